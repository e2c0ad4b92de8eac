use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::backend::{Level, LineHandle, PinDriver, Pull, PwmHandle};
use crate::config::PinConfig;
use crate::error::AppError;
use crate::events::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PinMode {
    Input,
    Output,
}

impl FromStr for PinMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" | "in" => Ok(PinMode::Input),
            "output" | "out" => Ok(PinMode::Output),
            _ => Err(AppError::InvalidMode(s.to_string())),
        }
    }
}

impl fmt::Display for PinMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PinMode::Input => "input",
            PinMode::Output => "output",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeView {
    Input,
    Output,
    Unconfigured,
}

impl From<Option<PinMode>> for ModeView {
    fn from(mode: Option<PinMode>) -> Self {
        match mode {
            Some(PinMode::Input) => ModeView::Input,
            Some(PinMode::Output) => ModeView::Output,
            None => ModeView::Unconfigured,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PwmView {
    pub active: bool,
    pub frequency: f64,
    pub duty_cycle: f64,
}

/// Point-in-time view of one pin.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PinSnapshot {
    pub mode: ModeView,
    pub value: Level,
    pub pull: Pull,
    pub configured: bool,
    pub monitoring: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pwm: Option<PwmView>,
}

/// Outcome of a PWM update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PwmUpdate {
    pub duty_applied: bool,
    /// False when a frequency was requested but the driver cannot retune a
    /// running channel.
    pub frequency_applied: bool,
}

struct PinEntry {
    mode: PinMode,
    value: Level,
    pull: Pull,
    /// Changes on every configure; in-flight pulses abort when it moves.
    generation: u64,
    handle: LineHandle,
}

struct PwmEntry {
    frequency_hz: f64,
    duty_cycle: f64,
    handle: PwmHandle,
}

#[derive(Default)]
struct RegistryState {
    pins: FxHashMap<u32, PinEntry>,
    pwms: FxHashMap<u32, PwmEntry>,
    /// Monitored pin -> subscription number, fresh on every enable.
    monitors: FxHashMap<u32, u64>,
    next_generation: u64,
}

impl RegistryState {
    fn output_entry(&mut self, pin_id: u32) -> Result<&mut PinEntry, AppError> {
        match self.pins.get_mut(&pin_id) {
            None => Err(AppError::NotConfigured(pin_id)),
            Some(entry) if entry.mode != PinMode::Output => Err(AppError::NotOutput(pin_id)),
            Some(entry) => Ok(entry),
        }
    }

    fn pulse_entry(&mut self, pin_id: u32, generation: u64) -> Result<&mut PinEntry, AppError> {
        self.pins
            .get_mut(&pin_id)
            .filter(|e| e.generation == generation && e.mode == PinMode::Output)
            .ok_or(AppError::PulseAborted(pin_id))
    }
}

/// One read of a monitored pin.
#[derive(Debug, Clone, PartialEq)]
pub struct PinReading {
    pub pin: u32,
    /// Changes whenever monitoring is re-enabled on the pin.
    pub subscription: u64,
    pub level: Result<Level, AppError>,
}

pub fn validate_duty_cycle(duty_cycle: f64) -> Result<f64, AppError> {
    if !(0.0..=100.0).contains(&duty_cycle) {
        return Err(AppError::OutOfRange("Duty cycle must be 0-100%".into()));
    }
    Ok(duty_cycle)
}

pub const MIN_FREQUENCY_HZ: f64 = 0.01;
pub const MAX_FREQUENCY_HZ: f64 = 1_000_000.0;

pub fn validate_frequency(frequency_hz: f64) -> Result<f64, AppError> {
    if !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&frequency_hz) {
        return Err(AppError::OutOfRange(format!(
            "Frequency must be {MIN_FREQUENCY_HZ}-{MAX_FREQUENCY_HZ}Hz"
        )));
    }
    Ok(frequency_hz)
}

/// Authoritative state of every pin.
///
/// A single lock covers line states, PWM channels and the monitor set, so a
/// reader never observes a pin between release and re-acquisition. Driver
/// handles live only inside the registry and are released on reconfigure,
/// PWM stop, [`PinRegistry::reset`] and drop.
pub struct PinRegistry {
    pins: BTreeMap<u32, PinConfig>,
    driver: Arc<dyn PinDriver>,
    bus: Arc<EventBus>,
    state: Mutex<RegistryState>,
}

impl PinRegistry {
    pub fn new(
        pins: BTreeMap<u32, PinConfig>,
        driver: Arc<dyn PinDriver>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            pins,
            driver,
            bus,
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn driver(&self) -> &dyn PinDriver {
        self.driver.as_ref()
    }

    pub fn valid_pins(&self) -> Vec<u32> {
        self.pins.keys().copied().collect()
    }

    pub fn pwm_pins(&self) -> Vec<u32> {
        self.pins
            .iter()
            .filter(|(_, cfg)| cfg.pwm)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn pin_config(&self, pin_id: u32) -> Result<&PinConfig, AppError> {
        self.pins.get(&pin_id).ok_or(AppError::InvalidPin(pin_id))
    }

    /// Releases whatever currently holds the pin and acquires it in `mode`.
    ///
    /// A monitored pin stays monitored when reconfigured as an input. If the
    /// new acquisition fails the pin is left unconfigured.
    pub fn configure(&self, pin_id: u32, mode: PinMode, pull: Pull) -> Result<(), AppError> {
        let cfg = self.pin_config(pin_id)?;
        let pull = match mode {
            PinMode::Input => pull,
            PinMode::Output => Pull::Off,
        };

        let mut state = self.state.lock();
        self.release_locked(&mut state, pin_id);

        let acquired = match mode {
            PinMode::Input => self.driver.configure_input(pin_id, cfg, pull),
            PinMode::Output => self.driver.configure_output(pin_id, cfg),
        };
        let handle = match acquired {
            Ok(handle) => handle,
            Err(e) => {
                state.monitors.remove(&pin_id);
                return Err(e);
            }
        };
        if mode == PinMode::Output {
            state.monitors.remove(&pin_id);
        }

        let value = match mode {
            PinMode::Input => self.driver.read_level(&handle).unwrap_or_default(),
            PinMode::Output => Level::Low,
        };
        state.next_generation += 1;
        let generation = state.next_generation;
        state.pins.insert(
            pin_id,
            PinEntry {
                mode,
                value,
                pull,
                generation,
                handle,
            },
        );

        debug!("pin {pin_id} configured as {mode} (pull {pull})");
        Ok(())
    }

    pub fn write(&self, pin_id: u32, level: Level) -> Result<(), AppError> {
        self.pin_config(pin_id)?;

        let mut state = self.state.lock();
        let entry = state.output_entry(pin_id)?;
        self.driver.set_level(&entry.handle, level)?;
        entry.value = level;
        Ok(())
    }

    /// Drives `cycles` high/low periods of `on_duration` each half and leaves
    /// the pin low. Blocks the caller for the whole sequence.
    ///
    /// The registry lock is only held per toggle. If the pin is reconfigured,
    /// switched to PWM or reset meanwhile, the pulse stops at its next toggle
    /// with [`AppError::PulseAborted`] and leaves the new state alone.
    pub fn pulse(&self, pin_id: u32, on_duration: Duration, cycles: u32) -> Result<(), AppError> {
        self.pin_config(pin_id)?;

        let generation = self.state.lock().output_entry(pin_id)?.generation;

        for _ in 0..cycles {
            self.pulse_step(pin_id, generation, Level::High)?;
            thread::sleep(on_duration);
            self.pulse_step(pin_id, generation, Level::Low)?;
            thread::sleep(on_duration);
        }

        let mut state = self.state.lock();
        let entry = state.pulse_entry(pin_id, generation)?;
        if entry.value != Level::Low {
            self.driver.set_level(&entry.handle, Level::Low)?;
        }
        entry.value = Level::Low;
        Ok(())
    }

    fn pulse_step(&self, pin_id: u32, generation: u64, level: Level) -> Result<(), AppError> {
        let mut state = self.state.lock();
        let entry = state.pulse_entry(pin_id, generation)?;
        self.driver.set_level(&entry.handle, level)?;
        entry.value = level;
        Ok(())
    }

    /// Starts PWM on the pin, tearing down any line state or earlier PWM
    /// channel it had.
    pub fn start_pwm(
        &self,
        pin_id: u32,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<(), AppError> {
        let cfg = self.pin_config(pin_id)?;
        validate_frequency(frequency_hz)?;
        validate_duty_cycle(duty_cycle)?;

        let mut state = self.state.lock();
        self.release_locked(&mut state, pin_id);
        state.monitors.remove(&pin_id);

        let handle = self
            .driver
            .start_pwm(pin_id, cfg, frequency_hz, duty_cycle)?;
        state.pwms.insert(
            pin_id,
            PwmEntry {
                frequency_hz,
                duty_cycle,
                handle,
            },
        );
        Ok(())
    }

    /// Applies the fields that are present. The recorded frequency only
    /// changes when the driver could retune the running channel.
    pub fn update_pwm(
        &self,
        pin_id: u32,
        frequency_hz: Option<f64>,
        duty_cycle: Option<f64>,
    ) -> Result<PwmUpdate, AppError> {
        self.pin_config(pin_id)?;
        if let Some(f) = frequency_hz {
            validate_frequency(f)?;
        }
        if let Some(d) = duty_cycle {
            validate_duty_cycle(d)?;
        }

        let mut state = self.state.lock();
        let entry = state
            .pwms
            .get_mut(&pin_id)
            .ok_or(AppError::NotActive(pin_id))?;

        let mut update = PwmUpdate {
            duty_applied: false,
            frequency_applied: false,
        };
        if let Some(d) = duty_cycle {
            self.driver.set_pwm_duty(&entry.handle, d)?;
            update.duty_applied = true;
        }
        if let Some(f) = frequency_hz
            && self.driver.supports_live_frequency_change()
        {
            if let Err(e) = self.driver.set_pwm_frequency(&entry.handle, f) {
                // leave the channel exactly as it was before the update
                if update.duty_applied
                    && let Err(restore) = self.driver.set_pwm_duty(&entry.handle, entry.duty_cycle)
                {
                    self.bus.error(format!(
                        "Error restoring PWM duty cycle on pin {pin_id}: {restore}"
                    ));
                }
                return Err(e);
            }
            entry.frequency_hz = f;
            update.frequency_applied = true;
        }
        if let Some(d) = duty_cycle {
            entry.duty_cycle = d;
        }
        Ok(update)
    }

    /// Returns whether a channel was running.
    pub fn stop_pwm(&self, pin_id: u32) -> Result<bool, AppError> {
        self.pin_config(pin_id)?;

        let mut state = self.state.lock();
        let Some(entry) = state.pwms.remove(&pin_id) else {
            return Ok(false);
        };
        if let Err(e) = self.driver.release_pwm(entry.handle) {
            self.bus
                .error(format!("Error stopping PWM on pin {pin_id}: {e}"));
        }
        Ok(true)
    }

    /// Enabling requires an input pin; disabling is always a no-op success.
    /// Returns the resulting membership.
    pub fn set_monitoring(&self, pin_id: u32, enable: bool) -> Result<bool, AppError> {
        self.pin_config(pin_id)?;

        let mut state = self.state.lock();
        if !enable {
            state.monitors.remove(&pin_id);
            return Ok(false);
        }
        match state.pins.get(&pin_id) {
            None => Err(AppError::NotConfigured(pin_id)),
            Some(entry) if entry.mode != PinMode::Input => Err(AppError::NotInput(pin_id)),
            Some(_) => {
                if !state.monitors.contains_key(&pin_id) {
                    state.next_generation += 1;
                    let subscription = state.next_generation;
                    state.monitors.insert(pin_id, subscription);
                }
                Ok(true)
            }
        }
    }

    pub fn monitored_pins(&self) -> Vec<u32> {
        let mut pins: Vec<u32> = self.state.lock().monitors.keys().copied().collect();
        pins.sort_unstable();
        pins
    }

    /// Reads every monitored pin, in pin order.
    pub fn poll_monitored(&self) -> Vec<PinReading> {
        let state = self.state.lock();
        let mut pins: Vec<(u32, u64)> = state.monitors.iter().map(|(p, s)| (*p, *s)).collect();
        pins.sort_unstable();

        pins.into_iter()
            .filter_map(|(pin_id, subscription)| {
                let entry = state.pins.get(&pin_id)?;
                if entry.mode != PinMode::Input {
                    return None;
                }
                Some(PinReading {
                    pin: pin_id,
                    subscription,
                    level: self.driver.read_level(&entry.handle),
                })
            })
            .collect()
    }

    /// Consistent view of every valid pin.
    pub fn snapshot(&self) -> BTreeMap<u32, PinSnapshot> {
        let state = self.state.lock();

        self.pins
            .keys()
            .map(|&pin_id| {
                let mut snap = match state.pins.get(&pin_id) {
                    Some(entry) => PinSnapshot {
                        mode: Some(entry.mode).into(),
                        value: match entry.mode {
                            PinMode::Input => self
                                .driver
                                .read_level(&entry.handle)
                                .unwrap_or(entry.value),
                            PinMode::Output => entry.value,
                        },
                        pull: entry.pull,
                        configured: true,
                        monitoring: state.monitors.contains_key(&pin_id),
                        pwm: None,
                    },
                    None => PinSnapshot {
                        mode: ModeView::Unconfigured,
                        value: Level::Low,
                        pull: Pull::Off,
                        configured: false,
                        monitoring: false,
                        pwm: None,
                    },
                };
                snap.pwm = state.pwms.get(&pin_id).map(|pwm| PwmView {
                    active: true,
                    frequency: pwm.frequency_hz,
                    duty_cycle: pwm.duty_cycle,
                });
                (pin_id, snap)
            })
            .collect()
    }

    /// Clears the monitor set and releases every line and PWM channel.
    ///
    /// Release failures are published as error events and never stop the
    /// sweep. Returns the number of resources released.
    pub fn reset(&self) -> usize {
        let mut state = self.state.lock();
        state.monitors.clear();

        let mut targets: Vec<u32> = state.pins.keys().chain(state.pwms.keys()).copied().collect();
        targets.sort_unstable();
        targets.dedup();

        targets
            .into_iter()
            .map(|pin_id| self.release_locked(&mut state, pin_id))
            .sum()
    }

    fn release_locked(&self, state: &mut RegistryState, pin_id: u32) -> usize {
        let mut released = 0;
        if let Some(entry) = state.pins.remove(&pin_id) {
            released += 1;
            if let Err(e) = self.driver.release_line(entry.handle) {
                self.bus
                    .error(format!("Error cleaning up pin {pin_id}: {e}"));
            }
        }
        if let Some(entry) = state.pwms.remove(&pin_id) {
            released += 1;
            if let Err(e) = self.driver.release_pwm(entry.handle) {
                self.bus
                    .error(format!("Error cleaning up PWM on pin {pin_id}: {e}"));
            }
        }
        released
    }
}

impl Drop for PinRegistry {
    fn drop(&mut self) {
        let released = self.reset();
        if released > 0 {
            debug!("released {released} gpio resources on drop");
        }
    }
}
