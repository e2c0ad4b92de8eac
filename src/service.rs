use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::{Level, Pull};
use crate::error::AppError;
use crate::events::{EventBus, EventSubscription};
use crate::registry::{PinMode, PinRegistry, PinSnapshot};

const DEFAULT_PULSE_MS: f64 = 100.0;
const DEFAULT_PULSE_LOOPS: u32 = 5;
const MAX_PULSE_MS: f64 = 60_000.0;
const MAX_PULSE_LOOPS: u32 = 10_000;
/// Upper bound for a whole pulse train, both half periods of every loop.
const MAX_PULSE_TOTAL_MS: f64 = 300_000.0;
const DEFAULT_PWM_FREQUENCY_HZ: f64 = 1000.0;
const DEFAULT_PWM_DUTY_CYCLE: f64 = 50.0;

pub const CONFIGURE_CONTEXT: &str = "Error configuring pin";
pub const WRITE_CONTEXT: &str = "Error writing to pin";
pub const PWM_CONTEXT: &str = "Error controlling PWM";
pub const MONITOR_CONTEXT: &str = "Error toggling monitor";

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureRequest {
    pub pin: u32,
    pub mode: String,
    #[serde(default)]
    pub pull: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteRequest {
    pub pin: u32,
    pub action: String,
    /// Pulse on-time in milliseconds.
    #[serde(default)]
    pub duration: Option<f64>,
    #[serde(default)]
    pub loops: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PwmRequest {
    pub pin: u32,
    pub action: String,
    #[serde(default)]
    pub frequency: Option<f64>,
    #[serde(default)]
    pub duty_cycle: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorRequest {
    pub pin: u32,
    #[serde(default)]
    pub enable: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WriteAction {
    Set(Level),
    Pulse { on_duration: Duration, cycles: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PwmAction {
    Start {
        frequency_hz: f64,
        duty_cycle: f64,
    },
    Stop,
    Update {
        frequency_hz: Option<f64>,
        duty_cycle: Option<f64>,
    },
}

impl WriteRequest {
    pub fn parse(&self) -> Result<WriteAction, AppError> {
        match self.action.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(WriteAction::Set(Level::High)),
            "low" => Ok(WriteAction::Set(Level::Low)),
            "pulse" => {
                let ms = self.duration.unwrap_or(DEFAULT_PULSE_MS);
                if !ms.is_finite() || !(0.0..=MAX_PULSE_MS).contains(&ms) {
                    return Err(AppError::OutOfRange(format!(
                        "Pulse duration must be 0-{MAX_PULSE_MS}ms"
                    )));
                }
                let cycles = self.loops.unwrap_or(DEFAULT_PULSE_LOOPS);
                if cycles > MAX_PULSE_LOOPS {
                    return Err(AppError::OutOfRange(format!(
                        "Pulse loops must be 0-{MAX_PULSE_LOOPS}"
                    )));
                }
                if ms * 2.0 * f64::from(cycles) > MAX_PULSE_TOTAL_MS {
                    return Err(AppError::OutOfRange(format!(
                        "Pulse train must not exceed {MAX_PULSE_TOTAL_MS}ms"
                    )));
                }
                Ok(WriteAction::Pulse {
                    on_duration: Duration::from_secs_f64(ms / 1000.0),
                    cycles,
                })
            }
            _ => Err(AppError::InvalidAction(self.action.clone())),
        }
    }
}

impl PwmRequest {
    pub fn parse(&self) -> Result<PwmAction, AppError> {
        use crate::registry::{validate_duty_cycle, validate_frequency};

        match self.action.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(PwmAction::Start {
                frequency_hz: validate_frequency(
                    self.frequency.unwrap_or(DEFAULT_PWM_FREQUENCY_HZ),
                )?,
                duty_cycle: validate_duty_cycle(
                    self.duty_cycle.unwrap_or(DEFAULT_PWM_DUTY_CYCLE),
                )?,
            }),
            "stop" => Ok(PwmAction::Stop),
            "update" => Ok(PwmAction::Update {
                frequency_hz: self.frequency.map(validate_frequency).transpose()?,
                duty_cycle: self.duty_cycle.map(validate_duty_cycle).transpose()?,
            }),
            _ => Err(AppError::InvalidAction(self.action.clone())),
        }
    }
}

/// Everything a client needs to render the pin table.
#[derive(Debug, Clone, Serialize)]
pub struct PinsOverview {
    pub pins: BTreeMap<u32, PinSnapshot>,
    pub backend: &'static str,
    pub is_hardware: bool,
    pub supports_live_frequency_change: bool,
    pub valid_pins: Vec<u32>,
    pub pwm_pins: Vec<u32>,
}

/// Command surface over the registry.
///
/// Requests are fully parsed and validated before the registry is touched.
/// Each command publishes one event: `info` when it succeeds, `error` when it
/// is rejected or fails.
pub struct CommandService {
    registry: Arc<PinRegistry>,
    bus: Arc<EventBus>,
}

impl CommandService {
    pub fn new(registry: Arc<PinRegistry>, bus: Arc<EventBus>) -> Self {
        Self { registry, bus }
    }

    pub fn registry(&self) -> &Arc<PinRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.bus.subscribe()
    }

    /// Publishes a command that was rejected before it could be parsed.
    pub fn reject(&self, context: &str, err: AppError) -> AppError {
        self.bus.error(format!("{context}: {err}"));
        err
    }

    fn run<T>(
        &self,
        context: &str,
        op: impl FnOnce() -> Result<(T, String), AppError>,
    ) -> Result<T, AppError> {
        match op() {
            Ok((value, message)) => {
                self.bus.info(message);
                Ok(value)
            }
            Err(e) => Err(self.reject(context, e)),
        }
    }

    pub fn configure(&self, req: &ConfigureRequest) -> Result<(), AppError> {
        self.run(CONFIGURE_CONTEXT, || {
            self.registry.pin_config(req.pin)?;
            let mode: PinMode = req.mode.parse()?;
            let pull: Pull = match mode {
                PinMode::Input => req.pull.as_deref().unwrap_or("off").parse()?,
                PinMode::Output => Pull::Off,
            };

            self.registry.configure(req.pin, mode, pull)?;

            let mut message = format!("Pin {} configured as {mode}", req.pin);
            if mode == PinMode::Input && pull != Pull::Off {
                message.push_str(&format!(" with pull-{pull}"));
            }
            Ok(((), message))
        })
    }

    /// Blocks for the whole sequence when the action is a pulse.
    pub fn write(&self, req: &WriteRequest) -> Result<(), AppError> {
        self.run(WRITE_CONTEXT, || {
            self.registry.pin_config(req.pin)?;
            match req.parse()? {
                WriteAction::Set(level) => {
                    self.registry.write(req.pin, level)?;
                    let label = match level {
                        Level::High => "HIGH",
                        Level::Low => "LOW",
                    };
                    Ok(((), format!("Pin {} set to {label}", req.pin)))
                }
                WriteAction::Pulse {
                    on_duration,
                    cycles,
                } => {
                    self.registry.pulse(req.pin, on_duration, cycles)?;
                    Ok((
                        (),
                        format!(
                            "Pin {} pulsed {cycles} times for {:.1}ms",
                            req.pin,
                            on_duration.as_secs_f64() * 1000.0
                        ),
                    ))
                }
            }
        })
    }

    pub fn pwm(&self, req: &PwmRequest) -> Result<(), AppError> {
        self.run(PWM_CONTEXT, || {
            self.registry.pin_config(req.pin)?;
            let pin = req.pin;
            match req.parse()? {
                PwmAction::Start {
                    frequency_hz,
                    duty_cycle,
                } => {
                    self.registry.start_pwm(pin, frequency_hz, duty_cycle)?;
                    Ok((
                        (),
                        format!(
                            "PWM started on pin {pin}: {frequency_hz}Hz, {duty_cycle}% duty cycle"
                        ),
                    ))
                }
                PwmAction::Stop => {
                    let message = if self.registry.stop_pwm(pin)? {
                        format!("PWM stopped on pin {pin}")
                    } else {
                        format!("PWM not running on pin {pin}, nothing to stop")
                    };
                    Ok(((), message))
                }
                PwmAction::Update {
                    frequency_hz,
                    duty_cycle,
                } => {
                    let update = self.registry.update_pwm(pin, frequency_hz, duty_cycle)?;

                    let mut changes = Vec::new();
                    if let Some(f) = frequency_hz {
                        if update.frequency_applied {
                            changes.push(format!("{f}Hz"));
                        } else {
                            changes.push(format!(
                                "{f}Hz ignored, {} backend cannot change frequency while running",
                                self.registry.driver().name()
                            ));
                        }
                    }
                    if let Some(d) = duty_cycle {
                        changes.push(format!("{d}% duty cycle"));
                    }
                    let message = if changes.is_empty() {
                        format!("PWM on pin {pin} unchanged")
                    } else {
                        format!("PWM updated on pin {pin}: {}", changes.join(", "))
                    };
                    Ok(((), message))
                }
            }
        })
    }

    /// Returns whether the pin is monitored afterwards.
    pub fn monitor(&self, req: &MonitorRequest) -> Result<bool, AppError> {
        self.run(MONITOR_CONTEXT, || {
            let enable = req.enable.unwrap_or(true);
            let monitoring = self.registry.set_monitoring(req.pin, enable)?;
            let message = if monitoring {
                format!("Started monitoring pin {}", req.pin)
            } else {
                format!("Stopped monitoring pin {}", req.pin)
            };
            Ok((monitoring, message))
        })
    }

    pub fn reset(&self) -> Result<(), AppError> {
        self.run("Error resetting pins", || {
            let released = self.registry.reset();
            Ok((
                (),
                format!("All pins reset to safe defaults ({released} resources released)"),
            ))
        })
    }

    pub fn overview(&self) -> PinsOverview {
        let driver = self.registry.driver();
        PinsOverview {
            pins: self.registry.snapshot(),
            backend: driver.name(),
            is_hardware: driver.is_hardware(),
            supports_live_frequency_change: driver.supports_live_frequency_change(),
            valid_pins: self.registry.valid_pins(),
            pwm_pins: self.registry.pwm_pins(),
        }
    }

    pub fn announce_startup(&self) {
        let driver = self.registry.driver();
        self.bus.info(format!(
            "GPIO controller started (backend: {}, hardware: {})",
            driver.name(),
            driver.is_hardware()
        ));
    }

    /// Releases every acquired resource before the process exits.
    pub fn shutdown(&self) {
        let released = self.registry.reset();
        self.bus
            .info(format!("GPIO cleanup completed ({released} resources released)"));
    }
}
