use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use log::debug;

use crate::backend::{Level, LineHandle, PinDriver, Pull, PwmHandle};
use crate::config::PinConfig;
use crate::error::AppError;

/// In-memory driver used when no hardware is available and by the tests.
///
/// Input levels can be injected with [`MockPinDriver::set_input_level`]; every
/// level written to an output is recorded per pin.
pub struct MockPinDriver {
    state: Mutex<MockState>,
    live_frequency_change: bool,
}

#[derive(Default)]
struct MockState {
    next_id: u64,
    lines: HashMap<u64, MockLine>,
    pwms: HashMap<u64, MockPwm>,
    external: HashMap<u32, Level>,
    writes: HashMap<u32, Vec<Level>>,
    failing_reads: HashSet<u32>,
    failing_releases: HashSet<u32>,
    failing_frequency: HashSet<u32>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Input,
    Output,
}

struct MockLine {
    pin: u32,
    direction: Direction,
    pull: Pull,
    level: Level,
}

struct MockPwm {
    pin: u32,
    frequency_hz: f64,
    duty_cycle: f64,
}

impl Default for MockPinDriver {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            live_frequency_change: true,
        }
    }
}

impl MockState {
    fn ensure_free(&self, pin_id: u32) -> Result<(), AppError> {
        let busy = self.lines.values().any(|l| l.pin == pin_id)
            || self.pwms.values().any(|p| p.pin == pin_id);
        if busy {
            return Err(AppError::Driver(format!("pin {pin_id} is busy")));
        }
        Ok(())
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

impl MockPinDriver {
    /// A mock that, like RPi.GPIO, cannot retune a running PWM channel.
    pub fn without_live_frequency_change() -> Self {
        Self {
            live_frequency_change: false,
            ..Self::default()
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MockState>, AppError> {
        self.state
            .lock()
            .map_err(|e| AppError::Driver(format!("lock poisoned: {e}")))
    }

    /// Simulates an external signal on an input pin.
    pub fn set_input_level(&self, pin_id: u32, level: Level) {
        if let Ok(mut state) = self.lock() {
            state.external.insert(pin_id, level);
        }
    }

    /// Levels written to `pin_id` since the last [`MockPinDriver::clear_writes`].
    pub fn writes(&self, pin_id: u32) -> Vec<Level> {
        self.lock()
            .map(|s| s.writes.get(&pin_id).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn clear_writes(&self) {
        if let Ok(mut state) = self.lock() {
            state.writes.clear();
        }
    }

    pub fn fail_reads(&self, pin_id: u32, fail: bool) {
        if let Ok(mut state) = self.lock() {
            if fail {
                state.failing_reads.insert(pin_id);
            } else {
                state.failing_reads.remove(&pin_id);
            }
        }
    }

    pub fn fail_releases(&self, pin_id: u32, fail: bool) {
        if let Ok(mut state) = self.lock() {
            if fail {
                state.failing_releases.insert(pin_id);
            } else {
                state.failing_releases.remove(&pin_id);
            }
        }
    }

    pub fn fail_frequency_changes(&self, pin_id: u32, fail: bool) {
        if let Ok(mut state) = self.lock() {
            if fail {
                state.failing_frequency.insert(pin_id);
            } else {
                state.failing_frequency.remove(&pin_id);
            }
        }
    }

    pub fn live_lines(&self) -> usize {
        self.lock().map(|s| s.lines.len()).unwrap_or(0)
    }

    pub fn live_pwms(&self) -> usize {
        self.lock().map(|s| s.pwms.len()).unwrap_or(0)
    }

    /// Current `(frequency_hz, duty_cycle)` of the channel on `pin_id`.
    pub fn pwm_output(&self, pin_id: u32) -> Option<(f64, f64)> {
        let state = self.lock().ok()?;
        state
            .pwms
            .values()
            .find(|p| p.pin == pin_id)
            .map(|p| (p.frequency_hz, p.duty_cycle))
    }

    pub fn output_level(&self, pin_id: u32) -> Option<Level> {
        let state = self.lock().ok()?;
        state
            .lines
            .values()
            .find(|l| l.pin == pin_id && l.direction == Direction::Output)
            .map(|l| l.level)
    }
}

impl PinDriver for MockPinDriver {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn is_hardware(&self) -> bool {
        false
    }

    fn supports_live_frequency_change(&self) -> bool {
        self.live_frequency_change
    }

    fn configure_input(
        &self,
        pin_id: u32,
        _pin: &PinConfig,
        pull: Pull,
    ) -> Result<LineHandle, AppError> {
        let mut state = self.lock()?;
        state.ensure_free(pin_id)?;

        let id = state.allocate();
        state.lines.insert(
            id,
            MockLine {
                pin: pin_id,
                direction: Direction::Input,
                pull,
                level: Level::Low,
            },
        );
        debug!("mock: pin {pin_id} acquired as input (pull {pull})");
        Ok(LineHandle::new(pin_id, id))
    }

    fn configure_output(&self, pin_id: u32, _pin: &PinConfig) -> Result<LineHandle, AppError> {
        let mut state = self.lock()?;
        state.ensure_free(pin_id)?;

        let id = state.allocate();
        state.lines.insert(
            id,
            MockLine {
                pin: pin_id,
                direction: Direction::Output,
                pull: Pull::Off,
                level: Level::Low,
            },
        );
        debug!("mock: pin {pin_id} acquired as output");
        Ok(LineHandle::new(pin_id, id))
    }

    fn set_level(&self, handle: &LineHandle, level: Level) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let line = state
            .lines
            .get_mut(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale handle for pin {}", handle.pin())))?;

        if line.direction != Direction::Output {
            return Err(AppError::Driver(format!(
                "pin {} is not an output line",
                handle.pin()
            )));
        }
        line.level = level;
        state.writes.entry(handle.pin()).or_default().push(level);
        Ok(())
    }

    fn read_level(&self, handle: &LineHandle) -> Result<Level, AppError> {
        let state = self.lock()?;
        if state.failing_reads.contains(&handle.pin()) {
            return Err(AppError::Driver(format!(
                "simulated read failure on pin {}",
                handle.pin()
            )));
        }
        let line = state
            .lines
            .get(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale handle for pin {}", handle.pin())))?;

        Ok(match line.direction {
            Direction::Output => line.level,
            Direction::Input => match state.external.get(&line.pin) {
                Some(level) => *level,
                None if line.pull == Pull::Up => Level::High,
                None => Level::Low,
            },
        })
    }

    fn release_line(&self, handle: LineHandle) -> Result<(), AppError> {
        let mut state = self.lock()?;
        state.lines.remove(&handle.id());
        if state.failing_releases.contains(&handle.pin()) {
            return Err(AppError::Driver(format!(
                "simulated release failure on pin {}",
                handle.pin()
            )));
        }
        Ok(())
    }

    fn start_pwm(
        &self,
        pin_id: u32,
        _pin: &PinConfig,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<PwmHandle, AppError> {
        let mut state = self.lock()?;
        state.ensure_free(pin_id)?;

        let id = state.allocate();
        state.pwms.insert(
            id,
            MockPwm {
                pin: pin_id,
                frequency_hz,
                duty_cycle,
            },
        );
        Ok(PwmHandle::new(pin_id, id))
    }

    fn set_pwm_duty(&self, handle: &PwmHandle, duty_cycle: f64) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let pwm = state
            .pwms
            .get_mut(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale pwm handle for pin {}", handle.pin())))?;
        pwm.duty_cycle = duty_cycle;
        Ok(())
    }

    fn set_pwm_frequency(&self, handle: &PwmHandle, frequency_hz: f64) -> Result<(), AppError> {
        if !self.live_frequency_change {
            return Ok(());
        }
        let mut state = self.lock()?;
        if state.failing_frequency.contains(&handle.pin()) {
            return Err(AppError::Driver(format!(
                "simulated frequency failure on pin {}",
                handle.pin()
            )));
        }
        let pwm = state
            .pwms
            .get_mut(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale pwm handle for pin {}", handle.pin())))?;
        pwm.frequency_hz = frequency_hz;
        Ok(())
    }

    fn release_pwm(&self, handle: PwmHandle) -> Result<(), AppError> {
        let mut state = self.lock()?;
        state.pwms.remove(&handle.id());
        if state.failing_releases.contains(&handle.pin()) {
            return Err(AppError::Driver(format!(
                "simulated release failure on pin {}",
                handle.pin()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pin_cfg(line: u32) -> PinConfig {
        PinConfig {
            name: format!("GPIO{line}"),
            chip: "/dev/gpiochip0".into(),
            line,
            pwm: false,
        }
    }

    #[test]
    fn pull_up_input_idles_high() {
        let driver = MockPinDriver::default();
        let handle = driver.configure_input(4, &pin_cfg(4), Pull::Up).unwrap();
        assert_eq!(driver.read_level(&handle).unwrap(), Level::High);

        driver.set_input_level(4, Level::Low);
        assert_eq!(driver.read_level(&handle).unwrap(), Level::Low);
    }

    #[test]
    fn busy_pin_cannot_be_acquired_twice() {
        let driver = MockPinDriver::default();
        let handle = driver.configure_output(5, &pin_cfg(5)).unwrap();
        assert!(driver.configure_input(5, &pin_cfg(5), Pull::Off).is_err());

        driver.release_line(handle).unwrap();
        assert!(driver.configure_input(5, &pin_cfg(5), Pull::Off).is_ok());
    }

    #[test]
    fn failing_release_still_frees_the_line() {
        let driver = MockPinDriver::default();
        let handle = driver.configure_output(6, &pin_cfg(6)).unwrap();
        driver.fail_releases(6, true);

        assert!(driver.release_line(handle).is_err());
        assert_eq!(driver.live_lines(), 0);
    }

    #[test]
    fn frequency_is_frozen_without_live_support() {
        let driver = MockPinDriver::without_live_frequency_change();
        let handle = driver.start_pwm(18, &pin_cfg(18), 1000.0, 50.0).unwrap();

        driver.set_pwm_frequency(&handle, 2000.0).unwrap();
        driver.set_pwm_duty(&handle, 25.0).unwrap();
        assert_eq!(driver.pwm_output(18), Some((1000.0, 25.0)));
    }
}
