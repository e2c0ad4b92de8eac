use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use libgpiod::{chip::Chip, line, request};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::backend::{Level, LineHandle, PinDriver, Pull, PwmHandle};
use crate::config::PinConfig;
use crate::error::AppError;

/// Linux GPIO character device backend.
///
/// Each handle owns its own line request. PWM is generated in software by a
/// thread per channel toggling the line, so frequency and duty can both be
/// changed while it runs.
pub struct LibgpiodBackend {
    next_id: AtomicU64,
    lines: Mutex<FxHashMap<u64, GpiodLine>>,
    pwms: Mutex<FxHashMap<u64, SoftPwm>>,
}

struct GpiodLine {
    offset: u32,
    request: request::Request,
}

fn open_chip(path: &str) -> Result<Chip, AppError> {
    let p = PathBuf::from(path);
    Chip::open(&p).map_err(|e| AppError::Driver(format!("open chip {path}: {e}")))
}

fn request_lines(chip: &Chip, line_cfg: &line::Config) -> Result<request::Request, AppError> {
    let mut req_cfg =
        request::Config::new().map_err(|e| AppError::Driver(format!("request config: {e}")))?;
    req_cfg
        .set_consumer(env!("CARGO_PKG_NAME"))
        .map_err(|e| AppError::Driver(format!("request consumer: {e}")))?;
    chip.request_lines(Some(&req_cfg), line_cfg)
        .map_err(|e| AppError::Driver(format!("request lines: {e}")))
}

fn input_settings(pull: Pull) -> Result<line::Settings, AppError> {
    let mut ls =
        line::Settings::new().map_err(|e| AppError::Driver(format!("libgpiod settings: {e}")))?;
    ls.set_direction(line::Direction::Input)
        .map_err(|e| AppError::Driver(format!("set direction: {e}")))?;
    let bias = match pull {
        Pull::Off => None,
        Pull::Up => Some(line::Bias::PullUp),
        Pull::Down => Some(line::Bias::PullDown),
    };
    ls.set_bias(bias)
        .map_err(|e| AppError::Driver(format!("set bias: {e}")))?;
    Ok(ls)
}

fn output_settings() -> Result<line::Settings, AppError> {
    let mut ls =
        line::Settings::new().map_err(|e| AppError::Driver(format!("libgpiod settings: {e}")))?;
    ls.set_direction(line::Direction::Output)
        .map_err(|e| AppError::Driver(format!("set direction: {e}")))?;
    ls.set_drive(line::Drive::PushPull)
        .map_err(|e| AppError::Driver(format!("set drive: {e}")))?;
    ls.set_output_value(line::Value::InActive)
        .map_err(|e| AppError::Driver(format!("set output value: {e}")))?;
    Ok(ls)
}

fn acquire(pin: &PinConfig, settings: line::Settings) -> Result<GpiodLine, AppError> {
    let mut cfg =
        line::Config::new().map_err(|e| AppError::Driver(format!("line config: {e}")))?;
    cfg.add_line_settings(&[pin.line], settings)
        .map_err(|e| AppError::Driver(format!("line config add settings: {e}")))?;

    let chip = open_chip(&pin.chip)?;
    let request = request_lines(&chip, &cfg)?;
    Ok(GpiodLine {
        offset: pin.line,
        request,
    })
}

fn to_value(level: Level) -> line::Value {
    match level {
        Level::Low => line::Value::InActive,
        Level::High => line::Value::Active,
    }
}

#[derive(Clone, Copy)]
struct PwmParams {
    frequency_hz: f64,
    duty_cycle: f64,
}

impl PwmParams {
    /// High and low time of one period.
    fn split(&self) -> (Duration, Duration) {
        let period = Duration::from_secs_f64(1.0 / self.frequency_hz);
        let high = period.mul_f64(self.duty_cycle / 100.0);
        (high, period.saturating_sub(high))
    }
}

struct SoftPwm {
    params: Arc<Mutex<PwmParams>>,
    cancel: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SoftPwm {
    fn new(pin_id: u32, mut gpio: GpiodLine, params: PwmParams) -> Result<Self, AppError> {
        let params = Arc::new(Mutex::new(params));
        let cancel = Arc::new(AtomicBool::new(false));
        let cancel_flag = cancel.clone();
        let shared = params.clone();

        let handle = std::thread::Builder::new()
            .name(format!("pwm-{pin_id}"))
            .spawn(move || {
                while !cancel_flag.load(Ordering::Relaxed) {
                    let (high, low) = shared.lock().split();
                    for (level, span) in [(line::Value::Active, high), (line::Value::InActive, low)]
                    {
                        if span.is_zero() {
                            continue;
                        }
                        if let Err(e) = gpio.request.set_value(gpio.offset, level) {
                            warn!("software pwm write error for pin {pin_id}: {e}");
                        }
                        std::thread::sleep(span);
                    }
                }
                let _ = gpio.request.set_value(gpio.offset, line::Value::InActive);
            })
            .map_err(|e| AppError::Driver(format!("spawn pwm thread: {e}")))?;

        Ok(Self {
            params,
            cancel,
            handle: Some(handle),
        })
    }
}

impl Drop for SoftPwm {
    fn drop(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl LibgpiodBackend {
    /// Opens every chip in `chips` once, so a host without the GPIO
    /// character devices is rejected at startup instead of on first use.
    pub fn probe<'a>(chips: impl IntoIterator<Item = &'a str>) -> Result<Self, AppError> {
        let mut probed = 0;
        for path in chips {
            open_chip(path)?;
            debug!("gpio chip {path} is available");
            probed += 1;
        }
        if probed == 0 {
            return Err(AppError::Driver("no gpio chip configured".into()));
        }

        Ok(Self {
            next_id: AtomicU64::new(1),
            lines: Mutex::new(FxHashMap::default()),
            pwms: Mutex::new(FxHashMap::default()),
        })
    }

    fn allocate(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl PinDriver for LibgpiodBackend {
    fn name(&self) -> &'static str {
        "libgpiod"
    }

    fn is_hardware(&self) -> bool {
        true
    }

    fn supports_live_frequency_change(&self) -> bool {
        true
    }

    fn configure_input(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        pull: Pull,
    ) -> Result<LineHandle, AppError> {
        let gpio = acquire(pin, input_settings(pull)?)?;
        let id = self.allocate();
        self.lines.lock().insert(id, gpio);
        debug!("libgpiod: pin {pin_id} ({}:{}) requested as input", pin.chip, pin.line);
        Ok(LineHandle::new(pin_id, id))
    }

    fn configure_output(&self, pin_id: u32, pin: &PinConfig) -> Result<LineHandle, AppError> {
        let gpio = acquire(pin, output_settings()?)?;
        let id = self.allocate();
        self.lines.lock().insert(id, gpio);
        debug!("libgpiod: pin {pin_id} ({}:{}) requested as output", pin.chip, pin.line);
        Ok(LineHandle::new(pin_id, id))
    }

    fn set_level(&self, handle: &LineHandle, level: Level) -> Result<(), AppError> {
        let mut lines = self.lines.lock();
        let gpio = lines
            .get_mut(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale handle for pin {}", handle.pin())))?;
        gpio.request
            .set_value(gpio.offset, to_value(level))
            .map_err(|e| AppError::Driver(format!("set value: {e}")))?;
        Ok(())
    }

    fn read_level(&self, handle: &LineHandle) -> Result<Level, AppError> {
        let lines = self.lines.lock();
        let gpio = lines
            .get(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale handle for pin {}", handle.pin())))?;
        let value = gpio
            .request
            .value(gpio.offset)
            .map_err(|e| AppError::Driver(format!("get value: {e}")))?;
        Ok(match value {
            line::Value::InActive => Level::Low,
            line::Value::Active => Level::High,
        })
    }

    fn release_line(&self, handle: LineHandle) -> Result<(), AppError> {
        // dropping the request hands the line back to the kernel
        self.lines
            .lock()
            .remove(&handle.id())
            .map(drop)
            .ok_or_else(|| AppError::Driver(format!("stale handle for pin {}", handle.pin())))
    }

    fn start_pwm(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<PwmHandle, AppError> {
        let gpio = acquire(pin, output_settings()?)?;
        let pwm = SoftPwm::new(
            pin_id,
            gpio,
            PwmParams {
                frequency_hz,
                duty_cycle,
            },
        )?;
        let id = self.allocate();
        self.pwms.lock().insert(id, pwm);
        Ok(PwmHandle::new(pin_id, id))
    }

    fn set_pwm_duty(&self, handle: &PwmHandle, duty_cycle: f64) -> Result<(), AppError> {
        let pwms = self.pwms.lock();
        let pwm = pwms
            .get(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale pwm handle for pin {}", handle.pin())))?;
        pwm.params.lock().duty_cycle = duty_cycle;
        Ok(())
    }

    fn set_pwm_frequency(&self, handle: &PwmHandle, frequency_hz: f64) -> Result<(), AppError> {
        let pwms = self.pwms.lock();
        let pwm = pwms
            .get(&handle.id())
            .ok_or_else(|| AppError::Driver(format!("stale pwm handle for pin {}", handle.pin())))?;
        pwm.params.lock().frequency_hz = frequency_hz;
        Ok(())
    }

    fn release_pwm(&self, handle: PwmHandle) -> Result<(), AppError> {
        // take it out of the map first so the join below doesn't hold the lock
        let pwm = self.pwms.lock().remove(&handle.id());
        match pwm {
            Some(pwm) => {
                drop(pwm);
                Ok(())
            }
            None => Err(AppError::Driver(format!(
                "stale pwm handle for pin {}",
                handle.pin()
            ))),
        }
    }
}
