#[cfg(feature = "hardware-gpio")]
pub mod libgpiod;
pub mod mock;

#[cfg(feature = "hardware-gpio")]
pub use libgpiod::LibgpiodBackend;
pub use mock::MockPinDriver;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::{BackendKind, PinConfig};
use crate::error::AppError;

/// Logical level of a line, 0 or 1 on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Level {
    #[default]
    Low,
    High,
}

impl Level {
    pub fn as_u8(self) -> u8 {
        match self {
            Level::Low => 0,
            Level::High => 1,
        }
    }
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high { Level::High } else { Level::Low }
    }
}

impl Serialize for Level {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Pull {
    #[default]
    Off,
    Up,
    Down,
}

impl FromStr for Pull {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Pull::Off),
            "up" => Ok(Pull::Up),
            "down" => Ok(Pull::Down),
            _ => Err(AppError::InvalidPull(s.to_string())),
        }
    }
}

impl fmt::Display for Pull {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Pull::Off => "off",
            Pull::Up => "up",
            Pull::Down => "down",
        })
    }
}

/// Ownership token for an acquired digital line.
///
/// Handles are move-only: [`PinDriver::release_line`] consumes them, so a
/// handle can be released at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct LineHandle {
    pin: u32,
    id: u64,
}

impl LineHandle {
    pub fn new(pin: u32, id: u64) -> Self {
        Self { pin, id }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Ownership token for an acquired PWM channel.
#[derive(Debug, PartialEq, Eq)]
pub struct PwmHandle {
    pin: u32,
    id: u64,
}

impl PwmHandle {
    pub fn new(pin: u32, id: u64) -> Self {
        Self { pin, id }
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Hardware capability consumed by the pin registry.
///
/// Implementations must behave identically at this interface whether they
/// drive real lines or simulate them. Release methods consume the handle even
/// when they return an error; the resource is considered gone either way.
pub trait PinDriver: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_hardware(&self) -> bool;
    /// Whether [`PinDriver::set_pwm_frequency`] reaches the running channel.
    fn supports_live_frequency_change(&self) -> bool;

    fn configure_input(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        pull: Pull,
    ) -> Result<LineHandle, AppError>;
    /// Acquires the line as an output driven low.
    fn configure_output(&self, pin_id: u32, pin: &PinConfig) -> Result<LineHandle, AppError>;
    fn set_level(&self, handle: &LineHandle, level: Level) -> Result<(), AppError>;
    fn read_level(&self, handle: &LineHandle) -> Result<Level, AppError>;
    fn release_line(&self, handle: LineHandle) -> Result<(), AppError>;

    fn start_pwm(
        &self,
        pin_id: u32,
        pin: &PinConfig,
        frequency_hz: f64,
        duty_cycle: f64,
    ) -> Result<PwmHandle, AppError>;
    fn set_pwm_duty(&self, handle: &PwmHandle, duty_cycle: f64) -> Result<(), AppError>;
    /// No-op when live frequency changes are unsupported.
    fn set_pwm_frequency(&self, handle: &PwmHandle, frequency_hz: f64) -> Result<(), AppError>;
    fn release_pwm(&self, handle: PwmHandle) -> Result<(), AppError>;
}

/// Picks the driver for `kind`.
///
/// `auto` probes every chip referenced by `gpios` and falls back to the mock
/// driver when one cannot be opened or hardware support is not compiled in.
/// An explicit `libgpiod` request fails instead.
pub fn select_driver(
    kind: BackendKind,
    gpios: &BTreeMap<u32, PinConfig>,
) -> Result<Arc<dyn PinDriver>, AppError> {
    let chips: BTreeSet<&str> = gpios.values().map(|p| p.chip.as_str()).collect();

    match kind {
        BackendKind::Mock => Ok(Arc::new(MockPinDriver::default())),
        BackendKind::Libgpiod => hardware_driver(&chips),
        BackendKind::Auto => match hardware_driver(&chips) {
            Ok(driver) => {
                info!("gpio hardware detected, using the {} backend", driver.name());
                Ok(driver)
            }
            Err(e) => {
                warn!("gpio hardware unavailable ({e}), falling back to the mock backend");
                Ok(Arc::new(MockPinDriver::default()))
            }
        },
    }
}

#[cfg(feature = "hardware-gpio")]
fn hardware_driver(chips: &BTreeSet<&str>) -> Result<Arc<dyn PinDriver>, AppError> {
    Ok(Arc::new(LibgpiodBackend::probe(chips.iter().copied())?))
}

#[cfg(not(feature = "hardware-gpio"))]
fn hardware_driver(_chips: &BTreeSet<&str>) -> Result<Arc<dyn PinDriver>, AppError> {
    Err(AppError::Config(
        "libgpiod backend requested but the hardware-gpio feature is disabled".into(),
    ))
}
