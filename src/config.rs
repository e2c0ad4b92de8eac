use std::collections::BTreeMap;
use std::time::Duration;
use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// BCM lines exposed on the Raspberry Pi header.
const RASPBERRY_PI_PINS: std::ops::RangeInclusive<u32> = 2..=27;
const RASPBERRY_PI_PWM_PINS: [u32; 4] = [12, 13, 18, 19];
const RASPBERRY_PI_CHIP: &str = "/dev/gpiochip0";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct HttpConfig {
    pub unix_socket: Option<String>,
    pub host: Option<String>,
    #[serde(default = "default_api_path")]
    pub path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            unix_socket: None,
            host: Some("0.0.0.0:5000".to_string()),
            path: default_api_path(),
        }
    }
}

fn default_api_path() -> String {
    "/api".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// libgpiod when compiled in, otherwise the mock driver.
    #[default]
    Auto,
    Mock,
    Libgpiod,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
#[serde(default)]
pub struct MonitorConfig {
    pub poll_interval_ms: u64,
    pub error_backoff_ms: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            error_backoff_ms: 1000,
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy)]
#[serde(default)]
pub struct EventsConfig {
    /// Queue depth per subscriber.
    pub capacity: usize,
    pub heartbeat_secs: u64,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            heartbeat_secs: 30,
        }
    }
}

impl EventsConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct PinConfig {
    pub name: String,
    pub chip: String,
    pub line: u32,
    #[serde(default)]
    pub pwm: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub events: EventsConfig,
    pub gpios: BTreeMap<u32, PinConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let gpios = RASPBERRY_PI_PINS
            .map(|id| {
                (
                    id,
                    PinConfig {
                        name: format!("GPIO{id}"),
                        chip: RASPBERRY_PI_CHIP.to_string(),
                        line: id,
                        pwm: RASPBERRY_PI_PWM_PINS.contains(&id),
                    },
                )
            })
            .collect();

        Self {
            http: HttpConfig::default(),
            backend: BackendKind::default(),
            monitor: MonitorConfig::default(),
            events: EventsConfig::default(),
            gpios,
        }
    }
}

impl AppConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AppError> {
        let contents = fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self, AppError> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| AppError::Config(format!("Invalid config json: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.gpios.is_empty() {
            return Err(AppError::Config("at least one gpio must be defined".into()));
        }
        if self.events.capacity == 0 {
            return Err(AppError::Config("events.capacity must be non-zero".into()));
        }
        if self.events.heartbeat_secs == 0 {
            return Err(AppError::Config(
                "events.heartbeat_secs must be non-zero".into(),
            ));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err(AppError::Config(
                "monitor.poll_interval_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }

    pub fn valid_pins(&self) -> Vec<u32> {
        self.gpios.keys().copied().collect()
    }

    pub fn pwm_pins(&self) -> Vec<u32> {
        self.gpios
            .iter()
            .filter(|(_, cfg)| cfg.pwm)
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_layout_matches_raspberry_pi_header() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.valid_pins().len(), 26);
        assert_eq!(cfg.valid_pins().first(), Some(&2));
        assert_eq!(cfg.valid_pins().last(), Some(&27));
        assert_eq!(cfg.pwm_pins(), vec![12, 13, 18, 19]);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn sections_fall_back_to_defaults() {
        let cfg = AppConfig::from_json(
            r#"{ "gpios": { "4": { "name": "LED", "chip": "/dev/gpiochip0", "line": 4 } } }"#,
        )
        .unwrap();
        assert_eq!(cfg.http.path, "/api");
        assert_eq!(cfg.backend, BackendKind::Auto);
        assert_eq!(cfg.monitor.poll_interval(), Duration::from_millis(100));
        assert_eq!(cfg.events.heartbeat_interval(), Duration::from_secs(30));
        assert!(!cfg.gpios[&4].pwm);
    }

    #[test]
    fn empty_gpio_table_is_rejected() {
        let err = AppConfig::from_json(r#"{ "gpios": {} }"#).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
