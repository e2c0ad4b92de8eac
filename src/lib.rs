pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod registry;
pub mod routes;
pub mod service;

pub use backend::{
    Level, LineHandle, MockPinDriver, PinDriver, Pull, PwmHandle, select_driver,
};
pub use config::{AppConfig, BackendKind, EventsConfig, HttpConfig, MonitorConfig, PinConfig};
pub use error::AppError;
pub use events::{Edge, EventBus, EventLevel, EventRecord, EventSubscription, FeedItem};
pub use monitor::{EdgeMonitor, MonitorLoop};
pub use registry::{
    ModeView, PinMode, PinReading, PinRegistry, PinSnapshot, PwmUpdate, PwmView,
};
pub use routes::AppState;
pub use service::{
    CommandService, ConfigureRequest, MonitorRequest, PinsOverview, PwmRequest, WriteRequest,
};

#[cfg(feature = "hardware-gpio")]
pub use backend::LibgpiodBackend;
