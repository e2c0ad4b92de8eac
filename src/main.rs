use log::{info, warn};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use actix_web::{App, HttpServer, web};

use gpioctl::{
    AppConfig, AppState, CommandService, EventBus, MonitorLoop, PinRegistry, select_driver,
};

fn load_config(path: &str) -> AppConfig {
    if Path::new(path).exists() {
        AppConfig::load_from_file(path).unwrap_or_else(|e| panic!("Failed to load config: {e}"))
    } else {
        warn!("{path} not found, using the built-in Raspberry Pi pin layout");
        AppConfig::default()
    }
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    env_logger::init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("GPIOCTL_CONFIG").ok())
        .unwrap_or_else(|| "config.json".to_string());
    let config = load_config(&config_path);

    let driver = select_driver(config.backend, &config.gpios)
        .unwrap_or_else(|e| panic!("Failed to init gpio backend: {e}"));

    let bus = EventBus::from_config(&config.events);
    let registry = Arc::new(PinRegistry::new(
        config.gpios.clone(),
        driver,
        bus.clone(),
    ));
    let service = Arc::new(CommandService::new(registry.clone(), bus.clone()));
    let monitor = MonitorLoop::start(registry, bus, config.monitor)
        .unwrap_or_else(|e| panic!("Failed to start input monitor: {e}"));
    service.announce_startup();

    let app_state = AppState::new(service.clone());
    let http_cfg = config.http.clone();
    let server = HttpServer::new(move || {
        let scope_path = http_cfg.path.clone();
        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .service(app_state.api_scope(&scope_path))
    });

    let bind_addrs: String;
    let http_cfg = config.http.clone();
    let server = match (&http_cfg.unix_socket, &http_cfg.host) {
        (Some(socket_path), Some(host)) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = format!("{} and {}", socket_path, host);

            server.bind_uds(socket_path)?.bind_auto_h2c(host)?
        }
        (Some(socket_path), None) => {
            if Path::new(socket_path).exists() {
                fs::remove_file(socket_path)?;
            }
            bind_addrs = socket_path.clone();

            server.bind_uds(socket_path)?
        }
        (None, Some(host)) => {
            bind_addrs = host.clone();

            server.bind_auto_h2c(host)?
        }
        _ => {
            panic!("Config error: either 'unix_socket' or 'host' must be specified")
        }
    };

    info!("Starting server on {}...", bind_addrs);

    // actix stops the server on SIGINT/SIGTERM, cleanup below runs either way
    let result = server.run().await;

    info!("Server stopped, releasing gpio resources");
    monitor.stop();
    service.shutdown();

    result
}
