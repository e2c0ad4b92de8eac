use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};

use log::{error, info};
use rustc_hash::FxHashMap;

use crate::backend::Level;
use crate::config::MonitorConfig;
use crate::error::AppError;
use crate::events::{Edge, EventBus, EventRecord};
use crate::registry::PinRegistry;

/// Edge detection over the registry's monitored pins.
///
/// The first reading of a pin only seeds the cache. Cached values are keyed
/// by subscription, so re-enabling monitoring always starts fresh, even
/// between two passes.
pub struct EdgeMonitor {
    registry: Arc<PinRegistry>,
    bus: Arc<EventBus>,
    /// Pin -> (subscription, last level).
    previous: FxHashMap<u32, (u64, Level)>,
}

impl EdgeMonitor {
    pub fn new(registry: Arc<PinRegistry>, bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            bus,
            previous: FxHashMap::default(),
        }
    }

    /// One polling pass; returns the number of edges published.
    pub fn tick(&mut self) -> usize {
        let readings = self.registry.poll_monitored();
        self.previous.retain(|pin, (sub, _)| {
            readings
                .iter()
                .any(|r| r.pin == *pin && r.subscription == *sub)
        });

        let mut edges = 0;
        for reading in readings {
            let pin_id = reading.pin;
            match reading.level {
                Ok(level) => {
                    let (_, previous) = *self
                        .previous
                        .entry(pin_id)
                        .or_insert((reading.subscription, level));
                    if let Some(edge) = Edge::between(previous, level) {
                        self.bus.publish(EventRecord::edge(pin_id, edge, level));
                        edges += 1;
                    }
                    self.previous.insert(pin_id, (reading.subscription, level));
                }
                Err(e) => self
                    .bus
                    .error(format!("Error monitoring pin {pin_id}: {e}")),
            }
        }
        edges
    }
}

/// Background thread running [`EdgeMonitor::tick`] on a fixed interval.
///
/// A panic inside a pass is reported on the bus and followed by a longer
/// back-off; the loop only ends through [`MonitorLoop::stop`] or drop.
pub struct MonitorLoop {
    stop_tx: Option<mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MonitorLoop {
    pub fn start(
        registry: Arc<PinRegistry>,
        bus: Arc<EventBus>,
        cfg: MonitorConfig,
    ) -> Result<Self, AppError> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let monitor = EdgeMonitor::new(registry, bus.clone());

        let handle = thread::Builder::new()
            .name("gpio-monitor".into())
            .spawn(move || run(monitor, bus, stop_rx, cfg))
            .map_err(|e| AppError::Internal(format!("spawn monitor thread: {e}")))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // dropping the sender wakes the thread out of its sleep
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("input monitor thread terminated abnormally");
        }
    }
}

impl Drop for MonitorLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut monitor: EdgeMonitor,
    bus: Arc<EventBus>,
    stop_rx: mpsc::Receiver<()>,
    cfg: MonitorConfig,
) {
    info!(
        "input monitor started, polling every {}ms",
        cfg.poll_interval_ms
    );

    loop {
        let pause = match panic::catch_unwind(AssertUnwindSafe(|| monitor.tick())) {
            Ok(_) => cfg.poll_interval(),
            Err(payload) => {
                bus.error(format!("Monitor thread error: {}", panic_message(payload.as_ref())));
                cfg.error_backoff()
            }
        };

        match stop_rx.recv_timeout(pause) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("input monitor stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}
