//! Per-device scan loop.
//!
//! A [`DeviceMonitor`] probes its device, reports the outcome to the hub and
//! sleeps for the interval of the scan mode the hub answers with. At most one
//! probe per device is ever outstanding.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::DeviceConfig;
use crate::hub::HubCommand;
use crate::ports::PortSelector;
use crate::presence::ScanMode;
use crate::probe::Prober;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    Probed,
    /// A probe for this device was still in flight; nothing was done.
    Skipped,
}

pub struct DeviceMonitor {
    device: Arc<DeviceConfig>,
    generation: u64,
    prober: Arc<dyn Prober>,
    ports: Arc<dyn PortSelector>,
    hub: mpsc::Sender<HubCommand>,
    in_flight: AtomicBool,
    mode: Mutex<ScanMode>,
    wake: Notify,
}

/// Clears the in-flight flag however the probe ends, including cancellation.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl DeviceMonitor {
    pub(crate) fn new(
        device: Arc<DeviceConfig>,
        generation: u64,
        prober: Arc<dyn Prober>,
        ports: Arc<dyn PortSelector>,
        hub: mpsc::Sender<HubCommand>,
    ) -> Self {
        DeviceMonitor {
            device,
            generation,
            prober,
            ports,
            hub,
            in_flight: AtomicBool::new(false),
            mode: Mutex::new(ScanMode::Normal),
            wake: Notify::new(),
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn is_scanning(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn mode(&self) -> ScanMode {
        *self.mode_lock()
    }

    fn mode_lock(&self) -> MutexGuard<'_, ScanMode> {
        self.mode.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Probes the device once and reports the outcome.
    ///
    /// Does nothing if a probe is already in flight. Probe failures are
    /// reported as a negative signal and never surface as errors.
    pub async fn scan(&self) -> ScanStatus {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            trace!("{self}: probe still in flight, skipping scan");
            return ScanStatus::Skipped;
        }
        let _in_flight = InFlight(&self.in_flight);

        let mode = self.mode();
        let port = self.ports.select(self.device.port);
        let timeout = mode.timeout(&self.device.timing);
        debug!("{self}: scanning port {port} ({mode:?})");
        let outcome = self
            .prober
            .attempt_connect(self.device.host, port, timeout)
            .await;

        let (reply, answer) = oneshot::channel();
        let command = HubCommand::ProbeCompleted {
            id: self.device.id.clone(),
            generation: self.generation,
            outcome,
            reply,
        };
        if self.hub.send(command).await.is_err() {
            debug!("{self}: presence hub is gone");
            return ScanStatus::Probed;
        }
        if let Ok(next) = answer.await {
            *self.mode_lock() = next;
        }
        ScanStatus::Probed
    }

    /// Wakes the scan loop early. Ignored while a probe is in flight.
    pub fn request_scan(&self) {
        self.wake.notify_waiters();
    }

    async fn run(self: Arc<Self>) {
        debug!("{self}: monitor started");
        loop {
            self.scan().await;

            let interval = self.mode().interval(&self.device.timing);
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = self.wake.notified() => debug!("{self}: scan requested"),
            }
        }
    }
}

impl fmt::Display for DeviceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.device.name, self.device.host)
    }
}

/// Owns a running monitor. Dropping it cancels the pending timer and any
/// in-flight probe.
pub(crate) struct MonitorHandle {
    monitor: Arc<DeviceMonitor>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    pub(crate) fn spawn(monitor: DeviceMonitor) -> Self {
        let monitor = Arc::new(monitor);
        let task = tokio::spawn(Arc::clone(&monitor).run());
        MonitorHandle { monitor, task }
    }

    pub(crate) fn monitor(&self) -> &Arc<DeviceMonitor> {
        &self.monitor
    }

    pub(crate) fn request_scan(&self) {
        self.monitor.request_scan();
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
