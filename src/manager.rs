use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::{DeviceConfig, DeviceEntry, DeviceId};
use crate::dispatcher::EventDispatcher;
use crate::error::ManagerError;
use crate::household::PresenceView;
use crate::hub::{Hub, HubCommand};
use crate::monitor::{DeviceMonitor, MonitorHandle};
use crate::ports::PortSelector;
use crate::presence::Clock;
use crate::probe::Prober;
use crate::store::{LastSeenStore, StoredPresence, spawn_writer};

/// Collaborators the manager runs with.
pub struct Components {
    pub prober: Arc<dyn Prober>,
    pub ports: Arc<dyn PortSelector>,
    pub store: Arc<dyn LastSeenStore>,
    pub clock: Arc<dyn Clock>,
    pub dispatcher: EventDispatcher,
}

/// Owns one monitor per tracked device and the hub they report to.
pub struct Manager {
    hub: mpsc::Sender<HubCommand>,
    view: PresenceView,
    monitors: HashMap<DeviceId, MonitorHandle>,
    prober: Arc<dyn Prober>,
    ports: Arc<dyn PortSelector>,
    restored: HashMap<DeviceId, StoredPresence>,
    next_generation: u64,
    hub_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Manager {
    /// Starts the hub and a monitor for every device.
    ///
    /// A store that cannot be read is logged and treated as empty.
    pub async fn start(
        components: Components,
        devices: Vec<DeviceConfig>,
    ) -> Result<Self, ManagerError> {
        let Components {
            prober,
            ports,
            store,
            clock,
            dispatcher,
        } = components;

        let restored = match store.load() {
            Ok(records) => records,
            Err(err) => {
                warn!("Could not read persisted presence state, starting fresh: {err}");
                HashMap::new()
            }
        };
        let (writer, writer_task) = spawn_writer(store);
        let (hub, view, hub_task) = Hub::spawn(dispatcher, writer, clock);

        let mut manager = Manager {
            hub,
            view,
            monitors: HashMap::new(),
            prober,
            ports,
            restored,
            next_generation: 0,
            hub_task,
            writer_task,
        };
        for device in devices {
            manager.track(device).await?;
        }
        info!("Monitoring {} device(s)", manager.monitors.len());
        Ok(manager)
    }

    pub fn view(&self) -> PresenceView {
        self.view.clone()
    }

    pub fn device_ids(&self) -> impl Iterator<Item = &DeviceId> {
        self.monitors.keys()
    }

    pub fn monitor(&self, id: &DeviceId) -> Option<&Arc<DeviceMonitor>> {
        self.monitors.get(id).map(MonitorHandle::monitor)
    }

    /// Validates a newly paired device and starts monitoring it.
    pub async fn add_device(&mut self, entry: DeviceEntry) -> Result<(), ManagerError> {
        let device = entry.into_config()?;
        self.track(device).await
    }

    /// Stops monitoring a device. Once this returns no further events are
    /// emitted for it, even for a probe that was already running.
    pub async fn remove_device(&mut self, id: &DeviceId) -> Result<(), ManagerError> {
        let Some(handle) = self.monitors.remove(id) else {
            return Err(ManagerError::UnknownDevice(id.clone()));
        };
        drop(handle);

        let (reply, answer) = oneshot::channel();
        self.send(HubCommand::Untrack {
            id: id.clone(),
            reply,
        })
        .await?;
        answer.await.map_err(|_| ManagerError::Stopped)?;
        Ok(())
    }

    /// Replaces a device's settings, keeping its presence state.
    pub async fn reconfigure(&mut self, entry: DeviceEntry) -> Result<(), ManagerError> {
        let device = Arc::new(entry.into_config()?);
        let Some(previous) = self.monitors.remove(&device.id) else {
            return Err(ManagerError::UnknownDevice(device.id.clone()));
        };
        drop(previous);

        let generation = self.bump_generation();
        let (reply, answer) = oneshot::channel();
        self.send(HubCommand::Reconfigure {
            device: Arc::clone(&device),
            generation,
            reply,
        })
        .await?;
        if !answer.await.map_err(|_| ManagerError::Stopped)? {
            return Err(ManagerError::UnknownDevice(device.id.clone()));
        }
        self.spawn_monitor(device, generation);
        Ok(())
    }

    /// Asks every monitor to scan now. Devices with a probe in flight ignore it.
    pub fn request_scan(&self) {
        debug!("Scan requested for all devices");
        for handle in self.monitors.values() {
            handle.request_scan();
        }
    }

    /// Cancels every monitor and waits for queued events and writes to drain.
    ///
    /// Each event consumer gets up to its delivery timeout per queued event.
    pub async fn stop(self) {
        let Manager {
            hub,
            monitors,
            hub_task,
            writer_task,
            ..
        } = self;
        drop(monitors);
        drop(hub);
        if let Err(err) = hub_task.await {
            warn!("Presence hub ended abnormally: {err}");
        }
        if let Err(err) = writer_task.await {
            warn!("Presence state writer ended abnormally: {err}");
        }
        info!("Stopped monitoring");
    }

    pub fn household_member_is_home(&self) -> bool {
        self.view.household_member_is_home()
    }

    pub fn kids_at_home(&self) -> bool {
        self.view.kids_at_home()
    }

    pub fn having_guests(&self) -> bool {
        self.view.having_guests()
    }

    pub fn someone_at_home(&self) -> bool {
        self.view.someone_at_home()
    }

    pub fn user_at_home(&self, id: &DeviceId) -> bool {
        self.view.user_at_home(id)
    }

    async fn track(&mut self, device: DeviceConfig) -> Result<(), ManagerError> {
        if self.monitors.contains_key(&device.id) {
            return Err(ManagerError::AlreadyTracked(device.id));
        }
        let device = Arc::new(device);
        let generation = self.bump_generation();
        let last_seen_at = self
            .restored
            .remove(&device.id)
            .and_then(|record| record.last_seen_at);

        let (reply, answer) = oneshot::channel();
        self.send(HubCommand::Track {
            device: Arc::clone(&device),
            generation,
            last_seen_at,
            reply,
        })
        .await?;
        answer.await.map_err(|_| ManagerError::Stopped)?;
        self.spawn_monitor(device, generation);
        Ok(())
    }

    fn spawn_monitor(&mut self, device: Arc<DeviceConfig>, generation: u64) {
        let id = device.id.clone();
        let monitor = DeviceMonitor::new(
            device,
            generation,
            Arc::clone(&self.prober),
            Arc::clone(&self.ports),
            self.hub.clone(),
        );
        self.monitors.insert(id, MonitorHandle::spawn(monitor));
    }

    fn bump_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    async fn send(&self, command: HubCommand) -> Result<(), ManagerError> {
        self.hub
            .send(command)
            .await
            .map_err(|_| ManagerError::Stopped)
    }
}
