//! The single task that owns every device's presence state.
//!
//! Monitors only probe. Every result is sent here, evaluated, aggregated and
//! dispatched one command at a time, so an aggregation pass never sees a
//! snapshot that another device is halfway through changing.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::{DeviceConfig, DeviceId};
use crate::dispatcher::EventDispatcher;
use crate::household::{DeviceStatus, HouseholdSnapshot, PresenceView, aggregate};
use crate::presence::{Clock, PresenceState, ScanMode, Transition};
use crate::probe::{ProbeErrorKind, ProbeOutcome};
use crate::store::{StoredPresence, WriteRequest};

const COMMAND_QUEUE: usize = 256;

#[derive(Debug)]
pub(crate) enum HubCommand {
    Track {
        device: Arc<DeviceConfig>,
        generation: u64,
        last_seen_at: Option<DateTime<Utc>>,
        reply: oneshot::Sender<()>,
    },
    Reconfigure {
        device: Arc<DeviceConfig>,
        generation: u64,
        reply: oneshot::Sender<bool>,
    },
    Untrack {
        id: DeviceId,
        reply: oneshot::Sender<bool>,
    },
    ProbeCompleted {
        id: DeviceId,
        generation: u64,
        outcome: ProbeOutcome,
        reply: oneshot::Sender<ScanMode>,
    },
}

struct Entry {
    device: Arc<DeviceConfig>,
    /// Bumped whenever the device's monitor is replaced; results from older monitors are ignored.
    generation: u64,
    state: PresenceState,
}

pub(crate) struct Hub {
    entries: HashMap<DeviceId, Entry>,
    snapshot: HouseholdSnapshot,
    snapshot_tx: watch::Sender<Arc<HouseholdSnapshot>>,
    dispatcher: EventDispatcher,
    writer: mpsc::UnboundedSender<WriteRequest>,
    clock: Arc<dyn Clock>,
}

impl Hub {
    pub(crate) fn spawn(
        dispatcher: EventDispatcher,
        writer: mpsc::UnboundedSender<WriteRequest>,
        clock: Arc<dyn Clock>,
    ) -> (mpsc::Sender<HubCommand>, PresenceView, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(HouseholdSnapshot::default()));
        let hub = Hub {
            entries: HashMap::new(),
            snapshot: HouseholdSnapshot::default(),
            snapshot_tx,
            dispatcher,
            writer,
            clock,
        };
        let handle = tokio::spawn(hub.run(rx));
        (tx, PresenceView::new(snapshot_rx), handle)
    }

    async fn run(mut self, mut rx: mpsc::Receiver<HubCommand>) {
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        debug!("Presence hub stopped, draining event consumers");
        self.dispatcher.shutdown().await;
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Track {
                device,
                generation,
                last_seen_at,
                reply,
            } => {
                self.track(device, generation, last_seen_at);
                let _ = reply.send(());
            }
            HubCommand::Reconfigure {
                device,
                generation,
                reply,
            } => {
                let known = self.reconfigure(device, generation);
                let _ = reply.send(known);
            }
            HubCommand::Untrack { id, reply } => {
                let known = self.untrack(&id);
                let _ = reply.send(known);
            }
            HubCommand::ProbeCompleted {
                id,
                generation,
                outcome,
                reply,
            } => {
                if let Some(mode) = self.probe_completed(&id, generation, &outcome) {
                    let _ = reply.send(mode);
                }
            }
        }
    }

    fn track(
        &mut self,
        device: Arc<DeviceConfig>,
        generation: u64,
        last_seen_at: Option<DateTime<Utc>>,
    ) {
        let state = PresenceState::restored(last_seen_at);
        info!("Tracking {} ({})", device.name, device.id);
        self.snapshot.insert(
            device.id.clone(),
            DeviceStatus::new(&device, state.present(), state.last_seen_at()),
        );
        self.entries.insert(
            device.id.clone(),
            Entry {
                device,
                generation,
                state,
            },
        );
        self.publish();
    }

    fn reconfigure(&mut self, device: Arc<DeviceConfig>, generation: u64) -> bool {
        let Some(entry) = self.entries.get_mut(&device.id) else {
            return false;
        };
        info!("Reconfigured {} ({})", device.name, device.id);
        self.snapshot.insert(
            device.id.clone(),
            DeviceStatus::new(&device, entry.state.present(), entry.state.last_seen_at()),
        );
        entry.device = device;
        entry.generation = generation;
        self.publish();
        true
    }

    fn untrack(&mut self, id: &DeviceId) -> bool {
        if self.entries.remove(id).is_none() {
            return false;
        }
        info!("Stopped tracking {id}");
        self.snapshot.remove(id);
        if self.writer.send(WriteRequest::Remove(id.clone())).is_err() {
            warn!("Presence state writer is gone, {id} stays on disk");
        }
        self.publish();
        true
    }

    fn probe_completed(
        &mut self,
        id: &DeviceId,
        generation: u64,
        outcome: &ProbeOutcome,
    ) -> Option<ScanMode> {
        let Some(entry) = self.entries.get_mut(id) else {
            debug!("Discarding probe result for removed device {id}");
            return None;
        };
        if entry.generation != generation {
            debug!("Discarding stale probe result for {id}");
            return None;
        }

        match outcome {
            ProbeOutcome::Reachable => debug!("{id}: online"),
            ProbeOutcome::Unreachable => debug!("{id}: offline: no answer"),
            ProbeOutcome::Error(kind @ ProbeErrorKind::Io(_)) => warn!("{id}: offline: {kind}"),
            ProbeOutcome::Error(kind) => debug!("{id}: offline: {kind}"),
        }

        let now = self.clock.now();
        let signal = outcome.is_reachable();
        let transition = entry
            .state
            .evaluate(signal, now, entry.device.timing.away_delay);

        if transition.is_some() || (signal && entry.state.needs_persist(now)) {
            let record = StoredPresence {
                last_seen_at: entry.state.last_seen_at(),
                present: entry.state.present(),
            };
            if self.writer.send(WriteRequest::Save(id.clone(), record)).is_err() {
                warn!("Presence state writer is gone, not persisting {id}");
            }
            entry.state.mark_persisted(now);
        }

        let mode = entry.state.scan_mode(now, &entry.device.timing);
        self.snapshot.insert(
            id.clone(),
            DeviceStatus::new(&entry.device, entry.state.present(), entry.state.last_seen_at()),
        );

        if let Some(transition) = transition {
            match transition {
                Transition::Arrived => info!("{} arrived", entry.device.name),
                Transition::Left => info!("{} left", entry.device.name),
            }
            for event in aggregate(id, transition, &self.snapshot) {
                self.dispatcher.emit(&event);
            }
        }
        self.publish();
        Some(mode)
    }

    fn publish(&self) {
        self.snapshot_tx.send_replace(Arc::new(self.snapshot.clone()));
    }
}
