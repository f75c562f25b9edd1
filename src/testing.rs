//! Test doubles shared by the unit tests.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt as _;
use futures::future::BoxFuture;
use tokio::sync::{Notify, mpsc, oneshot};

use crate::config::{DeviceConfig, DeviceEntry};
use crate::dispatcher::{BroadcastConsumer, EventDispatcher};
use crate::household::PresenceView;
use crate::hub::{Hub, HubCommand};
use crate::monitor::DeviceMonitor;
use crate::ports::RandomAlternation;
use crate::presence::ManualClock;
use crate::probe::{ProbeOutcome, Prober};
use crate::store::{MemoryStore, spawn_writer};

pub(crate) fn device(id: &str, is_guest: bool) -> Arc<DeviceConfig> {
    Arc::new(entry(id, is_guest).into_config().unwrap())
}

pub(crate) fn entry(id: &str, is_guest: bool) -> DeviceEntry {
    let mut entry = DeviceEntry::new(id, &id.to_uppercase(), "192.0.2.10");
    entry.is_guest = Some(is_guest);
    entry
}

/// Answers with a fixed script of outcomes, repeating the last one forever.
pub(crate) struct ScriptedProber {
    outcomes: Mutex<VecDeque<ProbeOutcome>>,
    last: Mutex<ProbeOutcome>,
    calls: AtomicUsize,
    timeouts: Mutex<Vec<Duration>>,
}

impl ScriptedProber {
    pub(crate) fn new(outcomes: Vec<ProbeOutcome>) -> Arc<Self> {
        Arc::new(ScriptedProber {
            outcomes: Mutex::new(outcomes.into()),
            last: Mutex::new(ProbeOutcome::Unreachable),
            calls: AtomicUsize::new(0),
            timeouts: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Timeout passed to every connect attempt so far, in order.
    pub(crate) fn timeouts(&self) -> Vec<Duration> {
        self.timeouts.lock().unwrap().clone()
    }
}

impl Prober for ScriptedProber {
    fn attempt_connect(
        &self,
        _host: IpAddr,
        _port: u16,
        timeout: Duration,
    ) -> BoxFuture<'static, ProbeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.timeouts.lock().unwrap().push(timeout);
        let mut last = self.last.lock().unwrap();
        if let Some(next) = self.outcomes.lock().unwrap().pop_front() {
            *last = next;
        }
        let outcome = last.clone();
        async move { outcome }.boxed()
    }
}

/// Keeps every probe open until [`HeldProber::release`] is called.
pub(crate) struct HeldProber {
    outcome: ProbeOutcome,
    calls: AtomicUsize,
    called: Notify,
    gate: Arc<Notify>,
}

impl HeldProber {
    pub(crate) fn new(outcome: ProbeOutcome) -> Arc<Self> {
        Arc::new(HeldProber {
            outcome,
            calls: AtomicUsize::new(0),
            called: Notify::new(),
            gate: Arc::new(Notify::new()),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_for_calls(&self, count: usize) {
        while self.calls() < count {
            self.called.notified().await;
        }
    }

    pub(crate) fn release(&self) {
        self.gate.notify_one();
    }
}

impl Prober for HeldProber {
    fn attempt_connect(
        &self,
        _host: IpAddr,
        _port: u16,
        _timeout: Duration,
    ) -> BoxFuture<'static, ProbeOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.called.notify_one();
        let gate = Arc::clone(&self.gate);
        let outcome = self.outcome.clone();
        async move {
            gate.notified().await;
            outcome
        }
        .boxed()
    }
}

/// A running hub with a broadcast consumer and in-memory persistence.
pub(crate) struct World {
    pub(crate) hub: mpsc::Sender<HubCommand>,
    pub(crate) view: PresenceView,
    pub(crate) broadcast: Arc<BroadcastConsumer>,
}

impl World {
    pub(crate) fn new() -> Self {
        let broadcast = Arc::new(BroadcastConsumer::new(64));
        let mut dispatcher = EventDispatcher::default();
        dispatcher.register(broadcast.clone());
        let (writer, _) = spawn_writer(Arc::new(MemoryStore::default()));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let (hub, view, _) = Hub::spawn(dispatcher, writer, clock);
        World {
            hub,
            view,
            broadcast,
        }
    }

    pub(crate) fn monitor(
        &self,
        device: Arc<DeviceConfig>,
        generation: u64,
        prober: Arc<dyn Prober>,
    ) -> DeviceMonitor {
        DeviceMonitor::new(
            device,
            generation,
            prober,
            Arc::new(RandomAlternation::default()),
            self.hub.clone(),
        )
    }

    pub(crate) async fn track(&self, monitor: &DeviceMonitor) {
        self.track_config(Arc::new(monitor.device().clone())).await;
    }

    pub(crate) async fn track_config(&self, device: Arc<DeviceConfig>) {
        let (reply, rx) = oneshot::channel();
        self.hub
            .send(HubCommand::Track {
                device,
                generation: 1,
                last_seen_at: None,
                reply,
            })
            .await
            .unwrap();
        rx.await.unwrap();
    }
}
