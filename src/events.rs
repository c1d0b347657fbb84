//! Process-wide event bus: unbounded multicast of lifecycle and artifact
//! events. Subscribers join at "now"; there is no replay. Delivery is
//! best-effort: a subscriber whose queue is full or gone is dropped.
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::artifacts::Artifact;
use crate::engine::Engine;

const SUBSCRIBER_QUEUE: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleKind {
    RunStarted,
    RunExited,
    RunStopped,
    RunKilled,
    RunIdleStopped,
    RunClosed,
}

impl LifecycleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleKind::RunStarted => "run-started",
            LifecycleKind::RunExited => "run-exited",
            LifecycleKind::RunStopped => "run-stopped",
            LifecycleKind::RunKilled => "run-killed",
            LifecycleKind::RunIdleStopped => "run-idle-stopped",
            LifecycleKind::RunClosed => "run-closed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub event: LifecycleKind,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
    pub warm: bool,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ArtifactEvent {
    #[serde(flatten)]
    pub artifact: Artifact,
    #[serde(rename = "runId")]
    pub run_id: String,
    pub engine: Engine,
    pub workspace: String,
    pub ts: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BusEvent {
    Lifecycle(LifecycleEvent),
    Artifact(ArtifactEvent),
}

impl BusEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            BusEvent::Lifecycle(ev) => ev.event.as_str(),
            BusEvent::Artifact(_) => "artifact",
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<SyncSender<BusEvent>>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus::default()
    }

    pub fn subscribe(&self) -> Receiver<BusEvent> {
        let (tx, rx) = sync_channel(SUBSCRIBER_QUEUE);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: BusEvent) {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}
