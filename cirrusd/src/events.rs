use std::sync::Mutex;

use tokio::sync::mpsc;

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// Everything the core reports to the outside. Subscribers receive events
/// through bounded channels; a slow or gone subscriber loses events instead
/// of blocking the emitting task.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    PassProgress {
        stage: PassStage,
        percentage: u8,
        current_path: String,
    },
    TransferProgress {
        file_name: String,
        bytes_sent: u64,
        bytes_total: u64,
        mib_per_sec: f64,
        eta_seconds: u64,
    },
    PassCompleted {
        uploads: usize,
        downloads: usize,
        folders_created: usize,
        deferred: usize,
    },
    Error {
        message: String,
    },
    ReauthRequired,
    FsChange {
        change: FsChangeKind,
        path: String,
        old_path: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassStage {
    Snapshot,
    UploadNew,
    Download,
    UploadNewer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsChangeKind {
    Added,
    Changed,
    Removed,
    Renamed,
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<SyncEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<SyncEvent> {
        self.subscribe_with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> mpsc::Receiver<SyncEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .push(tx);
        rx
    }

    pub fn emit(&self, event: SyncEvent) {
        let mut subscribers = self.subscribers.lock().expect("event bus mutex poisoned");
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            // A full subscriber keeps its slot and drops this event.
            Err(mpsc::error::TrySendError::Full(_)) => true,
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(SyncEvent::Error {
            message: message.into(),
        });
    }
}
