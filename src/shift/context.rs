use crate::shift::config::MigrationConfig;
use crate::shift::util::now_epoch_ms;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cooperative cancellation shared by the engine and the signal handler.
#[derive(Debug, Clone)]
pub struct RunControl {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Sleep for `delay`. Returns `false` when cancellation cut it short.
    pub async fn sleep(&self, delay: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.cancelled() => false,
        }
    }
}

/// Everything one migration pass needs to know, passed in explicitly.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: String,
    pub started_at_ms: u64,
    pub source_folders: Vec<String>,
    pub destination_folder: String,
    pub batch_size: usize,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub workers: usize,
    pub op_timeout: Duration,
    pub flag_settle_delay: Duration,
    pub flag_settle_attempts: u32,
    pub control: RunControl,
}

impl RunContext {
    pub fn from_config(cfg: &MigrationConfig, control: RunControl) -> Self {
        let started_at_ms = now_epoch_ms();
        Self {
            run_id: format!("run-{started_at_ms}-{}", std::process::id()),
            started_at_ms,
            source_folders: cfg.source_folders.clone(),
            destination_folder: cfg.destination_folder.clone(),
            batch_size: cfg.batch_size,
            max_attempts: cfg.max_attempts,
            retry_delay: cfg.retry_delay(),
            workers: cfg.workers,
            op_timeout: cfg.op_timeout(),
            flag_settle_delay: cfg.flag_settle_delay(),
            flag_settle_attempts: cfg.flag_settle_attempts,
            control,
        }
    }
}
