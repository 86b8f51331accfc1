use std::{sync::Arc, time::Duration};

use crate::{
    error::{Error, Result},
    manager::FileManager,
    scheduler::{BackgroundTask, Context, Scheduler},
};

/// Closes cached files that have sat unused for longer than `max_idle`.
pub struct IdleFileCloser {
    manager: Arc<FileManager>,
}

impl IdleFileCloser {
    pub fn new(manager: Arc<FileManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for IdleFileCloser {
    fn name(&self) -> &'static str {
        "idle-file-closer"
    }

    fn interval(&self) -> Duration {
        self.manager.config().idle_check_interval()
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        // Closing files blocks.
        let manager = self.manager.clone();
        tokio::task::spawn_blocking(move || manager.close_idle_readers())
            .await
            .map_err(|e| Error::InvalidState(format!("Idle file closer panicked: {}", e)))?;
        Ok(())
    }
}

pub struct MetricsTask {
    manager: Arc<FileManager>,
}

impl MetricsTask {
    pub fn new(manager: Arc<FileManager>) -> Self {
        Self { manager }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "file-manager-metrics"
    }

    fn interval(&self) -> Duration {
        self.manager.config().metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.manager.collect_metrics();
        Ok(())
    }
}

/// Registers the file manager's background tasks.
pub fn register(manager: &Arc<FileManager>, scheduler: &Scheduler) {
    scheduler
        .register(Arc::new(IdleFileCloser::new(manager.clone())))
        .register(Arc::new(MetricsTask::new(manager.clone())));
}
