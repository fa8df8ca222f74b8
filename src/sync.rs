//! Keeps the [`DomainRegistry`] in step with the service directory.
//!
//! The synchronizer lists every watched service once (`Init`), then follows
//! the directory's event feed from the resulting index (`Streaming`) until
//! the shutdown signal fires (`Stopped`). A feed that closes or fails while
//! streaming is reopened from the last applied index. Failing to list or to
//! open the feed is fatal and returned to the caller.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use pingora::services::background::BackgroundService;
use tokio::sync::watch;

use crate::directory::{
    Delivery, DirectoryError, Event, EventKind, ServiceDirectory, Subscription, WILDCARD,
};
use crate::registry::DomainRegistry;

/// Pause before reopening a feed that ended while streaming.
pub const RESUME_DELAY: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Init,
    Streaming,
    Stopped,
}

/// Observable synchronizer state.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncState {
    pub phase: Phase,
    /// Service names listed during `Init`.
    pub watch_set: Vec<String>,
    /// Feed position to resume from; never decreases.
    pub resume_index: u64,
}

impl SyncState {
    fn advance(&mut self, index: u64) {
        self.resume_index = self.resume_index.max(index);
    }
}

pub struct Synchronizer<D> {
    directory: Arc<D>,
    registry: Arc<DomainRegistry>,
    watch: Vec<String>,
    resume_delay: Duration,
    state: Mutex<SyncState>,
}

/// Wait for `fut` unless `shutdown` fires first; `None` means cancelled.
async fn until_shutdown<F: Future>(
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Option<F::Output> {
    tokio::pin!(fut);
    loop {
        if *shutdown.borrow() {
            return None;
        }
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return None;
                }
            }
            output = &mut fut => return Some(output),
        }
    }
}

impl<D: ServiceDirectory> Synchronizer<D> {
    pub fn new(directory: Arc<D>, registry: Arc<DomainRegistry>, watch: Vec<String>) -> Self {
        Synchronizer {
            directory,
            registry,
            watch,
            resume_delay: RESUME_DELAY,
            state: Mutex::new(SyncState {
                phase: Phase::Init,
                watch_set: Vec::new(),
                resume_index: 0,
            }),
        }
    }

    pub fn with_resume_delay(mut self, delay: Duration) -> Self {
        self.resume_delay = delay;
        self
    }

    pub fn state(&self) -> SyncState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn resume_index(&self) -> u64 {
        self.state().resume_index
    }

    fn update<T>(&self, f: impl FnOnce(&mut SyncState) -> T) -> T {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn stop(&self) -> Result<(), DirectoryError> {
        self.update(|state| state.phase = Phase::Stopped);
        log::info!("updater.stopped index={}", self.resume_index());
        Ok(())
    }

    /// Run until `shutdown` becomes true or the directory fails.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), DirectoryError> {
        log::info!("updater.starting services={:?}", self.watch);

        if until_shutdown(&mut shutdown, self.initial_sync())
            .await
            .transpose()?
            .is_none()
        {
            return self.stop();
        }

        self.update(|state| state.phase = Phase::Streaming);
        loop {
            let index = self.resume_index();
            log::info!("updater.streaming index={}", index);

            let opened = until_shutdown(&mut shutdown, self.directory.stream(&self.watch, index));
            let mut subscription = match opened.await {
                None => return self.stop(),
                Some(Ok(subscription)) => subscription,
                Some(Err(e)) => {
                    log::error!("updater.error: {}", e);
                    return Err(e);
                }
            };

            if !self.follow(&mut subscription, &mut shutdown).await {
                return self.stop();
            }
            drop(subscription);

            let delay = tokio::time::sleep(self.resume_delay);
            if until_shutdown(&mut shutdown, delay).await.is_none() {
                return self.stop();
            }
        }
    }

    /// Names to list during `Init`, with the wildcard expanded.
    async fn watch_set(&self) -> Result<Vec<String>, DirectoryError> {
        if !self.watch.iter().any(|s| s == WILDCARD) {
            return Ok(self.watch.clone());
        }

        let mut names = self.directory.services().await?;
        for name in &self.watch {
            if name != WILDCARD && !names.contains(name) {
                names.push(name.clone());
            }
        }
        Ok(names)
    }

    /// List current members of every watched service and register them.
    async fn initial_sync(&self) -> Result<(), DirectoryError> {
        let services = self.watch_set().await?;
        self.update(|state| state.watch_set = services.clone());

        for service in &services {
            let (members, index) = self.directory.list(service).await?;
            log::info!(
                "updater.sync service={} index={} members={}",
                service,
                index,
                members.len()
            );
            self.update(|state| state.advance(index.saturating_add(1)));

            for member in &members {
                self.registry.add(member);
            }
        }
        Ok(())
    }

    /// Apply batches until the feed ends. Returns false once cancelled.
    async fn follow(
        &self,
        subscription: &mut Subscription,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        loop {
            match subscription.next(shutdown).await {
                Delivery::Batch(batch) => {
                    for event in &batch.events {
                        self.apply(event);
                    }
                }
                Delivery::Closed => {
                    log::warn!("updater.closed index={}", self.resume_index());
                    return true;
                }
                Delivery::Failed(e) => {
                    log::warn!("updater.error index={}: {}", self.resume_index(), e);
                    return true;
                }
                Delivery::Cancelled => return false,
            }
        }
    }

    fn apply(&self, event: &Event) {
        log::debug!("updater.event type={} index={}", event.kind, event.index);
        self.update(|state| state.advance(event.index));

        let service = match event.service() {
            Ok(Some(service)) => service,
            Ok(None) => return,
            Err(e) => {
                log::warn!("updater.error index={}: {}", event.index, e);
                return;
            }
        };

        match event.kind() {
            EventKind::Registration => self.registry.add(&service),
            EventKind::Deregistration => self.registry.del(&service),
            EventKind::Other => {}
        }
    }
}

/// Runs a [`Synchronizer`] as a pingora background service.
///
/// A directory failure terminates the process so the supervisor restarts
/// it with a fresh snapshot.
pub struct SyncService<D> {
    synchronizer: Synchronizer<D>,
}

impl<D> SyncService<D> {
    pub fn new(synchronizer: Synchronizer<D>) -> Self {
        Self { synchronizer }
    }
}

#[async_trait]
impl<D: ServiceDirectory + 'static> BackgroundService for SyncService<D> {
    async fn start(&self, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.synchronizer.run(shutdown).await {
            log::error!("updater.fatal: {}", e);
            std::process::exit(1);
        }
    }
}
