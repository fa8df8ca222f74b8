//! Service directory collaborator.
//!
//! The synchronizer only sees the [`ServiceDirectory`] trait: a snapshot
//! listing per service plus an incremental event feed delivered through a
//! [`Subscription`]. [`nomad::NomadClient`] implements it over HTTP.

pub mod nomad;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Watch-set marker meaning "every service the directory knows".
pub const WILDCARD: &str = "*";

/// Event type for a new or updated service instance.
pub const REGISTRATION_EVENT: &str = "ServiceRegistration";
/// Event type for a removed service instance.
pub const DEREGISTRATION_EVENT: &str = "ServiceDeregistration";

// ============================================================================
// Records
// ============================================================================

/// One registered service instance as reported by the directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceRegistration {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "ServiceName")]
    pub service_name: String,
    #[serde(rename = "Namespace")]
    pub namespace: String,
    #[serde(rename = "JobID")]
    pub job_id: String,
    #[serde(rename = "AllocID")]
    pub alloc_id: String,
    #[serde(rename = "Address")]
    pub address: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Tags", deserialize_with = "null_as_empty")]
    pub tags: Vec<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<Vec<String>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// Kind of a feed event, as far as routing is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Registration,
    Deregistration,
    Other,
}

/// One entry of the incremental feed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Event {
    #[serde(rename = "Type")]
    pub kind: String,
    #[serde(rename = "Index")]
    pub index: u64,
    #[serde(rename = "Payload")]
    pub payload: serde_json::Value,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self.kind.as_str() {
            REGISTRATION_EVENT => EventKind::Registration,
            DEREGISTRATION_EVENT => EventKind::Deregistration,
            _ => EventKind::Other,
        }
    }

    /// Decode the service record carried by this event.
    ///
    /// `Ok(None)` when the payload carries no service at all.
    pub fn service(&self) -> Result<Option<ServiceRegistration>, serde_json::Error> {
        match self.payload.get("Service") {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(service) => ServiceRegistration::deserialize(service).map(Some),
        }
    }
}

/// A group of events delivered together by the feed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EventBatch {
    #[serde(rename = "Index")]
    pub index: u64,
    #[serde(rename = "Events")]
    pub events: Vec<Event>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("directory returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode directory response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid directory url: {0}")]
    Url(String),
}

// ============================================================================
// Subscription
// ============================================================================

/// Outcome of waiting on a [`Subscription`].
#[derive(Debug)]
pub enum Delivery {
    /// Next batch of events, in feed order.
    Batch(EventBatch),
    /// The feed ended on its own; it may be reopened.
    Closed,
    /// The feed reported an error; it may be reopened.
    Failed(DirectoryError),
    /// The shutdown signal fired.
    Cancelled,
}

/// A live, cancellable feed of event batches.
///
/// Dropping the subscription stops the task feeding it.
pub struct Subscription {
    rx: mpsc::Receiver<Result<EventBatch, DirectoryError>>,
    feeder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<Result<EventBatch, DirectoryError>>) -> Self {
        Subscription { rx, feeder: None }
    }

    /// Subscription whose batches are produced by `feeder`.
    pub fn with_feeder(
        rx: mpsc::Receiver<Result<EventBatch, DirectoryError>>,
        feeder: JoinHandle<()>,
    ) -> Self {
        Subscription {
            rx,
            feeder: Some(feeder),
        }
    }

    /// Wait for the next batch, or for `shutdown` to become true.
    ///
    /// Cancellation takes priority over a batch that is ready at the
    /// same moment. A dropped shutdown sender counts as cancellation.
    pub async fn next(&mut self, shutdown: &mut watch::Receiver<bool>) -> Delivery {
        loop {
            if *shutdown.borrow() {
                return Delivery::Cancelled;
            }

            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Delivery::Cancelled;
                    }
                }
                item = self.rx.recv() => {
                    return match item {
                        Some(Ok(batch)) => Delivery::Batch(batch),
                        Some(Err(e)) => Delivery::Failed(e),
                        None => Delivery::Closed,
                    };
                }
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feeder) = self.feeder.take() {
            feeder.abort();
        }
    }
}

// ============================================================================
// Directory trait
// ============================================================================

/// Source of service membership: snapshots plus an incremental feed.
#[async_trait]
pub trait ServiceDirectory: Send + Sync {
    /// Names of every service currently known.
    async fn services(&self) -> Result<Vec<String>, DirectoryError>;

    /// Current members of `service` plus the directory's modify index.
    async fn list(&self, service: &str)
    -> Result<(Vec<ServiceRegistration>, u64), DirectoryError>;

    /// Open the event feed for `watch` starting at `index`.
    async fn stream(&self, watch: &[String], index: u64) -> Result<Subscription, DirectoryError>;
}
