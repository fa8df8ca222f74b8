//! [`ServiceDirectory`] over the Nomad HTTP API.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{
    DirectoryError, Event, EventBatch, ServiceDirectory, ServiceRegistration, Subscription,
    WILDCARD,
};
use crate::configuration::NomadConfig;
use crate::credential::Credential;

pub const TOKEN_HEADER: &str = "X-Nomad-Token";
pub const INDEX_HEADER: &str = "X-Nomad-Index";
const SERVICE_TOPIC: &str = "Service";
const FEED_BUFFER: usize = 16;
/// Longest feed frame accepted; longer ones are dropped.
const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct NamespaceServices {
    #[serde(rename = "Services", default)]
    services: Vec<ServiceStub>,
}

#[derive(Debug, Deserialize)]
struct ServiceStub {
    #[serde(rename = "ServiceName")]
    service_name: String,
}

pub struct NomadClient {
    http: Client,
    address: String,
    namespace: Option<String>,
    credential: Arc<Credential>,
}

impl NomadClient {
    pub fn new(config: &NomadConfig, credential: Arc<Credential>) -> Self {
        NomadClient {
            http: Client::new(),
            address: config.address.trim_end_matches('/').to_string(),
            namespace: config.namespace.clone(),
            credential,
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let mut request = self.http.get(format!("{}{}", self.address, path));
        if let Some(token) = self.credential.secret() {
            request = request.header(TOKEN_HEADER, token);
        }
        if let Some(namespace) = &self.namespace {
            request = request.query(&[("namespace", namespace)]);
        }
        request
    }

    async fn send(request: RequestBuilder) -> Result<Response, DirectoryError> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(DirectoryError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Path segment for a service name.
fn service_path(service: &str) -> Result<String, DirectoryError> {
    if service.is_empty() || service.contains(['/', '?', '#']) {
        return Err(DirectoryError::Url(format!("bad service name '{service}'")));
    }
    Ok(format!("/v1/service/{service}"))
}

/// Query pairs selecting the service topic for each watched name.
fn topic_query(watch: &[String], index: u64) -> Vec<(&'static str, String)> {
    let mut query = vec![("index", index.to_string())];
    if watch.is_empty() {
        query.push(("topic", format!("{SERVICE_TOPIC}:{WILDCARD}")));
    }
    for service in watch {
        query.push(("topic", format!("{SERVICE_TOPIC}:{service}")));
    }
    query
}

/// Splits the feed body into newline-terminated frames.
///
/// Bytes already searched for a newline are not scanned again. A frame
/// growing past `max_frame` is dropped up to its terminating newline.
struct FrameReader {
    buffer: Vec<u8>,
    scanned: usize,
    max_frame: usize,
    discarding: bool,
}

impl FrameReader {
    fn new(max_frame: usize) -> Self {
        FrameReader {
            buffer: Vec::new(),
            scanned: 0,
            max_frame,
            discarding: false,
        }
    }

    /// Append `chunk` and return every frame it completes.
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[self.scanned..].iter().position(|b| *b == b'\n') {
            let end = self.scanned + pos;
            let frame = self.buffer[start..end].trim_ascii();
            if self.discarding {
                self.discarding = false;
            } else if frame.len() > self.max_frame {
                log::warn!("updater.error dropping {} byte frame", frame.len());
            } else if !frame.is_empty() {
                frames.push(frame.to_vec());
            }
            start = end + 1;
            self.scanned = start;
        }

        self.buffer.drain(..start);
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_frame {
            if !self.discarding {
                log::warn!("updater.error dropping frame over {} bytes", self.max_frame);
            }
            self.buffer.clear();
            self.scanned = 0;
            self.discarding = true;
        }
        frames
    }
}

#[derive(Debug, Deserialize)]
struct RawBatch {
    #[serde(rename = "Index", default)]
    index: u64,
    #[serde(rename = "Events", default)]
    events: Vec<serde_json::Value>,
}

/// Decode one NDJSON frame; heartbeats decode to `None`.
///
/// Events that fail to decode are logged and left out of the batch.
fn decode_frame(frame: &[u8]) -> Result<Option<EventBatch>, DirectoryError> {
    let raw: RawBatch = serde_json::from_slice(frame)?;

    let mut events = Vec::with_capacity(raw.events.len());
    for value in &raw.events {
        match Event::deserialize(value) {
            Ok(event) => events.push(event),
            Err(e) => log::warn!("updater.error index={}: skipping event: {}", raw.index, e),
        }
    }

    if events.is_empty() {
        return Ok(None);
    }
    Ok(Some(EventBatch {
        index: raw.index,
        events,
    }))
}

/// Pump frames from the response body into `tx` until the body ends,
/// the transport fails or the subscription is dropped. Undecodable
/// frames are logged and skipped.
async fn feed(mut response: Response, tx: mpsc::Sender<Result<EventBatch, DirectoryError>>) {
    let mut reader = FrameReader::new(MAX_FRAME);
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        for frame in reader.push(&chunk) {
            match decode_frame(&frame) {
                Ok(Some(batch)) => {
                    if tx.send(Ok(batch)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("updater.error skipping frame: {}", e),
            }
        }
    }
}

#[async_trait]
impl ServiceDirectory for NomadClient {
    async fn services(&self) -> Result<Vec<String>, DirectoryError> {
        let response = Self::send(self.get("/v1/services")).await?;
        let namespaces: Vec<NamespaceServices> = serde_json::from_slice(&response.bytes().await?)?;

        let mut names: Vec<String> = namespaces
            .into_iter()
            .flat_map(|ns| ns.services)
            .map(|stub| stub.service_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn list(
        &self,
        service: &str,
    ) -> Result<(Vec<ServiceRegistration>, u64), DirectoryError> {
        let response = Self::send(self.get(&service_path(service)?)).await?;
        let index = response
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let members = serde_json::from_slice(&response.bytes().await?)?;
        Ok((members, index))
    }

    async fn stream(&self, watch: &[String], index: u64) -> Result<Subscription, DirectoryError> {
        let request = self.get("/v1/event/stream").query(&topic_query(watch, index));
        let response = Self::send(request).await?;

        let (tx, rx) = mpsc::channel(FEED_BUFFER);
        let feeder = tokio::spawn(feed(response, tx));
        Ok(Subscription::with_feeder(rx, feeder))
    }
}
