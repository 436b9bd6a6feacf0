//! Observability events and their Prometheus counters.
//!
//! The request path never touches a recorder directly. It hands an [`Event`]
//! to an [`EventEmitter`], which forwards it over a bounded channel to a
//! detached worker task. A full channel drops the event instead of waiting.
//!
//! Provided metrics:
//! * `regate_requests_total` (counter, label `method`)
//! * `regate_image_requests_total` (counter, label `image`)
//! * `regate_auth_total` (counter, label `outcome`)
//! * `regate_cache_total` (counter, label `result`)
//! * `regate_upstream_responses_total` (counter, label `status`)
use std::net::IpAddr;

use axum::http::{Method, StatusCode};
use eyre::WrapErr;
use metrics::{Unit, counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};

pub const REGATE_REQUESTS_TOTAL: &str = "regate_requests_total";
pub const REGATE_IMAGE_REQUESTS_TOTAL: &str = "regate_image_requests_total";
pub const REGATE_AUTH_TOTAL: &str = "regate_auth_total";
pub const REGATE_CACHE_TOTAL: &str = "regate_cache_total";
pub const REGATE_UPSTREAM_RESPONSES_TOTAL: &str = "regate_upstream_responses_total";

/// Default depth of the event queue.
pub const DEFAULT_EVENT_QUEUE: usize = 4096;

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        REGATE_REQUESTS_TOTAL,
        Unit::Count,
        "Requests that entered the proxy pipeline."
    );
    describe_counter!(
        REGATE_IMAGE_REQUESTS_TOTAL,
        Unit::Count,
        "Requests per repository name."
    );
    describe_counter!(
        REGATE_AUTH_TOTAL,
        Unit::Count,
        "Authorization decisions by outcome."
    );
    describe_counter!(
        REGATE_CACHE_TOTAL,
        Unit::Count,
        "Response cache lookups on cacheable endpoints."
    );
    describe_counter!(
        REGATE_UPSTREAM_RESPONSES_TOTAL,
        Unit::Count,
        "Responses received from the upstream registry."
    );
});

/// Something worth counting that happened on the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Request { method: Method, path: String },
    Auth { ip: Option<IpAddr>, success: bool },
    Cache { hit: bool },
    Upstream { status: StatusCode },
}

/// Non-blocking handle for emitting [`Event`]s. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::Sender<Event>>,
}

impl EventEmitter {
    /// Spawn the recording worker and return an emitter feeding it.
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(record_events(rx));
        (Self { tx: Some(tx) }, worker)
    }

    /// Emitter backed by a caller-owned channel.
    pub fn from_sender(tx: mpsc::Sender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Emitter that discards everything.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: Event) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::debug!(?event, "event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

async fn record_events(mut rx: mpsc::Receiver<Event>) {
    while let Some(event) = rx.recv().await {
        record(&event);
    }
    tracing::debug!("event worker stopped");
}

/// Apply a single event to the installed recorder.
pub fn record(event: &Event) {
    match event {
        Event::Request { method, path } => {
            counter!(REGATE_REQUESTS_TOTAL, "method" => method.to_string()).increment(1);
            if let Some(image) = image_name(path) {
                counter!(REGATE_IMAGE_REQUESTS_TOTAL, "image" => image.to_string()).increment(1);
            }
        }
        Event::Auth { ip, success } => {
            let outcome = if *success { "success" } else { "failure" };
            tracing::debug!(ip = ?ip, outcome, "authorization outcome");
            counter!(REGATE_AUTH_TOTAL, "outcome" => outcome).increment(1);
        }
        Event::Cache { hit } => {
            let result = if *hit { "hit" } else { "miss" };
            counter!(REGATE_CACHE_TOTAL, "result" => result).increment(1);
        }
        Event::Upstream { status } => {
            counter!(REGATE_UPSTREAM_RESPONSES_TOTAL, "status" => status.as_u16().to_string())
                .increment(1);
        }
    }
}

/// Repository name of a registry API path, e.g. `library/nginx` for
/// `/v2/library/nginx/manifests/latest`.
pub fn image_name(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/v2/")?;
    let mut end = 0;
    for segment in rest.split('/') {
        if matches!(segment, "blobs" | "manifests" | "tags") {
            let name = rest[..end].trim_end_matches('/');
            return (!name.is_empty()).then_some(name);
        }
        end += segment.len() + 1;
    }
    None
}

/// Install the Prometheus recorder and register metric descriptions.
pub fn init_metrics() -> eyre::Result<PrometheusHandle> {
    tracing::info!("Initializing metrics recorder");

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("Failed to install Prometheus recorder")?;

    Lazy::force(&DESCRIPTIONS);

    tracing::info!("Metrics recorder initialized");
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_names() {
        assert_eq!(image_name("/v2/nginx/manifests/latest"), Some("nginx"));
        assert_eq!(
            image_name("/v2/library/nginx/blobs/sha256:abc"),
            Some("library/nginx")
        );
        assert_eq!(image_name("/v2/org/team/app/tags/list"), Some("org/team/app"));
        assert_eq!(image_name("/v2/"), None);
        assert_eq!(image_name("/v2/_catalog"), None);
        assert_eq!(image_name("/v2/manifests/latest"), None);
        assert_eq!(image_name("/_health"), None);
    }

    #[tokio::test]
    async fn emitter_delivers_to_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let emitter = EventEmitter::from_sender(tx);

        emitter.emit(Event::Cache { hit: true });

        assert_eq!(rx.recv().await, Some(Event::Cache { hit: true }));
    }

    #[tokio::test]
    async fn full_queue_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let emitter = EventEmitter::from_sender(tx);

        emitter.emit(Event::Cache { hit: true });
        emitter.emit(Event::Cache { hit: false });

        assert_eq!(rx.recv().await, Some(Event::Cache { hit: true }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_emitter_is_silent() {
        EventEmitter::disabled().emit(Event::Upstream {
            status: StatusCode::OK,
        });
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        record(&Event::Request {
            method: Method::GET,
            path: "/v2/nginx/tags/list".to_string(),
        });
        record(&Event::Auth {
            ip: None,
            success: false,
        });
    }
}
