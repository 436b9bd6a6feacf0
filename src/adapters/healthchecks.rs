//! Reporter for a healthchecks.io compatible ping service.
//!
//! Endpoints, relative to `<base>/<uuid>`:
//! * `` success ping
//! * `/start` process is starting
//! * `/fail` something went wrong, body carries the reason
//! * `/<code>` process exited with `code`
use std::time::Duration;

use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::broadcast;
use url::Url;

use crate::{ports::health_reporter::HealthReporter, utils::graceful_shutdown::ShutdownReason};

#[derive(Error, Debug)]
pub enum HealthcheckError {
    #[error("invalid healthchecks URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("healthchecks request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("healthchecks answered {0}")]
    Status(StatusCode),
}

#[derive(Clone)]
pub struct HealthchecksClient {
    client: Client,
    check_url: String,
}

impl HealthchecksClient {
    pub fn new(base_url: &str, uuid: &str) -> Result<Self, HealthcheckError> {
        let check_url = format!("{}/{}", base_url.trim_end_matches('/'), uuid.trim());
        Url::parse(&check_url)?;

        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { client, check_url })
    }

    async fn send(&self, suffix: &str, body: String) -> Result<(), HealthcheckError> {
        let url = format!("{}{suffix}", self.check_url);
        let response = self.client.post(&url).body(body).send().await?;
        if !response.status().is_success() {
            return Err(HealthcheckError::Status(response.status()));
        }
        Ok(())
    }

    pub async fn start(&self, body: impl Into<String>) -> Result<(), HealthcheckError> {
        self.send("/start", body.into()).await
    }

    pub async fn ping(&self) -> Result<(), HealthcheckError> {
        self.send("", String::new()).await
    }

    pub async fn report_fail(&self, body: impl Into<String>) -> Result<(), HealthcheckError> {
        self.send("/fail", body.into()).await
    }

    pub async fn exit_status(&self, code: i32, body: impl Into<String>) -> Result<(), HealthcheckError> {
        self.send(&format!("/{code}"), body.into()).await
    }

    /// Ping every `interval` until a shutdown signal arrives.
    pub async fn run(&self, interval: Duration, mut shutdown: broadcast::Receiver<ShutdownReason>) {
        tracing::info!(interval = ?interval, "healthchecks ping loop started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.ping().await {
                        tracing::warn!(error = %err, "healthchecks ping failed");
                    }
                }
                _ = shutdown.recv() => break,
            }
        }
        tracing::info!("healthchecks ping loop stopped");
    }
}

impl HealthReporter for HealthchecksClient {
    fn fail(&self, body: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(%body, "no runtime to report health failure on");
            return;
        };
        let client = self.clone();
        runtime.spawn(async move {
            if let Err(err) = client.report_fail(body).await {
                tracing::warn!(error = %err, "failed to report health failure");
            }
        });
    }
}
