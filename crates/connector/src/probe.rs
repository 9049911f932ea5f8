//! Liveness probe
//!
//! Asks the agent host whether the remote agent process behind a session
//! is still answering. The transport can be up while the process is gone.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use reqwest::Url;

use crate::{session_endpoint, ConnectorError};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn is_alive(&self, session_id: &str) -> Result<bool, ConnectorError>;
}

#[derive(Debug, Deserialize)]
struct SessionStatusBody {
    cli_connected: Option<bool>,
}

/// Polls `GET {agent_url}/api/sessions/{id}`
pub struct HttpLivenessProbe {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLivenessProbe {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ConnectorError> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub fn status_url(&self, session_id: &str) -> Result<Url, ConnectorError> {
        session_endpoint(&self.base_url, &["api", "sessions"], session_id)
    }
}

#[async_trait]
impl LivenessProbe for HttpLivenessProbe {
    async fn is_alive(&self, session_id: &str) -> Result<bool, ConnectorError> {
        let response = self.client.get(self.status_url(session_id)?).send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(ConnectorError::StatusError(status.as_u16()));
        }

        let body = response.bytes().await?;
        Ok(parse_liveness(&body, session_id))
    }
}

/// A success response without `cli_connected` counts as alive.
fn parse_liveness(body: &[u8], session_id: &str) -> bool {
    match serde_json::from_slice::<SessionStatusBody>(body) {
        Ok(SessionStatusBody {
            cli_connected: Some(live),
        }) => live,
        Ok(_) => true,
        Err(e) => {
            debug!(
                component = "liveness_probe",
                event = "probe.body_unparsed",
                session_id = %session_id,
                error = %e,
                "Probe body not JSON, treating success status as alive"
            );
            true
        }
    }
}
