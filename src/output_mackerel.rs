use std::env;
use std::time::Duration;

use serde::Serialize;
use ureq::{Agent, AgentBuilder};

use crate::error::{Error, OutputError};
use crate::output::{call_error, Outputs};
use crate::payload::{MackerelTarget, ServiceMetric};
use crate::sigv4::uri_encode;

pub const DEFAULT_API_BASE: &str = "https://api.mackerelio.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Metrics-service backend posting service and host metrics to Mackerel.
pub struct MackerelOutput {
    agent: Agent,
    api_base: String,
    api_key: String,
}

#[derive(Serialize)]
struct HostMetricValue<'a> {
    #[serde(rename = "hostId")]
    host_id: &'a str,
    name: &'a str,
    time: i64,
    value: f64,
}

impl MackerelOutput {
    pub fn new(api_key: impl Into<String>, api_base: &str) -> Self {
        Self {
            agent: AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            api_base: api_base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    /// Reads `MACKEREL_APIKEY` and, if set, `MACKEREL_APIBASE`.
    pub fn from_env() -> Result<Self, Error> {
        let api_key = env::var("MACKEREL_APIKEY")
            .ok()
            .filter(|v| !v.is_empty())
            .ok_or(Error::Backend {
                backend: "mackerel",
                reason: "MACKEREL_APIKEY is not set".into(),
            })?;
        let api_base = env::var("MACKEREL_APIBASE")
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self::new(api_key, &api_base))
    }

    fn url(&self, target: &MackerelTarget) -> String {
        match target {
            MackerelTarget::Service(name) => format!(
                "{}/api/v0/services/{}/tsdb",
                self.api_base,
                uri_encode(name, true)
            ),
            MackerelTarget::Host(_) => format!("{}/api/v0/tsdb", self.api_base),
        }
    }
}

/// JSON body for one post. Host metrics carry their host id on every value.
pub fn encode_body(payload: &ServiceMetric) -> Result<String, serde_json::Error> {
    match &payload.target {
        MackerelTarget::Service(_) => serde_json::to_string(&payload.values),
        MackerelTarget::Host(host_id) => serde_json::to_string(
            &payload
                .values
                .iter()
                .map(|v| HostMetricValue {
                    host_id: host_id.as_str(),
                    name: &v.name,
                    time: v.time,
                    value: v.value,
                })
                .collect::<Vec<_>>(),
        ),
    }
}

impl Outputs<ServiceMetric> for MackerelOutput {
    fn name(&self) -> &'static str {
        "mackerel"
    }

    fn process_payload(&mut self, payload: &ServiceMetric) -> Result<(), OutputError> {
        let body = encode_body(payload)?;
        self.agent
            .post(&self.url(&payload.target))
            .set("X-Api-Key", &self.api_key)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map(drop)
            .map_err(|e| call_error("mackerel", e))
    }
}
