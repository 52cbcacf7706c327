use std::time::Duration;

use chrono::Utc;
use ureq::{Agent, AgentBuilder};

use crate::error::{CredentialsError, OutputError};
use crate::output::{call_error, Outputs};
use crate::payload::PutMetricData;
use crate::sigv4::{self, uri_encode, Credentials, SignableRequest, Signer};

const API_VERSION: &str = "2010-08-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Time-series backend speaking the CloudWatch `PutMetricData` query API.
pub struct CloudWatchOutput {
    agent: Agent,
    signer: Signer,
    base_url: String,
    host: String,
}

impl CloudWatchOutput {
    pub fn new(credentials: Credentials, region: String) -> Self {
        let base_url = format!("https://monitoring.{}.amazonaws.com", region);
        Self {
            agent: AgentBuilder::new().timeout(REQUEST_TIMEOUT).build(),
            signer: Signer::new(credentials, region, "monitoring"),
            host: host_of(&base_url),
            base_url,
        }
    }

    pub fn from_env() -> Result<Self, CredentialsError> {
        let region = sigv4::region_from_env()?;
        Ok(Self::new(Credentials::from_env()?, region))
    }

    /// Sends requests to `base_url` (e.g. `http://127.0.0.1:4566`) instead of
    /// the regional endpoint.
    pub fn with_endpoint(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self.host = host_of(&self.base_url);
        self
    }
}

fn host_of(base_url: &str) -> String {
    let rest = base_url
        .split_once("://")
        .map_or(base_url, |(_, rest)| rest);
    rest.split('/').next().unwrap_or(rest).to_string()
}

/// Form-encodes one `PutMetricData` call.
pub fn encode_put_metric_data(input: &PutMetricData) -> String {
    let mut params = vec![
        ("Action".to_string(), "PutMetricData".to_string()),
        ("Version".to_string(), API_VERSION.to_string()),
        ("Namespace".to_string(), input.namespace.clone()),
    ];
    for (i, datum) in input.data.iter().enumerate() {
        let member = format!("MetricData.member.{}", i + 1);
        params.push((format!("{}.MetricName", member), datum.name.clone()));
        params.push((format!("{}.Value", member), datum.value.to_string()));
        params.push((
            format!("{}.Timestamp", member),
            datum.timestamp.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        ));
        for (j, dimension) in datum.dimensions.iter().enumerate() {
            let prefix = format!("{}.Dimensions.member.{}", member, j + 1);
            params.push((format!("{}.Name", prefix), dimension.name.clone()));
            params.push((format!("{}.Value", prefix), dimension.value.clone()));
        }
    }
    params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&")
}

impl Outputs<PutMetricData> for CloudWatchOutput {
    fn name(&self) -> &'static str {
        "cloudwatch"
    }

    fn process_payload(&mut self, payload: &PutMetricData) -> Result<(), OutputError> {
        let mut request = SignableRequest::new("POST", self.host.clone(), "/")
            .header(
                "content-type",
                "application/x-www-form-urlencoded; charset=utf-8",
            )
            .body(encode_put_metric_data(payload).into_bytes());
        self.signer.sign(&mut request, Utc::now())?;

        let mut call = self.agent.post(&format!("{}/", self.base_url));
        for (name, value) in request.headers.iter().filter(|(name, _)| *name != "host") {
            call = call.set(name, value);
        }
        call.send_bytes(&request.body)
            .map(drop)
            .map_err(|e| call_error("cloudwatch", e))
    }
}
