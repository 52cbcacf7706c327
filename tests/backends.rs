use std::io::{Read, Write};
use std::thread::{self, JoinHandle};

use chrono::{TimeZone, Utc};
use tiny_http::{Response, Server};

use plugin_agent::config::load_config;
use plugin_agent::error::OutputError;
use plugin_agent::output::Outputs;
use plugin_agent::output_cloudwatch::CloudWatchOutput;
use plugin_agent::output_mackerel::MackerelOutput;
use plugin_agent::payload::{
    Dimension, MackerelTarget, MetricDatum, MetricValue, PutMetricData, ServiceMetric,
};
use plugin_agent::sigv4::Credentials;

struct Recorded {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: String,
}

impl Recorded {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Serves exactly one request with `status` and `body`.
fn serve_once(status: u16, body: &'static str) -> (String, JoinHandle<Recorded>) {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    let handle = thread::spawn(move || {
        let mut request = server.recv().unwrap();
        let mut content = String::new();
        request.as_reader().read_to_string(&mut content).unwrap();
        let recorded = Recorded {
            method: request.method().to_string(),
            url: request.url().to_string(),
            headers: request
                .headers()
                .iter()
                .map(|h| (h.field.to_string(), h.value.to_string()))
                .collect(),
            body: content,
        };
        request
            .respond(Response::from_string(body).with_status_code(status))
            .unwrap();
        recorded
    });
    (format!("http://{}", addr), handle)
}

#[test]
fn mackerel_posts_service_metrics() {
    let (base, server) = serve_once(200, r#"{"success":true}"#);
    let mut output = MackerelOutput::new("secret-key", &base);
    output
        .process_payload(&ServiceMetric {
            target: MackerelTarget::Service("production".into()),
            values: vec![MetricValue {
                name: "latency.p99".into(),
                time: 1_700_000_000,
                value: 0.25,
            }],
        })
        .unwrap();

    let request = server.join().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.url, "/api/v0/services/production/tsdb");
    assert_eq!(request.header("X-Api-Key"), Some("secret-key"));
    assert_eq!(request.header("Content-Type"), Some("application/json"));
    assert_eq!(
        request.body,
        r#"[{"name":"latency.p99","time":1700000000,"value":0.25}]"#
    );
}

#[test]
fn mackerel_error_status_is_reported() {
    let (base, server) = serve_once(403, "forbidden");
    let mut output = MackerelOutput::new("bad-key", &base);
    let err = output
        .process_payload(&ServiceMetric {
            target: MackerelTarget::Host("3yAYEDLXKL5".into()),
            values: vec![MetricValue {
                name: "custom.load.avg".into(),
                time: 1_700_000_000,
                value: 1.0,
            }],
        })
        .unwrap_err();
    let request = server.join().unwrap();
    assert_eq!(request.url, "/api/v0/tsdb");
    assert!(request.body.contains(r#""hostId":"3yAYEDLXKL5""#));
    match err {
        OutputError::Status { status, body, .. } => {
            assert_eq!(status, 403);
            assert_eq!(body, "forbidden");
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn cloudwatch_posts_signed_form() {
    let (base, server) = serve_once(200, "<PutMetricDataResponse/>");
    let mut output = CloudWatchOutput::new(
        Credentials::new("AKIDEXAMPLE", "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY"),
        "ap-northeast-1".into(),
    )
    .with_endpoint(&base);
    output
        .process_payload(&PutMetricData {
            namespace: "memcached/check".into(),
            data: vec![MetricDatum {
                name: "CheckOK".into(),
                value: 1.0,
                timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
                dimensions: vec![Dimension::new("Host", "a")],
            }],
        })
        .unwrap();

    let request = server.join().unwrap();
    assert_eq!(request.method, "POST");
    assert_eq!(request.url, "/");
    let authorization = request.header("Authorization").unwrap();
    assert!(authorization.starts_with(
        "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/"
    ));
    assert!(authorization.contains("/ap-northeast-1/monitoring/aws4_request"));
    assert!(request.header("X-Amz-Date").is_some());
    assert!(request.body.starts_with("Action=PutMetricData&Version=2010-08-01"));
    assert!(request
        .body
        .contains("MetricData.member.1.Dimensions.member.1.Value=a"));
}

#[test]
fn cloudwatch_transport_failure_is_reported() {
    let server = Server::http("127.0.0.1:0").unwrap();
    let addr = server.server_addr().to_ip().unwrap();
    drop(server);
    let mut output = CloudWatchOutput::new(Credentials::new("AKID", "secret"), "us-east-1".into())
        .with_endpoint(&format!("http://{}", addr));
    let err = output
        .process_payload(&PutMetricData {
            namespace: "a/b".into(),
            data: Vec::new(),
        })
        .unwrap_err();
    assert!(matches!(err, OutputError::Transport { service: "cloudwatch", .. }));
}

const CONFIG: &str = r#"
plugin:
  check:
    memcached:
      namespace: memcached/check
      command: check-memcached --port ${MEMCACHED_PORT:-11211}
"#;

#[test]
fn loads_config_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let path = file.path().to_str().unwrap().to_string();

    for source in [path.clone(), format!("file://{}", path)] {
        let config = load_config(&source).unwrap();
        let plugin = config.get("plugin.check.memcached").unwrap();
        assert_eq!(
            plugin.command.args,
            vec!["check-memcached", "--port", "11211"]
        );
    }
}

#[test]
fn loads_config_over_http() {
    let (base, server) = serve_once(200, CONFIG);
    let config = load_config(&format!("{}/agent.yaml", base)).unwrap();
    assert_eq!(server.join().unwrap().url, "/agent.yaml");
    assert_eq!(config.plugins.len(), 1);
    assert!(config.uses_time_series());
    assert!(!config.uses_service_metrics());
}

#[test]
fn missing_config_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.yaml");
    let err = load_config(missing.to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("missing.yaml"));
}
