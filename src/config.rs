use std::fs;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::Utc;
use log::{info, warn};
use regex::Regex;
use yaml_rust::{yaml, Yaml, YamlLoader};

use crate::command::{Command, DEFAULT_KILL_AFTER};
use crate::error::ConfigError;
use crate::payload::{Dimension, MackerelTarget};
use crate::sigv4::{self, Credentials, SignableRequest, Signer};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

const KNOWN_KEYS: &[&str] = &[
    "command",
    "namespace",
    "timeout",
    "interval",
    "kill_after",
    "dimensions",
    "destination",
    "service",
    "host_id",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    TimeSeries,
    ServiceMetrics(MackerelTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginKind {
    Check { namespace: String },
    Metrics(Destination),
}

/// One configured plugin. Built once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub id: String,
    pub command: Command,
    pub interval: Duration,
    pub dimensions: Vec<Vec<Dimension>>,
    pub kind: PluginKind,
}

impl PluginSpec {
    pub fn targets_time_series(&self) -> bool {
        matches!(
            self.kind,
            PluginKind::Check { .. } | PluginKind::Metrics(Destination::TimeSeries)
        )
    }

    pub fn targets_service_metrics(&self) -> bool {
        matches!(
            self.kind,
            PluginKind::Metrics(Destination::ServiceMetrics(_))
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub plugins: Vec<PluginSpec>,
}

impl Config {
    pub fn from_yaml(doc: &Yaml) -> Result<Self, ConfigError> {
        let mut config = Config::default();
        let sections = match doc {
            Yaml::Hash(ref h) => match h.get(&Yaml::String("plugin".into())) {
                Some(Yaml::Hash(ref sections)) => sections,
                Some(Yaml::Null) | None => return Ok(config),
                Some(_) => return Err(ConfigError::Structure("plugin should be a hashmap".into())),
            },
            Yaml::Null | Yaml::BadValue => return Ok(config),
            _ => return Err(ConfigError::Structure("top level should be a hashmap".into())),
        };
        for (key, value) in sections {
            let section = key
                .as_str()
                .ok_or_else(|| ConfigError::Structure(format!("invalid section name {:?}", key)))?;
            if !matches!(section, "metrics" | "check") {
                return Err(ConfigError::UnknownSection(section.to_string()));
            }
            let plugins = match value {
                Yaml::Hash(ref h) => h,
                Yaml::Null => continue,
                _ => {
                    return Err(ConfigError::Structure(format!(
                        "plugin.{} should be a hashmap",
                        section
                    )))
                }
            };
            for (name, record) in plugins {
                let name = name.as_str().ok_or_else(|| {
                    ConfigError::Structure(format!("invalid plugin name {:?} in plugin.{}", name, section))
                })?;
                let record = PluginRecord::new(section, name, record)?;
                let spec = if section == "metrics" {
                    record.metric_plugin()?
                } else {
                    record.check_plugin()?
                };
                config.plugins.push(spec);
            }
        }
        Ok(config)
    }

    pub fn get(&self, id: &str) -> Option<&PluginSpec> {
        self.plugins.iter().find(|p| p.id == id)
    }

    pub fn uses_time_series(&self) -> bool {
        self.plugins.iter().any(PluginSpec::targets_time_series)
    }

    pub fn uses_service_metrics(&self) -> bool {
        self.plugins.iter().any(PluginSpec::targets_service_metrics)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let docs = YamlLoader::load_from_str(text)?;
        match docs.first() {
            Some(doc) => Config::from_yaml(doc),
            None => Ok(Config::default()),
        }
    }
}

/// A raw `plugin.<section>.<name>` record.
struct PluginRecord<'a> {
    section: &'a str,
    name: &'a str,
    fields: &'a yaml::Hash,
}

impl<'a> PluginRecord<'a> {
    fn new(section: &'a str, name: &'a str, value: &'a Yaml) -> Result<Self, ConfigError> {
        let Yaml::Hash(ref fields) = value else {
            return Err(ConfigError::Structure(format!(
                "plugin.{}.{} should be a hashmap",
                section, name
            )));
        };
        let record = Self {
            section,
            name,
            fields,
        };
        for key in fields.keys() {
            match key.as_str() {
                Some(k) if KNOWN_KEYS.contains(&k) => {}
                _ => warn!(
                    "plugin.{}.{}: ignoring unknown key {:?}",
                    section, name, key
                ),
            }
        }
        Ok(record)
    }

    fn id(&self, kind: &str) -> String {
        format!("plugin.{}.{}", kind, self.name)
    }

    fn get(&self, key: &str) -> Option<&'a Yaml> {
        match self.fields.get(&Yaml::String(key.to_string())) {
            None | Some(Yaml::Null) => None,
            Some(v) => Some(v),
        }
    }

    fn string(&self, key: &'static str) -> Result<Option<String>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(Yaml::String(s)) if s.is_empty() => Ok(None),
            Some(Yaml::String(s)) => Ok(Some(s.clone())),
            Some(Yaml::Integer(i)) => Ok(Some(i.to_string())),
            Some(other) => Err(self.invalid(key, format!("expected a string, got {:?}", other))),
        }
    }

    fn duration(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let value = match self.get(key) {
            None => Duration::ZERO,
            Some(Yaml::Integer(secs)) if *secs >= 0 => Duration::from_secs(*secs as u64),
            Some(Yaml::String(s)) => parse_duration(s).map_err(|e| self.invalid(key, e.to_string()))?,
            Some(other) => return Err(self.invalid(key, format!("{:?}", other))),
        };
        Ok(if value.is_zero() { default } else { value })
    }

    fn command(&self) -> Result<Vec<String>, ConfigError> {
        let args = match self.get("command") {
            None => Vec::new(),
            Some(Yaml::String(line)) => {
                shell_words::split(line).map_err(|e| self.invalid("command", format!("parse command failed: {}", e)))?
            }
            Some(Yaml::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Yaml::String(s) => Ok(s.clone()),
                    Yaml::Integer(i) => Ok(i.to_string()),
                    other => Err(self.invalid("command", format!("{:?}", other))),
                })
                .collect::<Result<_, _>>()?,
            Some(other) => return Err(self.invalid("command", format!("{:?}", other))),
        };
        if args.is_empty() {
            return Err(self.missing("command"));
        }
        Ok(args)
    }

    fn dimensions(&self) -> Result<Vec<Vec<Dimension>>, ConfigError> {
        match self.get("dimensions") {
            None => Ok(Vec::new()),
            Some(Yaml::String(s)) => Ok(vec![Dimension::parse_set(s)?]),
            Some(Yaml::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Yaml::String(s) => Dimension::parse_set(s),
                    other => Err(ConfigError::InvalidDimension(format!("{:?}", other))),
                })
                .collect(),
            Some(other) => Err(self.invalid("dimensions", format!("{:?}", other))),
        }
    }

    fn build(&self, id: String, kind: PluginKind) -> Result<PluginSpec, ConfigError> {
        let command = Command::new(self.command()?, self.duration("timeout", DEFAULT_COMMAND_TIMEOUT)?)
            .with_kill_after(self.duration("kill_after", DEFAULT_KILL_AFTER)?);
        Ok(PluginSpec {
            id,
            command,
            interval: self.duration("interval", DEFAULT_INTERVAL)?,
            dimensions: self.dimensions()?,
            kind,
        })
    }

    fn check_plugin(&self) -> Result<PluginSpec, ConfigError> {
        let namespace = self.string("namespace")?.ok_or_else(|| self.missing("namespace"))?;
        self.build(self.id("check"), PluginKind::Check { namespace })
    }

    fn metric_plugin(&self) -> Result<PluginSpec, ConfigError> {
        let destination = self.string("destination")?.unwrap_or_default();
        match destination.to_lowercase().as_str() {
            "" | "cloudwatch" => {
                self.build(self.id("metrics"), PluginKind::Metrics(Destination::TimeSeries))
            }
            "mackerel" => {
                let target = match (self.string("service")?, self.string("host_id")?) {
                    (Some(service), None) => MackerelTarget::Service(service),
                    (None, Some(host)) => MackerelTarget::Host(host),
                    (None, None) => return Err(self.missing("service")),
                    (Some(_), Some(_)) => {
                        return Err(self.invalid("host_id", "service and host_id are exclusive".into()))
                    }
                };
                self.build(
                    self.id("servicemetrics"),
                    PluginKind::Metrics(Destination::ServiceMetrics(target)),
                )
            }
            _ => Err(ConfigError::UnknownDestination(destination)),
        }
    }

    fn missing(&self, field: &'static str) -> ConfigError {
        ConfigError::MissingField {
            plugin: format!("plugin.{}.{}", self.section, self.name),
            field,
        }
    }

    fn invalid(&self, field: &'static str, reason: String) -> ConfigError {
        ConfigError::InvalidField {
            plugin: format!("plugin.{}.{}", self.section, self.name),
            field,
            reason,
        }
    }
}

/// Parses durations such as `90s`, `1m30s`, `1h 15m` or `250ms`. A bare `0`
/// means unset.
pub fn parse_duration(text: &str) -> Result<Duration, ConfigError> {
    let text = text.trim();
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    humantime::parse_duration(text)
        .map_err(|e| ConfigError::InvalidDuration(format!("{:?}: {}", text, e)))
}

fn env_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("valid env pattern")
    })
}

/// Replaces `${NAME}` and `${NAME:-default}` with values from the environment.
/// YAML comments are left untouched.
pub fn expand_env(text: &str) -> Result<String, ConfigError> {
    expand_with(text, |name| std::env::var(name).ok())
}

fn expand_with<F>(text: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(text.len());
    for line in text.split_inclusive('\n') {
        let (content, comment) = line.split_at(comment_start(line));
        expand_line(content, &lookup, &mut out)?;
        out.push_str(comment);
    }
    Ok(out)
}

fn expand_line<F>(text: &str, lookup: &F, out: &mut String) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut last = 0;
    for caps in env_pattern().captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let name = &caps[1];
        let value = match (lookup(name), caps.get(2)) {
            (Some(value), _) => value,
            (None, Some(default)) => default.as_str().to_string(),
            (None, None) => return Err(ConfigError::MissingEnv(name.to_string())),
        };
        out.push_str(&text[last..whole.start()]);
        out.push_str(&value);
        last = whole.end();
    }
    out.push_str(&text[last..]);
    Ok(())
}

/// Byte offset of a `#` comment in `line`, or its length. A `#` starts a
/// comment at the start of the line or after whitespace, outside quotes.
fn comment_start(line: &str) -> usize {
    let mut quote = None;
    let mut prev = None;
    for (i, c) in line.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '#') if prev.map_or(true, char::is_whitespace) => return i,
            _ => {}
        }
        prev = Some(c);
    }
    line.len()
}

/// Reads the raw configuration from a path, `file://`, `http(s)://` or
/// `s3://bucket/key`.
pub fn fetch(source: &str) -> Result<String, ConfigError> {
    if let Some(path) = source.strip_prefix("file://") {
        read_file(path)
    } else if source.starts_with("http://") || source.starts_with("https://") {
        fetch_http(source)
    } else if let Some(location) = source.strip_prefix("s3://") {
        fetch_s3(location)
    } else if let Some((scheme, _)) = source.split_once("://") {
        Err(ConfigError::UnsupportedScheme(scheme.to_string()))
    } else {
        read_file(source)
    }
}

fn read_file(path: &str) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_string(),
        source,
    })
}

fn fetch_http(url: &str) -> Result<String, ConfigError> {
    info!("fetching HTTP {}", url);
    let fetch_err = |reason: String| ConfigError::Fetch {
        url: url.to_string(),
        reason,
    };
    ureq::get(url)
        .call()
        .map_err(|e| fetch_err(e.to_string()))?
        .into_string()
        .map_err(|e| fetch_err(e.to_string()))
}

fn fetch_s3(location: &str) -> Result<String, ConfigError> {
    let (bucket, key) = location
        .split_once('/')
        .ok_or_else(|| ConfigError::UnsupportedScheme(format!("s3://{}", location)))?;
    info!("fetching S3 bucket={} key={}", bucket, key);
    let region = sigv4::region_from_env()?;
    let signer = Signer::new(Credentials::from_env()?, region.clone(), "s3");
    let mut request = SignableRequest::new(
        "GET",
        format!("{}.s3.{}.amazonaws.com", bucket, region),
        format!("/{}", sigv4::uri_encode(key, false)),
    );
    let url = format!("https://{}{}", request.host, request.path);
    let fetch_err = |reason: String| ConfigError::Fetch {
        url: format!("s3://{}", location),
        reason,
    };
    signer
        .sign(&mut request, Utc::now())
        .map_err(|e| fetch_err(e.to_string()))?;
    let mut call = ureq::get(&url);
    for (name, value) in request.headers.iter().filter(|(name, _)| *name != "host") {
        call = call.set(name, value);
    }
    call.call()
        .map_err(|e| fetch_err(format!("failed to get s3 object: {}", e)))?
        .into_string()
        .map_err(|e| fetch_err(e.to_string()))
}

/// Fetches, expands and parses the configuration at `source`.
pub fn load_config(source: &str) -> Result<Config, ConfigError> {
    let text = expand_env(&fetch(source)?)?;
    text.parse()
}
