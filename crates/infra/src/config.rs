//! Environment-driven configuration.
//!
//! Every variable has a default, so an empty environment yields a working
//! in-memory setup. Unparseable values are errors rather than silently
//! replaced by defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::usecases::Destinations;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Which transport backs the message channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BrokerKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgAuthConfig {
    pub broker: BrokerKind,
    /// Default: redis://127.0.0.1:6379
    pub redis_url: String,
    /// Postgres-backed store when set.
    pub database_url: Option<String>,
    /// JSON snapshot of users/organizations/projects for the in-process directory.
    pub directory_seed: Option<PathBuf>,
    pub destinations: Destinations,
    pub inbound_queues: Vec<String>,
    /// queue -> destinations feeding it
    pub inbound_bindings: BTreeMap<String, Vec<String>>,
    pub publish_retry: Duration,
    pub reconnect_delay: Duration,
    pub poll_timeout: Duration,
    pub consumer_name: String,
    /// Re-publish changes applied from inbound events.
    pub republish_inbound: bool,
}

impl OrgAuthConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from any key lookup (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let broker = match get("ORGAUTH_BROKER").as_deref() {
            None | Some("memory") => BrokerKind::Memory,
            Some("redis") => BrokerKind::Redis,
            Some(other) => {
                return Err(ConfigError::invalid(
                    "ORGAUTH_BROKER",
                    format!("expected memory or redis, got {other}"),
                ));
            }
        };

        let defaults = Destinations::default();
        let destinations = Destinations {
            organization_authorizations: text(
                "ORGAUTH_ORG_AUTH_EXCHANGE",
                &defaults.organization_authorizations,
            ),
            project_authorizations: text(
                "ORGAUTH_PROJECT_AUTH_EXCHANGE",
                &defaults.project_authorizations,
            ),
            update_projects: text("ORGAUTH_UPDATE_PROJECTS_EXCHANGE", &defaults.update_projects),
        };

        let inbound_queues = split_list(&text("ORGAUTH_INBOUND_QUEUES", "orgauth.authorizations"));
        let inbound_bindings = parse_bindings(&text(
            "ORGAUTH_INBOUND_BINDINGS",
            "orgauth.authorizations=authorizations-sync.topic",
        ))?;

        let millis = |key: &'static str, default: u64| -> Result<Duration, ConfigError> {
            match get(key) {
                None => Ok(Duration::from_millis(default)),
                Some(raw) => raw
                    .parse::<u64>()
                    .map(Duration::from_millis)
                    .map_err(|e| ConfigError::invalid(key, format!("{raw}: {e}"))),
            }
        };

        let republish_inbound = match get("ORGAUTH_REPUBLISH_INBOUND") {
            None => false,
            Some(raw) => parse_bool(&raw)
                .ok_or_else(|| ConfigError::invalid("ORGAUTH_REPUBLISH_INBOUND", raw))?,
        };

        Ok(Self {
            broker,
            redis_url: text("ORGAUTH_REDIS_URL", "redis://127.0.0.1:6379"),
            database_url: get("ORGAUTH_DATABASE_URL"),
            directory_seed: get("ORGAUTH_DIRECTORY_SEED").map(PathBuf::from),
            destinations,
            inbound_queues,
            inbound_bindings,
            publish_retry: millis("ORGAUTH_PUBLISH_RETRY_MS", 5000)?,
            reconnect_delay: millis("ORGAUTH_RECONNECT_MS", 5000)?,
            poll_timeout: millis("ORGAUTH_POLL_TIMEOUT_MS", 1000)?,
            consumer_name: get("ORGAUTH_CONSUMER_NAME")
                .unwrap_or_else(|| format!("orgauth-{}", uuid::Uuid::now_v7())),
            republish_inbound,
        })
    }

    /// Destinations bound to `queue` (empty when unbound).
    pub fn bindings_for(&self, queue: &str) -> &[String] {
        self.inbound_bindings
            .get(queue)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `queue=destination` pairs, comma-separated. A queue may appear more than once.
fn parse_bindings(raw: &str) -> Result<BTreeMap<String, Vec<String>>, ConfigError> {
    let mut bindings: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for pair in split_list(raw) {
        let (queue, destination) = pair
            .split_once('=')
            .map(|(q, d)| (q.trim(), d.trim()))
            .filter(|(q, d)| !q.is_empty() && !d.is_empty())
            .ok_or_else(|| {
                ConfigError::invalid("ORGAUTH_INBOUND_BINDINGS", format!("expected queue=destination, got {pair}"))
            })?;
        bindings
            .entry(queue.to_string())
            .or_default()
            .push(destination.to_string());
    }
    Ok(bindings)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Result<OrgAuthConfig, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        OrgAuthConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn empty_environment_uses_defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.broker, BrokerKind::Memory);
        assert_eq!(cfg.database_url, None);
        assert_eq!(cfg.directory_seed, None);
        assert_eq!(cfg.destinations, Destinations::default());
        assert_eq!(cfg.inbound_queues, vec!["orgauth.authorizations".to_string()]);
        assert_eq!(
            cfg.bindings_for("orgauth.authorizations"),
            ["authorizations-sync.topic".to_string()]
        );
        assert_eq!(cfg.publish_retry, Duration::from_secs(5));
        assert_eq!(cfg.poll_timeout, Duration::from_secs(1));
        assert!(cfg.consumer_name.starts_with("orgauth-"));
        assert!(!cfg.republish_inbound);
    }

    #[test]
    fn overrides_are_applied() {
        let cfg = config(&[
            ("ORGAUTH_BROKER", "redis"),
            ("ORGAUTH_DATABASE_URL", "postgres://localhost/orgauth"),
            ("ORGAUTH_INBOUND_QUEUES", "a, b"),
            ("ORGAUTH_INBOUND_BINDINGS", "a=x.topic,a=y.topic, b=z.topic"),
            ("ORGAUTH_RECONNECT_MS", "250"),
            ("ORGAUTH_CONSUMER_NAME", "worker-1"),
            ("ORGAUTH_REPUBLISH_INBOUND", "yes"),
        ])
        .unwrap();

        assert_eq!(cfg.broker, BrokerKind::Redis);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/orgauth"));
        assert_eq!(cfg.inbound_queues, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(cfg.bindings_for("a"), ["x.topic".to_string(), "y.topic".to_string()]);
        assert_eq!(cfg.bindings_for("b"), ["z.topic".to_string()]);
        assert!(cfg.bindings_for("c").is_empty());
        assert_eq!(cfg.reconnect_delay, Duration::from_millis(250));
        assert_eq!(cfg.consumer_name, "worker-1");
        assert!(cfg.republish_inbound);
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            ("ORGAUTH_BROKER", "kafka"),
            ("ORGAUTH_POLL_TIMEOUT_MS", "soon"),
            ("ORGAUTH_REPUBLISH_INBOUND", "maybe"),
            ("ORGAUTH_INBOUND_BINDINGS", "queue-without-destination"),
        ] {
            let err = config(&[(key, value)]).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { key: k, .. } if k == key), "{key}");
        }
    }
}
