//! flock.toml configuration parser.
//!
//! Every section is optional. Accessors resolve the effective value,
//! falling back to the built-in defaults.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::types::UNDEFINED_NODE;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlockConfig {
    pub node: Option<NodeConfig>,
    pub heartbeat: Option<HeartbeatConfig>,
    pub liveness: Option<LivenessConfig>,
    pub placement: Option<PlacementConfig>,
    pub ratings: Option<RatingsConfig>,
    pub actions: Option<ActionsConfig>,
    pub composition: Option<CompositionConfig>,
    pub forker: Option<ForkerConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: Option<String>,
    pub data_dir: Option<PathBuf>,
    /// Bucket for components no grouping criterion claimed.
    pub default_node: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    pub interval: Option<String>,
    /// Endpoint advertised to monitors (`host:port`).
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LivenessConfig {
    pub ping_timeout: Option<String>,
    pub poll_interval: Option<String>,
    /// Consecutive DEAD/STUCK verdicts before an isolate is declared lost.
    pub confirm_threshold: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlacementConfig {
    pub max_rounds: Option<u32>,
    pub approval_winners: Option<usize>,
    pub approval_max_votes: Option<usize>,
    pub approval_penalty: Option<i64>,
    pub approval_exclusion: Option<usize>,
    pub history_retention: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RatingsConfig {
    pub default: Option<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionsConfig {
    pub poll_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositionConfig {
    /// JSON composition started at boot.
    pub file: Option<PathBuf>,
    pub autostart: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ForkerConfig {
    /// Isolate kind ("pelix", "osgi", "boot") → program and arguments.
    pub commands: Option<BTreeMap<String, Vec<String>>>,
    /// Isolates listen for liveness checks from this port upwards.
    pub liveness_base_port: Option<u16>,
}

impl FlockConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: FlockConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check that every duration string parses.
    pub fn validate(&self) -> CoreResult<()> {
        let durations = [
            self.heartbeat.as_ref().and_then(|h| h.interval.as_deref()),
            self.liveness.as_ref().and_then(|l| l.ping_timeout.as_deref()),
            self.liveness.as_ref().and_then(|l| l.poll_interval.as_deref()),
            self.placement
                .as_ref()
                .and_then(|p| p.history_retention.as_deref()),
            self.actions.as_ref().and_then(|a| a.poll_timeout.as_deref()),
        ];
        for value in durations.into_iter().flatten() {
            parse_duration(value).ok_or_else(|| CoreError::InvalidDuration(value.to_string()))?;
        }
        Ok(())
    }

    pub fn node_name(&self) -> String {
        self.node
            .as_ref()
            .and_then(|n| n.name.clone())
            .unwrap_or_else(|| "local".to_string())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.node
            .as_ref()
            .and_then(|n| n.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("/var/lib/flock"))
    }

    pub fn default_node(&self) -> String {
        self.node
            .as_ref()
            .and_then(|n| n.default_node.clone())
            .unwrap_or_else(|| UNDEFINED_NODE.to_string())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        duration_or(
            self.heartbeat.as_ref().and_then(|h| h.interval.as_deref()),
            Duration::from_secs(3),
        )
    }

    pub fn heartbeat_endpoint(&self) -> String {
        self.heartbeat
            .as_ref()
            .and_then(|h| h.endpoint.clone())
            .unwrap_or_else(|| "127.0.0.1:0".to_string())
    }

    pub fn ping_timeout(&self) -> Duration {
        duration_or(
            self.liveness.as_ref().and_then(|l| l.ping_timeout.as_deref()),
            Duration::from_secs(1),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        duration_or(
            self.liveness.as_ref().and_then(|l| l.poll_interval.as_deref()),
            Duration::from_secs(5),
        )
    }

    pub fn confirm_threshold(&self) -> u32 {
        self.liveness
            .as_ref()
            .and_then(|l| l.confirm_threshold)
            .unwrap_or(2)
            .max(1)
    }

    pub fn placement(&self) -> PlacementConfig {
        self.placement.clone().unwrap_or_default()
    }

    pub fn history_retention(&self) -> Duration {
        duration_or(
            self.placement
                .as_ref()
                .and_then(|p| p.history_retention.as_deref()),
            Duration::from_secs(3600),
        )
    }

    pub fn default_rating(&self) -> u8 {
        self.ratings
            .as_ref()
            .and_then(|r| r.default)
            .unwrap_or(50)
            .min(100)
    }

    /// Command booting an isolate of `kind`; empty when not configured.
    pub fn isolate_command(&self, kind: &str) -> Vec<String> {
        self.forker
            .as_ref()
            .and_then(|f| f.commands.as_ref())
            .and_then(|commands| commands.get(kind).cloned())
            .unwrap_or_default()
    }

    pub fn liveness_base_port(&self) -> Option<u16> {
        self.forker.as_ref().and_then(|f| f.liveness_base_port)
    }

    pub fn composition_file(&self) -> Option<PathBuf> {
        let composition = self.composition.as_ref()?;
        if composition.autostart == Some(false) {
            return None;
        }
        composition.file.clone()
    }

    pub fn action_poll_timeout(&self) -> Duration {
        duration_or(
            self.actions.as_ref().and_then(|a| a.poll_timeout.as_deref()),
            Duration::from_millis(500),
        )
    }
}

fn duration_or(value: Option<&str>, default: Duration) -> Duration {
    value.and_then(parse_duration).unwrap_or(default)
}

/// Parse a duration string like "5s", "500ms", "2m" or a plain number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()
            .and_then(|h| h.checked_mul(3600))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: FlockConfig = toml::from_str("").unwrap();
        assert_eq!(config.node_name(), "local");
        assert_eq!(config.default_node(), UNDEFINED_NODE);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(3));
        assert_eq!(config.ping_timeout(), Duration::from_secs(1));
        assert_eq!(config.confirm_threshold(), 2);
        assert_eq!(config.default_rating(), 50);
        assert_eq!(config.action_poll_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn parse_sections() {
        let toml_str = r#"
[node]
name = "node-a"
default_node = "node-a"

[heartbeat]
interval = "500ms"

[liveness]
ping_timeout = "2s"
confirm_threshold = 3

[placement]
max_rounds = 4
approval_winners = 2

[ratings]
default = 70

[forker]
commands = { pelix = ["python3", "-m", "flock.isolate"] }
"#;
        let config: FlockConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node_name(), "node-a");
        assert_eq!(config.default_node(), "node-a");
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(500));
        assert_eq!(config.ping_timeout(), Duration::from_secs(2));
        assert_eq!(config.confirm_threshold(), 3);
        assert_eq!(config.placement().max_rounds, Some(4));
        assert_eq!(config.default_rating(), 70);
        assert_eq!(config.isolate_command("pelix")[0], "python3");
        assert!(config.isolate_command("osgi").is_empty());
    }

    #[test]
    fn invalid_duration_rejected() {
        let config: FlockConfig = toml::from_str("[liveness]\nping_timeout = \"soon\"\n").unwrap();
        assert!(matches!(config.validate(), Err(CoreError::InvalidDuration(_))));
    }

    #[test]
    fn parse_duration_units() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration("10"), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn oversized_durations_are_rejected() {
        let huge = format!("{}h", u64::MAX / 60);
        assert_eq!(parse_duration(&huge), None);
        assert_eq!(parse_duration(&format!("{}m", u64::MAX)), None);

        let config: FlockConfig =
            toml::from_str(&format!("[placement]\nhistory_retention = \"{huge}\"\n")).unwrap();
        assert!(matches!(config.validate(), Err(CoreError::InvalidDuration(_))));
    }

    #[test]
    fn round_trips_through_toml() {
        let config: FlockConfig = toml::from_str("[node]\nname = \"n1\"\n").unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("n1"));
    }
}
