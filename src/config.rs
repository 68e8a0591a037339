//! Eskka Configuration
//!
//! Configuration for the discovery subsystem. Host name resolution
//! (including magic values like `_non_loopback_`) is the embedding
//! host's job; by the time a config reaches this crate the host field
//! holds a concrete, canonical host name.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::membership::{Address, FailureDetectorConfig, Roles};

/// Default cluster port
pub const DEFAULT_PORT: u16 = 9400;

/// Main eskka configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EskkaConfig {
    /// Discovery configuration
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Node role flags
    #[serde(default)]
    pub node: NodeFlags,
}

/// Discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Seed addresses (`host[:port]`); defines the quorum denominator.
    /// Empty means this node seeds itself.
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    /// Bind host, pre-resolved to canonical form
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port; defaults to 9400, or 0 (ephemeral) for client nodes
    #[serde(default)]
    pub port: Option<u16>,

    /// Failure detector heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Failure detector slack in milliseconds
    #[serde(default = "default_acceptable_heartbeat_pause_ms")]
    pub acceptable_heartbeat_pause_ms: u64,

    /// Partition monitor tuning
    #[serde(default)]
    pub partition: PartitionConfig,

    /// Publish acknowledgement deadline in milliseconds (capped at 60 s)
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    /// Lower bound of the randomized join timeout in milliseconds
    #[serde(default = "default_startup_timeout_min_ms")]
    pub startup_timeout_min_ms: u64,

    /// Upper bound of the randomized join timeout in milliseconds
    #[serde(default = "default_startup_timeout_max_ms")]
    pub startup_timeout_max_ms: u64,

    /// How long quorum loss must persist before the node restarts itself,
    /// in milliseconds
    #[serde(default = "default_abdication_window_ms")]
    pub abdication_window_ms: u64,
}

/// Partition monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitionConfig {
    /// Delay before an unreachable node is evaluated, in milliseconds
    #[serde(default = "default_eval_delay_ms")]
    pub eval_delay_ms: u64,

    /// Affirmative-timeout window per voter, in milliseconds
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
}

/// Node role flags
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFlags {
    /// Client nodes never become master and bind an ephemeral port
    #[serde(default)]
    pub client: bool,

    /// Master eligibility; defaults to the opposite of `client`
    #[serde(default)]
    pub master: Option<bool>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_acceptable_heartbeat_pause_ms() -> u64 {
    3000
}

fn default_eval_delay_ms() -> u64 {
    5000
}

fn default_ping_timeout_ms() -> u64 {
    2000
}

fn default_publish_timeout_ms() -> u64 {
    60_000
}

fn default_startup_timeout_min_ms() -> u64 {
    15_000
}

fn default_startup_timeout_max_ms() -> u64 {
    45_000
}

fn default_abdication_window_ms() -> u64 {
    10_000
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            seed_nodes: Vec::new(),
            host: default_host(),
            port: None,
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            acceptable_heartbeat_pause_ms: default_acceptable_heartbeat_pause_ms(),
            partition: PartitionConfig::default(),
            publish_timeout_ms: default_publish_timeout_ms(),
            startup_timeout_min_ms: default_startup_timeout_min_ms(),
            startup_timeout_max_ms: default_startup_timeout_max_ms(),
            abdication_window_ms: default_abdication_window_ms(),
        }
    }
}

impl Default for PartitionConfig {
    fn default() -> Self {
        Self {
            eval_delay_ms: default_eval_delay_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
        }
    }
}

impl Default for EskkaConfig {
    fn default() -> Self {
        Self {
            discovery: DiscoveryConfig::default(),
            node: NodeFlags::default(),
        }
    }
}

impl EskkaConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: EskkaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.discovery.host.is_empty() {
            return Err(Error::Config("discovery.host cannot be empty".into()));
        }
        if self.discovery.startup_timeout_min_ms > self.discovery.startup_timeout_max_ms {
            return Err(Error::Config(
                "discovery.startup_timeout_min_ms exceeds startup_timeout_max_ms".into(),
            ));
        }
        if self.discovery.partition.ping_timeout_ms == 0 {
            return Err(Error::Config(
                "discovery.partition.ping_timeout_ms must be positive".into(),
            ));
        }
        // seeds must parse
        self.seed_addresses()?;
        Ok(())
    }

    /// The effective bind port: explicit, else 0 for clients, else 9400
    pub fn effective_port(&self) -> u16 {
        self.discovery
            .port
            .unwrap_or(if self.node.client { 0 } else { DEFAULT_PORT })
    }

    /// This node's address
    pub fn self_address(&self) -> Address {
        Address::new(&self.discovery.host, self.effective_port())
    }

    /// The seed set; an empty configuration seeds from this node alone
    pub fn seed_addresses(&self) -> Result<Vec<Address>> {
        if self.discovery.seed_nodes.is_empty() {
            return Ok(vec![self.self_address()]);
        }
        self.discovery
            .seed_nodes
            .iter()
            .map(|s| Address::parse(s, DEFAULT_PORT))
            .collect()
    }

    /// Derived roles: master-eligible unless a client (or overridden),
    /// voter iff this node's address is a seed
    pub fn roles(&self) -> Result<Roles> {
        let master_eligible = self.node.master.unwrap_or(!self.node.client);
        let self_address = self.self_address();
        let voter = self.seed_addresses()?.contains(&self_address);
        Ok(Roles {
            master_eligible,
            voter,
        })
    }

    /// Get the partition evaluation delay as Duration
    pub fn eval_delay(&self) -> Duration {
        Duration::from_millis(self.discovery.partition.eval_delay_ms)
    }

    /// Get the voter ping timeout as Duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.partition.ping_timeout_ms)
    }

    /// Get the publish deadline as Duration
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery.publish_timeout_ms)
    }

    /// Get the abdication observation window as Duration
    pub fn abdication_window(&self) -> Duration {
        Duration::from_millis(self.discovery.abdication_window_ms)
    }

    /// The randomized join timeout bounds
    pub fn startup_timeout_range(&self) -> (Duration, Duration) {
        (
            Duration::from_millis(self.discovery.startup_timeout_min_ms),
            Duration::from_millis(self.discovery.startup_timeout_max_ms),
        )
    }

    /// Failure detector tunables for the membership substrate
    pub fn failure_detector(&self) -> FailureDetectorConfig {
        FailureDetectorConfig {
            heartbeat_interval: Duration::from_millis(self.discovery.heartbeat_interval_ms),
            acceptable_heartbeat_pause: Duration::from_millis(
                self.discovery.acceptable_heartbeat_pause_ms,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[discovery]
seed_nodes = ["seed-1:9400", "seed-2", "Seed-3:9401"]
host = "seed-1"

[discovery.partition]
eval_delay_ms = 3000

[node]
client = false
"#;

        let config = EskkaConfig::from_str(toml).unwrap();
        let seeds = config.seed_addresses().unwrap();
        assert_eq!(
            seeds,
            vec![
                Address::new("seed-1", 9400),
                Address::new("seed-2", 9400),
                Address::new("seed-3", 9401),
            ]
        );
        assert_eq!(config.self_address(), Address::new("seed-1", 9400));
        assert_eq!(config.eval_delay(), Duration::from_millis(3000));
        // untouched keys keep their defaults
        assert_eq!(config.ping_timeout(), Duration::from_millis(2000));
        assert_eq!(config.publish_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_derived_roles() {
        let toml = r#"
[discovery]
seed_nodes = ["seed-1", "seed-2"]
host = "seed-1"
"#;
        let config = EskkaConfig::from_str(toml).unwrap();
        let roles = config.roles().unwrap();
        assert!(roles.master_eligible);
        assert!(roles.voter);

        // a non-seed node is not a voter
        let toml = r#"
[discovery]
seed_nodes = ["seed-1", "seed-2"]
host = "data-7"
"#;
        let roles = EskkaConfig::from_str(toml).unwrap().roles().unwrap();
        assert!(roles.master_eligible);
        assert!(!roles.voter);

        // clients are neither master-eligible nor bound to a fixed port
        let toml = r#"
[discovery]
seed_nodes = ["seed-1"]
host = "client-1"

[node]
client = true
"#;
        let config = EskkaConfig::from_str(toml).unwrap();
        let roles = config.roles().unwrap();
        assert!(!roles.master_eligible);
        assert_eq!(config.effective_port(), 0);

        // explicit master flag wins over the client default
        let toml = r#"
[discovery]
host = "node-1"

[node]
client = true
master = true
"#;
        let roles = EskkaConfig::from_str(toml).unwrap().roles().unwrap();
        assert!(roles.master_eligible);
    }

    #[test]
    fn test_failure_detector_tunables() {
        let toml = r#"
[discovery]
host = "node-1"
heartbeat_interval_ms = 500
"#;
        let fd = EskkaConfig::from_str(toml).unwrap().failure_detector();
        assert_eq!(fd.heartbeat_interval, Duration::from_millis(500));
        // default slack
        assert_eq!(fd.acceptable_heartbeat_pause, Duration::from_secs(3));
    }

    #[test]
    fn test_empty_seed_list_seeds_from_self() {
        let config = EskkaConfig::default();
        assert_eq!(config.seed_addresses().unwrap(), vec![config.self_address()]);
        assert!(config.roles().unwrap().voter);
    }

    #[test]
    fn test_validation_errors() {
        let toml = r#"
[discovery]
host = ""
"#;
        assert!(EskkaConfig::from_str(toml).is_err());

        let toml = r#"
[discovery]
host = "node-1"
seed_nodes = ["seed-1:badport"]
"#;
        assert!(EskkaConfig::from_str(toml).is_err());

        let toml = r#"
[discovery]
host = "node-1"
startup_timeout_min_ms = 5000
startup_timeout_max_ms = 1000
"#;
        assert!(EskkaConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[discovery]
seed_nodes = ["seed-1", "seed-2", "seed-3"]
host = "seed-2"
"#
        )
        .unwrap();

        let config = EskkaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.self_address(), Address::new("seed-2", 9400));
        assert_eq!(config.seed_addresses().unwrap().len(), 3);
    }
}
