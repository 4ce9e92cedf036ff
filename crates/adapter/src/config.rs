//! Provider configuration.
//!
//! A JSON document layered under `VMNODE_`-prefixed environment variables.
//! Defaults are applied before validation, so a config file only needs the
//! keys that differ from them.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Fallback location checked when no `--config` flag is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vmnode/config.json";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    #[serde(rename = "Region")]
    pub region: String,
    #[serde(rename = "ClusterName")]
    pub cluster_name: String,
    #[serde(rename = "ManagementSubnet")]
    pub management_subnet: String,
    /// Logical node name; may also come from the CLI.
    #[serde(rename = "NodeName")]
    pub node_name: String,
    #[serde(rename = "VMConfig")]
    pub vm_config: VmConfig,
    #[serde(rename = "BootstrapAgent")]
    pub bootstrap_agent: BootstrapAgentConfig,
    #[serde(rename = "HealthConfig")]
    pub health: HealthConfig,
    #[serde(rename = "VKVMAgentConnectionConfig")]
    pub agent_connection: AgentConnectionConfig,
    #[serde(rename = "WarmPoolConfig")]
    pub warm_pools: Vec<WarmPoolConfig>,
    #[serde(rename = "MetricsAddress")]
    pub metrics_address: String,
    #[serde(rename = "Logging")]
    pub logging: LoggingConfig,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            region: String::new(),
            cluster_name: String::new(),
            management_subnet: String::new(),
            node_name: String::new(),
            vm_config: VmConfig::default(),
            bootstrap_agent: BootstrapAgentConfig::default(),
            health: HealthConfig::default(),
            agent_connection: AgentConnectionConfig::default(),
            warm_pools: Vec::new(),
            metrics_address: ":10256".to_string(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Default VM image settings applied when a pod doesn't override them.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct VmConfig {
    #[serde(rename = "DefaultAMI")]
    pub default_ami: String,
    /// Base64 cloud-init payload handed to every VM.
    #[serde(rename = "InitData")]
    pub init_data: String,
}

/// Where the in-VM agent binary lives and how it is started.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapAgentConfig {
    #[serde(rename = "S3Bucket")]
    pub s3_bucket: String,
    #[serde(rename = "S3Key")]
    pub s3_key: String,
    #[serde(rename = "GRPCPort")]
    pub grpc_port: u16,
    #[serde(rename = "InitData")]
    pub init_data: String,
}

impl Default for BootstrapAgentConfig {
    fn default() -> Self {
        Self {
            s3_bucket: String::new(),
            s3_key: String::new(),
            grpc_port: 8200,
            init_data: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before a monitor reports unhealthy.
    #[serde(rename = "UnhealthyThresholdCount")]
    pub unhealthy_threshold_count: u32,
    #[serde(rename = "HealthCheckIntervalSeconds")]
    pub health_check_interval_seconds: u64,
    /// Sleep between watch-stream reconnect attempts.
    #[serde(rename = "StreamRetryIntervalSeconds")]
    pub stream_retry_interval_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            unhealthy_threshold_count: 5,
            health_check_interval_seconds: 60,
            stream_retry_interval_seconds: 5,
        }
    }
}

/// Dial behavior for the per-pod agent channel.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AgentConnectionConfig {
    #[serde(rename = "Port")]
    pub port: u16,
    /// Hard ceiling on the whole blocking dial, reconnect attempts included.
    #[serde(rename = "TimeoutSeconds")]
    pub timeout_seconds: u64,
    /// Minimum time a single connect attempt is given.
    #[serde(rename = "MinConnectTimeoutSeconds")]
    pub min_connect_timeout_seconds: u64,
    #[serde(rename = "Backoff")]
    pub backoff: BackoffConfig,
    #[serde(rename = "Keepalive")]
    pub keepalive: KeepaliveConfig,
    #[serde(rename = "KeepaliveEnabled")]
    pub keepalive_enabled: bool,
}

impl Default for AgentConnectionConfig {
    fn default() -> Self {
        Self {
            port: 8200,
            timeout_seconds: 300,
            min_connect_timeout_seconds: 60,
            backoff: BackoffConfig::default(),
            keepalive: KeepaliveConfig::default(),
            keepalive_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(rename = "BaseDelaySeconds")]
    pub base_delay_seconds: u64,
    #[serde(rename = "Multiplier")]
    pub multiplier: f64,
    #[serde(rename = "Jitter")]
    pub jitter: f64,
    #[serde(rename = "MaxDelaySeconds")]
    pub max_delay_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: 1,
            multiplier: 1.5,
            jitter: 0.5,
            max_delay_seconds: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Inactivity before the client pings the server.
    #[serde(rename = "TimeSeconds")]
    pub time_seconds: u64,
    /// How long to wait for the ping response before closing.
    #[serde(rename = "TimeoutSeconds")]
    pub timeout_seconds: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            time_seconds: 60,
            timeout_seconds: 120,
        }
    }
}

/// One pre-provisioned pool of instances.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WarmPoolConfig {
    #[serde(rename = "DesiredCount")]
    pub desired_count: usize,
    #[serde(rename = "IamInstanceProfile")]
    pub iam_instance_profile: String,
    #[serde(rename = "SecurityGroups")]
    pub security_groups: Vec<String>,
    #[serde(rename = "KeyPair")]
    pub key_pair: String,
    #[serde(rename = "ImageID")]
    pub image_id: String,
    #[serde(rename = "InstanceType")]
    pub instance_type: String,
    #[serde(rename = "Subnets")]
    pub subnets: Vec<String>,
}

impl Default for WarmPoolConfig {
    fn default() -> Self {
        Self {
            desired_count: 10,
            iam_instance_profile: String::new(),
            security_groups: Vec::new(),
            key_pair: String::new(),
            image_id: String::new(),
            instance_type: String::new(),
            subnets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    #[serde(rename = "Level")]
    pub level: String,
    #[serde(rename = "Json")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,adapter=debug".to_string(),
            json: false,
        }
    }
}

impl ProviderConfig {
    /// Load configuration: defaults, then the JSON file, then `VMNODE_*`
    /// environment variables (double underscore for nesting).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let defaults = config::Config::try_from(&ProviderConfig::default())
            .context("Failed to serialize default configuration")?;

        let mut builder = config::Config::builder().add_source(defaults);

        match path {
            Some(path) => {
                builder = builder
                    .add_source(config::File::new(path, config::FileFormat::Json).required(true));
            }
            None => {
                builder = builder.add_source(
                    config::File::new(DEFAULT_CONFIG_PATH, config::FileFormat::Json)
                        .required(false),
                );
            }
        }

        builder = builder.add_source(
            config::Environment::with_prefix("VMNODE")
                .separator("__")
                .try_parsing(true),
        );

        builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        if self.region.is_empty() {
            anyhow::bail!("Region must be set");
        }
        if self.cluster_name.is_empty() {
            anyhow::bail!("ClusterName must be set");
        }
        if self.management_subnet.is_empty() {
            anyhow::bail!("ManagementSubnet must be set");
        }

        for (idx, pool) in self.warm_pools.iter().enumerate() {
            if pool.image_id.is_empty() {
                anyhow::bail!("WarmPoolConfig[{idx}]: ImageID must be set");
            }
            if pool.instance_type.is_empty() {
                anyhow::bail!("WarmPoolConfig[{idx}]: InstanceType must be set");
            }
            if pool.subnets.is_empty() {
                anyhow::bail!("WarmPoolConfig[{idx}]: 1 or more Subnets must be configured");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> ProviderConfig {
        ProviderConfig {
            region: "us-west-2".to_string(),
            cluster_name: "test-cluster".to_string(),
            management_subnet: "subnet-mgmt".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_match_contract() {
        let cfg = ProviderConfig::default();
        assert_eq!(cfg.health.unhealthy_threshold_count, 5);
        assert_eq!(cfg.health.health_check_interval_seconds, 60);
        assert_eq!(cfg.agent_connection.port, 8200);
        assert_eq!(cfg.agent_connection.timeout_seconds, 300);
        assert_eq!(cfg.agent_connection.min_connect_timeout_seconds, 60);
        assert_eq!(cfg.agent_connection.backoff.base_delay_seconds, 1);
        assert_eq!(cfg.agent_connection.backoff.multiplier, 1.5);
        assert_eq!(cfg.agent_connection.backoff.jitter, 0.5);
        assert_eq!(cfg.agent_connection.backoff.max_delay_seconds, 120);
        assert_eq!(cfg.agent_connection.keepalive.time_seconds, 60);
        assert_eq!(cfg.agent_connection.keepalive.timeout_seconds, 120);
        assert_eq!(cfg.bootstrap_agent.grpc_port, 8200);
        assert_eq!(cfg.metrics_address, ":10256");
        assert_eq!(WarmPoolConfig::default().desired_count, 10);
    }

    #[test]
    fn validate_rejects_missing_management_subnet() {
        let mut cfg = minimal();
        cfg.management_subnet = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_minimal() {
        assert!(minimal().validate().is_ok());
    }

    #[test]
    fn validate_checks_warm_pool_entries() {
        let mut cfg = minimal();
        cfg.warm_pools.push(WarmPoolConfig {
            image_id: "ami-0001".to_string(),
            instance_type: "t3.small".to_string(),
            subnets: vec![],
            ..Default::default()
        });
        let err = cfg.validate().unwrap_err().to_string();
        assert!(err.contains("Subnets"), "unexpected error: {err}");
    }

    #[test]
    fn parses_partial_json_document() {
        let doc = serde_json::json!({
            "Region": "eu-central-1",
            "ClusterName": "prod",
            "ManagementSubnet": "subnet-a",
            "HealthConfig": { "UnhealthyThresholdCount": 2 },
            "WarmPoolConfig": [{
                "DesiredCount": 3,
                "ImageID": "ami-0001",
                "InstanceType": "t3.small",
                "Subnets": ["subnet-a", "subnet-b"]
            }]
        });

        let cfg: ProviderConfig = serde_json::from_value(doc).unwrap();
        assert_eq!(cfg.region, "eu-central-1");
        assert_eq!(cfg.health.unhealthy_threshold_count, 2);
        // unspecified keys keep their defaults
        assert_eq!(cfg.health.health_check_interval_seconds, 60);
        assert_eq!(cfg.warm_pools[0].desired_count, 3);
        assert_eq!(cfg.warm_pools[0].subnets.len(), 2);
        cfg.validate().unwrap();
    }
}
