use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_PATH: &str = "/etc/hca-transport/config.toml";

/// Errors raised while loading or validating a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The file is not valid TOML for [`HcaConfig`]
    #[error("Parse error: {0}")]
    ParseError(#[from] toml::de::Error),

    /// A value is outside of what the hardware supports
    #[error("invalid value: {0}")]
    Invalid(String),
}

/// Which doorbell generation the device speaks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DoorbellKind {
    /// MMIO doorbell per batch of work requests
    #[default]
    Legacy,
    /// Doorbell records in host memory plus an MMIO trigger
    MemoryFree,
}

/// Resource limits reported by the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct DeviceLimits {
    /// Size of the QP table, a power of two
    pub num_qps: u32,
    /// QP numbers reserved by firmware; special QPs follow them
    pub reserved_qps: u32,
    /// Size of the CQ table, a power of two
    pub num_cqs: u32,
    pub reserved_cqs: u32,
    /// Size of the SRQ table, a power of two
    pub num_srqs: u32,
    pub reserved_srqs: u32,
    /// Maximum work requests per work queue
    pub max_wqes: u32,
    /// Maximum scatter/gather entries per WQE
    pub max_sg: u32,
    /// Maximum WQE size in bytes
    pub max_desc_sz: u32,
    pub max_cqes: u32,
    pub max_srq_wqes: u32,
    pub max_srq_sge: u32,
    pub num_ports: u8,
    pub pkey_table_len: u16,
    pub gid_table_len: u16,
    /// Maximum outstanding RDMA read/atomic requests as initiator
    pub max_qp_init_rdma: u8,
    /// log2 of the responder resources per QP
    pub rdb_shift: u8,
    /// Doorbell records available in memory-free mode
    pub num_db_records: u32,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self {
            num_qps: 1024,
            reserved_qps: 8,
            num_cqs: 256,
            reserved_cqs: 1,
            num_srqs: 256,
            reserved_srqs: 1,
            max_wqes: 16384,
            max_sg: 30,
            max_desc_sz: 1008,
            max_cqes: 65535,
            max_srq_wqes: 16384,
            max_srq_sge: 30,
            num_ports: 2,
            pkey_table_len: 64,
            gid_table_len: 32,
            max_qp_init_rdma: 128,
            rdb_shift: 2,
            num_db_records: 512,
        }
    }
}

/// Configuration of one driver instance.
///
/// Passed to [`crate::HcaContext::new`]; nothing in the crate keeps global state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HcaConfig {
    /// Doorbell generation
    pub doorbell: DoorbellKind,
    /// Device limits
    pub limits: DeviceLimits,
    /// Work requests covered by one legacy doorbell
    pub legacy_doorbell_batch: u32,
    /// Index of the driver's UAR page
    pub uar_index: u32,
    /// Event queue receiving asynchronous errors
    pub async_eqn: u32,
    /// Event queue receiving completion events
    pub comp_eqn: u32,
    /// Base of the RDMA read responder buffers
    pub rdb_base: u32,
    /// Key covering all WQE, CQE and header buffers
    pub reserved_lkey: u32,
    /// P_Key placed in headers built for special QPs
    pub default_pkey: u16,
}

impl Default for HcaConfig {
    fn default() -> Self {
        Self {
            doorbell: DoorbellKind::default(),
            limits: DeviceLimits::default(),
            legacy_doorbell_batch: 256,
            uar_index: 1,
            async_eqn: 0,
            comp_eqn: 1,
            rdb_base: 0,
            reserved_lkey: 0x100,
            default_pkey: 0xffff,
        }
    }
}

impl HcaConfig {
    /// Returns `true` for the memory-free doorbell protocol.
    #[must_use]
    pub fn is_memfree(&self) -> bool {
        self.doorbell == DoorbellKind::MemoryFree
    }

    /// Checks that table sizes and limits are usable by the hardware.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let l = &self.limits;
        for (name, value) in [
            ("num_qps", l.num_qps),
            ("num_cqs", l.num_cqs),
            ("num_srqs", l.num_srqs),
        ] {
            if !value.is_power_of_two() || value > 1 << 24 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a power of two no larger than 2^24, got {value}"
                )));
            }
        }
        if !(1..=2).contains(&l.num_ports) {
            return Err(ConfigError::Invalid(format!(
                "num_ports must be 1 or 2, got {}",
                l.num_ports
            )));
        }
        if special_qp_base(l.reserved_qps).saturating_add(4) > l.num_qps {
            return Err(ConfigError::Invalid(
                "reserved_qps leaves no room for special QPs".into(),
            ));
        }
        if l.reserved_cqs >= l.num_cqs || l.reserved_srqs >= l.num_srqs {
            return Err(ConfigError::Invalid("reserved range covers whole table".into()));
        }
        if l.max_desc_sz < 64 {
            return Err(ConfigError::Invalid(format!(
                "max_desc_sz {} is below the minimum WQE size",
                l.max_desc_sz
            )));
        }
        if self.legacy_doorbell_batch == 0 || self.legacy_doorbell_batch > 256 {
            return Err(ConfigError::Invalid(format!(
                "legacy_doorbell_batch must be in 1..=256, got {}",
                self.legacy_doorbell_batch
            )));
        }
        if self.is_memfree() && l.num_db_records < 4 {
            return Err(ConfigError::Invalid("num_db_records too small".into()));
        }
        Ok(())
    }
}

/// First special QP number: the port 1 QP0 number has to be even.
pub(crate) fn special_qp_base(reserved_qps: u32) -> u32 {
    (reserved_qps + 1) & !1
}

/// Loads [`HcaConfig`] from TOML files.
#[derive(Debug, Clone, Copy)]
pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads the configuration from the default path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_default() -> Result<HcaConfig, ConfigError> {
        Self::load_from_path(DEFAULT_CONFIG_PATH)
    }

    /// Loads the configuration from the specified path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from_path(path: &str) -> Result<HcaConfig, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Parses and validates a configuration held in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the text cannot be parsed or validated.
    pub fn load_from_str(content: &str) -> Result<HcaConfig, ConfigError> {
        let config: HcaConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        HcaConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = ConfigLoader::load_from_str(
            r#"
doorbell = "memory_free"
legacy_doorbell_batch = 64

[limits]
num_qps = 256
num_ports = 1
"#,
        )
        .unwrap();
        assert!(config.is_memfree());
        assert_eq!(config.legacy_doorbell_batch, 64);
        assert_eq!(config.limits.num_qps, 256);
        assert_eq!(config.limits.num_ports, 1);
        assert_eq!(config.limits.max_sg, DeviceLimits::default().max_sg);
    }

    #[test]
    fn rejects_non_power_of_two_tables() {
        let err = ConfigLoader::load_from_str("[limits]\nnum_cqs = 100\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_malformed_toml() {
        let err = ConfigLoader::load_from_str("doorbell = ").unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn special_qp_base_is_even() {
        assert_eq!(special_qp_base(8), 8);
        assert_eq!(special_qp_base(7), 8);
        assert_eq!(special_qp_base(0), 0);
    }
}
