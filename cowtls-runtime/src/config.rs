//! Runtime Configuration
//!
//! Configuration for a [`TlsSpace`](crate::TlsSpace). It can be set
//! programmatically or loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `COWTLS_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `COWTLS_INDEX_CAPACITY` | Number of slots in the registry hash index | 97 |
//! | `COWTLS_FAULT_TRAP` | Install the fault trap on first create ("true"/"false") | true |
//! | `COWTLS_FAULT_MATCH` | Fault address matching (page-start/containment) | page-start |
//! | `COWTLS_FAULT_LOCK_SPINS` | `try_lock` attempts the fault handler makes | 4096 |
//!
//! # Example
//!
//! ```rust,ignore
//! use cowtls_runtime::config::{FaultMatch, TlsConfig};
//!
//! // Load from environment with defaults
//! let config = TlsConfig::from_env();
//!
//! // Or use the builder pattern
//! let config = TlsConfig::builder()
//!     .index_capacity(193)
//!     .fault_match(FaultMatch::Containment)
//!     .build()?;
//! ```

use std::env;

/// Default number of slots in the registry hash index.
pub const DEFAULT_INDEX_CAPACITY: usize = 97;

/// Default number of lock attempts made by the fault handler.
pub const DEFAULT_FAULT_LOCK_SPINS: u32 = 4096;

/// How the fault trap decides that a faulting address belongs to a TLS page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum FaultMatch {
    /// Only a fault at the exact first byte of a page is recognized.
    ///
    /// A fault anywhere else inside a protected page is handled as an
    /// unrelated fault and terminates the process.
    #[default]
    PageStart = 0,
    /// Any address inside `[base, base + page_size)` is recognized.
    Containment = 1,
}

impl FaultMatch {
    /// Parse a matching policy from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "page-start" | "page_start" | "exact" => Some(FaultMatch::PageStart),
            "containment" | "contains" | "range" => Some(FaultMatch::Containment),
            _ => None,
        }
    }

    /// Convert from u8.
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => FaultMatch::Containment,
            _ => FaultMatch::PageStart,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            FaultMatch::PageStart => "page-start",
            FaultMatch::Containment => "containment",
        }
    }
}

/// Fault trap configuration.
#[derive(Debug, Clone)]
pub struct TrapConfig {
    /// Install the fault trap on the first `create`.
    /// Default: true.
    pub install: bool,

    /// Address matching policy.
    /// Default: `PageStart`.
    pub fault_match: FaultMatch,

    /// How many times the handler tries to take the page directory lock
    /// before treating the fault as unrelated.
    /// Default: 4096.
    pub lock_spins: u32,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            install: true,
            fault_match: FaultMatch::PageStart,
            lock_spins: DEFAULT_FAULT_LOCK_SPINS,
        }
    }
}

/// Complete configuration for a TLS space.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Number of slots in the registry hash index.
    /// Default: 97.
    pub index_capacity: usize,

    /// Fault trap configuration.
    pub trap: TrapConfig,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            index_capacity: DEFAULT_INDEX_CAPACITY,
            trap: TrapConfig::default(),
        }
    }
}

impl TlsConfig {
    /// Create a new builder for TlsConfig.
    pub fn builder() -> TlsConfigBuilder {
        TlsConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Variables that are unset or fail to parse keep their default values.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("COWTLS_INDEX_CAPACITY") {
            if val > 0 {
                config.index_capacity = val;
            }
        }

        if let Some(val) = parse_env_bool("COWTLS_FAULT_TRAP") {
            config.trap.install = val;
        }

        if let Ok(val) = env::var("COWTLS_FAULT_MATCH") {
            if let Some(policy) = FaultMatch::from_str(&val) {
                config.trap.fault_match = policy;
            }
        }

        if let Some(val) = parse_env_usize("COWTLS_FAULT_LOCK_SPINS") {
            if val > 0 {
                config.trap.lock_spins = u32::try_from(val).unwrap_or(u32::MAX);
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.index_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "index_capacity".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.trap.lock_spins == 0 {
            return Err(ConfigError::InvalidValue {
                field: "trap.lock_spins".into(),
                message: "must be at least 1".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for TlsConfig.
#[derive(Debug, Clone, Default)]
pub struct TlsConfigBuilder {
    config: TlsConfig,
}

impl TlsConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of registry index slots.
    pub fn index_capacity(mut self, capacity: usize) -> Self {
        self.config.index_capacity = capacity;
        self
    }

    /// Enable or disable installing the fault trap.
    pub fn install_fault_trap(mut self, enabled: bool) -> Self {
        self.config.trap.install = enabled;
        self
    }

    /// Set the fault address matching policy.
    pub fn fault_match(mut self, policy: FaultMatch) -> Self {
        self.config.trap.fault_match = policy;
        self
    }

    /// Set the number of lock attempts the fault handler makes.
    pub fn fault_lock_spins(mut self, spins: u32) -> Self {
        self.config.trap.lock_spins = spins;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<TlsConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> TlsConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| {
        match s.to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TlsConfig::default();
        assert_eq!(config.index_capacity, 97);
        assert!(config.trap.install);
        assert_eq!(config.trap.fault_match, FaultMatch::PageStart);
        assert_eq!(config.trap.lock_spins, DEFAULT_FAULT_LOCK_SPINS);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = TlsConfig::builder()
            .index_capacity(13)
            .install_fault_trap(false)
            .fault_match(FaultMatch::Containment)
            .fault_lock_spins(16)
            .build()
            .unwrap();

        assert_eq!(config.index_capacity, 13);
        assert!(!config.trap.install);
        assert_eq!(config.trap.fault_match, FaultMatch::Containment);
        assert_eq!(config.trap.lock_spins, 16);
    }

    #[test]
    fn test_builder_validation() {
        assert!(TlsConfig::builder().index_capacity(0).build().is_err());
        assert!(TlsConfig::builder().fault_lock_spins(0).build().is_err());
    }

    #[test]
    fn test_fault_match_from_str() {
        assert_eq!(FaultMatch::from_str("page-start"), Some(FaultMatch::PageStart));
        assert_eq!(FaultMatch::from_str("EXACT"), Some(FaultMatch::PageStart));
        assert_eq!(FaultMatch::from_str("Containment"), Some(FaultMatch::Containment));
        assert_eq!(FaultMatch::from_str("bogus"), None);
    }

    #[test]
    fn test_fault_match_u8_roundtrip() {
        assert_eq!(FaultMatch::from_u8(FaultMatch::PageStart as u8), FaultMatch::PageStart);
        assert_eq!(FaultMatch::from_u8(FaultMatch::Containment as u8), FaultMatch::Containment);
        assert_eq!(FaultMatch::from_u8(200), FaultMatch::PageStart);
    }

    #[test]
    fn test_config_error_display() {
        let err = TlsConfig::builder().index_capacity(0).build().unwrap_err();
        assert!(err.to_string().contains("index_capacity"));
        assert!(err.to_string().contains("at least 1"));
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("COWTLS_INDEX_CAPACITY");
        env::remove_var("COWTLS_FAULT_MATCH");

        let config = TlsConfig::from_env();
        assert_eq!(config.index_capacity, DEFAULT_INDEX_CAPACITY);
        assert_eq!(config.trap.fault_match, FaultMatch::PageStart);
    }
}
