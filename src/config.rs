//! Process-wide configuration lookup.
//!
//! Configuration is only ever read. The scrypt default is consulted when a new
//! key is stored; retrieval always uses the parameters persisted with the key.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Property holding the scrypt cost for newly stored keys, as `N:r:p` log2 values.
pub const SCRYPT_PROP: &str = "ASHURA_SCRYPT_PARAMS";
pub const SCRYPT_DEFAULTS: &str = "15:3:1";

/// Property naming the secure-overwrite program.
pub const SECDISCARD_PROP: &str = "ASHURA_SECDISCARD";
/// Property naming the recursive-delete program.
pub const RM_PROP: &str = "ASHURA_RM";

const DEFAULT_SECDISCARD: &str = "shred";
const DEFAULT_RM: &str = "rm";

/// Read-only source of named configuration values.
pub trait PropertySource: Send + Sync {
    fn property(&self, name: &str) -> Option<String>;

    fn property_or(&self, name: &str, default: &str) -> String {
        self.property(name).unwrap_or_else(|| default.to_string())
    }
}

/// Reads properties from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvProperties;

impl PropertySource for EnvProperties {
    fn property(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.is_empty())
    }
}

/// A fixed property map.
#[derive(Debug, Clone, Default)]
pub struct StaticProperties {
    values: HashMap<String, String>,
}

impl StaticProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, value: &str) -> Self {
        self.values.insert(name.to_string(), value.to_string());
        self
    }
}

impl PropertySource for StaticProperties {
    fn property(&self, name: &str) -> Option<String> {
        self.values.get(name).cloned()
    }
}

/// An external program plus the arguments placed before the target paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

/// The external utilities used when destroying a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureDeleteConfig {
    /// Overwrites the sensitive files in place.
    pub secdiscard: ToolCommand,
    /// Removes the key directory recursively.
    pub rm: ToolCommand,
}

impl Default for SecureDeleteConfig {
    fn default() -> Self {
        Self {
            secdiscard: ToolCommand::new(DEFAULT_SECDISCARD, &["-z", "--"]),
            rm: ToolCommand::new(DEFAULT_RM, &["-rf", "--"]),
        }
    }
}

impl SecureDeleteConfig {
    /// Defaults, with the program paths overridable through properties.
    pub fn from_properties(props: &dyn PropertySource) -> Self {
        let mut config = Self::default();
        if let Some(program) = props.property(SECDISCARD_PROP) {
            config.secdiscard.program = program.into();
        }
        if let Some(program) = props.property(RM_PROP) {
            config.rm.program = program.into();
        }
        config
    }
}

/// Everything a [`crate::KeyStorage`] reads from its environment.
#[derive(Clone)]
pub struct KeyStorageConfig {
    pub properties: Arc<dyn PropertySource>,
    pub secure_delete: SecureDeleteConfig,
}

impl KeyStorageConfig {
    pub fn new(properties: Arc<dyn PropertySource>) -> Self {
        let secure_delete = SecureDeleteConfig::from_properties(properties.as_ref());
        Self {
            properties,
            secure_delete,
        }
    }

    /// Configuration backed by environment variables.
    pub fn from_env() -> Self {
        Self::new(Arc::new(EnvProperties))
    }

    pub fn with_secure_delete(mut self, secure_delete: SecureDeleteConfig) -> Self {
        self.secure_delete = secure_delete;
        self
    }

    /// The scrypt cost string to use for a newly stored key.
    pub fn scrypt_params(&self) -> String {
        self.properties.property_or(SCRYPT_PROP, SCRYPT_DEFAULTS)
    }
}

impl Default for KeyStorageConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl std::fmt::Debug for KeyStorageConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStorageConfig")
            .field("scrypt_params", &self.scrypt_params())
            .field("secure_delete", &self.secure_delete)
            .finish()
    }
}
