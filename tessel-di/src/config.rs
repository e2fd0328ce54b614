//! Configuration-based context wiring
//!
//! A configuration file declares constant bindings so deployments can
//! change settings without recompiling:
//!
//! ```toml
//! name = "application"
//! duplicate_policy = "reject"
//! lock = true
//!
//! [[bindings]]
//! key = "datasource.url"
//! value = "postgres://localhost/todos"
//! scope = "singleton"
//! tags = ["datasource"]
//! ```
//!
//! Values are bound as `serde_json::Value`.

use serde::{Deserialize, Serialize};

use crate::binding::BindingScope;
use crate::context::{Context, DuplicatePolicy};
use crate::error::{DiError, DiResult};

/// Binding scope configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeConfig {
    #[default]
    Transient,
    Singleton,
    ContextBound,
}

impl From<ScopeConfig> for BindingScope {
    fn from(config: ScopeConfig) -> Self {
        match config {
            ScopeConfig::Transient => BindingScope::Transient,
            ScopeConfig::Singleton => BindingScope::Singleton,
            ScopeConfig::ContextBound => BindingScope::ContextBound,
        }
    }
}

/// Duplicate policy configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicatePolicyConfig {
    #[default]
    Replace,
    Reject,
}

impl From<DuplicatePolicyConfig> for DuplicatePolicy {
    fn from(config: DuplicatePolicyConfig) -> Self {
        match config {
            DuplicatePolicyConfig::Replace => DuplicatePolicy::Replace,
            DuplicatePolicyConfig::Reject => DuplicatePolicy::Reject,
        }
    }
}

/// One constant binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindingConfig {
    pub key: String,
    pub value: serde_json::Value,
    #[serde(default)]
    pub scope: ScopeConfig,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Context configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub duplicate_policy: DuplicatePolicyConfig,
    /// Lock the context once the bindings are applied
    #[serde(default)]
    pub lock: bool,
    #[serde(default)]
    pub bindings: Vec<BindingConfig>,
}

fn default_name() -> String {
    "application".to_string()
}

impl ContextConfig {
    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> DiResult<Self> {
        toml::from_str(toml_str)
            .map_err(|e| DiError::ConfigError(format!("Failed to parse TOML: {}", e)))
    }

    /// Load configuration from JSON string
    pub fn from_json(json_str: &str) -> DiResult<Self> {
        serde_json::from_str(json_str)
            .map_err(|e| DiError::ConfigError(format!("Failed to parse JSON: {}", e)))
    }

    /// Bind every configured value into `ctx`, then lock it if requested
    pub fn apply(&self, ctx: &Context) -> DiResult<()> {
        for entry in &self.bindings {
            if entry.key.is_empty() {
                return Err(DiError::ConfigError("Binding key cannot be empty".to_string()));
            }
            let binding = ctx.bind(entry.key.clone())?;
            binding.to(entry.value.clone()).in_scope(entry.scope.into());
            for tag in &entry.tags {
                binding.tag(tag.clone());
            }
        }
        if self.lock {
            ctx.lock();
        }
        Ok(())
    }

    /// Create a root context from this configuration
    pub fn build(&self) -> DiResult<Context> {
        let ctx = Context::builder()
            .name(self.name.clone())
            .duplicate_policy(self.duplicate_policy.into())
            .build()?;
        self.apply(&ctx)?;
        Ok(ctx)
    }
}

/// Configuration builder
pub struct ConfigBuilder {
    config: ContextConfig,
}

impl ConfigBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            config: ContextConfig {
                name: name.into(),
                duplicate_policy: DuplicatePolicyConfig::default(),
                lock: false,
                bindings: Vec::new(),
            },
        }
    }

    pub fn bind(mut self, key: impl Into<String>, value: serde_json::Value, scope: ScopeConfig) -> Self {
        self.config.bindings.push(BindingConfig {
            key: key.into(),
            value,
            scope,
            tags: Vec::new(),
        });
        self
    }

    pub fn duplicate_policy(mut self, policy: DuplicatePolicyConfig) -> Self {
        self.config.duplicate_policy = policy;
        self
    }

    pub fn lock(mut self, lock: bool) -> Self {
        self.config.lock = lock;
        self
    }

    pub fn build(self) -> ContextConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_round_trips_through_json() {
        let config = ConfigBuilder::new("api")
            .bind("page.size", json!(25), ScopeConfig::Singleton)
            .lock(true)
            .build();
        let text = serde_json::to_string(&config).unwrap();
        let parsed = ContextConfig::from_json(&text).unwrap();

        assert_eq!(parsed.name, "api");
        assert!(parsed.lock);
        assert_eq!(parsed.bindings[0].scope, ScopeConfig::Singleton);
    }

    #[test]
    fn test_empty_key_rejected() {
        let config = ConfigBuilder::new("api")
            .bind("", json!(null), ScopeConfig::Transient)
            .build();
        assert!(matches!(config.build(), Err(DiError::ConfigError(_))));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            ContextConfig::from_toml("bindings = 3"),
            Err(DiError::ConfigError(_))
        ));
    }
}
