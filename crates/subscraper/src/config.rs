use crate::registry::Registry;
use crate::{Error, Result};
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_DIR: &str = ".config/subscraper";
const CONFIG_FILE: &str = "provider-config.yaml";

/// API keys per source, as written in the provider configuration file:
///
/// ```yaml
/// securitytrails:
///   - ${SECURITYTRAILS_KEY}
///   - second-key
/// ```
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderConfig {
    sources: BTreeMap<String, Vec<String>>,
}

// region:        --- Loading

impl ProviderConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        let config = Self::from_yaml(&raw)?;
        debug!(
            "Provider config loaded from {:?} ({} sources with keys)",
            path,
            config.sources.len()
        );
        Ok(config)
    }

    /// Parses a configuration after environment substitution. Sources listed without any
    /// usable key are left out.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let raw = substitute_env_vars(raw);
        // unset variables leave `- ` entries behind, which YAML reads as null
        let parsed: Option<BTreeMap<String, Option<Vec<Option<String>>>>> =
            serde_yaml::from_str(&raw)?;

        let mut sources: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, keys) in parsed.unwrap_or_default() {
            let keys: Vec<String> = keys
                .unwrap_or_default()
                .into_iter()
                .flatten()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .collect();
            if keys.is_empty() {
                continue;
            }
            sources
                .entry(name.trim().to_lowercase())
                .or_default()
                .extend(keys);
        }

        Ok(Self { sources })
    }

    pub fn keys(&self, source: &str) -> &[String] {
        self.sources
            .get(&source.to_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn into_keys(self) -> HashMap<String, Vec<String>> {
        self.sources.into_iter().collect()
    }
}

// endregion:     --- Loading

// region:        --- Template

impl ProviderConfig {
    /// One empty entry per source that needs a key.
    pub fn template(registry: &Registry) -> Self {
        let sources = registry
            .all_sources()
            .iter()
            .filter(|source| source.needs_key())
            .map(|source| (source.name().to_string(), Vec::new()))
            .collect();
        Self { sources }
    }

    pub fn write_template(path: &Path, registry: &Registry) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let yaml = serde_yaml::to_string(&Self::template(registry))?;
        fs::write(path, yaml)?;
        info!("Provider config template written to {:?}", path);
        Ok(())
    }
}

pub fn default_config_path() -> Result<PathBuf> {
    match env::var_os("HOME") {
        Some(home) if !home.is_empty() => Ok(PathBuf::from(home).join(CONFIG_DIR).join(CONFIG_FILE)),
        _ => Err(Error::Configuration(
            "HOME is not set, pass the provider config path explicitly".to_string(),
        )),
    }
}

// endregion:     --- Template

/// Replaces `${VAR}` and `$VAR` with the variable's value, unset variables become empty.
fn substitute_env_vars(raw: &str) -> String {
    let pattern = regex!(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)");

    let mut substituted = String::with_capacity(raw.len());
    let mut last = 0;
    for caps in pattern.captures_iter(raw) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1).or_else(|| caps.get(2))) else {
            continue;
        };
        substituted.push_str(&raw[last..whole.start()]);
        substituted.push_str(&env::var(name.as_str()).unwrap_or_default());
        last = whole.end();
    }
    substituted.push_str(&raw[last..]);
    substituted
}
