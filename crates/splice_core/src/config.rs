//! Engine settings and declarative patch manifests (TOML)

use crate::error::ConfigError;
use crate::pattern::Matcher;
use crate::registry::{Patch, Replacement};
use serde::Deserialize;
use std::path::Path;

/// Global name the host's bundler publishes its chunk loader under.
pub const DEFAULT_CHUNK_GLOBAL: &str = "webpackChunkdiscord_app";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub chunk_global: String,
    pub label_patched_modules: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_global: DEFAULT_CHUNK_GLOBAL.to_string(),
            label_patched_modules: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

/// A plugin's patches, as shipped in a manifest file:
///
/// ```toml
/// plugin = "MessageHooks"
///
/// [[patches]]
/// find = "sendMessage:function"
///
/// [[patches.replacement]]
/// match = '\)\{'
/// replace = '){onSend();'
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct PatchManifest {
    pub plugin: String,
    #[serde(default)]
    pub patches: Vec<PatchSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PatchSpec {
    pub find: String,
    #[serde(default)]
    pub replacement: Vec<ReplacementSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplacementSpec {
    #[serde(rename = "match")]
    pub pattern: String,
    pub replace: String,
    #[serde(default)]
    pub global: bool,
    /// `match` is plain text, not a pattern.
    #[serde(default)]
    pub literal: bool,
}

impl PatchManifest {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Compile every pattern. Fails on the first invalid one so a broken
    /// manifest registers nothing.
    pub fn patches(&self) -> Result<Vec<Patch>, ConfigError> {
        self.patches
            .iter()
            .map(|spec| {
                if spec.replacement.is_empty() {
                    return Err(ConfigError::EmptyPatch {
                        owner: self.plugin.clone(),
                        find: spec.find.clone(),
                    });
                }
                let replacements = spec
                    .replacement
                    .iter()
                    .map(|r| {
                        let matcher = if r.literal {
                            Matcher::literal(&r.pattern)
                        } else {
                            Matcher::new(&r.pattern)
                        };
                        let matcher = matcher.map_err(|source| ConfigError::Pattern {
                            owner: self.plugin.clone(),
                            source,
                        })?;
                        let replacement = Replacement::template(matcher, &r.replace);
                        Ok(if r.global { replacement.global() } else { replacement })
                    })
                    .collect::<Result<Vec<_>, ConfigError>>()?;
                Ok(Patch {
                    find: spec.find.clone(),
                    replacements,
                })
            })
            .collect()
    }
}
