//! Error types for patching, compilation and module execution

use crate::module::ModuleId;
use thiserror::Error;

/// A patch's rewrite step failed before any code was compiled.
#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("pattern `{pattern}` matched nothing")]
    NoMatch { pattern: String },

    #[error("pattern `{pattern}` could not be evaluated: {message}")]
    Matcher { pattern: String, message: String },

    #[error("replacement function failed: {0}")]
    Replacer(String),
}

/// Rewritten source could not be turned back into a callable factory.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("module {id}: syntax error: {message}")]
    Syntax { id: ModuleId, message: String },

    #[error("module {id}: source does not define `fn {entry}()`")]
    MissingEntry { id: ModuleId, entry: &'static str },
}

/// Why a single patch attempt on a single module was abandoned.
#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Rewrite(#[from] RewriteError),

    #[error(transparent)]
    Compile(#[from] CompileError),
}

impl PatchError {
    pub fn is_no_match(&self) -> bool {
        matches!(self, PatchError::Rewrite(RewriteError::NoMatch { .. }))
    }
}

/// Failure while resolving or running a module factory.
#[derive(Debug, Clone, Error)]
pub enum ModuleError {
    #[error("module {0} is not registered")]
    NotFound(ModuleId),

    #[error("module {id} threw: {message}")]
    Failed { id: ModuleId, message: String },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("plugin `{owner}`: invalid match pattern: {source}")]
    Pattern {
        owner: String,
        #[source]
        source: fancy_regex::Error,
    },

    #[error("plugin `{owner}`: patch for `{find}` has no replacements")]
    EmptyPatch { owner: String, find: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
