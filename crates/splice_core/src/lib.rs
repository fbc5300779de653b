//! Splice - bundler chunk interception and module source patching.
//!
//! Hooks the host's chunk loader, rewrites module sources with registered
//! find/match/replace patches, recompiles them, and lets collaborators
//! react the first time a module with a given export shape loads.

pub mod broadcaster;
pub mod chunk;
pub mod compiler;
pub mod config;
pub mod engine;
pub mod error;
pub mod interceptor;
pub mod module;
pub mod patcher;
pub mod pattern;
pub mod registry;
pub mod runtime;
pub mod subscription;

pub use chunk::{Chunk, ChunkId};
pub use compiler::{Compiler, ScriptCompiler};
pub use config::{EngineConfig, PatchManifest, DEFAULT_CHUNK_GLOBAL};
pub use engine::Engine;
pub use error::{CompileError, ConfigError, ModuleError, PatchError, RewriteError};
pub use interceptor::{ChunkInterceptor, FrameContext, LoaderHandle, PushFn};
pub use module::{Exports, Factory, Module, ModuleId, RequireHandle};
pub use patcher::ModulePatcher;
pub use pattern::{Captures, Matcher};
pub use registry::{Patch, PatchOutcome, PatchRegistry, Replacement};
pub use runtime::HostRuntime;
pub use subscription::{filters, SubscriptionId, SubscriptionTable};

use std::sync::Once;

static INIT: Once = Once::new();

/// Install the `tracing` subscriber (filter from `RUST_LOG`). Safe to call
/// more than once.
pub fn init_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}
