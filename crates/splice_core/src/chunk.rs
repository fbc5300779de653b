//! Chunks: the unit in which a host delivers module factories

use crate::module::{Factory, ModuleId};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChunkId(pub String);

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// `[chunkIds, modules, entry]` as pushed by the host.
///
/// Modules keep the order the host enumerated them in.
#[derive(Clone, Debug, Default)]
pub struct Chunk {
    pub ids: Vec<ChunkId>,
    pub modules: Vec<(ModuleId, Factory)>,
    pub entry: Option<ModuleId>,
}

impl Chunk {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(|id| ChunkId(id.into())).collect(),
            modules: Vec::new(),
            entry: None,
        }
    }

    pub fn with_module(mut self, id: impl Into<ModuleId>, factory: Factory) -> Self {
        self.modules.push((id.into(), factory));
        self
    }

    pub fn with_entry(mut self, id: impl Into<ModuleId>) -> Self {
        self.entry = Some(id.into());
        self
    }

    pub fn module_ids(&self) -> Vec<ModuleId> {
        self.modules.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn factory(&self, id: &ModuleId) -> Option<&Factory> {
        self.modules.iter().find(|(m, _)| m == id).map(|(_, f)| f)
    }

    /// Label used in logs. Falls back to a hash of the module ids for
    /// chunks pushed without ids.
    pub fn label(&self) -> String {
        if self.ids.is_empty() {
            return fingerprint(&self.module_ids());
        }
        self.ids
            .iter()
            .map(|id| id.0.as_str())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn fingerprint(modules: &[ModuleId]) -> String {
    let mut hasher = DefaultHasher::new();
    modules.hash(&mut hasher);
    format!("anon-{:x}", hasher.finish())
}
