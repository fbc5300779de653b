//! Patch registry: find/match/replace rules contributed by plugins

use crate::error::RewriteError;
use crate::pattern::{Captures, Matcher};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

/// Replacement function. Receives the match and its capture groups.
pub type ReplaceFn = dyn Fn(&Captures<'_>) -> anyhow::Result<String>;

#[derive(Clone)]
pub enum Replace {
    /// JS replacement template (`$&`, `$1`, `$$`).
    Template(String),
    With(Rc<ReplaceFn>),
}

impl fmt::Debug for Replace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replace::Template(t) => f.debug_tuple("Template").field(t).finish(),
            Replace::With(_) => f.write_str("With(<fn>)"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Replacement {
    pub matcher: Matcher,
    pub replace: Replace,
    /// Replace every match instead of the first one.
    pub global: bool,
}

impl Replacement {
    pub fn template(matcher: Matcher, template: &str) -> Self {
        Self {
            matcher,
            replace: Replace::Template(template.to_string()),
            global: false,
        }
    }

    pub fn with<F>(matcher: Matcher, f: F) -> Self
    where
        F: Fn(&Captures<'_>) -> anyhow::Result<String> + 'static,
    {
        Self {
            matcher,
            replace: Replace::With(Rc::new(f)),
            global: false,
        }
    }

    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }
}

/// Rewrite `source` with one replacement. Pure; touches no registry state.
pub fn rewrite(source: &str, replacement: &Replacement) -> Result<String, RewriteError> {
    let matcher = &replacement.matcher;
    let limit = if replacement.global { usize::MAX } else { 1 };
    let found = matcher
        .captures(source, limit)
        .map_err(|e| RewriteError::Matcher {
            pattern: matcher.as_str().to_string(),
            message: e.to_string(),
        })?;
    if found.is_empty() {
        return Err(RewriteError::NoMatch {
            pattern: matcher.as_str().to_string(),
        });
    }

    let mut out = String::with_capacity(source.len());
    let mut last = 0;
    for caps in &found {
        let (start, end) = caps.span();
        out.push_str(&source[last..start]);
        match &replacement.replace {
            Replace::Template(template) => caps.expand(template, &mut out),
            Replace::With(f) => {
                let text = f(caps).map_err(|e| RewriteError::Replacer(format!("{e:#}")))?;
                out.push_str(&text);
            }
        }
        last = end;
    }
    out.push_str(&source[last..]);
    Ok(out)
}

/// Registration unit: one find-string with one or more replacements.
#[derive(Clone, Debug)]
pub struct Patch {
    pub find: String,
    pub replacements: Vec<Replacement>,
}

impl Patch {
    pub fn new(find: impl Into<String>, replacement: Replacement) -> Self {
        Self {
            find: find.into(),
            replacements: vec![replacement],
        }
    }

    pub fn and(mut self, replacement: Replacement) -> Self {
        self.replacements.push(replacement);
        self
    }
}

#[derive(Debug)]
pub struct PatchDescriptor {
    /// Cheap substring pre-filter.
    pub find: String,
    pub replacement: Replacement,
    pub owner: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PatchId(u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    NoMatch,
    Failed,
}

#[derive(Clone, Debug)]
pub struct Retired {
    pub id: PatchId,
    pub descriptor: Rc<PatchDescriptor>,
    pub module: String,
    pub outcome: PatchOutcome,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    /// Keyed by id, so iteration is registration order.
    active: BTreeMap<PatchId, Rc<PatchDescriptor>>,
    retired: Vec<Retired>,
}

/// Shared handle to the process-wide patch table.
#[derive(Clone, Default)]
pub struct PatchRegistry {
    state: Rc<RefCell<RegistryState>>,
}

impl PatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, descriptor: PatchDescriptor) -> PatchId {
        let mut state = self.state.borrow_mut();
        let id = PatchId(state.next_id);
        state.next_id += 1;
        state.active.insert(id, Rc::new(descriptor));
        id
    }

    /// Register every replacement of `patch` as its own descriptor.
    pub fn register_patch(&self, owner: &str, patch: Patch) -> Vec<PatchId> {
        let Patch { find, replacements } = patch;
        replacements
            .into_iter()
            .map(|replacement| {
                self.register(PatchDescriptor {
                    find: find.clone(),
                    replacement,
                    owner: owner.to_string(),
                })
            })
            .collect()
    }

    /// Copy of the active set in registration order.
    pub fn snapshot(&self) -> Vec<(PatchId, Rc<PatchDescriptor>)> {
        self.state
            .borrow()
            .active
            .iter()
            .map(|(id, descriptor)| (*id, Rc::clone(descriptor)))
            .collect()
    }

    pub fn is_active(&self, id: PatchId) -> bool {
        self.state.borrow().active.contains_key(&id)
    }

    /// Remove a patch from the active set. Returns false if it was already gone.
    pub fn retire(&self, id: PatchId, module: &str, outcome: PatchOutcome) -> bool {
        let mut state = self.state.borrow_mut();
        let Some(descriptor) = state.active.remove(&id) else {
            return false;
        };
        state.retired.push(Retired {
            id,
            descriptor,
            module: module.to_string(),
            outcome,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.state.borrow().active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn retired(&self) -> Vec<Retired> {
        self.state.borrow().retired.clone()
    }

    /// Owners whose patches never found their target text.
    pub fn pending_owners(&self) -> Vec<String> {
        let mut owners: Vec<String> = Vec::new();
        for descriptor in self.state.borrow().active.values() {
            if !owners.contains(&descriptor.owner) {
                owners.push(descriptor.owner.clone());
            }
        }
        owners
    }
}
