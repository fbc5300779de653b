//! Chunk loader interception.
//!
//! The host exposes its chunk loader as a named property of a frame-scoped
//! global object. The interceptor defines that property as an accessor,
//! classifies every value assigned to it, and on the real bundler loader
//! swaps `push` for its own handler while keeping the original.

use crate::chunk::Chunk;
use crate::error::ModuleError;
use crate::patcher::ModulePatcher;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// What `push.toString()` yields for `Array.prototype.push`.
pub const NATIVE_PUSH_SOURCE: &str = "function push() { [native code] }";
/// What it yields for the bundler's bound chunk callback.
pub const BOUND_PUSH_SOURCE: &str = "function () { [native code] }";
const HOOKED_PUSH_SOURCE: &str = "function handlePush(chunk) { [interceptor] }";

/// Result of a push: the loader's queue length, as `Array.prototype.push`.
pub type PushResult = Result<usize, ModuleError>;

type PushCall = Rc<dyn Fn(Chunk) -> PushResult>;
type PushHook = Rc<dyn Fn(&LoaderHandle, Chunk) -> PushResult>;

/// A value that can sit in the loader's `push` slot.
#[derive(Clone)]
pub enum PushFn {
    /// The array's own push: queues the chunk on the loader.
    Native,
    Custom {
        source: Rc<str>,
        /// Declared by the host as its chunk-loading callback.
        chunk_callback: bool,
        call: PushCall,
    },
}

impl PushFn {
    pub fn custom<F>(source: &str, call: F) -> Self
    where
        F: Fn(Chunk) -> PushResult + 'static,
    {
        PushFn::Custom {
            source: source.into(),
            chunk_callback: false,
            call: Rc::new(call),
        }
    }

    /// The bundler's bound chunk callback.
    pub fn chunk_callback<F>(call: F) -> Self
    where
        F: Fn(Chunk) -> PushResult + 'static,
    {
        PushFn::Custom {
            source: BOUND_PUSH_SOURCE.into(),
            chunk_callback: true,
            call: Rc::new(call),
        }
    }

    pub fn source(&self) -> &str {
        match self {
            PushFn::Native => NATIVE_PUSH_SOURCE,
            PushFn::Custom { source, .. } => source,
        }
    }

    pub fn is_chunk_callback(&self) -> bool {
        matches!(self, PushFn::Custom { chunk_callback: true, .. })
    }
}

impl fmt::Debug for PushFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.source())
    }
}

enum PushSlot {
    Plain(PushFn),
    Hooked { hook: PushHook, original: PushFn },
}

struct LoaderState {
    queued: Vec<Chunk>,
    push: PushSlot,
}

/// The host's array-like chunk loader, shared between host and interceptor.
#[derive(Clone)]
pub struct LoaderHandle(Rc<RefCell<LoaderState>>);

impl LoaderHandle {
    /// A plain array: push queues chunks.
    pub fn new() -> Self {
        Self::with_push(PushFn::Native)
    }

    pub fn with_push(push: PushFn) -> Self {
        Self(Rc::new(RefCell::new(LoaderState {
            queued: Vec::new(),
            push: PushSlot::Plain(push),
        })))
    }

    pub fn push(&self, chunk: Chunk) -> PushResult {
        let hook = match &self.0.borrow().push {
            PushSlot::Plain(push) => Err(push.clone()),
            PushSlot::Hooked { hook, .. } => Ok(Rc::clone(hook)),
        };
        match hook {
            Ok(hook) => hook(self, chunk),
            Err(push) => self.invoke(&push, chunk),
        }
    }

    /// Push through whatever the host installed, bypassing any hook.
    pub fn push_original(&self, chunk: Chunk) -> PushResult {
        let push = match &self.0.borrow().push {
            PushSlot::Plain(push) => push.clone(),
            PushSlot::Hooked { original, .. } => original.clone(),
        };
        self.invoke(&push, chunk)
    }

    fn invoke(&self, push: &PushFn, chunk: Chunk) -> PushResult {
        match push {
            PushFn::Native => {
                let mut state = self.0.borrow_mut();
                state.queued.push(chunk);
                Ok(state.queued.len())
            }
            PushFn::Custom { call, .. } => call(chunk),
        }
    }

    /// Host assignment to `push`. Once hooked, the assignment replaces the
    /// kept original and the hook stays in front of it.
    pub fn set_push(&self, push: PushFn) {
        match &mut self.0.borrow_mut().push {
            PushSlot::Plain(slot) => *slot = push,
            PushSlot::Hooked { original, .. } => *original = push,
        }
    }

    /// The stringified form of the current `push`.
    pub fn push_source(&self) -> String {
        match &self.0.borrow().push {
            PushSlot::Plain(push) => push.source().to_string(),
            PushSlot::Hooked { .. } => HOOKED_PUSH_SOURCE.to_string(),
        }
    }

    pub fn push_fn(&self) -> Option<PushFn> {
        match &self.0.borrow().push {
            PushSlot::Plain(push) => Some(push.clone()),
            PushSlot::Hooked { .. } => None,
        }
    }

    pub fn has_native_push(&self) -> bool {
        matches!(self.push_fn(), Some(PushFn::Native))
    }

    pub fn is_hooked(&self) -> bool {
        matches!(self.0.borrow().push, PushSlot::Hooked { .. })
    }

    fn hook(&self, hook: PushHook) -> bool {
        let mut state = self.0.borrow_mut();
        let original = match &state.push {
            PushSlot::Plain(push) => push.clone(),
            PushSlot::Hooked { .. } => return false,
        };
        state.push = PushSlot::Hooked { hook, original };
        true
    }

    /// Chunks pushed before the host's runtime took over.
    pub fn take_queued(&self) -> Vec<Chunk> {
        std::mem::take(&mut self.0.borrow_mut().queued)
    }

    pub fn queued_len(&self) -> usize {
        self.0.borrow().queued.len()
    }

    fn for_each_queued(&self, mut f: impl FnMut(&mut Chunk)) {
        // Taken out so `f` may touch the loader.
        let mut queued = self.take_queued();
        queued.iter_mut().for_each(&mut f);
        let mut state = self.0.borrow_mut();
        queued.append(&mut state.queued);
        state.queued = queued;
    }

    pub fn ptr_eq(&self, other: &LoaderHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for LoaderHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LoaderHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoaderHandle")
            .field("push", &self.push_source())
            .field("queued", &self.queued_len())
            .finish()
    }
}

/// Getter/setter pair for an accessor property.
pub trait PropertyAccessor {
    fn get(&self) -> Option<LoaderHandle>;
    fn set(&self, context: &FrameContext, value: LoaderHandle);
}

#[derive(Clone)]
enum Property {
    Value(LoaderHandle),
    Accessor(Rc<dyn PropertyAccessor>),
}

/// The frame-scoped global object the host publishes its loader on.
#[derive(Clone, Default)]
pub struct FrameContext(Rc<RefCell<HashMap<String, Property>>>);

impl FrameContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<LoaderHandle> {
        let property = self.0.borrow().get(name).cloned();
        match property? {
            Property::Value(value) => Some(value),
            Property::Accessor(accessor) => accessor.get(),
        }
    }

    /// `context[name] = value`, honouring an accessor if one is defined.
    pub fn assign(&self, name: &str, value: LoaderHandle) {
        let accessor = match self.0.borrow().get(name) {
            Some(Property::Accessor(accessor)) => Some(Rc::clone(accessor)),
            _ => None,
        };
        match accessor {
            Some(accessor) => accessor.set(self, value),
            None => {
                self.0
                    .borrow_mut()
                    .insert(name.to_string(), Property::Value(value));
            }
        }
    }

    pub fn define_accessor(&self, name: &str, accessor: Rc<dyn PropertyAccessor>) {
        self.0
            .borrow_mut()
            .insert(name.to_string(), Property::Accessor(accessor));
    }

    pub fn delete(&self, name: &str) -> bool {
        self.0.borrow_mut().remove(name).is_some()
    }

    pub fn is_accessor(&self, name: &str) -> bool {
        matches!(self.0.borrow().get(name), Some(Property::Accessor(_)))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoaderKind {
    /// The bundler's incremental chunk loader.
    Bundler,
    /// A plain array with the native push.
    Native,
    Unknown,
}

/// Best-effort check for "is this the real loader". Probes are versioned
/// against the host's runtime naming; a bump means the detection changed.
pub trait LoaderProbe {
    fn name(&self) -> &'static str;
    fn version(&self) -> u32;
    fn classify(&self, loader: &LoaderHandle) -> LoaderKind;
}

/// Looks at the stringified `push`: the native one names itself, the
/// bundler's bound callback does not.
pub struct SignatureProbe;

impl LoaderProbe for SignatureProbe {
    fn name(&self) -> &'static str {
        "signature"
    }

    fn version(&self) -> u32 {
        1
    }

    fn classify(&self, loader: &LoaderHandle) -> LoaderKind {
        let source = loader.push_source();
        if source.contains("push") {
            LoaderKind::Native
        } else if source.contains("[native code]") {
            LoaderKind::Bundler
        } else {
            LoaderKind::Unknown
        }
    }
}

/// Trusts the host's own declaration that `push` is its chunk callback.
pub struct CallbackCapabilityProbe;

impl LoaderProbe for CallbackCapabilityProbe {
    fn name(&self) -> &'static str {
        "chunk-callback"
    }

    fn version(&self) -> u32 {
        1
    }

    fn classify(&self, loader: &LoaderHandle) -> LoaderKind {
        match loader.push_fn() {
            Some(push) if push.is_chunk_callback() => LoaderKind::Bundler,
            _ => LoaderKind::Unknown,
        }
    }
}

pub fn default_probes() -> Vec<Box<dyn LoaderProbe>> {
    vec![Box::new(SignatureProbe), Box::new(CallbackCapabilityProbe)]
}

struct InterceptorState {
    global: String,
    patcher: ModulePatcher,
    probes: Vec<Box<dyn LoaderProbe>>,
    current: RefCell<Option<LoaderHandle>>,
    instrumented: Cell<bool>,
    miss_logged: Cell<bool>,
}

/// Becomes the entry point for every chunk the host loads.
#[derive(Clone)]
pub struct ChunkInterceptor(Rc<InterceptorState>);

impl ChunkInterceptor {
    pub fn new(global: &str, patcher: ModulePatcher) -> Self {
        Self::with_probes(global, patcher, default_probes())
    }

    pub fn with_probes(
        global: &str,
        patcher: ModulePatcher,
        probes: Vec<Box<dyn LoaderProbe>>,
    ) -> Self {
        Self(Rc::new(InterceptorState {
            global: global.to_string(),
            patcher,
            probes,
            current: RefCell::new(None),
            instrumented: Cell::new(false),
            miss_logged: Cell::new(false),
        }))
    }

    /// Start observing assignments to the loader global. A value already
    /// present is classified right away.
    pub fn install(&self, context: &FrameContext) {
        let existing = context.get(&self.0.global);
        context.define_accessor(&self.0.global, Rc::new(self.clone()));
        tracing::debug!(global = %self.0.global, "watching loader global");
        if let Some(existing) = existing {
            context.assign(&self.0.global, existing);
        }
    }

    pub fn is_instrumented(&self) -> bool {
        self.0.instrumented.get()
    }

    pub fn global(&self) -> &str {
        &self.0.global
    }

    /// Every probe gets a say; a `Bundler` verdict from any of them wins
    /// over `Native`, since hosts may rename their callback.
    fn classify(&self, loader: &LoaderHandle) -> LoaderKind {
        let mut verdict = LoaderKind::Unknown;
        for (rank, probe) in self.0.probes.iter().enumerate() {
            match probe.classify(loader) {
                LoaderKind::Bundler => {
                    if rank > 0 {
                        tracing::info!(
                            condition = "loader_probe_fallback",
                            probe = probe.name(),
                            version = probe.version(),
                            "loader recognised by fallback probe"
                        );
                    }
                    return LoaderKind::Bundler;
                }
                LoaderKind::Native => verdict = LoaderKind::Native,
                LoaderKind::Unknown => {}
            }
        }
        verdict
    }

    fn instrument(&self, context: &FrameContext, loader: &LoaderHandle) {
        let patcher = self.0.patcher.clone();
        let hooked = loader.hook(Rc::new(move |loader: &LoaderHandle, chunk: Chunk| {
            handle_push(&patcher, loader, chunk)
        }));
        if !hooked {
            return;
        }

        let patcher = &self.0.patcher;
        loader.for_each_queued(|chunk| patcher.patch_chunk(chunk));

        self.0.instrumented.set(true);
        // From here on the global is a plain value again.
        context.delete(&self.0.global);
        context.assign(&self.0.global, loader.clone());
        tracing::info!(global = %self.0.global, "chunk loader instrumented");
    }
}

impl PropertyAccessor for ChunkInterceptor {
    fn get(&self) -> Option<LoaderHandle> {
        self.0.current.borrow().clone()
    }

    fn set(&self, context: &FrameContext, value: LoaderHandle) {
        *self.0.current.borrow_mut() = Some(value.clone());
        match self.classify(&value) {
            LoaderKind::Bundler => self.instrument(context, &value),
            LoaderKind::Native if value.has_native_push() => {
                tracing::debug!(global = %self.0.global, "native array assigned, waiting for loader");
            }
            LoaderKind::Native | LoaderKind::Unknown => {
                if !self.0.miss_logged.replace(true) {
                    tracing::warn!(
                        global = %self.0.global,
                        push = %value.push_source(),
                        "no probe recognised the loader; patches will not apply"
                    );
                }
            }
        }
    }
}

fn handle_push(patcher: &ModulePatcher, loader: &LoaderHandle, mut chunk: Chunk) -> PushResult {
    let received = chunk.modules.len();
    patcher.patch_chunk(&mut chunk);
    debug_assert_eq!(received, chunk.modules.len());
    tracing::trace!(chunk = %chunk.label(), modules = received, "forwarding chunk");
    loader.push_original(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ScriptCompiler;
    use crate::registry::PatchRegistry;
    use crate::subscription::SubscriptionTable;
    use std::io;
    use std::sync::{Arc, Mutex};

    const GLOBAL: &str = "webpackChunkapp";
    const MISS: &str = "no probe recognised the loader";

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` under a subscriber that records formatted events.
    fn capture_logs(f: impl FnOnce()) -> String {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buffer.0.lock().unwrap().clone();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn interceptor() -> ChunkInterceptor {
        let patcher = ModulePatcher::new(
            PatchRegistry::new(),
            SubscriptionTable::new(),
            Rc::new(ScriptCompiler::new()),
        );
        ChunkInterceptor::new(GLOBAL, patcher)
    }

    #[test]
    fn test_native_array_is_left_alone() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let array = LoaderHandle::new();
        context.assign(GLOBAL, array.clone());

        assert!(!interceptor.is_instrumented());
        assert!(!array.is_hooked());
        assert!(context.is_accessor(GLOBAL));
        assert!(context.get(GLOBAL).unwrap().ptr_eq(&array));
    }

    #[test]
    fn test_bundler_loader_is_hooked_and_property_redefined() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let loader = LoaderHandle::with_push(PushFn::chunk_callback(|_| Ok(0)));
        context.assign(GLOBAL, loader.clone());

        assert!(interceptor.is_instrumented());
        assert!(loader.is_hooked());
        assert!(!context.is_accessor(GLOBAL));
        assert!(context.get(GLOBAL).unwrap().ptr_eq(&loader));
    }

    #[test]
    fn test_fallback_probe_recognises_renamed_callback() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let renamed = PushFn::Custom {
            source: "function jsonpCallback(e) { ... }".into(),
            chunk_callback: true,
            call: Rc::new(|_: Chunk| -> PushResult { Ok(0) }),
        };
        context.assign(GLOBAL, LoaderHandle::with_push(renamed));
        assert!(interceptor.is_instrumented());
    }

    #[test]
    fn test_callback_named_push_is_still_recognised() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let renamed = PushFn::Custom {
            source: "function pushChunk(e) { ... }".into(),
            chunk_callback: true,
            call: Rc::new(|_: Chunk| -> PushResult { Ok(0) }),
        };
        let loader = LoaderHandle::with_push(renamed);
        let logs = capture_logs(|| context.assign(GLOBAL, loader.clone()));

        assert!(interceptor.is_instrumented());
        assert!(loader.is_hooked());
        assert!(logs.contains("loader_probe_fallback"));
    }

    #[test]
    fn test_unknown_loader_is_not_instrumented() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let loader = LoaderHandle::with_push(PushFn::custom("function (e) { polyfill(e) }", |_| Ok(0)));
        let logs = capture_logs(|| {
            context.assign(GLOBAL, loader.clone());
            context.assign(GLOBAL, loader.clone());
        });

        assert!(!interceptor.is_instrumented());
        assert_eq!(loader.push(Chunk::default()).unwrap(), 0);
        assert_eq!(logs.matches(MISS).count(), 1, "miss is reported once: {logs}");
    }

    #[test]
    fn test_custom_push_named_push_is_a_miss() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let loader = LoaderHandle::with_push(PushFn::custom("function pushPolyfill(e) { ... }", |_| Ok(0)));
        let logs = capture_logs(|| context.assign(GLOBAL, loader.clone()));

        assert!(!interceptor.is_instrumented());
        assert!(logs.contains(MISS));
    }

    #[test]
    fn test_native_array_is_not_a_miss() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let logs = capture_logs(|| context.assign(GLOBAL, LoaderHandle::new()));
        assert!(!logs.contains(MISS));
        assert!(logs.contains("native array assigned"));
    }

    #[test]
    fn test_push_assignment_after_hook_replaces_original() {
        let context = FrameContext::new();
        let interceptor = interceptor();
        interceptor.install(&context);

        let loader = LoaderHandle::with_push(PushFn::chunk_callback(|_| Ok(1)));
        context.assign(GLOBAL, loader.clone());
        loader.set_push(PushFn::chunk_callback(|_| Ok(2)));

        assert!(loader.is_hooked());
        assert_eq!(loader.push(Chunk::default()).unwrap(), 2);
    }

    #[test]
    fn test_install_over_existing_loader() {
        let context = FrameContext::new();
        let loader = LoaderHandle::with_push(PushFn::chunk_callback(|_| Ok(0)));
        context.assign(GLOBAL, loader.clone());

        let interceptor = interceptor();
        interceptor.install(&context);
        assert!(interceptor.is_instrumented());
        assert!(loader.is_hooked());
    }
}
