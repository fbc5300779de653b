use splice_core::{
    Chunk, Compiler, Engine, EngineConfig, Factory, FrameContext, HostRuntime, LoaderHandle,
    Matcher, ModuleId, Patch, PushFn, Replacement, ScriptCompiler,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

const GLOBAL: &str = "webpackChunkapp";

const SEND_MESSAGE: &str = r#"
fn sendMessage(a,b){
    a + b
}

fn factory() {
    this.exports.sent = sendMessage(1, 2);
}
"#;

fn config() -> EngineConfig {
    EngineConfig {
        chunk_global: GLOBAL.to_string(),
        ..EngineConfig::default()
    }
}

fn compile(compiler: &ScriptCompiler, id: &str, source: &str) -> Factory {
    compiler.compile(&id.into(), source).unwrap()
}

/// Compiler with a `SIDE_EFFECT()` native that counts its calls.
fn counting_compiler() -> (Rc<ScriptCompiler>, Rc<Cell<u32>>) {
    let calls = Rc::new(Cell::new(0));
    let c = Rc::clone(&calls);
    let compiler = ScriptCompiler::with_engine(move |engine| {
        engine.register_fn("SIDE_EFFECT", move || c.set(c.get() + 1));
    });
    (Rc::new(compiler), calls)
}

#[test]
fn test_side_effect_patch_applies_once() {
    splice_core::init_logging();
    let (compiler, calls) = counting_compiler();
    let engine = Engine::new(config(), compiler.clone());
    engine.register_patch(
        "MessageHooks",
        Patch::new(
            "fn sendMessage",
            Replacement::template(Matcher::new(r"\)\{").unwrap(), "){SIDE_EFFECT();"),
        ),
    );

    let context = FrameContext::new();
    let interceptor = engine.install(&context);
    let runtime = HostRuntime::new();
    let loader = runtime.attach(&context, GLOBAL).unwrap();
    assert!(interceptor.is_instrumented());

    loader
        .push(Chunk::new(["a"]).with_module("1", compile(&compiler, "1", SEND_MESSAGE)))
        .unwrap();
    runtime.require(&"1".into()).unwrap();

    assert_eq!(calls.get(), 1, "patched body ran SIDE_EFFECT()");
    let installed = runtime.factory(&"1".into()).unwrap();
    assert!(installed.source().contains("fn sendMessage(a,b){SIDE_EFFECT();"));
    assert!(engine.registry().is_empty(), "patch consumed");

    // Same text in a later chunk is left alone.
    loader
        .push(Chunk::new(["b"]).with_module("2", compile(&compiler, "2", SEND_MESSAGE)))
        .unwrap();
    runtime.require(&"2".into()).unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(runtime.factory(&"2".into()).unwrap().source(), SEND_MESSAGE);
}

#[test]
fn test_forwarded_module_ids_match_received() {
    let compiler = Rc::new(ScriptCompiler::new());
    let engine = Engine::new(config(), compiler.clone());
    engine.register_patch(
        "Anything",
        Patch::new("exports", Replacement::template(Matcher::new("= 1").unwrap(), "= 2")),
    );

    let forwarded: Rc<RefCell<Vec<Vec<ModuleId>>>> = Rc::default();
    let seen = Rc::clone(&forwarded);
    let loader = LoaderHandle::with_push(PushFn::chunk_callback(move |chunk| {
        seen.borrow_mut().push(chunk.module_ids());
        Ok(seen.borrow().len())
    }));

    let context = FrameContext::new();
    engine.install(&context);
    context.assign(GLOBAL, loader.clone());

    let chunk = Chunk::new(["c"])
        .with_module("9", compile(&compiler, "9", "fn factory() { this.exports.v = 1; }"))
        .with_module("1", compile(&compiler, "1", "fn factory() { this.exports.v = 1; }"))
        .with_module("5", compile(&compiler, "5", "fn factory() {}"));
    let received = chunk.module_ids();
    loader.push(chunk).unwrap();

    assert_eq!(forwarded.borrow().as_slice(), [received]);
}

#[test]
fn test_chunks_queued_before_loader_are_patched() {
    let compiler = Rc::new(ScriptCompiler::new());
    let engine = Engine::new(config(), compiler.clone());
    engine.register_patch(
        "Early",
        Patch::new("exports.v", Replacement::template(Matcher::new("= 1").unwrap(), "= 10")),
    );

    let context = FrameContext::new();
    engine.install(&context);

    // Host publishes a plain array first and queues a chunk on it.
    let early = LoaderHandle::new();
    context.assign(GLOBAL, early.clone());
    early
        .push(
            Chunk::new(["early"])
                .with_module("1", compile(&compiler, "1", "fn factory() { this.exports.v = 1; }"))
                .with_entry("1"),
        )
        .unwrap();

    let runtime = HostRuntime::new();
    runtime.attach(&context, GLOBAL).unwrap();

    let exports = runtime.require(&"1".into()).unwrap();
    let v = exports.read_lock::<rhai::Map>().unwrap()["v"].as_int().unwrap();
    assert_eq!(v, 10);
}

#[test]
fn test_unrecognised_loader_still_loads() {
    let compiler = Rc::new(ScriptCompiler::new());
    let engine = Engine::new(config(), compiler.clone());
    engine.register_patch(
        "Never",
        Patch::new("exports", Replacement::template(Matcher::new("= 1").unwrap(), "= 2")),
    );

    let context = FrameContext::new();
    let interceptor = engine.install(&context);

    let runtime = HostRuntime::new();
    let installs = runtime.clone();
    let loader = LoaderHandle::with_push(PushFn::custom("function (e) { install(e) }", move |chunk| {
        installs.install_chunk(chunk)?;
        Ok(1)
    }));
    context.assign(GLOBAL, loader.clone());
    assert!(!interceptor.is_instrumented());

    loader
        .push(Chunk::new(["x"]).with_module("1", compile(&compiler, "1", "fn factory() { this.exports.v = 1; }")))
        .unwrap();
    runtime.require(&"1".into()).unwrap();

    assert_eq!(engine.registry().len(), 1, "patch layer silently disabled");
    assert_eq!(engine.report(), ["Never"]);
}
