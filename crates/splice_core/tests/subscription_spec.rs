use rhai::Map;
use splice_core::{
    filters, Chunk, Compiler, Engine, EngineConfig, Exports, FrameContext, HostRuntime,
    ScriptCompiler,
};
use std::cell::RefCell;
use std::rc::Rc;

const GLOBAL: &str = "webpackChunkapp";

fn foo_is_one(exports: &Exports) -> bool {
    filters::by_key("FOO", |v| v.as_int() == Ok(1))(exports)
}

struct Harness {
    engine: Engine,
    compiler: Rc<ScriptCompiler>,
    runtime: HostRuntime,
    context: FrameContext,
}

impl Harness {
    fn new() -> Self {
        let compiler = Rc::new(ScriptCompiler::new());
        let engine = Engine::new(
            EngineConfig {
                chunk_global: GLOBAL.to_string(),
                ..EngineConfig::default()
            },
            compiler.clone(),
        );
        let context = FrameContext::new();
        engine.install(&context);
        let runtime = HostRuntime::new();
        runtime.attach(&context, GLOBAL).unwrap();
        Self {
            engine,
            compiler,
            runtime,
            context,
        }
    }

    /// Deliver one single-module chunk through the hooked loader and run it.
    fn load(&self, id: &str, source: &str) -> Exports {
        let factory = self.compiler.compile(&id.into(), source).unwrap();
        let loader = self.context.get(GLOBAL).unwrap();
        loader
            .push(Chunk::new([id]).with_module(id, factory))
            .unwrap();
        self.runtime.require(&id.into()).unwrap()
    }
}

fn tag(exports: &Exports) -> String {
    exports.read_lock::<Map>().unwrap()["tag"].clone().into_string().unwrap()
}

#[test]
fn test_first_matching_module_fires_once() {
    let harness = Harness::new();
    let seen: Rc<RefCell<Vec<String>>> = Rc::default();
    let s = Rc::clone(&seen);
    harness.engine.subscribe(foo_is_one, move |exports| {
        s.borrow_mut().push(tag(exports));
        Ok(())
    });

    harness.load("a", r#"fn factory() { this.exports.FOO = 1; this.exports.tag = "A"; }"#);
    harness.load("b", r#"fn factory() { this.exports.FOO = 2; this.exports.tag = "B"; }"#);
    harness.load("c", r#"fn factory() { this.exports.FOO = 1; this.exports.tag = "C"; }"#);

    assert_eq!(*seen.borrow(), ["A"]);
    assert!(harness.engine.subscriptions().is_empty());
}

#[test]
fn test_default_export_is_offered() {
    let harness = Harness::new();
    let seen: Rc<RefCell<Vec<String>>> = Rc::default();
    let s = Rc::clone(&seen);
    harness.engine.subscribe(filters::by_props(&["render"]), move |exports| {
        s.borrow_mut().push(tag(exports));
        Ok(())
    });

    harness.load(
        "d",
        r#"fn factory() { this.exports.default = #{ render: 1, tag: "inner" }; }"#,
    );

    assert_eq!(*seen.borrow(), ["inner"]);
}

#[test]
fn test_wait_for_already_loaded_module() {
    let harness = Harness::new();
    harness.load("a", r#"fn factory() { this.exports.FOO = 1; this.exports.tag = "A"; }"#);

    let seen: Rc<RefCell<Vec<String>>> = Rc::default();
    let s = Rc::clone(&seen);
    let pending = harness.engine.wait_for(&harness.runtime, foo_is_one, move |exports| {
        s.borrow_mut().push(tag(exports));
        Ok(())
    });

    assert!(pending.is_none());
    assert_eq!(*seen.borrow(), ["A"]);
    assert!(harness.engine.subscriptions().is_empty());
}

#[test]
fn test_wait_for_later_module() {
    let harness = Harness::new();
    let seen: Rc<RefCell<Vec<String>>> = Rc::default();
    let s = Rc::clone(&seen);
    let pending = harness.engine.wait_for(&harness.runtime, foo_is_one, move |exports| {
        s.borrow_mut().push(tag(exports));
        Ok(())
    });
    let id = pending.unwrap();
    assert!(harness.engine.subscriptions().is_pending(id));

    harness.load("z", r#"fn factory() { this.exports.FOO = 1; this.exports.tag = "Z"; }"#);

    assert_eq!(*seen.borrow(), ["Z"]);
    assert!(!harness.engine.subscriptions().is_pending(id));
}

#[test]
fn test_unsubscribed_callback_never_runs() {
    let harness = Harness::new();
    let id = harness
        .engine
        .subscribe(foo_is_one, |_| anyhow::bail!("should not run"));
    assert!(harness.engine.subscriptions().unsubscribe(id));

    harness.load("a", r#"fn factory() { this.exports.FOO = 1; this.exports.tag = "A"; }"#);
    assert!(!harness.engine.subscriptions().unsubscribe(id));
}

#[test]
fn test_failing_callback_does_not_break_loading() {
    let harness = Harness::new();
    harness.engine.subscribe(foo_is_one, |_| anyhow::bail!("subscriber bug"));

    let exports = harness.load("a", r#"fn factory() { this.exports.FOO = 1; this.exports.tag = "A"; }"#);
    assert_eq!(tag(&exports), "A");
    assert!(harness.engine.subscriptions().is_empty());
}
