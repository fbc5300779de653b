//! Turning (patched) module source back into a callable factory.
//!
//! Modules are Rhai scripts. A module's source must define `fn factory()`;
//! the module object is bound to `this`:
//!
//! ```text
//! fn factory() {
//!     let store = require("12");
//!     this.exports.count = store.count + 1;
//! }
//! ```
//!
//! `require(id)` is a global native function that resolves through the
//! runtime currently executing the module.

use crate::error::{CompileError, ModuleError};
use crate::module::{Factory, Module, ModuleFn, ModuleId, RequireHandle};
use rhai::{CallFnOptions, Dynamic, Engine, EvalAltResult, ImmutableString, Map, Scope, AST, INT};
use std::cell::RefCell;
use std::rc::Rc;

/// Name of the entry function every module script defines.
pub const FACTORY_FN: &str = "factory";

pub trait Compiler {
    fn compile(&self, id: &ModuleId, source: &str) -> Result<Factory, CompileError>;
}

/// Runtimes whose modules are executing, innermost last.
type RequireStack = Rc<RefCell<Vec<RequireHandle>>>;

/// Compiles module scripts with one shared Rhai engine.
pub struct ScriptCompiler {
    engine: Rc<Engine>,
    requires: RequireStack,
}

impl ScriptCompiler {
    pub fn new() -> Self {
        Self::with_engine(|_| {})
    }

    /// Build the compiler, letting the caller register extra native
    /// functions on the engine first.
    pub fn with_engine(setup: impl FnOnce(&mut Engine)) -> Self {
        let requires: RequireStack = Rc::default();
        let mut engine = Engine::new();

        let stack = Rc::clone(&requires);
        engine.register_fn(
            "require",
            move |id: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
                resolve(&stack, ModuleId::from(id.as_str()))
            },
        );
        let stack = Rc::clone(&requires);
        engine.register_fn(
            "require",
            move |id: INT| -> Result<Dynamic, Box<EvalAltResult>> {
                resolve(&stack, ModuleId::from(id.to_string()))
            },
        );

        setup(&mut engine);

        Self {
            engine: Rc::new(engine),
            requires,
        }
    }
}

impl Default for ScriptCompiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler for ScriptCompiler {
    fn compile(&self, id: &ModuleId, source: &str) -> Result<Factory, CompileError> {
        let ast = self.engine.compile(source).map_err(|e| CompileError::Syntax {
            id: id.clone(),
            message: e.to_string(),
        })?;

        if !ast.iter_functions().any(|f| f.name == FACTORY_FN) {
            return Err(CompileError::MissingEntry {
                id: id.clone(),
                entry: FACTORY_FN,
            });
        }

        let script = ScriptModule {
            engine: Rc::clone(&self.engine),
            ast,
            requires: Rc::clone(&self.requires),
        };
        Ok(Factory::new(source, script))
    }
}

fn resolve(stack: &RequireStack, id: ModuleId) -> Result<Dynamic, Box<EvalAltResult>> {
    let handle = stack
        .borrow()
        .last()
        .cloned()
        .ok_or_else(|| format!("require({id}) called outside of a module factory"))?;
    handle.require(&id).map_err(|e| e.to_string().into())
}

struct ScriptModule {
    engine: Rc<Engine>,
    ast: AST,
    requires: RequireStack,
}

/// Keeps `require` pointed at the calling runtime for the duration of one
/// factory call.
struct RequireFrame<'a>(&'a RequireStack);

impl<'a> RequireFrame<'a> {
    fn enter(stack: &'a RequireStack, handle: RequireHandle) -> Self {
        stack.borrow_mut().push(handle);
        Self(stack)
    }
}

impl Drop for RequireFrame<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().pop();
    }
}

impl ModuleFn for ScriptModule {
    fn call(&self, module: &mut Module, require: &RequireHandle) -> Result<(), ModuleError> {
        let mut object = Map::new();
        object.insert("id".into(), Dynamic::from(module.id.to_string()));
        object.insert("exports".into(), module.exports.clone());
        let mut this = Dynamic::from_map(object);

        let _frame = RequireFrame::enter(&self.requires, require.clone());
        let options = CallFnOptions::new().eval_ast(false).bind_this_ptr(&mut this);
        self.engine
            .call_fn_with_options::<Dynamic>(options, &mut Scope::new(), &self.ast, FACTORY_FN, ())
            .map_err(|e| ModuleError::Failed {
                id: module.id.clone(),
                message: e.to_string(),
            })?;

        if let Some(exports) = this.try_cast::<Map>().and_then(|mut m| m.remove("exports")) {
            module.exports = exports;
        }
        Ok(())
    }
}
