//! Lua interpreter instance.
//!
//! Each worker owns one `mlua::Lua` state, created on the worker thread. Input
//! code is compiled as an expression first (`return <code>`) and as a block if
//! that fails, so `2+2` evaluates to `4`. `print` is redirected to the worker's
//! output buffer. With a thread-aware runtime the script also sees a `thread`
//! table:
//!
//! | function                          | effect                                   |
//! |-----------------------------------|------------------------------------------|
//! | `thread.name()`                   | worker name                              |
//! | `thread.get(key)`                 | shared store lookup, `nil` when absent   |
//! | `thread.set(key, value)`          | shared store write, `nil` removes        |
//! | `thread.keys()`                   | shared store keys                        |
//! | `thread.flush()`                  | send pending output now                  |
//! | `thread.log(level, message)`      | log through the bridge                   |
//! | `thread.ref(module, label, value)`| keep `value` alive, returns its handle   |
//! | `thread.getRef(module, label)`    | value previously passed to `thread.ref`  |
//! | `thread.unref(module, label)`     | release it                               |

use std::cell::RefCell;
use std::rc::Rc;

use mlua::{
    DeserializeOptions, Function, HookTriggers, Lua, LuaSerdeExt, MultiValue, RegistryKey,
    SerializeOptions, Table, Value as LuaValue, VmState,
};
use serde_json::Value;

use crate::error::ThreadError;
use crate::instance::{Instance, RuntimeAccessor, WorkerContext};
use crate::logging::{self, LogLevel};
use crate::message::{Input, Outcome};
use crate::registry::RefTable;

const INTERRUPTED: &str = "execution interrupted by cancellation";

type SharedRefs = Rc<RefCell<RefTable<RegistryKey>>>;

fn to_lua_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

fn from_lua_options() -> DeserializeOptions {
    DeserializeOptions::new().deny_unsupported_types(false)
}

/// [`Instance`] backed by a Lua 5.4 state.
pub struct LuaInstance {
    accessor: RuntimeAccessor,
    init_script: Option<String>,
    interrupt_interval: u32,
    lua: Option<Lua>,
    refs: SharedRefs,
}

impl LuaInstance {
    pub fn new(accessor: RuntimeAccessor) -> Self {
        Self {
            accessor,
            init_script: None,
            interrupt_interval: 1000,
            lua: None,
            refs: Rc::new(RefCell::new(RefTable::new())),
        }
    }

    pub fn with_init_script(mut self, script: Option<String>) -> Self {
        self.init_script = script;
        self
    }

    pub fn with_interrupt_interval(mut self, interval: u32) -> Self {
        self.interrupt_interval = interval.max(1);
        self
    }

    /// Install the host bindings. The init script only runs on a fresh state,
    /// so a preserved state keeps whatever the script set up.
    fn prepare(&self, lua: &Lua, ctx: &WorkerContext, fresh: bool) -> mlua::Result<()> {
        install_print(lua, ctx)?;
        install_interrupt(lua, ctx, self.interrupt_interval);
        if let RuntimeAccessor::ThreadAware { .. } = self.accessor {
            let api = thread_api(lua, ctx, Rc::clone(&self.refs))?;
            lua.globals().set("thread", api)?;
        }
        if let (true, Some(script)) = (fresh, &self.init_script) {
            lua.load(script.as_str())
                .set_name(format!("={}:init", ctx.name()))
                .exec()?;
        }
        Ok(())
    }

    fn run(lua: &Lua, ctx: &WorkerContext, input: Input) -> mlua::Result<Vec<Value>> {
        let function = compile(lua, ctx.name(), &input.code)?;

        let mut args = Vec::with_capacity(input.args.len());
        for arg in &input.args {
            args.push(lua.to_value_with(arg, to_lua_options())?);
        }

        let results: MultiValue = function.call(MultiValue::from_vec(args))?;
        results
            .into_iter()
            .map(|value| lua.from_value_with(value, from_lua_options()))
            .collect()
    }
}

impl Instance for LuaInstance {
    fn start(&mut self, ctx: &WorkerContext) -> Result<(), ThreadError> {
        let (lua, fresh) = match self.lua.take() {
            Some(lua) => (lua, false),
            None => (Lua::new(), true),
        };
        self.prepare(&lua, ctx, fresh)
            .map_err(|e| ThreadError::InitializationFailure(e.to_string()))?;
        self.lua = Some(lua);
        Ok(())
    }

    fn execute(&mut self, ctx: &WorkerContext, input: Input) -> Outcome {
        let Some(lua) = &self.lua else {
            return Outcome::Unavailable("interpreter context not started".to_string());
        };

        match Self::run(lua, ctx, input) {
            Ok(values) => Outcome::Values(values),
            Err(e) if ctx.is_interrupted() => Outcome::Error(format!("{}: {}", INTERRUPTED, e)),
            Err(e) => Outcome::Error(e.to_string()),
        }
    }

    fn teardown(&mut self, ctx: &WorkerContext) {
        let Some(lua) = self.lua.take() else {
            return;
        };

        let on_close: mlua::Result<Option<Function>> = lua.globals().get("onClose");
        match on_close {
            Ok(Some(on_close)) => {
                let result: mlua::Result<()> = on_close.call(());
                if let Err(e) = result {
                    logging::error(ctx.name(), format_args!("onClose failed: {}", e));
                }
            }
            Ok(None) => {}
            Err(e) => logging::error(ctx.name(), format_args!("onClose is not a function: {}", e)),
        }

        self.refs.borrow_mut().clear();
        if let Err(e) = ctx.registry().clear() {
            logging::error(ctx.name(), format_args!("unable to clear references: {}", e));
        }
        logging::debug(ctx.name(), "interpreter context closed");
    }
}

fn compile(lua: &Lua, name: &str, code: &str) -> mlua::Result<Function> {
    let chunk_name = format!("={}", name);
    match lua
        .load(format!("return {}", code))
        .set_name(chunk_name.clone())
        .into_function()
    {
        Ok(function) => Ok(function),
        Err(_) => lua.load(code).set_name(chunk_name).into_function(),
    }
}

fn install_print(lua: &Lua, ctx: &WorkerContext) -> mlua::Result<()> {
    let ctx = ctx.clone();
    let print = lua.create_function(move |lua, args: MultiValue| {
        let tostring: Function = lua.globals().get("tostring")?;
        let mut line = String::new();
        for (i, value) in args.into_iter().enumerate() {
            if i > 0 {
                line.push('\t');
            }
            let text: String = tostring.call(value)?;
            line.push_str(&text);
        }
        line.push('\n');
        ctx.write_output(line.as_bytes());
        Ok(())
    })?;
    lua.globals().set("print", print)
}

fn install_interrupt(lua: &Lua, ctx: &WorkerContext, interval: u32) {
    let status = ctx.status().clone();
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(interval),
        move |_lua, _debug| {
            if status.is_interrupted() {
                Err(mlua::Error::RuntimeError(INTERRUPTED.to_string()))
            } else {
                Ok(VmState::Continue)
            }
        },
    );
}

fn thread_api(lua: &Lua, ctx: &WorkerContext, refs: SharedRefs) -> mlua::Result<Table> {
    let api = lua.create_table()?;
    let store = ctx
        .store()
        .cloned()
        .ok_or_else(|| mlua::Error::RuntimeError("thread-aware runtime without a store".into()))?;

    let name = ctx.name().to_string();
    api.set("name", lua.create_function(move |_, ()| Ok(name.clone()))?)?;

    let get_store = store.clone();
    api.set(
        "get",
        lua.create_function(move |lua, key: String| {
            match get_store.get(&key).map_err(mlua::Error::external)? {
                Some(value) => lua.to_value_with(&value, to_lua_options()),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let set_store = store.clone();
    api.set(
        "set",
        lua.create_function(move |lua, (key, value): (String, LuaValue)| {
            if value.is_nil() {
                set_store.remove(&key).map_err(mlua::Error::external)?;
            } else {
                let value: Value = lua.from_value_with(value, from_lua_options())?;
                set_store.set(key, value).map_err(mlua::Error::external)?;
            }
            Ok(true)
        })?,
    )?;

    let keys_store = store;
    api.set(
        "keys",
        lua.create_function(move |_, ()| keys_store.keys().map_err(mlua::Error::external))?,
    )?;

    let flush_ctx = ctx.clone();
    api.set(
        "flush",
        lua.create_function(move |_, ()| {
            flush_ctx.flush_output();
            Ok(())
        })?,
    )?;

    let log_ctx = ctx.clone();
    api.set(
        "log",
        lua.create_function(move |_, (level, message): (String, String)| {
            let level: LogLevel = level.parse().map_err(mlua::Error::external)?;
            logging::log(level, log_ctx.name(), message);
            Ok(())
        })?,
    )?;

    let ref_ctx = ctx.clone();
    let ref_refs = Rc::clone(&refs);
    api.set(
        "ref",
        lua.create_function(
            move |lua, (module, label, value): (String, String, LuaValue)| {
                let key = lua.create_registry_value(value)?;
                let handle = ref_refs.borrow_mut().insert(key);
                let previous = match ref_ctx.registry().set_ref(&label, &module, handle) {
                    Ok(previous) => previous,
                    Err(e) => {
                        if let Some(key) = ref_refs.borrow_mut().remove(handle) {
                            lua.remove_registry_value(key)?;
                        }
                        return Err(mlua::Error::external(e));
                    }
                };
                if let Some(old) = previous.and_then(|h| ref_refs.borrow_mut().remove(h)) {
                    lua.remove_registry_value(old)?;
                }
                Ok(handle)
            },
        )?,
    )?;

    let get_ctx = ctx.clone();
    let get_refs = Rc::clone(&refs);
    api.set(
        "getRef",
        lua.create_function(move |lua, (module, label): (String, String)| {
            let handle = match get_ctx.registry().get_ref(&label, &module) {
                Ok(handle) => handle,
                Err(ThreadError::ReferenceNotFound { .. }) => return Ok(LuaValue::Nil),
                Err(e) => return Err(mlua::Error::external(e)),
            };
            match get_refs.borrow().get(handle) {
                Some(key) => lua.registry_value::<LuaValue>(key),
                None => Ok(LuaValue::Nil),
            }
        })?,
    )?;

    let unref_ctx = ctx.clone();
    api.set(
        "unref",
        lua.create_function(move |lua, (module, label): (String, String)| {
            let removed = unref_ctx
                .registry()
                .remove_ref(&label, &module)
                .map_err(mlua::Error::external)?;
            let Some(handle) = removed else {
                return Ok(false);
            };
            if let Some(key) = refs.borrow_mut().remove(handle) {
                lua.remove_registry_value(key)?;
            }
            Ok(true)
        })?,
    )?;

    Ok(api)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::port::MessagePort;
    use crate::state::WorkerStatus;
    use crate::store::SharedStore;
    use serde_json::json;
    use std::sync::Arc;

    struct Harness {
        ctx: WorkerContext,
        port: MessagePort,
        store: Arc<SharedStore>,
        status: Arc<WorkerStatus>,
    }

    fn harness(name: &str) -> Harness {
        let (port, port_ref) = MessagePort::open();
        let store = Arc::new(SharedStore::new());
        let status = Arc::new(WorkerStatus::new(false, false));
        let ctx = WorkerContext::new(
            name.to_string(),
            port_ref,
            Arc::clone(&status),
            RuntimeAccessor::ThreadAware {
                store: Arc::clone(&store),
            },
        );
        Harness {
            ctx,
            port,
            store,
            status,
        }
    }

    fn started(h: &Harness) -> LuaInstance {
        let mut instance = LuaInstance::new(h.ctx.accessor().clone());
        instance.start(&h.ctx).unwrap();
        instance
    }

    #[test]
    fn test_expression_and_block() {
        let h = harness("lua-expr");
        let mut lua = started(&h);

        assert_eq!(
            lua.execute(&h.ctx, Input::new("2+2")),
            Outcome::Values(vec![json!(4)])
        );
        assert_eq!(
            lua.execute(&h.ctx, Input::new("local x = 3\nreturn x, 'three'")),
            Outcome::Values(vec![json!(3), json!("three")])
        );
        assert_eq!(
            lua.execute(&h.ctx, Input::new("y = 1")),
            Outcome::Values(vec![])
        );
    }

    #[test]
    fn test_arguments_are_varargs() {
        let h = harness("lua-args");
        let mut lua = started(&h);

        let outcome = lua.execute(
            &h.ctx,
            Input::with_args(
                "local a, b, c = ...\nreturn a + b, c == nil",
                vec![json!(40), json!(2), Value::Null],
            ),
        );
        assert_eq!(outcome, Outcome::Values(vec![json!(42), json!(true)]));
    }

    #[test]
    fn test_script_error_is_an_outcome() {
        let h = harness("lua-error");
        let mut lua = started(&h);

        match lua.execute(&h.ctx, Input::new("error('boom')")) {
            Outcome::Error(message) => assert!(message.contains("boom"), "{}", message),
            other => panic!("expected error, got {:?}", other),
        }
        // The context survives the error.
        assert_eq!(
            lua.execute(&h.ctx, Input::new("1")),
            Outcome::Values(vec![json!(1)])
        );
    }

    #[test]
    fn test_print_is_captured() {
        let mut h = harness("lua-print");
        let mut lua = started(&h);

        lua.execute(&h.ctx, Input::new("print('a', 1, nil, true)"));
        assert_eq!(h.ctx.pending_output(), "a\t1\tnil\ttrue\n".len());

        lua.execute(&h.ctx, Input::new("print('x') thread.flush()"));
        assert_eq!(
            h.port.try_recv().unwrap(),
            Some(Message::PrintFlush {
                output: b"a\t1\tnil\ttrue\nx\n".to_vec()
            })
        );
    }

    #[test]
    fn test_thread_api_store() {
        let h = harness("lua-store");
        let mut lua = started(&h);

        lua.execute(&h.ctx, Input::new("thread.set('k', {a = 1})"));
        assert_eq!(h.store.get("k").unwrap(), Some(json!({"a": 1})));

        h.store.set("n", json!(7)).unwrap();
        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread.get('n') * 2")),
            Outcome::Values(vec![json!(14)])
        );
        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread.get('missing') == nil")),
            Outcome::Values(vec![json!(true)])
        );

        lua.execute(&h.ctx, Input::new("thread.set('k', nil)"));
        assert_eq!(h.store.get("k").unwrap(), None);
        assert_eq!(
            lua.execute(&h.ctx, Input::new("#thread.keys()")),
            Outcome::Values(vec![json!(1)])
        );
        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread.name()")),
            Outcome::Values(vec![json!("lua-store")])
        );
    }

    #[test]
    fn test_refs() {
        let h = harness("lua-refs");
        let mut lua = started(&h);

        let outcome = lua.execute(&h.ctx, Input::new("thread.ref('mod', 'fn', function() return 5 end)"));
        let handle = match outcome {
            Outcome::Values(values) => values[0].as_i64().unwrap() as i32,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(h.ctx.registry().get_ref("fn", "mod").unwrap(), handle);

        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread.getRef('mod', 'fn')()")),
            Outcome::Values(vec![json!(5)])
        );
        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread.unref('mod', 'fn')")),
            Outcome::Values(vec![json!(true)])
        );
        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread.getRef('mod', 'fn') == nil")),
            Outcome::Values(vec![json!(true)])
        );
    }

    #[test]
    fn test_default_runtime_has_no_thread_api() {
        let h = harness("lua-default");
        let mut lua = LuaInstance::new(RuntimeAccessor::Default);
        lua.start(&h.ctx).unwrap();

        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread == nil")),
            Outcome::Values(vec![json!(true)])
        );
    }

    #[test]
    fn test_restart_preserves_or_resets() {
        let h = harness("lua-restart");
        let mut lua = started(&h);

        lua.execute(&h.ctx, Input::new("x = 42"));
        lua.restart(&h.ctx, false).unwrap();
        assert_eq!(
            lua.execute(&h.ctx, Input::new("x")),
            Outcome::Values(vec![json!(42)])
        );

        lua.restart(&h.ctx, true).unwrap();
        assert_eq!(
            lua.execute(&h.ctx, Input::new("x")),
            Outcome::Values(vec![Value::Null])
        );
    }

    #[test]
    fn test_init_script_only_runs_on_fresh_state() {
        let h = harness("lua-init-once");
        let mut lua = LuaInstance::new(h.ctx.accessor().clone())
            .with_init_script(Some("counter = 0".to_string()));
        lua.start(&h.ctx).unwrap();

        lua.execute(&h.ctx, Input::new("counter = counter + 5"));
        lua.restart(&h.ctx, false).unwrap();
        assert_eq!(
            lua.execute(&h.ctx, Input::new("counter")),
            Outcome::Values(vec![json!(5)])
        );
        // The preserved state still gets fresh bindings.
        assert_eq!(
            lua.execute(&h.ctx, Input::new("thread.name()")),
            Outcome::Values(vec![json!("lua-init-once")])
        );

        lua.restart(&h.ctx, true).unwrap();
        assert_eq!(
            lua.execute(&h.ctx, Input::new("counter")),
            Outcome::Values(vec![json!(0)])
        );
    }

    #[test]
    fn test_init_script_failure() {
        let h = harness("lua-init");
        let mut lua = LuaInstance::new(h.ctx.accessor().clone())
            .with_init_script(Some("error('no luck')".to_string()));

        match lua.start(&h.ctx) {
            Err(ThreadError::InitializationFailure(message)) => assert!(message.contains("no luck")),
            other => panic!("expected initialization failure, got {:?}", other),
        }
        assert!(matches!(
            lua.execute(&h.ctx, Input::new("1")),
            Outcome::Unavailable(_)
        ));
    }

    #[test]
    fn test_teardown_runs_on_close() {
        let h = harness("lua-close");
        let mut lua = started(&h);

        lua.execute(&h.ctx, Input::new("function onClose() thread.set('closed', true) end"));
        lua.teardown(&h.ctx);
        assert_eq!(h.store.get("closed").unwrap(), Some(json!(true)));
    }

    #[test]
    fn test_interrupt_stops_running_code() {
        let h = harness("lua-interrupt");
        let mut lua = LuaInstance::new(h.ctx.accessor().clone()).with_interrupt_interval(10);
        lua.start(&h.ctx).unwrap();

        h.status.request_cancel(false);
        match lua.execute(&h.ctx, Input::new("while true do end")) {
            Outcome::Error(message) => assert!(message.contains("interrupted"), "{}", message),
            other => panic!("expected interruption, got {:?}", other),
        }
    }
}
