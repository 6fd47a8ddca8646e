//! Host functions exposed to module code.
//!
//! Every module sees exactly three host functions:
//!
//! - `getdata(key)` returns the stored string or `nil`
//! - `setdata(key, value)` stores a scalar, `nil` clears the value
//! - `sendmessage(receiver_uid, text)` appends to the message bus
//!
//! They only work while a command runs. Top-level module code, which runs
//! whenever the module is compiled, gets an error instead, so compiling a
//! module never touches its data or the message bus.
//!
//! Scripts run on a blocking thread; these functions reach the async
//! storage layer through the runtime handle captured at registration.

use std::sync::Arc;

use mlua::{Lua, Result as LuaResult, Value};
use tokio::runtime::Handle;

use super::data_repository::ModuleDataRepository;
use super::engine::{scalar_to_string, ScriptEngine};
use super::message_log::MessageLog;
use super::types::Requester;
use crate::db::DbPool;
use crate::Result;

/// Binds the host functions for one module.
pub struct HostApi {
    module: String,
    pool: DbPool,
    messages: Arc<MessageLog>,
    runtime: Handle,
}

impl HostApi {
    pub fn new(module: &str, pool: DbPool, messages: Arc<MessageLog>, runtime: Handle) -> Self {
        Self {
            module: module.to_string(),
            pool,
            messages,
            runtime,
        }
    }

    /// Register the host functions in the engine's module environment.
    pub fn register(&self, engine: &ScriptEngine) -> Result<()> {
        self.register_data_functions(engine)?;
        self.register_message_functions(engine)?;
        Ok(())
    }

    fn register_data_functions(&self, engine: &ScriptEngine) -> Result<()> {
        // getdata(key)
        let (module, pool, runtime) = (self.module.clone(), self.pool.clone(), self.runtime.clone());
        let getdata = engine.create_function(move |lua, key: String| {
            current_requester(lua, "getdata")?;
            runtime
                .block_on(ModuleDataRepository::new(&pool).get(&module, &key))
                .map_err(mlua::Error::external)
        })?;
        engine.bind("getdata", getdata)?;

        // setdata(key, value)
        let (module, pool, runtime) = (self.module.clone(), self.pool.clone(), self.runtime.clone());
        let setdata = engine.create_function(move |lua, (key, value): (String, Value)| {
            current_requester(lua, "setdata")?;
            let value = scalar_arg(lua, "setdata", value)?;
            runtime
                .block_on(ModuleDataRepository::new(&pool).set(&module, &key, value.as_deref()))
                .map_err(mlua::Error::external)
        })?;
        engine.bind("setdata", setdata)?;

        Ok(())
    }

    fn register_message_functions(&self, engine: &ScriptEngine) -> Result<()> {
        // sendmessage(receiver_uid, text)
        let (module, messages, runtime) = (
            self.module.clone(),
            Arc::clone(&self.messages),
            self.runtime.clone(),
        );
        let sendmessage = engine.create_function(move |lua, (receiver_uid, text): (i64, Value)| {
            let sender_uid = current_requester(lua, "sendmessage")?.user_id;
            let text = scalar_arg(lua, "sendmessage", text)?.ok_or_else(|| {
                mlua::Error::RuntimeError("sendmessage: text must not be nil".to_string())
            })?;
            runtime
                .block_on(messages.append(&module, sender_uid, receiver_uid, &text))
                .map(|_| ())
                .map_err(mlua::Error::external)
        })?;
        engine.bind("sendmessage", sendmessage)?;

        Ok(())
    }
}

/// Requester of the command currently running on this VM.
///
/// Fails when no command is running, which is the case for top-level code.
pub fn current_requester(lua: &Lua, function: &str) -> LuaResult<Requester> {
    lua.app_data_ref::<Requester>()
        .map(|requester| *requester)
        .ok_or_else(|| {
            mlua::Error::RuntimeError(format!(
                "{function}: only available while a command runs"
            ))
        })
}

fn scalar_arg(lua: &Lua, function: &str, value: Value) -> LuaResult<Option<String>> {
    scalar_to_string(lua, value)
        .map_err(|found| mlua::Error::RuntimeError(format!("{function}: got {found}")))
}
