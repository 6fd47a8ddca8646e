//! Lua script engine with sandboxing.
//!
//! Each installed module owns one [`ScriptEngine`]. Module code never runs
//! against the real Lua globals: it is loaded into a private environment
//! table holding a whitelist of pure libraries plus whatever host functions
//! are bound with [`ScriptEngine::bind`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use mlua::{Function, HookTriggers, IntoLua, IntoLuaMulti, Lua, Table, Value, VmState};

use crate::config::ModulesConfig;
use crate::{ModhostError, Result};

/// Instructions between two budget checks.
const HOOK_INTERVAL: u32 = 1000;

/// Globals removed from the VM itself.
const STRIPPED_GLOBALS: &[&str] = &[
    "os",
    "io",
    "load",
    "loadfile",
    "dofile",
    "require",
    "package",
    "debug",
    "collectgarbage",
    "coroutine",
];

/// Core functions copied into a module environment.
const SAFE_FUNCTIONS: &[&str] = &[
    "tostring",
    "tonumber",
    "type",
    "pairs",
    "ipairs",
    "next",
    "select",
    "error",
    "pcall",
    "xpcall",
    "assert",
    "rawget",
    "rawset",
    "rawlen",
    "rawequal",
    "setmetatable",
    "getmetatable",
];

/// Libraries copied into a module environment.
const SAFE_LIBRARIES: &[&str] = &["string", "math", "table", "utf8"];

/// Resource limits for script execution.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Maximum number of instructions per call (0 = unlimited).
    pub max_instructions: u64,
    /// Maximum memory in bytes (0 = unlimited).
    pub max_memory: usize,
    /// Maximum execution time per call in seconds (0 = unlimited).
    pub max_execution_seconds: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_instructions: 1_000_000,
            max_memory: 10 * 1024 * 1024, // 10MB
            max_execution_seconds: 30,
        }
    }
}

impl From<&ModulesConfig> for ResourceLimits {
    fn from(config: &ModulesConfig) -> Self {
        Self {
            max_instructions: config.max_instructions,
            max_memory: config.max_memory_mb * 1024 * 1024,
            max_execution_seconds: config.max_execution_seconds,
        }
    }
}

/// Per-call budget shared with the VM hook.
#[derive(Default)]
struct ExecutionBudget {
    instructions: AtomicU64,
    deadline: Mutex<Option<Instant>>,
}

impl ExecutionBudget {
    fn arm(&self, max_execution_seconds: u32) {
        self.instructions.store(0, Ordering::SeqCst);
        let deadline = (max_execution_seconds > 0)
            .then(|| Instant::now() + Duration::from_secs(u64::from(max_execution_seconds)));
        *self.deadline.lock().unwrap_or_else(|p| p.into_inner()) = deadline;
    }

    fn disarm(&self) {
        *self.deadline.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    fn check(&self, max_instructions: u64) -> mlua::Result<VmState> {
        let used = self
            .instructions
            .fetch_add(u64::from(HOOK_INTERVAL), Ordering::SeqCst)
            + u64::from(HOOK_INTERVAL);
        if max_instructions > 0 && used > max_instructions {
            return Err(mlua::Error::RuntimeError(
                "Script exceeded instruction limit".to_string(),
            ));
        }

        let deadline = *self.deadline.lock().unwrap_or_else(|p| p.into_inner());
        if deadline.is_some_and(|d| Instant::now() > d) {
            return Err(mlua::Error::RuntimeError(
                "Script exceeded time limit".to_string(),
            ));
        }

        Ok(VmState::Continue)
    }
}

/// Lua script execution engine with sandboxing.
pub struct ScriptEngine {
    lua: Lua,
    env: Table,
    budget: Arc<ExecutionBudget>,
    limits: ResourceLimits,
    /// Set once a call hit the memory limit.
    exhausted: AtomicBool,
}

impl ScriptEngine {
    /// Create a new ScriptEngine with default resource limits.
    pub fn new() -> Result<Self> {
        Self::with_limits(ResourceLimits::default())
    }

    /// Create a new ScriptEngine with custom resource limits.
    pub fn with_limits(limits: ResourceLimits) -> Result<Self> {
        let lua = Lua::new();

        Self::apply_sandbox(&lua)?;
        let env = Self::build_environment(&lua)
            .map_err(|e| ModhostError::ScriptFault(format!("Failed to build environment: {e}")))?;

        if limits.max_memory > 0 {
            lua.set_memory_limit(limits.max_memory).map_err(|e| {
                ModhostError::ScriptFault(format!("Failed to set memory limit: {e}"))
            })?;
        }

        let budget = Arc::new(ExecutionBudget::default());
        if limits.max_instructions > 0 || limits.max_execution_seconds > 0 {
            let hook_budget = Arc::clone(&budget);
            let max_instructions = limits.max_instructions;
            lua.set_hook(
                HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
                move |_lua, _debug| hook_budget.check(max_instructions),
            );
        }

        Ok(Self {
            lua,
            env,
            budget,
            limits,
            exhausted: AtomicBool::new(false),
        })
    }

    /// Remove dangerous libraries from the VM globals.
    fn apply_sandbox(lua: &Lua) -> Result<()> {
        let globals = lua.globals();
        for name in STRIPPED_GLOBALS {
            globals.set(*name, Value::Nil).map_err(|e| {
                ModhostError::ScriptFault(format!("Failed to disable {name}: {e}"))
            })?;
        }
        Ok(())
    }

    /// Build the whitelist-only environment module code runs in.
    fn build_environment(lua: &Lua) -> mlua::Result<Table> {
        let env = lua.create_table()?;
        let globals = lua.globals();

        for name in SAFE_FUNCTIONS.iter().chain(SAFE_LIBRARIES) {
            let value = globals.get::<Value>(*name)?;
            if !value.is_nil() {
                env.set(*name, value)?;
            }
        }

        // Would hand out the bytecode of module functions
        let string: Table = env.get("string")?;
        string.set("dump", Value::Nil)?;

        Ok(env)
    }

    /// Expose a host value to module code under `name`.
    pub fn bind<V: IntoLua>(&self, name: &str, value: V) -> Result<()> {
        self.env
            .set(name, value)
            .map_err(|e| ModhostError::ScriptFault(format!("Failed to bind '{name}': {e}")))
    }

    /// Create a Lua function from a Rust closure.
    pub fn create_function<F, A, R>(&self, func: F) -> Result<Function>
    where
        F: Fn(&Lua, A) -> mlua::Result<R> + Send + 'static,
        A: mlua::FromLuaMulti,
        R: mlua::IntoLuaMulti,
    {
        self.lua
            .create_function(func)
            .map_err(|e| ModhostError::ScriptFault(format!("Failed to create function: {e}")))
    }

    /// Compile and run a chunk inside the module environment.
    ///
    /// Syntax errors and errors raised by top-level code are both reported
    /// as [`ModhostError::Compile`].
    pub fn load(&self, chunk_name: &str, source: &str) -> Result<()> {
        self.budget.arm(self.limits.max_execution_seconds);
        let result = self
            .lua
            .load(source)
            .set_name(format!("={chunk_name}"))
            .set_environment(self.env.clone())
            .exec();
        self.budget.disarm();

        result.map_err(|e| ModhostError::Compile(e.to_string()))
    }

    /// Look up a function defined by module code.
    pub fn function(&self, name: &str) -> Result<Option<Function>> {
        match self.env.get::<Value>(name) {
            Ok(Value::Function(function)) => Ok(Some(function)),
            Ok(_) => Ok(None),
            Err(e) => Err(ModhostError::ScriptFault(e.to_string())),
        }
    }

    /// Call a module function under the resource limits.
    ///
    /// A storage failure inside a host function is returned as
    /// [`ModhostError::Database`]; every other error is a script fault.
    pub fn call(&self, function: &Function, args: impl IntoLuaMulti) -> Result<Value> {
        self.budget.arm(self.limits.max_execution_seconds);
        let result = function.call::<Value>(args);
        self.budget.disarm();

        result.map_err(|e| self.classify(e))
    }

    fn classify(&self, error: mlua::Error) -> ModhostError {
        for cause in error.chain() {
            if let Some(ModhostError::Database(msg)) = cause.downcast_ref::<ModhostError>() {
                return ModhostError::Database(msg.clone());
            }
            if let Some(mlua::Error::MemoryError(_)) = cause.downcast_ref::<mlua::Error>() {
                self.exhausted.store(true, Ordering::SeqCst);
            }
        }
        ModhostError::ScriptFault(error.to_string())
    }

    /// Whether a call ran into the memory limit.
    ///
    /// Whatever the script left reachable still counts against the limit, so
    /// the VM should be replaced.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::SeqCst)
    }

    /// Convert a returned value into the string result of a command.
    ///
    /// `nil` yields `None`; numbers and booleans use their Lua string form.
    pub fn to_result_string(&self, value: Value) -> Result<Option<String>> {
        scalar_to_string(&self.lua, value).map_err(|e| {
            ModhostError::ScriptFault(format!("command returned {e}"))
        })
    }

    /// Get the resource limits.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// Get a reference to the underlying Lua instance.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }
}

/// Render a scalar Lua value as text.
///
/// Tables, functions and other reference types are rejected with a short
/// description of what was found.
pub(crate) fn scalar_to_string(
    lua: &Lua,
    value: Value,
) -> std::result::Result<Option<String>, String> {
    match value {
        Value::Nil => Ok(None),
        Value::Boolean(b) => Ok(Some(b.to_string())),
        Value::Integer(i) => Ok(Some(i.to_string())),
        Value::String(s) => Ok(Some(s.to_string_lossy().into())),
        number @ Value::Number(_) => lua
            .coerce_string(number)
            .map(|s| s.map(|s| s.to_string_lossy().into()))
            .map_err(|e| e.to_string()),
        other => Err(format!(
            "a {} (expected a string, number, boolean or nil)",
            other.type_name()
        )),
    }
}
