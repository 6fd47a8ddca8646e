//! Installed modules, persisted and compiled.
//!
//! The store keeps one [`CompiledModule`] per name. Installing replaces the
//! entry atomically: callers holding the old handle finish on the old code,
//! every later lookup sees the new one. A module whose code does not compile
//! never replaces anything.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use super::api::HostApi;
use super::engine::{ResourceLimits, ScriptEngine};
use super::message_log::MessageLog;
use super::repository::ModuleRepository;
use super::types::{validate_module_name, LoadReport, Requester};
use crate::db::DbPool;
use crate::{ModhostError, Result};

/// Prefix of the Lua functions a module exposes as commands.
pub const COMMAND_PREFIX: &str = "command_";

/// A module whose code has been loaded into its own sandboxed VM.
pub struct CompiledModule {
    name: String,
    code: String,
    limits: ResourceLimits,
    host: HostApi,
    engine: std::sync::Mutex<ScriptEngine>,
}

impl CompiledModule {
    /// Build the VM, bind the host API and run the module's top-level code.
    ///
    /// Top-level code cannot reach the host functions, so a rejected module
    /// leaves no trace.
    pub fn compile(name: &str, code: &str, limits: ResourceLimits, host: HostApi) -> Result<Self> {
        let engine = Self::build(name, code, &limits, &host)?;

        Ok(Self {
            name: name.to_string(),
            code: code.to_string(),
            limits,
            host,
            engine: std::sync::Mutex::new(engine),
        })
    }

    fn build(name: &str, code: &str, limits: &ResourceLimits, host: &HostApi) -> Result<ScriptEngine> {
        let engine = ScriptEngine::with_limits(limits.clone())?;
        host.register(&engine)?;
        engine.load(name, code)?;
        Ok(engine)
    }

    /// Run `command_<command>(user_id, data)` on behalf of `requester`.
    ///
    /// Blocks on host calls, so it must not run on an async worker thread.
    /// A command that runs out of memory gets the VM rebuilt from the stored
    /// code, dropping whatever globals it had grown.
    pub fn invoke(
        &self,
        command: &str,
        data: &str,
        requester: Requester,
    ) -> Result<Option<String>> {
        let mut engine = self.engine.lock().unwrap_or_else(|p| p.into_inner());
        let handler = engine
            .function(&format!("{COMMAND_PREFIX}{command}"))?
            .ok_or_else(|| ModhostError::CommandNotFound {
                module: self.name.clone(),
                command: command.to_string(),
            })?;

        let lua = engine.lua();
        let _ = lua.set_app_data(requester);
        let result = engine.call(&handler, (requester.user_id, data));
        let _ = lua.remove_app_data::<Requester>();
        let output = result.and_then(|value| engine.to_result_string(value));
        drop(handler);

        if engine.is_exhausted() {
            self.rebuild(&mut engine);
        }
        output
    }

    fn rebuild(&self, engine: &mut ScriptEngine) {
        match Self::build(&self.name, &self.code, &self.limits, &self.host) {
            Ok(fresh) => {
                *engine = fresh;
                warn!(module = %self.name, "Module hit its memory limit, VM rebuilt");
            }
            Err(e) => {
                warn!(module = %self.name, error = %e, "Failed to rebuild module VM");
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Registry of installed modules.
pub struct ModuleStore {
    pool: DbPool,
    messages: Arc<MessageLog>,
    limits: ResourceLimits,
    modules: RwLock<HashMap<String, Arc<CompiledModule>>>,
    /// Orders persist-then-swap across concurrent installs.
    install_lock: Mutex<()>,
}

impl ModuleStore {
    pub fn new(pool: DbPool, messages: Arc<MessageLog>, limits: ResourceLimits) -> Self {
        Self {
            pool,
            messages,
            limits,
            modules: RwLock::new(HashMap::new()),
            install_lock: Mutex::new(()),
        }
    }

    /// Compile `code` on a blocking thread.
    async fn compile(&self, name: &str, code: &str) -> Result<CompiledModule> {
        let host = HostApi::new(
            name,
            self.pool.clone(),
            Arc::clone(&self.messages),
            Handle::current(),
        );
        let (name, code, limits) = (name.to_string(), code.to_string(), self.limits.clone());

        tokio::task::spawn_blocking(move || CompiledModule::compile(&name, &code, limits, host))
            .await
            .map_err(|e| ModhostError::Compile(format!("compile task failed: {e}")))?
    }

    /// Compile, persist and activate a module.
    ///
    /// On a compile error nothing is persisted and the previous version, if
    /// any, stays active.
    pub async fn install(&self, name: &str, code: &str) -> Result<Arc<CompiledModule>> {
        validate_module_name(name).map_err(ModhostError::Validation)?;

        let compiled = Arc::new(self.compile(name, code).await?);

        let _install = self.install_lock.lock().await;
        ModuleRepository::new(&self.pool).upsert(name, code).await?;
        self.modules
            .write()
            .await
            .insert(name.to_string(), Arc::clone(&compiled));

        info!(module = name, "Module installed");
        Ok(compiled)
    }

    /// Get the active version of a module.
    pub async fn get(&self, name: &str) -> Result<Arc<CompiledModule>> {
        self.modules
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ModhostError::ModuleNotFound(name.to_string()))
    }

    /// Names of all active modules, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Compile every persisted module.
    ///
    /// A module whose stored code no longer compiles is reported and left
    /// inactive; the rest still load.
    pub async fn load_all(&self) -> Result<LoadReport> {
        let stored = ModuleRepository::new(&self.pool).list_all().await?;
        let mut report = LoadReport::default();

        for module in stored {
            match self.compile(&module.name, &module.code).await {
                Ok(compiled) => {
                    self.modules
                        .write()
                        .await
                        .insert(module.name, Arc::new(compiled));
                    report.loaded += 1;
                }
                Err(e) => {
                    warn!(module = %module.name, error = %e, "Stored module failed to compile");
                    report.failed.push((module.name, e.to_string()));
                }
            }
        }

        info!(
            loaded = report.loaded,
            failed = report.failed.len(),
            "Modules loaded"
        );
        Ok(report)
    }
}
