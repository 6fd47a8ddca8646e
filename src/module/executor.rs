//! Command execution with per-module serialization.
//!
//! Commands of one module run one at a time, in the order they acquired the
//! module's gate. Different modules run in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{debug, warn};

use super::log_repository::{ModuleExecutionRepository, NewModuleExecution};
use super::store::ModuleStore;
use super::types::Requester;
use crate::db::DbPool;
use crate::{ModhostError, Result};

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Runs module commands.
pub struct ModuleExecutor {
    store: Arc<ModuleStore>,
    pool: DbPool,
    gates: Mutex<HashMap<String, Gate>>,
}

impl ModuleExecutor {
    pub fn new(store: Arc<ModuleStore>, pool: DbPool) -> Self {
        Self {
            store,
            pool,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, module: &str) -> Gate {
        let mut gates = self.gates.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(gates.entry(module.to_string()).or_default())
    }

    /// Run `command` of `module` with `data` on behalf of `requester`.
    pub async fn run_command(
        &self,
        module: &str,
        command: &str,
        data: &str,
        requester: &Requester,
    ) -> Result<Option<String>> {
        // Unknown names never get a gate
        self.store.get(module).await?;

        let permit = self.gate(module).lock_owned().await;
        // Re-read under the gate so a reinstall that finished while waiting is picked up
        let compiled = self.store.get(module).await?;

        let started = Instant::now();
        let (task_command, task_data, requester) = (command.to_string(), data.to_string(), *requester);
        let result = tokio::task::spawn_blocking(move || {
            // Held until the script returns even if the caller goes away
            let _permit = permit;
            compiled.invoke(&task_command, &task_data, requester)
        })
        .await
        .map_err(|e| ModhostError::ScriptFault(format!("command task failed: {e}")))?;
        let elapsed_ms = started.elapsed().as_millis() as i64;

        if matches!(result, Err(ModhostError::CommandNotFound { .. })) {
            return result;
        }
        match &result {
            Ok(_) => debug!(module, command, elapsed_ms, "Command completed"),
            Err(e) => debug!(module, command, elapsed_ms, error = %e, "Command failed"),
        }

        let error_message = result.as_ref().err().map(|e| e.to_string());
        let entry = NewModuleExecution {
            module,
            command,
            user_id: requester.user_id,
            execution_ms: elapsed_ms,
            error_message: error_message.as_deref(),
        };
        if let Err(e) = ModuleExecutionRepository::new(&self.pool).record(&entry).await {
            warn!(module, command, error = %e, "Failed to record command execution");
        }

        result
    }
}
