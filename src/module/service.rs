//! Module service: the entry point for installing modules, running their
//! commands and listening on the message bus.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::engine::ResourceLimits;
use super::executor::ModuleExecutor;
use super::listen::ListenRegistry;
use super::message_log::MessageLog;
use super::store::ModuleStore;
use super::types::{BroadcastPolicy, ModuleMessage, ModuleView, Requester, UpdateOutcome};
use crate::config::ModulesConfig;
use crate::db::Database;
use crate::{ModhostError, Result};

/// Process-wide module service. Construct once and share behind an `Arc`.
pub struct ModuleService {
    store: Arc<ModuleStore>,
    executor: ModuleExecutor,
    messages: Arc<MessageLog>,
    max_listen_timeout: Duration,
    decay_interval: Duration,
}

impl ModuleService {
    /// Open the service on `db`, recompiling every persisted module.
    pub async fn open(db: &Database, config: &ModulesConfig) -> Result<Self> {
        let policy = BroadcastPolicy::from_enabled(config.broadcast_enabled);
        let registry = Arc::new(ListenRegistry::new(policy, config.listen_grace_period()));
        let messages = Arc::new(MessageLog::open(db.pool().clone(), registry, policy).await?);

        let store = Arc::new(ModuleStore::new(
            db.pool().clone(),
            Arc::clone(&messages),
            ResourceLimits::from(config),
        ));
        let report = store.load_all().await?;
        if !report.failed.is_empty() {
            warn!(
                failed = report.failed.len(),
                "Some stored modules are inactive until reinstalled"
            );
        }

        let executor = ModuleExecutor::new(Arc::clone(&store), db.pool().clone());
        info!(modules = report.loaded, ?policy, "Module service ready");

        Ok(Self {
            store,
            executor,
            messages,
            max_listen_timeout: config.max_listen_timeout(),
            decay_interval: config.decay_interval(),
        })
    }

    /// Install or replace a module.
    ///
    /// A compile error is reported in the outcome and leaves any previous
    /// version active. Other failures are returned as errors.
    pub async fn update_module(&self, view: ModuleView) -> Result<UpdateOutcome> {
        match self.store.install(&view.name, &view.code).await {
            Ok(_) => Ok(UpdateOutcome {
                name: view.name,
                compiled_ok: true,
                error: None,
            }),
            Err(ModhostError::Compile(error)) => {
                warn!(module = %view.name, %error, "Module failed to compile");
                Ok(UpdateOutcome {
                    name: view.name,
                    compiled_ok: false,
                    error: Some(error),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Run a module command on behalf of `requester`.
    pub async fn run_command(
        &self,
        module: &str,
        command: &str,
        data: &str,
        requester: &Requester,
    ) -> Result<Option<String>> {
        self.executor
            .run_command(module, command, data, requester)
            .await
    }

    /// Long-poll for messages addressed to `requester` with an id above `since_id`.
    ///
    /// `timeout` is clamped to the configured maximum. An empty result means
    /// the timeout elapsed.
    pub async fn listen(
        &self,
        since_id: i64,
        requester: &Requester,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModuleMessage>> {
        if since_id < 0 {
            return Err(ModhostError::Validation(format!(
                "since_id must not be negative, got {since_id}"
            )));
        }

        let timeout = timeout.min(self.max_listen_timeout);
        self.messages
            .listen(since_id, requester.user_id, timeout, cancel)
            .await
    }

    /// Start the background task that expires abandoned listeners.
    pub fn spawn_decayer(&self) -> JoinHandle<()> {
        self.messages.registry().spawn_decayer(self.decay_interval)
    }

    pub fn store(&self) -> &ModuleStore {
        &self.store
    }

    pub fn messages(&self) -> &MessageLog {
        &self.messages
    }
}
