//! Append-only message log shared by all modules.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::listen::ListenRegistry;
use super::message_repository::ModuleMessageRepository;
use super::types::{BroadcastPolicy, MessageSearch, ModuleMessage, Requester};
use crate::db::DbPool;
use crate::Result;

/// Persistent message bus with strictly increasing ids.
///
/// Id assignment, the insert and listener notification happen under one
/// lock, so ids are gap-free and become visible in id order.
pub struct MessageLog {
    pool: DbPool,
    last_id: Mutex<i64>,
    registry: Arc<ListenRegistry>,
    policy: BroadcastPolicy,
}

impl MessageLog {
    /// Open the log, continuing after the highest persisted id.
    pub async fn open(
        pool: DbPool,
        registry: Arc<ListenRegistry>,
        policy: BroadcastPolicy,
    ) -> Result<Self> {
        let last_id = ModuleMessageRepository::new(&pool).max_id().await?;
        debug!(last_id, "Message log opened");

        Ok(Self {
            pool,
            last_id: Mutex::new(last_id),
            registry,
            policy,
        })
    }

    /// Append a message and wake matching listeners.
    pub async fn append(
        &self,
        module: &str,
        sender_uid: i64,
        receiver_uid: i64,
        text: &str,
    ) -> Result<ModuleMessage> {
        let mut last_id = self.last_id.lock().await;

        let message = ModuleMessage {
            id: *last_id + 1,
            module: module.to_string(),
            sender_uid,
            receiver_uid,
            message: text.to_string(),
            create_date: Utc::now(),
        };
        ModuleMessageRepository::new(&self.pool)
            .insert(&message)
            .await?;
        *last_id = message.id;

        let woken = self.registry.notify(&message);
        debug!(
            id = message.id,
            module,
            sender_uid,
            receiver_uid,
            woken,
            "Message appended"
        );

        Ok(message)
    }

    /// Messages visible to `requester_uid` with an id above `since_id`.
    pub async fn after(&self, since_id: i64, requester_uid: i64) -> Result<Vec<ModuleMessage>> {
        ModuleMessageRepository::new(&self.pool)
            .after(since_id, requester_uid, self.policy)
            .await
    }

    /// Browse the log. `all_receivers` is only honored for system requesters.
    pub async fn search(
        &self,
        search: &MessageSearch,
        requester: &Requester,
    ) -> Result<Vec<ModuleMessage>> {
        let visible_to = if search.all_receivers && requester.is_system {
            None
        } else {
            Some((requester.user_id, self.policy))
        };

        ModuleMessageRepository::new(&self.pool)
            .search(search, visible_to)
            .await
    }

    /// Long-poll for messages; see [`ListenRegistry::listen`].
    pub async fn listen(
        &self,
        since_id: i64,
        requester_uid: i64,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<ModuleMessage>> {
        self.registry
            .listen(self, since_id, requester_uid, timeout, cancel)
            .await
    }

    /// Highest id assigned so far.
    pub async fn last_id(&self) -> i64 {
        *self.last_id.lock().await
    }

    pub fn registry(&self) -> &Arc<ListenRegistry> {
        &self.registry
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::types::BROADCAST_UID;
    use crate::Database;

    async fn open_log(db: &Database, policy: BroadcastPolicy) -> MessageLog {
        let registry = Arc::new(ListenRegistry::new(policy, Duration::from_secs(10)));
        MessageLog::open(db.pool().clone(), registry, policy)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_increasing_ids() {
        let db = Database::open_in_memory().await.unwrap();
        let log = open_log(&db, BroadcastPolicy::Enabled).await;

        let first = log.append("test", 9, 9, "one").await.unwrap();
        let second = log.append("test", 9, 10, "two").await.unwrap();

        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(log.last_id().await, 2);
    }

    #[tokio::test]
    async fn test_reopen_continues_numbering() {
        let db = Database::open_in_memory().await.unwrap();
        {
            let log = open_log(&db, BroadcastPolicy::Enabled).await;
            log.append("test", 9, 9, "one").await.unwrap();
            log.append("test", 9, 9, "two").await.unwrap();
        }

        let log = open_log(&db, BroadcastPolicy::Enabled).await;
        let third = log.append("test", 9, 9, "three").await.unwrap();
        assert_eq!(third.id, 3);
    }

    #[tokio::test]
    async fn test_after_only_returns_visible() {
        let db = Database::open_in_memory().await.unwrap();
        let log = open_log(&db, BroadcastPolicy::Enabled).await;

        log.append("test", 9, 9, "hey").await.unwrap();
        log.append("test", 9, 10, "hey NO").await.unwrap();
        log.append("test", 9, BROADCAST_UID, "all").await.unwrap();

        let messages = log.after(0, 9).await.unwrap();
        let texts: Vec<&str> = messages.iter().map(|m| m.message.as_str()).collect();
        assert_eq!(texts, vec!["hey", "all"]);
    }

    #[tokio::test]
    async fn test_search_all_receivers_requires_system() {
        let db = Database::open_in_memory().await.unwrap();
        let log = open_log(&db, BroadcastPolicy::Enabled).await;

        log.append("test", 9, 9, "a").await.unwrap();
        log.append("test", 9, 10, "b").await.unwrap();

        let search = MessageSearch {
            all_receivers: true,
            ..Default::default()
        };
        assert_eq!(log.search(&search, &Requester::user(9)).await.unwrap().len(), 1);
        assert_eq!(log.search(&search, &Requester::system()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_append_notifies_registry() {
        let db = Database::open_in_memory().await.unwrap();
        let log = open_log(&db, BroadcastPolicy::Enabled).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
        let (_guard, rx) = log.registry().register(9, 0, deadline);
        log.append("test", 1, 9, "wake").await.unwrap();

        assert_eq!(rx.await.unwrap(), crate::module::listen::Wake::Message);
    }
}
