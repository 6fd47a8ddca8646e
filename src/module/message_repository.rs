//! Message repository for the module bus.

use sqlx::{QueryBuilder, Sqlite};

use super::types::{BroadcastPolicy, ModuleMessage, MessageSearch, BROADCAST_UID};
use crate::db::DbPool;
use crate::Result;

/// Default number of rows returned by a search.
pub const DEFAULT_SEARCH_LIMIT: i64 = 100;

/// Hard cap on rows returned by a search.
pub const MAX_SEARCH_LIMIT: i64 = 1000;

const MESSAGE_COLUMNS: &str = "id, module, sender_uid, receiver_uid, message, created_at";

/// Repository for persisted bus messages.
pub struct ModuleMessageRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> ModuleMessageRepository<'a> {
    /// Create a new message repository.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Insert a message whose id has already been assigned.
    pub async fn insert(&self, message: &ModuleMessage) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO module_messages (id, module, sender_uid, receiver_uid, message, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(message.id)
        .bind(&message.module)
        .bind(message.sender_uid)
        .bind(message.receiver_uid)
        .bind(&message.message)
        .bind(message.create_date)
        .execute(self.pool)
        .await?;

        Ok(())
    }

    /// Highest assigned id, or 0 for an empty log.
    pub async fn max_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM module_messages")
            .fetch_one(self.pool)
            .await?;

        Ok(max.unwrap_or(0))
    }

    /// Messages visible to `requester_uid` with an id above `since_id`, in id order.
    pub async fn after(
        &self,
        since_id: i64,
        requester_uid: i64,
        policy: BroadcastPolicy,
    ) -> Result<Vec<ModuleMessage>> {
        let messages = sqlx::query_as::<_, ModuleMessage>(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM module_messages
            WHERE id > $1 AND (receiver_uid = $2 OR ($3 AND receiver_uid = $4))
            ORDER BY id
            "#
        ))
        .bind(since_id)
        .bind(requester_uid)
        .bind(policy == BroadcastPolicy::Enabled)
        .bind(BROADCAST_UID)
        .fetch_all(self.pool)
        .await?;

        Ok(messages)
    }

    /// Filtered browse of the log.
    ///
    /// `visible_to` restricts results to one requester's view; `None` returns
    /// every receiver.
    pub async fn search(
        &self,
        search: &MessageSearch,
        visible_to: Option<(i64, BroadcastPolicy)>,
    ) -> Result<Vec<ModuleMessage>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {MESSAGE_COLUMNS} FROM module_messages WHERE 1 = 1"
        ));

        if let Some(min_id) = search.min_id {
            query.push(" AND id > ").push_bind(min_id);
        }
        if let Some(max_id) = search.max_id {
            query.push(" AND id < ").push_bind(max_id);
        }
        if let Some(module) = &search.module {
            query.push(" AND module = ").push_bind(module.clone());
        }
        if let Some((requester_uid, policy)) = visible_to {
            query.push(" AND (receiver_uid = ").push_bind(requester_uid);
            if policy == BroadcastPolicy::Enabled {
                query.push(" OR receiver_uid = ").push_bind(BROADCAST_UID);
            }
            query.push(")");
        }

        query.push(if search.reverse {
            " ORDER BY id DESC"
        } else {
            " ORDER BY id"
        });

        let limit = search
            .limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT);
        query.push(" LIMIT ").push_bind(limit);

        let messages = query
            .build_query_as::<ModuleMessage>()
            .fetch_all(self.pool)
            .await?;

        Ok(messages)
    }
}
