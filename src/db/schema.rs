//! Database schema and migrations for modhost.
//!
//! Migrations are applied sequentially when the database is first opened
//! or upgraded.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: Installed modules
    r#"
-- One row per module name; replaced wholesale on reinstall
CREATE TABLE modules (
    name        TEXT PRIMARY KEY,
    code        TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);
"#,
    // v2: Per-module key/value data
    r#"
-- Keyed by module name, not by installation, so reinstalling keeps the rows
CREATE TABLE module_data (
    module      TEXT NOT NULL,
    key         TEXT NOT NULL,
    value       TEXT,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (module, key)
);
"#,
    // v3: Module message log
    r#"
-- Ids are assigned by the message log, never by SQLite
CREATE TABLE module_messages (
    id            INTEGER PRIMARY KEY,
    module        TEXT NOT NULL,
    sender_uid    INTEGER NOT NULL,
    receiver_uid  INTEGER NOT NULL,
    message       TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE INDEX idx_module_messages_receiver ON module_messages(receiver_uid, id);
CREATE INDEX idx_module_messages_module ON module_messages(module, id);
"#,
    // v4: Command execution log
    r#"
CREATE TABLE module_executions (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    module         TEXT NOT NULL,
    command        TEXT NOT NULL,
    user_id        INTEGER NOT NULL,
    executed_at    TEXT NOT NULL,
    execution_ms   INTEGER NOT NULL,
    success        INTEGER NOT NULL,
    error_message  TEXT
);

CREATE INDEX idx_module_executions_module ON module_executions(module, id);
"#,
];
