//! Modhost - a host for sandboxed Lua modules.
//!
//! Modules are installed at runtime, keep private key-value data and talk to
//! users through a persistent message bus that clients long-poll.

pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod module;

pub use config::Config;
pub use db::Database;
pub use error::{ModhostError, Result};
pub use module::{
    BroadcastPolicy, MessageSearch, ModuleMessage, ModuleService, ModuleView, Requester,
    UpdateOutcome, BROADCAST_UID,
};
