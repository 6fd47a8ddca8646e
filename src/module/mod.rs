//! Module host: sandboxed Lua modules with persistent data and a
//! long-poll message bus.
//!
//! A module is a named Lua chunk exposing `command_<name>` functions. Each
//! module runs in its own VM with three host functions (`getdata`,
//! `setdata`, `sendmessage`); [`ModuleService`] ties installation, command
//! execution and listening together.

pub mod api;
pub mod data_repository;
pub mod engine;
pub mod executor;
pub mod listen;
pub mod log_repository;
pub mod message_log;
pub mod message_repository;
pub mod repository;
pub mod service;
pub mod store;
pub mod types;

pub use api::HostApi;
pub use data_repository::ModuleDataRepository;
pub use engine::{ResourceLimits, ScriptEngine};
pub use executor::ModuleExecutor;
pub use listen::{ListenRegistry, Wake};
pub use log_repository::{ModuleExecution, ModuleExecutionRepository};
pub use message_log::MessageLog;
pub use message_repository::ModuleMessageRepository;
pub use repository::{ModuleRepository, StoredModule};
pub use service::ModuleService;
pub use store::{CompiledModule, ModuleStore, COMMAND_PREFIX};
pub use types::{
    BroadcastPolicy, LoadReport, MessageSearch, ModuleMessage, ModuleView, Requester,
    UpdateOutcome, BROADCAST_UID,
};
