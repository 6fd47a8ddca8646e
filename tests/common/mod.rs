//! Test helpers for module service integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use modhost::config::ModulesConfig;
use modhost::{Database, ModuleService, ModuleView, Requester};

/// Upper bound for anything expected to happen "promptly".
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// The module used by most scenarios.
pub const TEST_MODULE: &str = r#"
function command_wow(uid, data)
    return "Id: " .. uid .. " Data: " .. data
end

function command_setdata(uid, data)
    setdata("tdata", data)
end

function command_getdata(uid, data)
    return getdata("tdata")
end

function command_sendmessage(uid, data)
    sendmessage(uid, "hey")
    sendmessage(uid + 1, "hey NO")
end

function command_broadcast(uid, data)
    sendmessage(0, data)
end
"#;

/// Open an in-memory database and a service on it.
pub async fn setup_service(config: &ModulesConfig) -> (Database, Arc<ModuleService>) {
    let db = Database::open_in_memory().await.unwrap();
    let service = ModuleService::open(&db, config).await.unwrap();
    (db, Arc::new(service))
}

/// A service with the default configuration and [`TEST_MODULE`] installed as "test".
pub async fn setup_with_test_module() -> (Database, Arc<ModuleService>) {
    let (db, service) = setup_service(&ModulesConfig::default()).await;
    install(&service, "test", TEST_MODULE).await;
    (db, service)
}

/// Install a module and assert it compiled.
pub async fn install(service: &ModuleService, name: &str, code: &str) {
    let outcome = service
        .update_module(ModuleView::new(name, code))
        .await
        .unwrap();
    assert!(outcome.compiled_ok, "{name} failed: {:?}", outcome.error);
}

/// Run a command as a regular user, panicking on error.
pub async fn run(service: &ModuleService, command: &str, data: &str, uid: i64) -> Option<String> {
    service
        .run_command("test", command, data, &Requester::user(uid))
        .await
        .unwrap()
}
