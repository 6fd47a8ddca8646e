//! Long-poll and concurrency tests.
//!
//! These verify listener wake-up, timeout and cancellation behavior, and that
//! concurrent commands keep message ids ordered and module execution serialized.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use modhost::config::ModulesConfig;
use modhost::{ModhostError, ModuleMessage, Requester, BROADCAST_UID};

use common::{install, run, setup_service, setup_with_test_module, DEFAULT_TIMEOUT};

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_returns_immediately_with_data() {
    let (_db, service) = setup_with_test_module().await;
    run(&service, "sendmessage", "", 9).await;

    let started = Instant::now();
    let messages = service
        .listen(
            0,
            &Requester::user(9),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(messages.len(), 1);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_times_out_empty() {
    let (_db, service) = setup_with_test_module().await;
    let wait = Duration::from_millis(300);

    let started = Instant::now();
    let messages = service
        .listen(0, &Requester::user(9), wait, &CancellationToken::new())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(messages.is_empty());
    assert!(elapsed >= wait);
    assert!(elapsed < wait + Duration::from_secs(2));
    assert_eq!(service.messages().registry().pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_since_id_skips_seen() {
    let (_db, service) = setup_with_test_module().await;
    run(&service, "sendmessage", "", 9).await;
    let first = service
        .listen(
            0,
            &Requester::user(9),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let again = service
        .listen(
            first[0].id,
            &Requester::user(9),
            Duration::from_millis(50),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(again.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_wakes_on_append() {
    let (_db, service) = setup_with_test_module().await;

    let listener = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .listen(
                    0,
                    &Requester::user(9),
                    Duration::from_secs(30),
                    &CancellationToken::new(),
                )
                .await
        })
    };

    // Let the listener park
    while service.messages().registry().pending() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let started = Instant::now();
    run(&service, "sendmessage", "", 9).await;

    let messages = timeout(DEFAULT_TIMEOUT, listener)
        .await
        .expect("listener woke")
        .unwrap()
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].message, "hey");
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(service.messages().registry().pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_ignores_other_receivers() {
    let (_db, service) = setup_with_test_module().await;

    let listener = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .listen(
                    0,
                    &Requester::user(11),
                    Duration::from_millis(500),
                    &CancellationToken::new(),
                )
                .await
        })
    };
    while service.messages().registry().pending() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Reaches 9 and 10, not 11
    run(&service, "sendmessage", "", 9).await;

    let messages = listener.await.unwrap().unwrap();
    assert!(messages.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_listen_cancellation() {
    let (_db, service) = setup_with_test_module().await;
    let cancel = CancellationToken::new();

    let listener = {
        let service = Arc::clone(&service);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            service
                .listen(0, &Requester::user(9), Duration::from_secs(30), &cancel)
                .await
        })
    };
    while service.messages().registry().pending() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    cancel.cancel();
    let result = timeout(DEFAULT_TIMEOUT, listener)
        .await
        .expect("listener cancelled")
        .unwrap();

    assert!(matches!(result, Err(ModhostError::Cancelled)));
    assert_eq!(service.messages().registry().pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_racing_append_has_one_outcome() {
    let (_db, service) = setup_with_test_module().await;

    for round in 0..20 {
        let since_id = service.messages().last_id().await;
        let cancel = CancellationToken::new();
        let listener = {
            let service = Arc::clone(&service);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                service
                    .listen(since_id, &Requester::user(9), Duration::from_secs(30), &cancel)
                    .await
            })
        };
        while service.messages().registry().pending() == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let append = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.messages().append("test", 1, 9, "race").await })
        };
        cancel.cancel();
        append.await.unwrap().unwrap();

        let result = timeout(DEFAULT_TIMEOUT, listener)
            .await
            .expect("listener finished")
            .unwrap();
        match result {
            Ok(messages) => {
                assert_eq!(messages.len(), 1, "round {round}");
                assert_eq!(messages[0].id, since_id + 1);
            }
            Err(ModhostError::Cancelled) => {}
            Err(e) => panic!("round {round}: unexpected error {e}"),
        }
        assert_eq!(service.messages().registry().pending(), 0);
    }

    // Every append landed whatever the listener saw
    assert_eq!(service.messages().last_id().await, 20);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_messages_appended_before_wake_arrive_together() {
    let (db, service) = setup_with_test_module().await;

    let listener = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .listen(
                    0,
                    &Requester::user(9),
                    Duration::from_secs(30),
                    &CancellationToken::new(),
                )
                .await
        })
    };
    while service.messages().registry().pending() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Both rows become visible at once, then a single wake follows
    let mut tx = db.pool().begin().await.unwrap();
    for id in [1_i64, 2] {
        sqlx::query(
            "INSERT INTO module_messages (id, module, sender_uid, receiver_uid, message, created_at) \
             VALUES ($1, 'test', 1, 9, $2, $3)",
        )
        .bind(id)
        .bind(format!("m{id}"))
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .unwrap();
    }
    tx.commit().await.unwrap();

    let last = ModuleMessage {
        id: 2,
        module: "test".to_string(),
        sender_uid: 1,
        receiver_uid: 9,
        message: "m2".to_string(),
        create_date: Utc::now(),
    };
    service.messages().registry().notify(&last);

    let messages = timeout(DEFAULT_TIMEOUT, listener)
        .await
        .expect("listener woke")
        .unwrap()
        .unwrap();
    let ids: Vec<i64> = messages.iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![1, 2]);
    assert_eq!(messages[1].message, "m2");
    assert_eq!(service.messages().registry().pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_listener_deregisters() {
    let (_db, service) = setup_with_test_module().await;

    let listener = {
        let service = Arc::clone(&service);
        tokio::spawn(async move {
            service
                .listen(
                    0,
                    &Requester::user(9),
                    Duration::from_secs(30),
                    &CancellationToken::new(),
                )
                .await
        })
    };
    while service.messages().registry().pending() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    listener.abort();
    let _ = listener.await;
    assert_eq!(service.messages().registry().pending(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_reaches_every_listener() {
    let (_db, service) = setup_with_test_module().await;

    let mut listeners = Vec::new();
    for uid in [20, 21, 22] {
        let service = Arc::clone(&service);
        listeners.push(tokio::spawn(async move {
            service
                .listen(
                    0,
                    &Requester::user(uid),
                    Duration::from_secs(30),
                    &CancellationToken::new(),
                )
                .await
        }));
    }
    while service.messages().registry().pending() < 3 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    run(&service, "broadcast", "hello all", 1).await;

    for listener in listeners {
        let messages = timeout(DEFAULT_TIMEOUT, listener)
            .await
            .expect("listener woke")
            .unwrap()
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].receiver_uid, BROADCAST_UID);
        assert_eq!(messages[0].message, "hello all");
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_broadcast_disabled() {
    let config = ModulesConfig {
        broadcast_enabled: false,
        ..Default::default()
    };
    let (_db, service) = setup_service(&config).await;
    install(&service, "test", common::TEST_MODULE).await;

    run(&service, "broadcast", "hello all", 1).await;

    let messages = service
        .listen(
            0,
            &Requester::user(20),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(messages.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_appends_are_ordered() {
    let (_db, service) = setup_with_test_module().await;
    install(
        &service,
        "second",
        "function command_send(uid, data) sendmessage(uid, data) end",
    )
    .await;

    let mut tasks = Vec::new();
    for i in 0..20 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            let module = if i % 2 == 0 { "test" } else { "second" };
            let command = if i % 2 == 0 { "sendmessage" } else { "send" };
            service
                .run_command(module, command, "x", &Requester::user(9))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let messages = service
        .listen(
            0,
            &Requester::user(9),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(messages.len(), 20);
    assert!(messages.windows(2).all(|w| w[0].id < w[1].id));
    // 10 to uid 9 and 10 to uid 10 from "test", 10 to uid 9 from "second"
    assert_eq!(service.messages().last_id().await, 30);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_module_execution_is_serialized() {
    let (_db, service) = setup_service(&ModulesConfig::default()).await;
    install(
        &service,
        "counter",
        r#"
        function command_bump()
            local n = tonumber(getdata("n") or "0")
            -- Busy work between the read and the write
            local x = 0
            for i = 1, 20000 do x = x + i end
            setdata("n", tostring(n + 1))
        end
        function command_get() return getdata("n") end
        "#,
    )
    .await;

    let mut tasks = Vec::new();
    for uid in 0..25 {
        let service = Arc::clone(&service);
        tasks.push(tokio::spawn(async move {
            service
                .run_command("counter", "bump", "", &Requester::user(uid))
                .await
                .unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let count = service
        .run_command("counter", "get", "", &Requester::user(1))
        .await
        .unwrap();
    assert_eq!(count, Some("25".to_string()));
}
