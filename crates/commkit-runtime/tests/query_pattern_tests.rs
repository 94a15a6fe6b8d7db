//! Integration tests for the query pattern

use std::sync::Arc;
use std::time::{Duration, Instant};

use commkit_runtime::{
    handler_fn, query_handler_fn, ClientPattern, CommConfig, CommError, Component,
    InMemoryNamingService, NamingService, OverflowPolicy, QueryFailure, QueryServerInput,
    QueueConfig,
};
use parking_lot::Mutex;
use tokio_test::assert_ok;

fn component(name: &str, naming: &Arc<dyn NamingService>) -> Component {
    Component::builder(name)
        .with_config(CommConfig::testing())
        .with_naming(naming.clone())
        .build()
        .expect("component")
}

fn ping_server(server: &Component) -> Arc<commkit_runtime::QueryServer<String, String>> {
    let query_server = server.query_server::<String, String>("ping").unwrap();
    query_server.register_handler(query_handler_fn(|request: &String| {
        std::thread::sleep(Duration::from_millis(5));
        match request.as_str() {
            "ping" => Ok("pong".to_string()),
            other => Err(QueryFailure::Handler(format!("unsupported request '{other}'"))),
        }
    }));
    query_server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_ping_pong() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);
    let _query_server = ping_server(&server);

    let query_client = client
        .connected_query_client::<String, String>("base", "ping")
        .await
        .unwrap();
    let answer = query_client
        .query("ping".to_string(), Duration::from_millis(100))
        .await
        .unwrap();

    assert_eq!(answer, "pong");
    assert_eq!(query_client.pending_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_error_surfaces_as_query_failed() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);
    let _query_server = ping_server(&server);

    let query_client = client
        .connected_query_client::<String, String>("base", "ping")
        .await
        .unwrap();
    let result = query_client
        .query("status".to_string(), Duration::from_millis(200))
        .await;

    assert!(matches!(
        result,
        Err(CommError::QueryFailed(QueryFailure::Handler(_)))
    ));
}

#[tokio::test]
async fn test_unbound_query_fails_immediately() {
    let naming = InMemoryNamingService::shared();
    let client = component("planner", &naming);
    let query_client = client.query_client::<String, String>().unwrap();

    let started = Instant::now();
    let result = query_client
        .query("ping".to_string(), Duration::from_secs(5))
        .await;

    assert_eq!(result, Err(CommError::NotConnected));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[tokio::test]
async fn test_query_without_answer_times_out() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    // The handler keeps the request without answering it.
    let query_server = server.query_server::<u32, u32>("silent").unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let parked_clone = parked.clone();
    query_server
        .subject()
        .register(handler_fn(move |input: &QueryServerInput<u32, u32>| {
            parked_clone.lock().push(input.clone())
        }));

    let query_client = client
        .connected_query_client::<u32, u32>("base", "silent")
        .await
        .unwrap();
    let started = Instant::now();
    let result = query_client.query(1, Duration::from_millis(50)).await;

    assert!(matches!(result, Err(CommError::Timeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(query_client.pending_count(), 0);
}

#[tokio::test]
async fn test_no_handler_fails_query() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);
    let _query_server = server.query_server::<u32, u32>("empty").unwrap();

    let query_client = client
        .connected_query_client::<u32, u32>("base", "empty")
        .await
        .unwrap();
    let result = query_client.query(1, Duration::from_millis(200)).await;

    assert_eq!(result, Err(CommError::QueryFailed(QueryFailure::NoHandler)));
}

#[tokio::test]
async fn test_deferred_answer_through_responder() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    let query_server = server.query_server::<u32, u32>("double").unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let parked_clone = parked.clone();
    query_server
        .subject()
        .register(handler_fn(move |input: &QueryServerInput<u32, u32>| {
            parked_clone.lock().push(input.clone())
        }));

    let query_client = client
        .connected_query_client::<u32, u32>("base", "double")
        .await
        .unwrap();
    let id = query_client.query_request(21).await.unwrap();

    for _ in 0..100 {
        if !parked.lock().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(query_client.query_receive(id), Ok(None));

    let input = parked.lock().pop().expect("parked request");
    assert!(input.responder.answer(input.request * 2));
    assert!(!input.responder.answer(0));

    let answer = query_client
        .query_receive_wait(id, Duration::from_millis(200))
        .await
        .unwrap();
    assert_eq!(answer, 42);
    assert_eq!(
        query_client.query_receive(id),
        Err(CommError::WrongId(id.value()))
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_async_query_api() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);
    let _query_server = ping_server(&server);

    let query_client = client
        .connected_query_client::<String, String>("base", "ping")
        .await
        .unwrap();

    let first = query_client.query_request("ping".to_string()).await.unwrap();
    let second = query_client.query_request("ping".to_string()).await.unwrap();
    assert_ne!(first, second);
    assert_eq!(query_client.pending_count(), 2);

    assert_ok!(query_client.query_discard(second));
    assert_eq!(
        query_client.query_discard(second),
        Err(CommError::WrongId(second.value()))
    );

    let answer = query_client
        .query_receive_wait(first, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(answer, "pong");
    assert_eq!(query_client.pending_count(), 0);
}

#[tokio::test]
async fn test_disconnect_aborts_pending_queries() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    let query_server = server.query_server::<u32, u32>("silent").unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let parked_clone = parked.clone();
    query_server
        .subject()
        .register(handler_fn(move |input: &QueryServerInput<u32, u32>| {
            parked_clone.lock().push(input.clone())
        }));

    let query_client = client
        .connected_query_client::<u32, u32>("base", "silent")
        .await
        .unwrap();

    let waiter = {
        let query_client = query_client.clone();
        tokio::spawn(async move { query_client.query(7, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    query_client.disconnect().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("query must not hang")
        .unwrap();
    assert_eq!(result, Err(CommError::NotConnected));
    assert_eq!(query_client.pending_count(), 0);
}

#[tokio::test]
async fn test_blocking_disabled_cancels_waiters() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    let query_server = server.query_server::<u32, u32>("silent").unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let parked_clone = parked.clone();
    query_server
        .subject()
        .register(handler_fn(move |input: &QueryServerInput<u32, u32>| {
            parked_clone.lock().push(input.clone())
        }));

    let query_client = client
        .connected_query_client::<u32, u32>("base", "silent")
        .await
        .unwrap();

    let waiter = {
        let query_client = query_client.clone();
        tokio::spawn(async move { query_client.query(7, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    client.set_blocking(false);

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("query must not hang")
        .unwrap();
    assert_eq!(result, Err(CommError::Cancelled));

    // New blocking calls are refused until blocking is re-enabled.
    assert_eq!(
        query_client.query(8, Duration::from_millis(50)).await,
        Err(CommError::Cancelled)
    );
    client.set_blocking(true);
    query_client.set_blocking(false);
    assert_eq!(
        query_client.query(9, Duration::from_millis(50)).await,
        Err(CommError::Cancelled)
    );
}

#[tokio::test]
async fn test_server_shutdown_fails_pending_and_later_queries() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    let query_server = server.query_server::<u32, u32>("silent").unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let parked_clone = parked.clone();
    query_server
        .subject()
        .register(handler_fn(move |input: &QueryServerInput<u32, u32>| {
            parked_clone.lock().push(input.clone())
        }));

    let query_client = client
        .connected_query_client::<u32, u32>("base", "silent")
        .await
        .unwrap();
    let waiter = {
        let query_client = query_client.clone();
        tokio::spawn(async move { query_client.query(7, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    query_server.shutdown().await.unwrap();
    let pending = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("query must not hang")
        .unwrap();
    assert!(pending.is_err());

    assert_eq!(
        query_client.query(8, Duration::from_millis(50)).await,
        Err(CommError::NotConnected)
    );
    assert!(!query_client.is_connected());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_request_under_overflow_fails_query() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    let query_server = server.query_server::<u32, u32>("slow").unwrap();
    let id = query_server.register_handler(query_handler_fn(|request: &u32| {
        std::thread::sleep(Duration::from_millis(100));
        Ok(*request)
    }));
    query_server
        .subject()
        .decorate_active_queue(id, QueueConfig::new(1, OverflowPolicy::RejectNew))
        .unwrap();

    let query_client = client
        .connected_query_client::<u32, u32>("base", "slow")
        .await
        .unwrap();

    let first = query_client.query_request(1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = query_client.query_request(2).await.unwrap();
    let third = query_client.query_request(3).await.unwrap();

    let third_result = query_client
        .query_receive_wait(third, Duration::from_secs(1))
        .await;
    assert_eq!(third_result, Err(CommError::QueryFailed(QueryFailure::Dropped)));

    assert_eq!(
        query_client
            .query_receive_wait(first, Duration::from_secs(1))
            .await,
        Ok(1)
    );
    assert_eq!(
        query_client
            .query_receive_wait(second, Duration::from_secs(1))
            .await,
        Ok(2)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_congested_link_query_times_out_at_caller_deadline() {
    let naming = InMemoryNamingService::shared();
    let mut config = CommConfig::testing();
    config.query.channel_capacity = 1;
    config.query.default_timeout_ms = 1_000;
    let server = Component::builder("base")
        .with_config(config.clone())
        .with_naming(naming.clone())
        .build()
        .unwrap();
    let client = Component::builder("planner")
        .with_config(config)
        .with_naming(naming.clone())
        .build()
        .unwrap();

    let query_server = server.query_server::<u32, u32>("slow").unwrap();
    query_server.register_handler(query_handler_fn(|request: &u32| {
        std::thread::sleep(Duration::from_millis(400));
        Ok(*request)
    }));
    let query_client = client
        .connected_query_client::<u32, u32>("base", "slow")
        .await
        .unwrap();

    // One request inside the handler, one filling the link.
    query_client.query_request(1).await.unwrap();
    while query_server.received() < 1 {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    query_client.query_request(2).await.unwrap();

    let started = Instant::now();
    let result = query_client.query(3, Duration::from_millis(50)).await;

    assert!(matches!(result, Err(CommError::Timeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[tokio::test(flavor = "current_thread")]
async fn test_slow_handler_does_not_stall_single_threaded_runtime() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    let query_server = server.query_server::<u32, u32>("slow").unwrap();
    query_server.register_handler(query_handler_fn(|request: &u32| {
        std::thread::sleep(Duration::from_millis(500));
        Ok(*request)
    }));
    let query_client = client
        .connected_query_client::<u32, u32>("base", "slow")
        .await
        .unwrap();

    let started = Instant::now();
    let result = query_client.query(3, Duration::from_millis(50)).await;

    assert!(matches!(result, Err(CommError::Timeout { .. })));
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[tokio::test]
async fn test_server_shutdown_clears_pending_requests() {
    let naming = InMemoryNamingService::shared();
    let server = component("base", &naming);
    let client = component("planner", &naming);

    let query_server = server.query_server::<u32, u32>("silent").unwrap();
    let parked = Arc::new(Mutex::new(Vec::new()));
    let parked_clone = parked.clone();
    query_server
        .subject()
        .register(handler_fn(move |input: &QueryServerInput<u32, u32>| {
            parked_clone.lock().push(input.clone())
        }));

    let query_client = client
        .connected_query_client::<u32, u32>("base", "silent")
        .await
        .unwrap();
    let first = query_client.query_request(1).await.unwrap();
    query_client.query_request(2).await.unwrap();
    assert_eq!(query_client.pending_count(), 2);

    query_server.shutdown().await.unwrap();

    assert_eq!(
        query_client.query(3, Duration::from_millis(50)).await,
        Err(CommError::NotConnected)
    );
    assert_eq!(query_client.pending_count(), 0);
    assert_eq!(
        query_client.query_receive_wait(first, Duration::from_millis(50)).await,
        Err(CommError::WrongId(first.value()))
    );
}
