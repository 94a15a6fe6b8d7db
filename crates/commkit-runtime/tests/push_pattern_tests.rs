//! Integration tests for the push pattern
//!
//! Two components share one naming service; the server side owns a push
//! server whose handlers record what they receive.

use std::sync::{mpsc, Arc};
use std::time::Duration;

use commkit_runtime::{
    handler_fn, ClientPattern, CommConfig, CommError, Component, ConnectionError,
    InMemoryNamingService, NamingService, OverflowPolicy, QueueConfig, ServerPattern,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use tokio_test::{assert_err, assert_ok};

fn pair(naming: &Arc<dyn NamingService>) -> (Component, Component) {
    let server = Component::builder("base")
        .with_config(CommConfig::testing())
        .with_naming(naming.clone())
        .build()
        .expect("server component");
    let client = Component::builder("planner")
        .with_config(CommConfig::testing())
        .with_naming(naming.clone())
        .build()
        .expect("client component");
    (server, client)
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_handler_observes_items_in_send_order() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);

    let server = server_component.push_server::<u32>("odometry").unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    server.register_handler(handler_fn(move |value: &u32| {
        seen_clone.lock().push(*value)
    }));

    let client = client_component
        .connected_push_client::<u32>("base", "odometry")
        .await
        .unwrap();
    for value in [1, 2, 3] {
        client.send(value).await.unwrap();
    }

    wait_for(|| seen.lock().len() == 3).await;
    assert_eq!(*seen.lock(), vec![1, 2, 3]);
    assert_eq!(server.received(), 3);
}

#[tokio::test]
async fn test_every_handler_sees_every_item() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);

    let server = server_component.push_server::<String>("events").unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));
    for tag in ["first", "second"] {
        let log = log.clone();
        server.register_handler(handler_fn(move |value: &String| {
            log.lock().push(format!("{tag}:{value}"))
        }));
    }

    let client = client_component
        .connected_push_client::<String>("base", "events")
        .await
        .unwrap();
    client.send("a".to_string()).await.unwrap();
    client.send("b".to_string()).await.unwrap();

    wait_for(|| log.lock().len() == 4).await;
    assert_eq!(
        *log.lock(),
        vec!["first:a", "second:a", "first:b", "second:b"]
    );
}

#[tokio::test]
async fn test_unbound_send_is_not_connected() {
    let naming = InMemoryNamingService::shared();
    let (_server_component, client_component) = pair(&naming);

    let client = client_component.push_client::<u32>().unwrap();
    assert!(!client.is_connected());
    assert_eq!(client.send(1).await, Err(CommError::NotConnected));
}

#[tokio::test]
async fn test_connect_failures_are_reported() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let _server = server_component.push_server::<u32>("odometry").unwrap();
    let client = client_component.push_client::<u32>().unwrap();

    assert!(matches!(
        client.connect("arm", "joints").await,
        Err(CommError::Connection(ConnectionError::UnknownComponent { .. }))
    ));
    assert!(matches!(
        client.connect("base", "laser").await,
        Err(CommError::Connection(ConnectionError::ServiceUnavailable { .. }))
    ));

    let wrong_type = client_component.push_client::<String>().unwrap();
    assert!(matches!(
        wrong_type.connect("base", "odometry").await,
        Err(CommError::Connection(ConnectionError::IncompatibleService { .. }))
    ));
    assert!(!client.is_connected());
    assert!(!wrong_type.is_connected());
}

#[tokio::test]
async fn test_port_already_used() {
    let naming = InMemoryNamingService::shared();
    let (server_component, _client_component) = pair(&naming);
    let _server = server_component.push_server::<u32>("odometry").unwrap();

    let duplicate = server_component.push_server::<u32>("odometry");
    assert!(matches!(
        duplicate,
        Err(CommError::Connection(ConnectionError::PortAlreadyUsed { .. }))
    ));
}

#[tokio::test]
async fn test_disconnect_and_reconnect() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let first = server_component.push_server::<u32>("first").unwrap();
    let second = server_component.push_server::<u32>("second").unwrap();

    let client = client_component
        .connected_push_client::<u32>("base", "first")
        .await
        .unwrap();
    assert_eq!(first.connected_clients(), vec![client.id()]);

    // Connecting again re-binds.
    assert_ok!(client.connect("base", "second").await);
    assert!(first.connected_clients().is_empty());
    assert_eq!(second.connected_clients(), vec![client.id()]);

    assert_ok!(client.disconnect().await);
    assert_ok!(client.disconnect().await);
    assert!(second.connected_clients().is_empty());
    assert_err!(client.send(1).await);
}

#[tokio::test]
async fn test_server_shutdown_disconnects_clients() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component.push_server::<u32>("odometry").unwrap();
    let client = client_component
        .connected_push_client::<u32>("base", "odometry")
        .await
        .unwrap();

    server.shutdown().await.unwrap();
    assert_eq!(client.send(1).await, Err(CommError::NotConnected));
    assert!(!client.is_connected());
    assert!(naming.services().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_active_queue_handler_on_push_server() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component.push_server::<u32>("odometry").unwrap();

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let id = server.register_handler(handler_fn(move |value: &u32| {
        tx.lock().send(*value).unwrap();
    }));
    let queue = server
        .subject()
        .decorate_active_queue(id, QueueConfig::new(32, OverflowPolicy::Block))
        .unwrap();

    let client = client_component
        .connected_push_client::<u32>("base", "odometry")
        .await
        .unwrap();
    for value in 0..10 {
        client.send(value).await.unwrap();
    }

    let received: Vec<u32> = tokio::task::spawn_blocking(move || {
        (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect()
    })
    .await
    .unwrap();
    assert_eq!(received, (0..10).collect::<Vec<_>>());

    server.subject().deregister(id).await.unwrap();
    assert!(!queue.worker_alive());
    assert_eq!(queue.buffered(), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_push_preserves_send_order(values in proptest::collection::vec(any::<u16>(), 0..64)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let seen = runtime.block_on(async {
            let naming = InMemoryNamingService::shared();
            let (server_component, client_component) = pair(&naming);
            let server = server_component.push_server::<u16>("stream").unwrap();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let seen_clone = seen.clone();
            server.register_handler(handler_fn(move |value: &u16| {
                seen_clone.lock().push(*value)
            }));

            let client = client_component
                .connected_push_client::<u16>("base", "stream")
                .await
                .unwrap();
            for value in &values {
                client.send(*value).await.unwrap();
            }
            let expected = values.len();
            wait_for(|| seen.lock().len() == expected).await;
            let result = seen.lock().clone();
            result
        });
        prop_assert_eq!(seen, values);
    }
}
