//! Integration tests for the event pattern
//!
//! The server side fires whenever the published state exceeds the activation
//! parameter, and the event carries the state that fired it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use commkit_runtime::{
    event_handler_fn, event_test_fn, ClientPattern, CommConfig, CommError, Component,
    ConnectionError, EventId, EventMode, EventStatus, EventTestHandler, InMemoryNamingService,
    NamingService, ServerPattern,
};
use parking_lot::Mutex;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_millis(200);

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

fn above_threshold() -> Arc<dyn EventTestHandler<u32, u32, u32>> {
    event_test_fn(|threshold: &mut u32, state: &u32| (*state > *threshold).then_some(*state))
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
async fn test_connection_lifecycle() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component
        .event_server("battery", above_threshold())
        .unwrap();
    let client = client_component.event_client::<u32, u32>().unwrap();

    assert!(matches!(
        client.get_event(EventId::new(1), WAIT).await,
        Err(CommError::NotConnected)
    ));

    client.connect("base", "battery").await.unwrap();
    assert!(matches!(
        client.get_event(EventId::new(99), WAIT).await,
        Err(CommError::WrongId(99))
    ));
    let id = client.activate(EventMode::Continuous, 0).await.unwrap();
    assert_eq!(server.activation_count(), 1);

    client.disconnect().await.unwrap();
    assert_eq!(server.activation_count(), 0);
    assert!(server.connected_clients().is_empty());
    assert!(matches!(
        client.get_event(id, WAIT).await,
        Err(CommError::NotConnected)
    ));
    assert!(matches!(client.try_event(id), Err(CommError::NotConnected)));
    assert!(matches!(
        client.activate(EventMode::Single, 0).await,
        Err(CommError::NotConnected)
    ));

    client.connect("base", "battery").await.unwrap();
    let id = client.activate(EventMode::Continuous, 0).await.unwrap();
    server.shutdown().await.unwrap();
    assert!(matches!(
        client.get_event(id, WAIT).await,
        Err(CommError::NotConnected)
    ));
    assert!(!client.is_connected());
    assert_eq!(client.active_count(), 0);

    let reconnect = client.connect("base", "battery").await;
    assert!(matches!(
        reconnect,
        Err(CommError::Connection(ConnectionError::ServiceUnavailable { .. }))
    ));
}

#[tokio::test]
async fn test_single_and_continuous_activations() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component
        .event_server("battery", above_threshold())
        .unwrap();
    let client = client_component
        .connected_event_client::<u32, u32>("base", "battery")
        .await
        .unwrap();

    let continuous = client.activate(EventMode::Continuous, 0).await.unwrap();
    let single = client.activate(EventMode::Single, 0).await.unwrap();
    let high = client.activate(EventMode::Continuous, 3).await.unwrap();
    assert_eq!(server.activation_count(), 3);

    assert_eq!(server.put(&1), 2);
    assert_eq!(client.try_event(single).unwrap(), EventStatus::Fired);
    assert_eq!(client.get_event(continuous, WAIT).await.unwrap(), 1);
    assert_eq!(client.get_event(single, WAIT).await.unwrap(), 1);
    assert_eq!(client.try_event(continuous).unwrap(), EventStatus::Active);
    assert_eq!(client.try_event(single).unwrap(), EventStatus::Passive);
    assert_eq!(client.try_event(high).unwrap(), EventStatus::Active);
    assert_eq!(server.activation_count(), 2);

    for state in [2, 3, 4] {
        server.put(&state);
    }
    assert_eq!(client.get_event(continuous, WAIT).await.unwrap(), 4);
    assert_eq!(client.get_event(high, WAIT).await.unwrap(), 4);
    assert!(matches!(
        client.get_event(single, WAIT).await,
        Err(CommError::EventConsumed(_))
    ));

    assert_ok!(client.deactivate(continuous));
    assert_ok!(client.deactivate(single));
    assert_err!(client.deactivate(single));
    server.put(&5);
    assert!(matches!(client.try_event(continuous), Err(CommError::WrongId(_))));
    assert!(matches!(client.try_event(single), Err(CommError::WrongId(_))));
    assert_eq!(client.get_event(high, WAIT).await.unwrap(), 5);
    assert_eq!(server.activation_count(), 1);
    assert_eq!(server.fired(), 7);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_waiting_for_the_next_event() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component
        .event_server("battery", above_threshold())
        .unwrap();
    let client = client_component
        .connected_event_client::<u32, u32>("base", "battery")
        .await
        .unwrap();
    let id = client.activate(EventMode::Continuous, 0).await.unwrap();

    // A pending event does not satisfy a wait for the next one.
    server.put(&1);
    assert!(matches!(
        client.get_next_event(id, Duration::from_millis(50)).await,
        Err(CommError::Timeout { .. })
    ));

    let publisher = {
        let server = server.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            server.put(&7);
        })
    };
    assert_eq!(client.get_next_event(id, Duration::from_secs(1)).await.unwrap(), 7);
    publisher.await.unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.get_event(id, Duration::from_secs(1)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    client.deactivate(id).unwrap();
    assert!(matches!(
        waiter.await.unwrap(),
        Err(CommError::NotActivated(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_server_shutdown_wakes_waiters() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component
        .event_server("battery", above_threshold())
        .unwrap();
    let client = client_component
        .connected_event_client::<u32, u32>("base", "battery")
        .await
        .unwrap();
    let id = client.activate(EventMode::Single, 10).await.unwrap();

    let waiter = {
        let client = client.clone();
        tokio::spawn(async move { client.get_event(id, Duration::from_secs(5)).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    server_component.shutdown().await.unwrap();

    let result = tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter must wake")
        .unwrap();
    assert!(matches!(result, Err(CommError::NotConnected)));
    assert!(!client.is_connected());
    assert_eq!(server.put(&11), 0);
}

#[tokio::test]
async fn test_blocking_disabled_cancels_waits() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let _server = server_component
        .event_server("battery", above_threshold())
        .unwrap();
    let client = client_component
        .connected_event_client::<u32, u32>("base", "battery")
        .await
        .unwrap();
    let id = client.activate(EventMode::Continuous, 0).await.unwrap();

    client.set_blocking(false);
    assert!(matches!(
        client.get_event(id, WAIT).await,
        Err(CommError::Cancelled)
    ));
    client.set_blocking(true);
    assert!(matches!(
        client.get_event(id, Duration::from_millis(20)).await,
        Err(CommError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_fired_events_reach_handlers() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component
        .event_server("battery", above_threshold())
        .unwrap();
    let client = client_component
        .connected_event_client::<u32, u32>("base", "battery")
        .await
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let handler_seen = seen.clone();
    client.register_handler(event_handler_fn(move |id: EventId, event: &u32| {
        handler_seen.lock().push((id, *event))
    }));

    let low = client.activate(EventMode::Continuous, 0).await.unwrap();
    let high = client.activate(EventMode::Single, 2).await.unwrap();
    for state in [1, 3, 5] {
        server.put(&state);
    }

    wait_for(|| seen.lock().len() == 4).await;
    assert_eq!(
        *seen.lock(),
        vec![(low, 1), (low, 3), (high, 3), (low, 5)]
    );
}

#[tokio::test]
async fn test_activation_hook_sees_every_parameter() {
    struct Recording {
        params: Mutex<Vec<u32>>,
        checks: AtomicUsize,
    }

    impl EventTestHandler<u32, u32, u32> for Recording {
        fn test_event(&self, threshold: &mut u32, state: &u32) -> Option<u32> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            (*state > *threshold).then_some(*state)
        }

        fn on_activation(&self, param: &u32) {
            self.params.lock().push(*param);
        }
    }

    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let handler = Arc::new(Recording {
        params: Mutex::new(Vec::new()),
        checks: AtomicUsize::new(0),
    });
    let server = server_component
        .event_server::<u32, u32, u32>("battery", handler.clone())
        .unwrap();
    let client = client_component
        .connected_event_client::<u32, u32>("base", "battery")
        .await
        .unwrap();

    client.activate(EventMode::Continuous, 4).await.unwrap();
    client.activate(EventMode::Single, 9).await.unwrap();
    assert_eq!(*handler.params.lock(), vec![4, 9]);

    server.put(&5);
    assert_eq!(handler.checks.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_component_shutdown_closes_event_patterns() {
    let naming = InMemoryNamingService::shared();
    let (server_component, client_component) = pair(&naming);
    let server = server_component
        .event_server("battery", above_threshold())
        .unwrap();
    let client = client_component
        .connected_event_client::<u32, u32>("base", "battery")
        .await
        .unwrap();
    client.activate(EventMode::Continuous, 0).await.unwrap();

    let report = client_component.shutdown().await.unwrap();
    assert!(report.is_clean());
    assert_eq!(report.patterns_closed, 1);
    assert!(!client.is_connected());
    assert_eq!(server.activation_count(), 0);
    assert!(client.subject().is_empty());
}
