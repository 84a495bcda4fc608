mod common;

use common::{client, connected, eventually, fast_policy, MockBroker, MockTransport};
use resilient_amqp::options;
use resilient_amqp::{ConnectionManager, ConnectionState, Exchange, RabbitMQError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn reconnects_with_a_new_generation_after_a_drop() {
    let broker = MockBroker::new();
    let client = client(&broker, vec![]);
    connected(&client).await;
    assert_eq!(client.connection().generation(), Some(1));

    broker.drop_connection();

    assert!(
        eventually(Duration::from_secs(2), || client.connection().generation() == Some(2)).await
    );
    assert_eq!(broker.dials(), 2);
}

#[tokio::test]
async fn current_channel_moves_to_the_new_generation() {
    let broker = MockBroker::new();
    let client = client(&broker, vec![]);
    connected(&client).await;
    assert_eq!(client.current_channel().await.unwrap().generation, 1);

    broker.drop_connection();
    assert!(
        eventually(Duration::from_secs(2), || client.connection().generation() == Some(2)).await
    );
    assert_eq!(client.current_channel().await.unwrap().generation, 2);
}

#[tokio::test]
async fn keeps_dialing_until_the_broker_accepts() {
    let broker = MockBroker::new();
    broker.fail_next_dials(3);
    let client = client(&broker, vec![]);

    connected(&client).await;
    assert_eq!(broker.dials(), 4);
    assert_eq!(client.connection().generation(), Some(1));
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let broker = MockBroker::new();
    broker.refuse_all(true);
    let manager: ConnectionManager<MockTransport> =
        ConnectionManager::connect(broker.dialer(), fast_policy().with_max_attempts(3));

    let mut states = manager.watch();
    let exhausted = tokio::time::timeout(
        Duration::from_secs(2),
        states.wait_for(|s| matches!(s, ConnectionState::Exhausted { .. })),
    )
    .await
    .is_ok();
    assert!(exhausted);

    assert_eq!(broker.dials(), 3);
    match manager.channel().await {
        Err(RabbitMQError::ReconnectExhausted { attempts }) => assert_eq!(attempts, 3),
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn publish_fails_fast_without_wait() {
    let broker = MockBroker::new();
    broker.refuse_all(true);
    let client = client(&broker, vec![]);

    let err = client
        .publish(&Exchange::direct("jobs"), "run", &"payload", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::NotConnected), "{err:?}");
    assert!(err.is_transient());
}

#[tokio::test]
async fn waiting_publish_times_out() {
    let broker = MockBroker::new();
    broker.refuse_all(true);
    let client = client(
        &broker,
        vec![options::wait_connection(true, Duration::from_millis(50))],
    );

    let started = tokio::time::Instant::now();
    let err = client
        .publish(&Exchange::direct("jobs"), "run", &"payload", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, RabbitMQError::TimeoutError(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn waiting_publish_succeeds_once_the_broker_recovers() {
    let broker = MockBroker::new();
    broker.fail_next_dials(2);
    let client = client(
        &broker,
        vec![options::wait_connection(true, Duration::from_secs(2))],
    );

    tokio_test::assert_ok!(
        client
            .publish(&Exchange::direct("jobs"), "run", &"payload", 0)
            .await
    );
    assert_eq!(broker.published().len(), 1);
}

#[tokio::test]
async fn cancelling_the_context_interrupts_a_wait() {
    let broker = MockBroker::new();
    broker.refuse_all(true);
    let token = CancellationToken::new();
    let client = client(
        &broker,
        vec![
            options::wait_connection(true, Duration::from_secs(30)),
            options::context(token.clone()),
        ],
    );

    let publisher = client.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish(&Exchange::direct("jobs"), "run", &"payload", 0)
            .await
    });
    tokio::time::sleep(Duration::from_millis(30)).await;
    token.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), pending)
        .await
        .expect("publish did not return after cancellation")
        .unwrap();
    assert!(matches!(result, Err(RabbitMQError::Cancelled)), "{result:?}");
    assert!(
        eventually(Duration::from_secs(1), || client.connection().is_closed()).await
    );
}

#[tokio::test]
async fn close_is_idempotent_and_final() {
    let broker = MockBroker::new();
    let client = client(&broker, vec![]);
    connected(&client).await;

    client.close().await;
    client.close().await;

    assert!(client.connection().is_closed());
    assert!(matches!(
        client.connection().channel().await,
        Err(RabbitMQError::ConnectionClosed)
    ));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(broker.dials(), 1);
}

#[tokio::test]
async fn lost_resolves_when_the_generation_changes() {
    let broker = MockBroker::new();
    let client = client(&broker, vec![]);
    connected(&client).await;

    let conn = client.connection().clone();
    let lost = tokio::spawn(async move { conn.lost(1).await });
    broker.drop_connection();

    assert!(tokio::time::timeout(Duration::from_secs(1), lost).await.is_ok());
}

#[tokio::test]
async fn waiting_publish_right_after_a_drop_lands_on_the_new_generation() {
    let broker = MockBroker::new();
    let client = client(
        &broker,
        vec![options::wait_connection(true, Duration::from_secs(2))],
    );
    connected(&client).await;

    broker.drop_connection();
    tokio_test::assert_ok!(
        client
            .publish(&Exchange::direct("jobs"), "run", &"payload", 0)
            .await
    );
    assert_eq!(broker.published().len(), 1);
    assert_eq!(client.connection().generation(), Some(2));
    assert_eq!(client.current_channel().await.unwrap().generation, 2);
}

#[tokio::test]
async fn channel_on_a_dropped_link_is_not_connected() {
    let broker = MockBroker::new();
    let client = client(&broker, vec![]);
    connected(&client).await;

    broker.drop_connection();
    match client.connection().channel().await {
        Err(RabbitMQError::NotConnected) => {}
        Ok(live) => assert_eq!(live.generation, 2),
        Err(other) => panic!("expected NotConnected, got {other:?}"),
    }
}
