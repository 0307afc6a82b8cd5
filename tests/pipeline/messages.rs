use std::time::Duration;

use crate::support::{
    helpers::{init_tracing, producer_config, wait_until},
    workers::{Echo, Recorder, StopNotifier},
};
use anyhow::Result;
use prodcon::{Lifecycle, Producer};
use serde_json::{json, Value};
use tokio::time::sleep;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn on_stop_messages_reach_the_controller_before_join_returns() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<(), String>::default();
    let mut producer =
        Producer::<StopNotifier, _>::new(producer_config("notifier", Duration::from_millis(10)), hooks.clone());

    producer.start()?;
    sleep(Duration::from_millis(50)).await;
    producer.stop().await?;

    assert_eq!(hooks.messages(), vec!["stopped".to_string()]);
    assert!(producer.telemetry().snapshot().messages_delivered >= 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn messages_round_trip_in_order() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<(), Value>::default();
    let mut producer = Producer::<Echo, _>::new(producer_config("echo", Duration::from_millis(5)), hooks.clone());

    let err = producer.send_message(json!({"n": 0})).unwrap_err();
    assert!(format!("{err}").contains("never been started"));
    assert!(producer.message_sender().is_none());

    producer.start()?;
    producer.send_message(json!({"n": 1}))?;
    let sender = producer.message_sender().expect("sender of the active run");
    sender.send(json!({"n": 2}))?;

    wait_until("both replies", Duration::from_secs(2), || hooks.message_count() == 2).await?;
    assert_eq!(
        hooks.messages(),
        vec![
            json!({"echo": {"n": 1}, "seen": 1}),
            json!({"echo": {"n": 2}, "seen": 2}),
        ]
    );

    producer.send_message(json!({"cmd": "stop"}))?;
    producer.join().await?;
    assert_eq!(producer.lifecycle(), Lifecycle::Terminated);

    let err = producer.send_message(json!({"n": 3})).unwrap_err();
    assert!(format!("{err}").contains("run has ended"));
    assert!(sender.send(json!({"n": 4})).is_err());
    Ok(())
}
