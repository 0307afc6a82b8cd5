use std::time::Duration;

use crate::support::{
    helpers::{assert_is_contiguous, consumer_config, host, init_tracing, producer_config, wait_until},
    workers::{flatten, Batches, Counter, Faulty, Recorder},
};
use anyhow::{Context, Result};
use prodcon::{CallbackError, CallbackStage, Consumer, Producer, Runner, WorkArgs, WorkerConfig};
use tokio::time::{sleep, timeout};

const HOUR: Duration = Duration::from_secs(3_600);

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumers_start_first_and_flush_on_stop() -> Result<()> {
    init_tracing();
    let results = Recorder::<Vec<u64>>::default();
    let consumer = Consumer::<Batches, _>::new(consumer_config("sink", HOUR, 1_000, 1_000), results.clone());
    let queue = consumer.get_work_queue();

    let mut producer = Producer::<Counter>::new(producer_config("counter", Duration::from_millis(1)), ());
    producer.add_subscriber(queue.clone())?;
    let producer_telemetry = producer.telemetry();

    let mut runner = Runner::new();
    runner.add_producer(producer).add_consumer(consumer);
    runner.start().await?;
    assert!(runner.is_started());
    assert!(queue.is_ready());

    wait_until("twenty work calls", Duration::from_secs(5), || {
        producer_telemetry.work_calls() >= 20
    })
    .await?;
    runner.stop().await?;
    assert!(!runner.is_started());

    let batches = results.results();
    assert_eq!(batches.len(), 1, "everything queued is flushed in one final call");
    let items = flatten(&batches);
    assert_eq!(items.first(), Some(&0));
    assert!(items.len() >= 20);
    assert_is_contiguous(&items);
    assert!(!queue.is_ready());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_failure_surfaces_from_stop() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<u64, String>::default();
    let config = WorkerConfig::builder()
        .name("flaky")
        .work_timeout(Duration::from_millis(2))
        .work_args(WorkArgs::new().kwarg("fail", "work").kwarg("after", 2))
        .host(host())
        .build()?;
    let producer = Producer::<Faulty, _>::new(config, hooks.clone());

    let mut runner = Runner::new();
    runner.add_producer(producer);
    runner.start().await?;
    wait_until("the failing run exits", Duration::from_secs(2), || !hooks.exits().is_empty()).await?;

    let err = runner.stop().await.expect_err("failure should surface from stop");
    let failure = err
        .downcast_ref::<CallbackError>()
        .context("expected a callback failure")?;
    assert_eq!(failure.stage(), CallbackStage::Work);
    assert_eq!(failure.worker(), "flaky");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failed_start_unwinds_started_workers() -> Result<()> {
    init_tracing();
    let consumer = Consumer::<Batches>::new(consumer_config("sink", HOUR, 4, 16), ());
    let queue = consumer.get_work_queue();

    let mut producer = Producer::<Counter>::new(producer_config("early", Duration::from_millis(5)), ());
    producer.add_subscriber(queue.clone())?;
    producer.start()?;

    let mut runner = Runner::new();
    runner.add_consumer(consumer).add_producer(producer);
    let err = runner.start().await.expect_err("the producer is already running");
    assert!(format!("{err}").contains("is running"), "got {err}");
    assert!(!runner.is_started());
    assert!(!queue.is_ready(), "the consumer started first was stopped again");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn run_until_ctrl_c_returns_once_the_token_is_cancelled() -> Result<()> {
    init_tracing();
    let results = Recorder::<Vec<u64>>::default();
    let consumer = Consumer::<Batches, _>::new(
        consumer_config("sink", Duration::from_millis(20), 16, 64),
        results.clone(),
    );
    let mut producer = Producer::<Counter>::new(producer_config("counter", Duration::from_millis(5)), ());
    producer.add_subscriber(consumer.get_work_queue())?;

    let mut runner = Runner::new().with_metrics_interval(Duration::from_millis(20));
    runner.add_consumer(consumer).add_producer(producer);

    let token = runner.cancellation_token();
    tokio::spawn(async move {
        sleep(Duration::from_millis(150)).await;
        token.cancel();
    });

    timeout(Duration::from_secs(5), runner.run_until_ctrl_c())
        .await
        .context("runner should stop after cancellation")??;
    assert!(!runner.is_started());

    let items = flatten(&results.results());
    assert_eq!(items.first(), Some(&0));
    assert_is_contiguous(&items);

    assert!(!runner.cancellation_token().is_cancelled(), "a fresh token is armed");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn consumer_at_twice_the_period_sees_pairs() -> Result<()> {
    init_tracing();
    let results = Recorder::<Vec<u64>>::default();
    let consumer = Consumer::<Batches, _>::new(
        consumer_config("pairs", Duration::from_millis(60), 1_000, 1_000),
        results.clone(),
    );
    let mut producer = Producer::<Counter>::new(producer_config("ticks", Duration::from_millis(30)), ());
    producer.add_subscriber(consumer.get_work_queue())?;

    let mut runner = Runner::new();
    runner.add_consumer(consumer).add_producer(producer);
    runner.start().await?;
    wait_until("five batches", Duration::from_secs(5), || results.result_count() >= 5).await?;
    runner.stop().await?;

    let batches = results.results();
    let items = flatten(&batches);
    assert_eq!(items.first(), Some(&0));
    assert_is_contiguous(&items);

    let steady = &batches[1..batches.len() - 1];
    assert!(
        steady.iter().all(|batch| batch.len() <= 4),
        "batches follow the two-to-one cadence: {batches:?}"
    );
    assert!(steady.iter().any(|batch| batch.len() == 2), "{batches:?}");
    Ok(())
}
