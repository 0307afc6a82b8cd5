use std::time::Duration;

use crate::support::{
    helpers::{host, init_tracing, wait_until},
    workers::{Counter, Doomed, Faulty, Recorder, Stepper, Vanishing},
};
use anyhow::Result;
use prodcon::{CallbackError, CallbackStage, Lifecycle, Producer, WorkArgs, WorkerConfig, WorkerExit};
use tokio::time::sleep;

fn forwarding(name: &str, work_timeout: Duration, work_args: WorkArgs) -> WorkerConfig {
    WorkerConfig::builder()
        .name(name)
        .work_timeout(work_timeout)
        .work_args(work_args)
        .host(host())
        .build()
        .expect("valid config")
}

fn failure_args(stage: &str, after: u64) -> WorkArgs {
    WorkArgs::new().kwarg("fail", stage).kwarg("after", after)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_begins_with_fresh_state() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<u64>::default();
    let mut producer = Producer::<Counter, _>::new(
        forwarding("restartable", Duration::from_millis(2), WorkArgs::new()),
        hooks.clone(),
    );

    producer.start()?;
    wait_until("first run results", Duration::from_secs(2), || hooks.result_count() >= 3).await?;
    producer.stop().await?;
    assert_eq!(producer.lifecycle(), Lifecycle::Terminated);
    let first_run = hooks.result_count();

    producer.start()?;
    assert_eq!(producer.lifecycle(), Lifecycle::Running);
    wait_until("second run results", Duration::from_secs(2), || {
        hooks.result_count() >= first_run + 3
    })
    .await?;
    producer.stop().await?;

    let results = hooks.results();
    assert_eq!(results[0], 0);
    assert_eq!(results[first_run], 0, "state is recreated for every run");
    assert_eq!(hooks.exits(), vec![WorkerExit::Completed, WorkerExit::Completed]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn work_failure_ends_the_run_after_cleanup() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<u64, String>::default();
    let mut producer = Producer::<Faulty, _>::new(
        forwarding("faulty", Duration::from_millis(2), WorkArgs::new()),
        hooks.clone(),
    );

    producer.start_new(failure_args("work", 3))?;
    let err = producer.join().await.unwrap_err();
    let failure = err
        .downcast_ref::<CallbackError>()
        .expect("callback failures surface as CallbackError");
    assert_eq!(failure.stage(), CallbackStage::Work);
    assert_eq!(failure.worker(), "faulty");
    assert!(format!("{err:#}").contains("sensor offline"));

    assert_eq!(hooks.results(), vec![1, 2, 3]);
    assert_eq!(hooks.messages(), vec!["cleanup after 3 calls".to_string()]);
    assert_eq!(hooks.errors().len(), 1);
    assert_eq!(hooks.exits(), vec![WorkerExit::Failed(CallbackStage::Work)]);
    assert_eq!(producer.lifecycle(), Lifecycle::Terminated);
    assert_eq!(producer.telemetry().failures(), 1);

    producer.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn start_failure_skips_work_and_on_stop() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<u64, String>::default();
    let mut producer = Producer::<Faulty, _>::new(
        forwarding("broken", Duration::from_millis(2), WorkArgs::new()),
        hooks.clone(),
    );

    producer.start_new(failure_args("start", 0))?;
    let err = producer.join().await.unwrap_err();
    let failure = err.downcast_ref::<CallbackError>().expect("callback failure");
    assert_eq!(failure.stage(), CallbackStage::Start);

    assert!(hooks.results().is_empty());
    assert!(hooks.messages().is_empty());
    assert_eq!(hooks.exits(), vec![WorkerExit::Failed(CallbackStage::Start)]);
    assert_eq!(producer.telemetry().work_calls(), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panics_in_work_are_reported_as_failures() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<u64, String>::default();
    let mut producer = Producer::<Faulty, _>::new(
        forwarding("panicky", Duration::from_millis(2), WorkArgs::new()),
        hooks.clone(),
    );

    producer.start_new(failure_args("panic", 1))?;
    let err = producer.join().await.unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("sensor returned garbage"), "got {message}");
    assert_eq!(hooks.errors()[0].0, CallbackStage::Work);
    assert_eq!(hooks.messages(), vec!["cleanup after 1 calls".to_string()]);
    assert_eq!(hooks.exits(), vec![WorkerExit::Failed(CallbackStage::Work)]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_the_handle_stops_the_run() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<u64>::default();
    let mut producer = Producer::<Counter, _>::new(
        forwarding("dropped", Duration::from_millis(2), WorkArgs::new()),
        hooks.clone(),
    );
    producer.start()?;
    wait_until("some results", Duration::from_secs(2), || hooks.result_count() > 0).await?;

    drop(producer);
    wait_until("the run exits", Duration::from_secs(2), || !hooks.exits().is_empty()).await?;
    assert_eq!(hooks.exits(), vec![WorkerExit::Completed]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panicking_teardown_is_an_unexpected_exit() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<()>::default();
    let mut producer = Producer::<Doomed, _>::new(
        forwarding("doomed", Duration::from_millis(5), WorkArgs::new()),
        hooks.clone(),
    );
    producer.start()?;
    sleep(Duration::from_millis(20)).await;

    let err = producer.stop().await.unwrap_err();
    assert!(format!("{err}").contains("terminated unexpectedly"));
    assert_eq!(hooks.exits(), vec![WorkerExit::Unexpected]);
    assert_eq!(producer.lifecycle(), Lifecycle::Terminated);

    producer.start()?;
    producer.stop().await.unwrap_err();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_process_exit_leaves_the_controller_running() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<u64>::default();
    let mut producer = Producer::<Vanishing, _>::new(
        forwarding("vanishing", Duration::from_millis(2), WorkArgs::new().kwarg("after", 2)),
        hooks.clone(),
    );

    producer.start()?;
    let err = producer.join().await.unwrap_err();
    assert!(format!("{err}").contains("terminated unexpectedly"), "got {err}");
    assert_eq!(hooks.results(), vec![0, 1]);
    assert_eq!(hooks.exits(), vec![WorkerExit::Unexpected]);
    assert_eq!(producer.lifecycle(), Lifecycle::Terminated);
    assert!(producer.send_message(()).is_err(), "the run's message feed is closed");

    producer.start()?;
    producer.join().await.unwrap_err();
    assert_eq!(hooks.exits(), vec![WorkerExit::Unexpected, WorkerExit::Unexpected]);
    assert_eq!(hooks.results(), vec![0, 1, 0, 1], "a fresh process starts from scratch");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn call_time_args_merge_over_configured_ones() -> Result<()> {
    init_tracing();
    let hooks = Recorder::<(i64, usize)>::default();
    let configured = WorkArgs::new().arg("configured").kwarg("step", 2);
    let mut producer = Producer::<Stepper, _>::new(
        forwarding("stepper", Duration::from_millis(2), configured),
        hooks.clone(),
    );

    producer.start_new(WorkArgs::new().arg("extra").kwarg("step", 5))?;
    wait_until("two results", Duration::from_secs(2), || hooks.result_count() >= 2).await?;
    producer.stop().await?;
    let overridden = hooks.results();
    assert_eq!(overridden[..2], [(0, 2), (5, 2)]);

    producer.start()?;
    wait_until("two more results", Duration::from_secs(2), || {
        hooks.result_count() >= overridden.len() + 2
    })
    .await?;
    producer.stop().await?;
    let configured_only = &hooks.results()[overridden.len()..];
    assert_eq!(configured_only[..2], [(0, 1), (2, 1)]);
    Ok(())
}
