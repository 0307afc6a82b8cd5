use std::env;
use std::time::Duration;

use anyhow::Result;
use prodcon::{
    Consume, Consumer, ConsumerConfig, MessagePipe, Produce, Producer, RunState, Runner,
    WorkArgs, WorkerCallbacks, WorkerConfig, WorkerHost,
};
use tokio::time::sleep;

const NAMES: [&str; 2] = ["mary", "james"];

/// Greets on behalf of whoever is named by the `tag` argument.
struct Greeter;

impl WorkerCallbacks for Greeter {
    type Context = String;
    type State = ();
    type Message = ();

    fn on_start(_state: &mut RunState<()>, _pipe: &mut MessagePipe<()>, args: &WorkArgs) -> Result<String> {
        args.get_as("tag")
    }
}

impl Produce for Greeter {
    type Output = String;

    fn work(
        tag: &mut String,
        _state: &mut RunState<()>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<String> {
        Ok(format!("message from {tag}"))
    }
}

struct Printer;

impl WorkerCallbacks for Printer {
    type Context = ();
    type State = ();
    type Message = ();
}

impl Consume for Printer {
    type Item = String;
    type Output = ();

    fn work(
        items: Vec<String>,
        _context: &mut (),
        _state: &mut RunState<()>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<()> {
        for item in items {
            println!("{item}");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "warn");
    }
    prodcon::init_tracing();

    if WorkerHost::new()
        .producer::<Greeter>()
        .consumer::<Printer>()
        .serve_if_requested()
        .await?
    {
        return Ok(());
    }

    let consumer = Consumer::<Printer>::new(
        ConsumerConfig::builder()
            .name("printer")
            .work_timeout(Duration::ZERO)
            .queue_capacity(16)
            .build()?,
        (),
    );

    let mut runner = Runner::new();
    for name in NAMES {
        let mut producer = Producer::<Greeter>::new(
            WorkerConfig::builder()
                .name(name)
                .work_timeout_secs(1.0)
                .work_args(WorkArgs::new().kwarg("tag", name))
                .forward_results(false)
                .build()?,
            (),
        );
        producer.add_subscriber(consumer.get_work_queue())?;
        runner.add_producer(producer);
    }
    runner.add_consumer(consumer);

    runner.start().await?;
    sleep(Duration::from_secs(5)).await;
    runner.stop().await
}
