use std::env;
use std::time::Duration;

use anyhow::Result;
use prodcon::{
    Consume, Consumer, ConsumerConfig, MessagePipe, Produce, Producer, RunState, WorkArgs,
    WorkerCallbacks, WorkerConfig, WorkerHooks, WorkerHost,
};
use tokio::sync::Notify;
use tokio::time::sleep;

const RESET: &str = "reset";
const LIMIT: u64 = 5;

/// Counts up, restarting from zero on `reset`, and tells the controller once
/// the count passes the limit.
struct ResettableCount;

impl WorkerCallbacks for ResettableCount {
    type Context = ();
    type State = u64;
    type Message = String;
}

impl Produce for ResettableCount {
    type Output = u64;

    fn work(
        _context: &mut (),
        state: &mut RunState<u64>,
        pipe: &mut MessagePipe<String>,
        _args: &WorkArgs,
    ) -> Result<u64> {
        if pipe.poll() && pipe.try_recv().as_deref() == Some(RESET) {
            **state = 0;
        }

        let number = **state;
        **state += 1;
        if number > LIMIT {
            pipe.send(format!("reached {LIMIT}"))?;
        }
        Ok(number)
    }
}

struct Watcher {
    limit_reached: Notify,
}

impl WorkerHooks<u64, String> for Watcher {
    fn on_message_ready(&self, message: String) {
        println!("worker says: {message}");
        self.limit_reached.notify_one();
    }
}

struct Printer;

impl WorkerCallbacks for Printer {
    type Context = ();
    type State = ();
    type Message = ();
}

impl Consume for Printer {
    type Item = u64;
    type Output = ();

    fn work(
        items: Vec<u64>,
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
        .producer::<ResettableCount>()
        .consumer::<Printer>()
        .serve_if_requested()
        .await?
    {
        return Ok(());
    }

    let mut consumer = Consumer::<Printer>::new(
        ConsumerConfig::builder()
            .name("printer")
            .work_timeout_secs(2.0)
            .max_buffer_size(1_000)
            .build()?,
        (),
    );
    let mut producer = Producer::<ResettableCount, _>::new(
        WorkerConfig::builder()
            .name("counter")
            .work_timeout_secs(1.0)
            .forward_results(false)
            .build()?,
        Watcher {
            limit_reached: Notify::new(),
        },
    );
    producer.add_subscriber(consumer.get_work_queue())?;

    consumer.start()?;
    producer.start()?;

    sleep(Duration::from_secs(4)).await;
    println!("resetting...");
    producer.send_message(RESET.to_string())?;

    producer.hooks().limit_reached.notified().await;
    println!("exiting");

    producer.stop().await?;
    consumer.drain().await
}
