use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use prodcon::{
    Consume, Consumer, ConsumerConfig, MessagePipe, Produce, Producer, RunState, Runner,
    WorkArgs, WorkerCallbacks, WorkerConfig, WorkerHooks, WorkerHost,
};
use tokio::time::sleep;

const DEFAULT_LOG_DIRECTIVE: &str = "info";
const DEFAULT_PRODUCER_MS: u64 = 250;
const DEFAULT_CONSUMER_MS: u64 = 1_000;
const DEFAULT_MAX_BUFFER: usize = 1_000;

struct Count;

impl WorkerCallbacks for Count {
    type Context = ();
    type State = u64;
    type Message = ();
}

impl Produce for Count {
    type Output = u64;

    fn work(
        _context: &mut (),
        state: &mut RunState<u64>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<u64> {
        let next = **state;
        **state += 1;
        Ok(next)
    }
}

struct Describe;

impl WorkerCallbacks for Describe {
    type Context = ();
    type State = ();
    type Message = ();
}

impl Consume for Describe {
    type Item = u64;
    type Output = String;

    fn work(
        items: Vec<u64>,
        _context: &mut (),
        _state: &mut RunState<()>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<String> {
        Ok(format!("got {items:?} from producer"))
    }
}

struct Print;

impl WorkerHooks<String, ()> for Print {
    fn on_result_ready(&self, result: String) {
        println!("{result}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_example_tracing();

    if WorkerHost::new()
        .producer::<Count>()
        .consumer::<Describe>()
        .serve_if_requested()
        .await?
    {
        return Ok(());
    }

    let producer_ms = parse_env_with_default("PRODCON_PRODUCER_MS", DEFAULT_PRODUCER_MS)?;
    let consumer_ms = parse_env_with_default("PRODCON_CONSUMER_MS", DEFAULT_CONSUMER_MS)?;
    let max_buffer = parse_env_with_default("PRODCON_MAX_BUFFER", DEFAULT_MAX_BUFFER)?;
    let run_secs = parse_env_with_default::<u64>("PRODCON_RUN_SECS", 0)?;

    let consumer = Consumer::<Describe, _>::new(
        ConsumerConfig::builder()
            .name("describe")
            .work_timeout(Duration::from_millis(consumer_ms))
            .max_buffer_size(max_buffer)
            .build()?,
        Print,
    );
    let mut producer = Producer::<Count>::new(
        WorkerConfig::builder()
            .name("count")
            .work_timeout(Duration::from_millis(producer_ms))
            .forward_results(false)
            .build()?,
        (),
    );
    producer.add_subscriber(consumer.get_work_queue())?;

    let mut runner = Runner::new().with_metrics();
    runner.add_consumer(consumer).add_producer(producer);

    if run_secs > 0 {
        let token = runner.cancellation_token();
        tokio::spawn(async move {
            sleep(Duration::from_secs(run_secs)).await;
            token.cancel();
        });
    }

    runner.run_until_ctrl_c().await
}

fn init_example_tracing() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", DEFAULT_LOG_DIRECTIVE);
    }
    prodcon::init_tracing();
}

fn parse_env_with_default<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} must be a valid value, got `{raw}`")),
        Err(_) => Ok(default),
    }
}
