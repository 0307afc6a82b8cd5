use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use prodcon::{ConsumerConfig, HostCommand, WorkerConfig};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_names(true)
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Worker processes re-run this test binary, limited to the `worker_host`
/// entry point.
pub fn host() -> HostCommand {
    HostCommand::current_exe().args(["worker_host", "--exact", "--quiet", "--test-threads", "1"])
}

/// Polls `condition` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until<F>(what: &str, timeout: Duration, mut condition: F) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    loop {
        if condition() {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("{what} did not happen within {timeout:?}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

pub fn producer_config(name: &str, work_timeout: Duration) -> WorkerConfig {
    WorkerConfig::builder()
        .name(name)
        .work_timeout(work_timeout)
        .forward_results(false)
        .host(host())
        .build()
        .expect("valid producer config")
}

pub fn consumer_config(
    name: &str,
    work_timeout: Duration,
    max_buffer_size: usize,
    queue_capacity: usize,
) -> ConsumerConfig {
    ConsumerConfig::builder()
        .name(name)
        .work_timeout(work_timeout)
        .max_buffer_size(max_buffer_size)
        .queue_capacity(queue_capacity)
        .host(host())
        .build()
        .expect("valid consumer config")
}

pub fn assert_is_contiguous(values: &[u64]) {
    for window in values.windows(2) {
        if let [lhs, rhs] = window {
            assert_eq!(rhs, &(lhs + 1), "values must increase by one: {values:?}");
        }
    }
}
