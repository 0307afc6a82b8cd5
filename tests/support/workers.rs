//! Worker types shared by the pipeline scenarios.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use prodcon::{
    CallbackError, CallbackStage, Consume, MessagePipe, Produce, RunState, WorkArgs,
    WorkerCallbacks, WorkerExit, WorkerHooks, WorkerHost,
};
use serde_json::{json, Value};

/// Emits 0, 1, 2, ... restarting from 0 on every run.
pub struct Counter;

impl WorkerCallbacks for Counter {
    type Context = ();
    type State = u64;
    type Message = ();
}

impl Produce for Counter {
    type Output = u64;

    fn work(
        _context: &mut (),
        state: &mut RunState<u64>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<u64> {
        let value = **state;
        **state += 1;
        Ok(value)
    }
}

/// Emits `(tag, seq)`, the tag coming from the `tag` work argument.
pub struct Tagged;

impl WorkerCallbacks for Tagged {
    type Context = u8;
    type State = u64;
    type Message = ();

    fn on_start(_state: &mut RunState<u64>, _pipe: &mut MessagePipe<()>, args: &WorkArgs) -> Result<u8> {
        args.get_as("tag")
    }
}

impl Produce for Tagged {
    type Output = (u8, u64);

    fn work(
        tag: &mut u8,
        state: &mut RunState<u64>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<(u8, u64)> {
        let seq = **state;
        **state += 1;
        Ok((*tag, seq))
    }
}

/// Emits `seq * step` followed by every positional argument count, so tests
/// can check how arguments were merged.
pub struct Stepper;

impl WorkerCallbacks for Stepper {
    type Context = i64;
    type State = i64;
    type Message = ();

    fn on_start(_state: &mut RunState<i64>, _pipe: &mut MessagePipe<()>, args: &WorkArgs) -> Result<i64> {
        args.get_as("step")
    }
}

impl Produce for Stepper {
    type Output = (i64, usize);

    fn work(
        step: &mut i64,
        state: &mut RunState<i64>,
        _pipe: &mut MessagePipe<()>,
        args: &WorkArgs,
    ) -> Result<(i64, usize)> {
        let value = **state * *step;
        **state += 1;
        Ok((value, args.positional().len()))
    }
}

/// Returns every batch it receives unchanged.
pub struct Batches;

impl WorkerCallbacks for Batches {
    type Context = ();
    type State = ();
    type Message = ();
}

impl Consume for Batches {
    type Item = u64;
    type Output = Vec<u64>;

    fn work(
        items: Vec<u64>,
        _context: &mut (),
        _state: &mut RunState<()>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<Vec<u64>> {
        Ok(items)
    }
}

/// Like [`Batches`] for tagged items.
pub struct TaggedBatches;

impl WorkerCallbacks for TaggedBatches {
    type Context = ();
    type State = ();
    type Message = ();
}

impl Consume for TaggedBatches {
    type Item = (u8, u64);
    type Output = Vec<(u8, u64)>;

    fn work(
        items: Vec<(u8, u64)>,
        _context: &mut (),
        _state: &mut RunState<()>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<Vec<(u8, u64)>> {
        Ok(items)
    }
}

/// Consumer whose `work` takes `delay_ms` milliseconds.
pub struct SlowSink;

impl WorkerCallbacks for SlowSink {
    type Context = ();
    type State = ();
    type Message = ();
}

impl Consume for SlowSink {
    type Item = u64;
    type Output = usize;

    fn work(
        items: Vec<u64>,
        _context: &mut (),
        _state: &mut RunState<()>,
        _pipe: &mut MessagePipe<()>,
        args: &WorkArgs,
    ) -> Result<usize> {
        let delay: u64 = args.get_as("delay_ms")?;
        std::thread::sleep(Duration::from_millis(delay));
        Ok(items.len())
    }
}

/// Sends "stopped" to the controller from `on_stop`.
pub struct StopNotifier;

impl WorkerCallbacks for StopNotifier {
    type Context = ();
    type State = ();
    type Message = String;

    fn on_stop(
        _context: &mut (),
        _state: &mut RunState<()>,
        pipe: &mut MessagePipe<String>,
        _args: &WorkArgs,
    ) -> Result<()> {
        pipe.send("stopped".to_string())?;
        Ok(())
    }
}

impl Produce for StopNotifier {
    type Output = ();

    fn work(
        _context: &mut (),
        _state: &mut RunState<()>,
        _pipe: &mut MessagePipe<String>,
        _args: &WorkArgs,
    ) -> Result<()> {
        Ok(())
    }
}

/// Answers every controller message with `{"echo": <message>, "seen": <n>}`.
/// A message `{"cmd": "stop"}` ends the run from inside.
pub struct Echo;

impl WorkerCallbacks for Echo {
    type Context = ();
    type State = u64;
    type Message = Value;
}

impl Produce for Echo {
    type Output = ();

    fn work(
        _context: &mut (),
        state: &mut RunState<u64>,
        pipe: &mut MessagePipe<Value>,
        _args: &WorkArgs,
    ) -> Result<()> {
        for message in pipe.drain() {
            if message == json!({"cmd": "stop"}) {
                state.request_stop();
                continue;
            }
            **state += 1;
            pipe.send(json!({"echo": message, "seen": **state}))?;
        }
        Ok(())
    }
}

/// Fails in the stage named by the `fail` work argument (`start`, `work`,
/// `panic`), after `after` successful work calls. Reports cleanup through
/// the message pipe from `on_stop`.
pub struct Faulty;

impl WorkerCallbacks for Faulty {
    type Context = u64;
    type State = u64;
    type Message = String;

    fn on_start(_state: &mut RunState<u64>, _pipe: &mut MessagePipe<String>, args: &WorkArgs) -> Result<u64> {
        if args.get_as::<String>("fail")? == "start" {
            bail!("cannot open device");
        }
        args.get_as("after")
    }

    fn on_stop(
        _context: &mut u64,
        state: &mut RunState<u64>,
        pipe: &mut MessagePipe<String>,
        _args: &WorkArgs,
    ) -> Result<()> {
        pipe.send(format!("cleanup after {} calls", **state))?;
        Ok(())
    }
}

impl Produce for Faulty {
    type Output = u64;

    fn work(
        after: &mut u64,
        state: &mut RunState<u64>,
        _pipe: &mut MessagePipe<String>,
        args: &WorkArgs,
    ) -> Result<u64> {
        if **state >= *after {
            match args.get_as::<String>("fail")?.as_str() {
                "panic" => panic!("sensor returned garbage"),
                _ => bail!("sensor offline"),
            }
        }
        **state += 1;
        Ok(**state)
    }
}

/// Every worker type the scenarios start.
pub fn host() -> WorkerHost {
    WorkerHost::new()
        .producer::<Counter>()
        .producer::<Tagged>()
        .producer::<Stepper>()
        .producer::<StopNotifier>()
        .producer::<Echo>()
        .producer::<Faulty>()
        .producer::<Doomed>()
        .producer::<Vanishing>()
        .consumer::<Batches>()
        .consumer::<TaggedBatches>()
        .consumer::<SlowSink>()
}

/// State whose destructor panics, killing the worker process after `on_stop`
/// and before the run reports its exit.
#[derive(Default)]
pub struct Bomb;

impl Drop for Bomb {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("run state exploded on teardown");
        }
    }
}

pub struct Doomed;

impl WorkerCallbacks for Doomed {
    type Context = ();
    type State = Bomb;
    type Message = ();
}

impl Produce for Doomed {
    type Output = ();

    fn work(
        _context: &mut (),
        _state: &mut RunState<Bomb>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<()> {
        Ok(())
    }
}

/// Emits 0, 1, ... and ends its whole process with status 7 once `after`
/// values went out.
pub struct Vanishing;

impl WorkerCallbacks for Vanishing {
    type Context = u64;
    type State = u64;
    type Message = ();

    fn on_start(_state: &mut RunState<u64>, _pipe: &mut MessagePipe<()>, args: &WorkArgs) -> Result<u64> {
        args.get_as("after")
    }
}

impl Produce for Vanishing {
    type Output = u64;

    fn work(
        after: &mut u64,
        state: &mut RunState<u64>,
        _pipe: &mut MessagePipe<()>,
        _args: &WorkArgs,
    ) -> Result<u64> {
        if **state >= *after {
            std::process::exit(7);
        }
        let value = **state;
        **state += 1;
        Ok(value)
    }
}

/// Hooks recording everything the monitors deliver.
pub struct Recorder<O, M = ()> {
    inner: Arc<RecorderState<O, M>>,
}

struct RecorderState<O, M> {
    results: Mutex<Vec<O>>,
    messages: Mutex<Vec<M>>,
    errors: Mutex<Vec<(CallbackStage, String)>>,
    exits: Mutex<Vec<WorkerExit>>,
}

impl<O, M> Clone for Recorder<O, M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<O, M> Default for Recorder<O, M> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RecorderState {
                results: Mutex::new(Vec::new()),
                messages: Mutex::new(Vec::new()),
                errors: Mutex::new(Vec::new()),
                exits: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl<O: Clone, M: Clone> Recorder<O, M> {
    pub fn results(&self) -> Vec<O> {
        self.inner.results.lock().unwrap().clone()
    }

    pub fn result_count(&self) -> usize {
        self.inner.results.lock().unwrap().len()
    }

    pub fn messages(&self) -> Vec<M> {
        self.inner.messages.lock().unwrap().clone()
    }

    pub fn message_count(&self) -> usize {
        self.inner.messages.lock().unwrap().len()
    }

    pub fn errors(&self) -> Vec<(CallbackStage, String)> {
        self.inner.errors.lock().unwrap().clone()
    }

    pub fn exits(&self) -> Vec<WorkerExit> {
        self.inner.exits.lock().unwrap().clone()
    }
}

impl<O, M> WorkerHooks<O, M> for Recorder<O, M>
where
    O: Send + 'static,
    M: Send + 'static,
{
    fn on_result_ready(&self, result: O) {
        self.inner.results.lock().unwrap().push(result);
    }

    fn on_message_ready(&self, message: M) {
        self.inner.messages.lock().unwrap().push(message);
    }

    fn on_error(&self, error: &CallbackError) {
        self.inner
            .errors
            .lock()
            .unwrap()
            .push((error.stage(), error.to_string()));
    }

    fn on_exit(&self, exit: &WorkerExit) {
        self.inner.exits.lock().unwrap().push(*exit);
    }
}

/// Flattens consumer batches into one sequence.
pub fn flatten(batches: &[Vec<u64>]) -> Vec<u64> {
    batches.iter().flatten().copied().collect()
}
