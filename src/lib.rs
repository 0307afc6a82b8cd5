pub mod channel;
pub mod consumer;
pub mod host;
pub mod producer;
pub mod queue;
pub mod runtime;
pub mod worker;

pub use channel::{channel_pair, ChannelClosed, Endpoint, MessagePipe, MessageSender};
pub use consumer::{Consume, Consumer};
pub use host::WorkerHost;
pub use producer::{Produce, Producer};
pub use queue::{put_in_queue, BatchBuffer, PushOutcome, WorkQueue};
pub use runtime::config::{
    ConsumerConfig, ConsumerConfigBuilder, ConsumerConfigParams, HostCommand, WorkerConfig,
    WorkerConfigBuilder, WorkerConfigParams,
};
pub use runtime::runner::{Managed, Runner};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use worker::{
    CallbackError, CallbackStage, Lifecycle, Payload, RunState, WorkArgs, WorkerCallbacks,
    WorkerEvent, WorkerExit, WorkerHooks,
};
