pub mod buffer;
pub mod work_queue;

pub use buffer::BatchBuffer;
pub use work_queue::{put_in_queue, PushOutcome, WorkQueue};
