//! Runtime infrastructure - the tasks that find balances and sweep them
//!
//! - `locks`: per-asset processing locks with a stale sweep
//! - `sequencer`: nonce owner and FIFO drain, one submission in flight
//! - `worker`: the submission state machine for a single transfer
//! - `watcher`: event subscriptions and balance polling feeding the queue

mod locks;
mod sequencer;
mod watcher;
mod worker;

pub use locks::{HeldLock, LockGuard, LockTable};
pub use sequencer::{Job, JobRunner, NonceHandoff, Sequencer, SequencerSnapshot, Trigger};
pub use watcher::Watcher;
pub use worker::{classify, ErrorClass, TransferOutcome, TransferWorker, WorkerSettings};
