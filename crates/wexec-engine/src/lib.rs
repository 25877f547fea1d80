#![forbid(unsafe_code)]

//! The worker-based task executor: a client-side dispatch engine that sends
//! tasks to remote workers over a message bus, tracks them through a small
//! state machine, demultiplexes responses back to per-request promises, and
//! times out requests whose workers fall silent.
//!
//! [`WorkerTaskExecutor`] is the entry point; [`transport::Transport`] is the
//! only piece an embedder is expected to swap out for a real message bus.

mod dispatcher;
mod envelope;
mod executor;
mod maintenance;
mod registry;
mod request;
mod transport;
mod worker_finder;

pub use dispatcher::ResponseDispatcher;
pub use envelope::{
    Action, Envelope, EnvelopeBody, NotifyBody, NotifyResponseBody, RequestBody, ResponseBody,
};
pub use executor::{ExecutorConfig, WorkerTaskExecutor};
pub use maintenance::MaintenanceTick;
pub use registry::RequestRegistry;
pub use request::{Notifier, Outcome, ProgressCallback, Registration, Request, RequestState};
pub use transport::{
    BoxFuture, Handler, HandlerTable, InProcessBus, InProcessTransport, OnWait, RetryOptions,
    Transport,
};
pub use worker_finder::{WorkerDescriptor, WorkerFinder};
