//! Stage handlers, the Worker runtime, and the Dispatcher that drives an
//! Image through the pipeline end to end.

pub mod clients;
pub mod dispatcher;
pub mod handlers;
pub mod worker;

pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use handlers::cleanup::{CleanupHandler, CleanupReport};
pub use handlers::manual_resolve::{ManualResolveHandler, ResolveAction};
pub use handlers::{HandlerOutcome, StageHandler};
pub use worker::{Worker, WorkerConfig};
