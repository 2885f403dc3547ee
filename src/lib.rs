//! Siphon: an adaptive metric-collection daemon. Providers pull or receive
//! data, collectors schedule when it's evaluated, writers deliver it
//! (queued, batched, backed by an on-disk backlog), and a performance
//! governor throttles whichever provider is slow or failing. An in-process
//! event bus and named, mergeable state objects let components react to
//! each other without a central scheduler.

pub mod build;
pub mod bus;
#[cfg(feature = "cli")]
pub mod cli;
pub mod collector;
pub mod config;
pub mod context;
pub mod error;
pub mod expr;
pub mod logging;
pub mod perf;
pub mod perf_csv;
pub mod provider;
pub mod registry;
pub mod runtime;
pub mod scope;
pub mod state;
pub mod testutil;
pub mod value;
pub mod writer;

pub use context::AppContext;
pub use error::{Error, Result};
pub use runtime::{Supervisor, TerminationSignal, WorkerComponent};
