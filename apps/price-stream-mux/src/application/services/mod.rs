//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `Multiplexer`: Public facade; interest bookkeeping and session hooks
//! - `BatchScheduler`: Coalesces interest changes into wire instructions
//! - `Dispatcher`: Routes decoded ticks to price callbacks
//! - `CallbackRegistry`: Panic-isolated fan-out shared by both callback kinds

pub mod callbacks;
pub mod dispatcher;
pub mod multiplexer;
pub mod scheduler;

pub use callbacks::{Callback, CallbackHandle, CallbackRegistry, DispatchOutcome};
pub use dispatcher::{DispatchStats, Dispatcher};
pub use multiplexer::{Multiplexer, MultiplexerError, MultiplexerStats};
pub use scheduler::{BatchScheduler, SchedulerStats};
