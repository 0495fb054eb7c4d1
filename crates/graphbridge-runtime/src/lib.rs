pub mod accumulator;
pub mod batcher;
pub mod binding;
pub mod config;
pub mod executor;
pub mod instance;
pub mod lifecycle;
pub mod marshal;
pub mod request;
pub mod scheduler;
pub mod splitter;
pub mod stats;
pub mod worker;
pub mod worker_model;

pub use accumulator::*;
pub use batcher::*;
pub use binding::*;
pub use config::*;
pub use executor::*;
pub use instance::*;
pub use lifecycle::*;
pub use marshal::*;
pub use request::*;
pub use scheduler::*;
pub use splitter::*;
pub use stats::*;
pub use worker::*;
pub use worker_model::*;
