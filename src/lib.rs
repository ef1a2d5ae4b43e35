pub mod bus;
pub mod config;
pub mod discovery;
pub mod engine;
pub mod error;
pub mod power;
pub mod scheduler;

pub use config::Config;
pub use engine::{ConsumptionEngine, PowerInputs, TickOutcome};
pub use error::{AppError, Result};
pub use power::ConsumptionResult;
