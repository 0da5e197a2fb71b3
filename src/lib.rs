pub mod alarm;
pub mod config;
pub mod error;
pub mod executor;
pub mod fsm;
pub mod instance;
pub mod machines;
pub mod scheduler;
pub mod server;
pub mod storage;

pub use error::{Error, Result};
pub use executor::{ExecuteResult, Executor, ExecutorOptions};
pub use fsm::{ActionInvocation, FsmDefinition, Machine, Transition};
