//! Small reference machines used by the binary and the test suite.

mod counter;
mod microwave;

pub use counter::{Counter, TRIPLE_DELAY_MS};
pub use microwave::{
    Command, Direction, Microwave, MicrowaveInput, MicrowaveOutput, MicrowaveState, Mode,
    PowerLevel, TICK_MS, TimerAdjustment,
};
