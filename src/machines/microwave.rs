use crate::{
    Result,
    fsm::{ActionInvocation, ActionTable, Machine, Transition},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

/// Countdown granularity while running.
pub const TICK_MS: u64 = 1_000;

const MAX_TIMER: u32 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Mode {
    Stopped,
    Paused,
    Running,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PowerLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MicrowaveState {
    pub mode: Mode,
    pub power_level: PowerLevel,
    /// Remaining seconds.
    pub timer: u32,
}

impl Default for MicrowaveState {
    fn default() -> Self {
        Self {
            mode: Mode::Stopped,
            power_level: PowerLevel::Medium,
            timer: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerAdjustment {
    pub direction: Direction,
    pub adjustment: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Command {
    PowerUp,
    PowerDown,
    Start,
    Stop,
    Tick,
}

/// Either a timer adjustment object or a bare command string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MicrowaveInput {
    Adjust(TimerAdjustment),
    Command(Command),
}

impl MicrowaveInput {
    pub fn up(adjustment: u32) -> Self {
        Self::Adjust(TimerAdjustment {
            direction: Direction::Up,
            adjustment,
        })
    }

    pub fn down(adjustment: u32) -> Self {
        Self::Adjust(TimerAdjustment {
            direction: Direction::Down,
            adjustment,
        })
    }
}

impl From<Command> for MicrowaveInput {
    fn from(command: Command) -> Self {
        Self::Command(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MicrowaveOutput {
    Chime,
    Beep,
}

type Step = Transition<MicrowaveState, MicrowaveInput, MicrowaveOutput>;

#[derive(Debug, Clone, Copy, Default)]
pub struct Microwave;

impl Machine for Microwave {
    type State = MicrowaveState;
    type Input = MicrowaveInput;
    type Output = MicrowaveOutput;

    fn initial_state(&self) -> MicrowaveState {
        MicrowaveState::default()
    }

    fn transition(&self, state: &MicrowaveState, input: &MicrowaveInput) -> Result<Step> {
        Ok(match state.mode {
            Mode::Stopped => stopped(state, input),
            Mode::Paused => paused(state, input),
            Mode::Running => running(state, input),
        })
    }

    fn actions(&self) -> ActionTable<MicrowaveInput> {
        ActionTable::new()
            .with_fn("start", start_heating)
            .with_fn("stop", stop_heating)
    }
}

fn beep(state: &MicrowaveState) -> Step {
    Transition::to(state.clone()).emit(MicrowaveOutput::Beep)
}

fn tick_later(step: Step) -> Step {
    step.after(TICK_MS, Command::Tick.into())
}

fn start(state: &MicrowaveState) -> Step {
    if state.timer == 0 {
        return beep(state);
    }
    let running = MicrowaveState {
        mode: Mode::Running,
        ..state.clone()
    };
    tick_later(Transition::to(running).invoke(ActionInvocation::new("start")))
}

fn stopped(state: &MicrowaveState, input: &MicrowaveInput) -> Step {
    match input {
        MicrowaveInput::Adjust(TimerAdjustment {
            direction,
            adjustment,
        }) => {
            let timer = match direction {
                Direction::Up => state.timer.saturating_add(*adjustment).min(MAX_TIMER),
                Direction::Down => state.timer.saturating_sub(*adjustment),
            };
            Transition::to(MicrowaveState {
                timer,
                ..state.clone()
            })
        }
        MicrowaveInput::Command(Command::PowerDown) => {
            let power_level = match state.power_level {
                PowerLevel::High => PowerLevel::Medium,
                _ => PowerLevel::Low,
            };
            Transition::to(MicrowaveState {
                power_level,
                ..state.clone()
            })
        }
        MicrowaveInput::Command(Command::PowerUp) => {
            let power_level = match state.power_level {
                PowerLevel::Low => PowerLevel::Medium,
                _ => PowerLevel::High,
            };
            Transition::to(MicrowaveState {
                power_level,
                ..state.clone()
            })
        }
        MicrowaveInput::Command(Command::Start) => start(state),
        MicrowaveInput::Command(Command::Stop) => Transition::to(MicrowaveState::default()),
        MicrowaveInput::Command(Command::Tick) => beep(state),
    }
}

fn paused(state: &MicrowaveState, input: &MicrowaveInput) -> Step {
    match input {
        MicrowaveInput::Command(Command::Stop) => Transition::to(MicrowaveState {
            mode: Mode::Stopped,
            ..state.clone()
        }),
        MicrowaveInput::Command(Command::Start) => start(state),
        _ => beep(state),
    }
}

fn running(state: &MicrowaveState, input: &MicrowaveInput) -> Step {
    match input {
        MicrowaveInput::Command(Command::Stop) => Transition::to(MicrowaveState {
            mode: Mode::Paused,
            ..state.clone()
        })
        .invoke(ActionInvocation::new("stop")),
        MicrowaveInput::Command(Command::Tick) => {
            let timer = state.timer.saturating_sub(1);
            if timer == 0 {
                Transition::to(MicrowaveState {
                    mode: Mode::Stopped,
                    power_level: state.power_level,
                    timer: 0,
                })
                .emit(MicrowaveOutput::Chime)
                .invoke(ActionInvocation::new("stop"))
            } else {
                tick_later(Transition::to(MicrowaveState {
                    timer,
                    ..state.clone()
                }))
            }
        }
        // Anything else is refused, but the countdown keeps going.
        _ => tick_later(beep(state)),
    }
}

async fn start_heating(_argument: Option<Value>) -> Result<Option<MicrowaveInput>> {
    info!("🔥 Starting to micro all the waves");
    Ok(None)
}

async fn stop_heating(_argument: Option<Value>) -> Result<Option<MicrowaveInput>> {
    info!("🧊 Stopping to micro all the waves");
    Ok(None)
}
