#![no_std]

#![cfg_attr(
    not(test),
    deny(
        clippy::panic,
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::todo,
        clippy::unimplemented,
        clippy::indexing_slicing,
        clippy::string_slice,
        clippy::arithmetic_side_effects,
        clippy::panicking_unwrap,
        clippy::out_of_bounds_indexing,
        clippy::panic_in_result_fn,
        clippy::unwrap_in_result,
    )
)]
#![cfg_attr(not(test), warn(clippy::missing_panics_doc))]

#[macro_use]
mod fmt;

use bot_machine::{
    Bot, CompiledProgram, DebugTrap, ExecutionContext, ExecutionError, MoveDelta, Position,
    DEFAULT_STACK_SIZE,
};
use heapless::Vec;
use thiserror_no_std::Error;

pub const DEFAULT_WIDTH: i32 = 20;
pub const DEFAULT_HEIGHT: i32 = 10;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorldError {
    #[error("the world has no room for another bot")]
    TooManyBots,
    #[error("no bot with id {0}")]
    UnknownBot(usize),
    #[error("position is outside the world")]
    OutOfBounds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BotId(pub(crate) usize);

impl BotId {
    pub fn new(index: usize) -> Self {
        BotId(index)
    }

    pub fn value(&self) -> usize {
        self.0
    }
}

/// The grid bots live on, `0..width` by `0..height`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounds {
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, position: Position) -> bool {
        (0..self.width).contains(&position.x) && (0..self.height).contains(&position.y)
    }
}

impl Default for Bounds {
    fn default() -> Self {
        Self::new(DEFAULT_WIDTH, DEFAULT_HEIGHT)
    }
}

/// What happened to one bot during a world step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotOutcome {
    /// The tick finished, the delta was applied. `MoveDelta::NONE` when the bot stayed put.
    Moved(MoveDelta),
    /// The tick finished but the move would have left the world.
    Blocked(MoveDelta),
    Failed(ExecutionError),
}

impl BotOutcome {
    pub fn error(&self) -> Option<&ExecutionError> {
        match self {
            BotOutcome::Failed(error) => Some(error),
            _ => None,
        }
    }
}

/// Per bot results of one `World::step`, indexed like the bots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport<const BOT_CAP: usize> {
    tick: u64,
    outcomes: Vec<BotOutcome, BOT_CAP>,
}

impl<const BOT_CAP: usize> TickReport<BOT_CAP> {
    fn new(tick: u64) -> Self {
        Self {
            tick,
            outcomes: Vec::new(),
        }
    }

    /// Zero based number of the step this report belongs to.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn outcomes(&self) -> &[BotOutcome] {
        self.outcomes.as_slice()
    }

    pub fn outcome(&self, id: BotId) -> Option<&BotOutcome> {
        self.outcomes.get(id.0)
    }

    pub fn failures(&self) -> impl Iterator<Item = (BotId, &ExecutionError)> + '_ {
        self.outcomes
            .iter()
            .enumerate()
            .filter_map(|(index, outcome)| Some((BotId(index), outcome.error()?)))
    }
}

/// Owns the bots and advances them one tick at a time.
///
/// A step first runs every bot against the world as it was, then applies the
/// moves. One bot failing never stops the others, its error is recorded in the
/// report and its memory is left as the failed tick wrote it.
pub struct World<const BOT_CAP: usize, const STACK_SIZE: usize = DEFAULT_STACK_SIZE> {
    bounds: Bounds,
    bots: Vec<Bot, BOT_CAP>,
    tick: u64,
}

impl<const BOT_CAP: usize, const STACK_SIZE: usize> World<BOT_CAP, STACK_SIZE> {
    pub fn new(bounds: Bounds) -> Self {
        Self {
            bounds,
            bots: Vec::new(),
            tick: 0,
        }
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    /// Number of steps run so far.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    pub fn add_bot(
        &mut self,
        program: &CompiledProgram,
        position: Position,
    ) -> Result<BotId, WorldError> {
        if !self.bounds.contains(position) {
            return Err(WorldError::OutOfBounds);
        }
        if self.bots.is_full() {
            return Err(WorldError::TooManyBots);
        }
        let id = BotId(self.bots.len());
        self.bots
            .push(Bot::new(program, position))
            .map_err(|_| WorldError::TooManyBots)?;
        debug!("bot {} added at {} {}", id.0, position.x, position.y);
        Ok(id)
    }

    pub fn bot(&self, id: BotId) -> Result<&Bot, WorldError> {
        self.bots.get(id.0).ok_or(WorldError::UnknownBot(id.0))
    }

    pub fn bot_mut(&mut self, id: BotId) -> Result<&mut Bot, WorldError> {
        self.bots.get_mut(id.0).ok_or(WorldError::UnknownBot(id.0))
    }

    pub fn bots(&self) -> &[Bot] {
        self.bots.as_slice()
    }

    pub fn step(&mut self) -> TickReport<BOT_CAP> {
        self.step_with_trap(&mut ())
    }

    /// Like `step`, with `trap` receiving every `DEBUG` instruction of every bot.
    pub fn step_with_trap<T: DebugTrap>(&mut self, trap: &mut T) -> TickReport<BOT_CAP> {
        let mut report = TickReport::new(self.tick);
        let mut context = ExecutionContext::<STACK_SIZE>::new();

        for (index, bot) in self.bots.iter_mut().enumerate() {
            trace!("tick {} bot {}", self.tick, index);
            let outcome = match bot.run_tick(&mut context, trap) {
                Ok(delta) => BotOutcome::Moved(delta),
                Err(error) => {
                    warn!(
                        "bot {} failed at {} opcode {}",
                        index,
                        error.address(),
                        error.opcode().map(|op| op.value()).unwrap_or(u32::MAX)
                    );
                    BotOutcome::Failed(error)
                }
            };
            // Same capacity as the bot list.
            let _ = report.outcomes.push(outcome);
        }

        for (index, (bot, outcome)) in self
            .bots
            .iter_mut()
            .zip(report.outcomes.iter_mut())
            .enumerate()
        {
            let BotOutcome::Moved(delta) = *outcome else {
                continue;
            };
            if delta.is_none() {
                continue;
            }
            match bot.position().offset(delta) {
                Some(position) if self.bounds.contains(position) => {
                    bot.set_position(position);
                    debug!("bot {} moved to {} {}", index, position.x, position.y);
                }
                _ => *outcome = BotOutcome::Blocked(delta),
            }
        }

        self.tick = self.tick.wrapping_add(1);
        report
    }
}

impl<const BOT_CAP: usize, const STACK_SIZE: usize> Default for World<BOT_CAP, STACK_SIZE> {
    fn default() -> Self {
        Self::new(Bounds::default())
    }
}
