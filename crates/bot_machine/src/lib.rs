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

pub mod assembler;


use core::ops::Range;
use heapless::Vec;
use thiserror_no_std::Error;
use variant_count::VariantCount;

pub use assembler::{compile, CompileError, CompileErrorKind, CompiledProgram};

/// This module implements the virtual machine every bot runs once per tick.
///
/// Each bot owns a flat memory of `MEMORY_SIZE` words split in to fixed zones:
/// `
///     0..2000      compiled program
///     2000..3000   system registers, zeroed at the start of every tick
///     3000..4000   storage for auto-assigned symbols
///     4000..4100   protected, reserved for future built-ins
///     4100..10000  free for programs
/// `
/// The compiler and the machine both rely on these constants, the compiler
/// never places code or auto-aliases outside of their zones.
///
/// Every instruction is a single header word followed by its operands. The
/// header packs the opcode in the low 22 bits and a 10 bit modifier above it,
/// `opcode + (modifier << 22)` where the modifier is
/// `(operand_count << 7) | immediate_bits`. Operand `i` is immediate when bit
/// `6 - i` of the modifier is set, otherwise the stored value is an address
/// that is dereferenced once.
pub type Word = i32;

pub type Memory = [Word; MEMORY_SIZE];

pub const MEMORY_SIZE: usize = 10_000;
pub const CODE_ZONE: Range<usize> = 0..2000;
pub const SYSTEM_ZONE: Range<usize> = 2000..3000;
pub const AUTO_ALIAS_ZONE: Range<usize> = 3000..4000;
pub const PROTECTED_ZONE: Range<usize> = 4000..4100;
pub const GENERAL_ZONE: Range<usize> = 4100..MEMORY_SIZE;

pub const CODE_ZONE_SIZE: usize = CODE_ZONE.end - CODE_ZONE.start;
pub const AUTO_ALIAS_ZONE_SIZE: usize = AUTO_ALIAS_ZONE.end - AUTO_ALIAS_ZONE.start;

/// System register the program writes a `Direction` to.
pub const MOVE_ADDRESS: usize = SYSTEM_ZONE.start;

pub const MAX_OPERANDS: usize = 7;
pub const MODIFIER_SHIFT: u32 = 22;
pub const OPERAND_COUNT_SHIFT: u32 = 7;
pub const OPCODE_MASK: u32 = 0x003F_FFFF;
pub const MODIFIER_MASK: u32 = 0x3FF;
pub const IMMEDIATE_MASK: u32 = 0x7F;
const OPERAND_COUNT_MASK: u32 = 0x7;
const FIRST_IMMEDIATE_FLAG: u8 = 0x40;

pub const DEFAULT_STACK_SIZE: usize = 256;

#[repr(u32)]
#[derive(VariantCount, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Ends the tick.
    End,
    Add,
    /// Pushes the first operand minus the second.
    Sub,
    /// One operand: pops the stack in to the operand address.
    /// Two operands: stores the second operand at the first.
    Set,
    /// Pops an address and pushes the word stored there.
    Get,
    Push,
    Jump,
    /// Pops the stack, when it was zero skips the number of words in the first operand.
    If,
    /// Compile time only, never executed.
    Label,
    Equal,
    Greater,
    Lesser,
    GreaterEqual,
    LesserEqual,
    Debug,
}

const OPCODES: [Opcode; Opcode::VARIANT_COUNT] = [
    Opcode::End,
    Opcode::Add,
    Opcode::Sub,
    Opcode::Set,
    Opcode::Get,
    Opcode::Push,
    Opcode::Jump,
    Opcode::If,
    Opcode::Label,
    Opcode::Equal,
    Opcode::Greater,
    Opcode::Lesser,
    Opcode::GreaterEqual,
    Opcode::LesserEqual,
    Opcode::Debug,
];

const MNEMONICS: [(&str, Opcode); 20] = [
    ("END", Opcode::End),
    ("ADD", Opcode::Add),
    ("SUB", Opcode::Sub),
    ("SET", Opcode::Set),
    ("GET", Opcode::Get),
    ("PUSH", Opcode::Push),
    ("JUMP", Opcode::Jump),
    ("IF", Opcode::If),
    ("LABEL", Opcode::Label),
    ("EQUAL", Opcode::Equal),
    ("EQ", Opcode::Equal),
    ("GREATER", Opcode::Greater),
    ("GT", Opcode::Greater),
    ("LESSER", Opcode::Lesser),
    ("LT", Opcode::Lesser),
    ("GREATEREQUAL", Opcode::GreaterEqual),
    ("GE", Opcode::GreaterEqual),
    ("LESSEREQUAL", Opcode::LesserEqual),
    ("LE", Opcode::LesserEqual),
    ("DEBUG", Opcode::Debug),
];

impl Opcode {
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn from_value(value: u32) -> Option<Self> {
        let index = usize::try_from(value).ok()?;
        OPCODES.get(index).copied()
    }

    /// Case-insensitive lookup, accepts the short comparison forms (`EQ`, `GT`, ...).
    pub fn from_mnemonic(token: &str) -> Option<Self> {
        MNEMONICS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(token))
            .map(|(_, op)| *op)
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::End => "END",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Set => "SET",
            Opcode::Get => "GET",
            Opcode::Push => "PUSH",
            Opcode::Jump => "JUMP",
            Opcode::If => "IF",
            Opcode::Label => "LABEL",
            Opcode::Equal => "EQUAL",
            Opcode::Greater => "GREATER",
            Opcode::Lesser => "LESSER",
            Opcode::GreaterEqual => "GREATEREQUAL",
            Opcode::LesserEqual => "LESSEREQUAL",
            Opcode::Debug => "DEBUG",
        }
    }
}

impl From<Opcode> for u32 {
    fn from(op: Opcode) -> u32 {
        op.value()
    }
}

/// Decoded form of an instruction header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub opcode: u32,
    pub operand_count: usize,
    pub immediate_bits: u8,
}

impl Header {
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode: opcode.value(),
            operand_count: 0,
            immediate_bits: 0,
        }
    }

    /// Records one more operand. Returns false once `MAX_OPERANDS` is reached.
    pub fn push_operand(&mut self, immediate: bool) -> bool {
        if self.operand_count >= MAX_OPERANDS {
            return false;
        }
        if immediate {
            self.immediate_bits |= immediate_flag(self.operand_count);
        }
        self.operand_count = self.operand_count.saturating_add(1);
        true
    }

    pub fn is_immediate(&self, index: usize) -> bool {
        index < self.operand_count && self.immediate_bits & immediate_flag(index) != 0
    }

    pub fn modifier(&self) -> u32 {
        let count = u32::try_from(self.operand_count).unwrap_or(u32::MAX) & OPERAND_COUNT_MASK;
        (count.wrapping_shl(OPERAND_COUNT_SHIFT) | u32::from(self.immediate_bits) & IMMEDIATE_MASK)
            & MODIFIER_MASK
    }

    /// Words taken by the header and its operands.
    pub fn width(&self) -> usize {
        self.operand_count.saturating_add(1)
    }

    pub fn encode(&self) -> Word {
        let packed = (self.opcode & OPCODE_MASK) | self.modifier().wrapping_shl(MODIFIER_SHIFT);
        // The modifier may reach bit 31, keep the bit pattern.
        packed as Word
    }

    pub fn decode(word: Word) -> Self {
        let bits = word as u32;
        let modifier = bits.wrapping_shr(MODIFIER_SHIFT) & MODIFIER_MASK;
        let count = modifier.wrapping_shr(OPERAND_COUNT_SHIFT) & OPERAND_COUNT_MASK;
        Self {
            opcode: bits & OPCODE_MASK,
            operand_count: usize::try_from(count).unwrap_or(0),
            immediate_bits: u8::try_from(modifier & IMMEDIATE_MASK).unwrap_or(0),
        }
    }
}

fn immediate_flag(index: usize) -> u8 {
    match u32::try_from(index) {
        Ok(shift) => FIRST_IMMEDIATE_FLAG.checked_shr(shift).unwrap_or(0),
        Err(_) => 0,
    }
}

#[repr(i32)] // Must match Word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up = 1,
    Right = 2,
    Down = 3,
    Left = 4,
}

impl Direction {
    pub fn from_word(word: Word) -> Option<Self> {
        match word {
            1 => Some(Direction::Up),
            2 => Some(Direction::Right),
            3 => Some(Direction::Down),
            4 => Some(Direction::Left),
            _ => None,
        }
    }

    pub fn delta(self) -> MoveDelta {
        match self {
            Direction::Up => MoveDelta { dx: 0, dy: -1 },
            Direction::Right => MoveDelta { dx: 1, dy: 0 },
            Direction::Down => MoveDelta { dx: 0, dy: 1 },
            Direction::Left => MoveDelta { dx: -1, dy: 0 },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveDelta {
    pub dx: i32,
    pub dy: i32,
}

impl MoveDelta {
    pub const NONE: MoveDelta = MoveDelta { dx: 0, dy: 0 };

    /// Unknown values in the move register are ignored.
    pub fn from_move_register(value: Word) -> Self {
        Direction::from_word(value)
            .map(Direction::delta)
            .unwrap_or(Self::NONE)
    }

    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn offset(self, delta: MoveDelta) -> Option<Self> {
        Some(Self {
            x: self.x.checked_add(delta.dx)?,
            y: self.y.checked_add(delta.dy)?,
        })
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("word {word} at address {address} is not an executable opcode")]
    UnknownOpcode { address: usize, word: Word },
    #[error("{opcode:?} at address {address} popped an empty stack")]
    StackUnderflow { address: usize, opcode: Opcode },
    #[error("{opcode:?} at address {address} overflowed the stack")]
    StackOverflow { address: usize, opcode: Opcode },
    #[error("{opcode:?} at address {address} accessed out of bounds memory at {target}")]
    OutOfBoundsAccess {
        address: usize,
        opcode: Opcode,
        target: Word,
    },
}

impl ExecutionError {
    /// Address of the instruction that failed.
    pub fn address(&self) -> usize {
        match self {
            ExecutionError::UnknownOpcode { address, .. }
            | ExecutionError::StackUnderflow { address, .. }
            | ExecutionError::StackOverflow { address, .. }
            | ExecutionError::OutOfBoundsAccess { address, .. } => *address,
        }
    }

    pub fn opcode(&self) -> Option<Opcode> {
        match self {
            ExecutionError::UnknownOpcode { .. } => None,
            ExecutionError::StackUnderflow { opcode, .. }
            | ExecutionError::StackOverflow { opcode, .. }
            | ExecutionError::OutOfBoundsAccess { opcode, .. } => Some(*opcode),
        }
    }
}

/// Called by the `DEBUG` instruction. Execution continues once it returns.
pub trait DebugTrap {
    fn trap(&mut self, address: usize, stack: &[Word], memory: &Memory);
}

impl DebugTrap for () {
    fn trap(&mut self, _address: usize, _stack: &[Word], _memory: &Memory) {}
}

/// Scratch state for a single tick of a single bot.
pub struct ExecutionContext<const STACK_SIZE: usize = DEFAULT_STACK_SIZE> {
    stack: Vec<Word, STACK_SIZE>,
    parameters: [Word; MAX_OPERANDS],
}

impl<const STACK_SIZE: usize> ExecutionContext<STACK_SIZE> {
    pub fn new() -> Self {
        Self {
            stack: Vec::new(),
            parameters: [0; MAX_OPERANDS],
        }
    }

    pub fn reset(&mut self) {
        self.stack.clear();
        self.parameters = [0; MAX_OPERANDS];
    }

    pub fn stack(&self) -> &[Word] {
        self.stack.as_slice()
    }

    fn parameter(&self, index: usize) -> Word {
        self.parameters.get(index).copied().unwrap_or(0)
    }

    fn load_parameters(
        &mut self,
        memory: &Memory,
        address: usize,
        header: &Header,
        opcode: Opcode,
    ) -> Result<(), ExecutionError> {
        self.parameters = [0; MAX_OPERANDS];
        for (index, slot) in self
            .parameters
            .iter_mut()
            .take(header.operand_count)
            .enumerate()
        {
            let at = address
                .checked_add(1)
                .and_then(|first| first.checked_add(index))
                .ok_or(out_of_bounds(address, opcode, Word::MAX))?;
            let raw = match memory.get(at) {
                Some(word) => *word,
                None => return Err(out_of_bounds(address, opcode, usize_to_word(at))),
            };
            *slot = if header.is_immediate(index) {
                raw
            } else {
                read_cell(memory, raw, address, opcode)?
            };
        }
        Ok(())
    }

    fn pop(&mut self, address: usize, opcode: Opcode) -> Result<Word, ExecutionError> {
        self.stack
            .pop()
            .ok_or(ExecutionError::StackUnderflow { address, opcode })
    }

    fn push(&mut self, value: Word, address: usize, opcode: Opcode) -> Result<(), ExecutionError> {
        if self.stack.push(value).is_err() {
            return Err(ExecutionError::StackOverflow { address, opcode });
        }
        Ok(())
    }
}

impl<const STACK_SIZE: usize> Default for ExecutionContext<STACK_SIZE> {
    fn default() -> Self {
        Self::new()
    }
}

/// A bot's private memory and its place in the world.
pub struct Bot {
    memory: Memory,
    position: Position,
}

impl Bot {
    pub fn new(program: &CompiledProgram, position: Position) -> Self {
        let mut bot = Self {
            memory: [0; MEMORY_SIZE],
            position,
        };
        bot.load(program);
        bot
    }

    /// Clears all memory and loads `program` in to the code zone again.
    pub fn reload(&mut self, program: &CompiledProgram) {
        self.memory = [0; MEMORY_SIZE];
        self.load(program);
    }

    fn load(&mut self, program: &CompiledProgram) {
        let words = program.words();
        if let Some(code) = self.memory.get_mut(..words.len()) {
            code.copy_from_slice(words);
        }
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn set_position(&mut self, position: Position) {
        self.position = position;
    }

    /// Runs the program once. The move is returned, not applied.
    pub fn run_tick<const STACK_SIZE: usize, T: DebugTrap>(
        &mut self,
        context: &mut ExecutionContext<STACK_SIZE>,
        trap: &mut T,
    ) -> Result<MoveDelta, ExecutionError> {
        run_tick(&mut self.memory, context, trap)
    }

    pub fn apply_move(&mut self, delta: MoveDelta) {
        if let Some(position) = self.position.offset(delta) {
            self.position = position;
        }
    }

    /// Runs a tick and applies the resulting move.
    pub fn step<const STACK_SIZE: usize, T: DebugTrap>(
        &mut self,
        context: &mut ExecutionContext<STACK_SIZE>,
        trap: &mut T,
    ) -> Result<MoveDelta, ExecutionError> {
        let delta = self.run_tick(context, trap)?;
        self.apply_move(delta);
        Ok(delta)
    }
}

/// Executes the program in `memory` from address 0 until `END`, an error,
/// or the instruction pointer leaving memory.
pub fn run_tick<const STACK_SIZE: usize, T: DebugTrap>(
    memory: &mut Memory,
    context: &mut ExecutionContext<STACK_SIZE>,
    trap: &mut T,
) -> Result<MoveDelta, ExecutionError> {
    context.reset();
    if let Some(system) = memory.get_mut(SYSTEM_ZONE) {
        system.fill(0);
    }

    let mut ip: usize = 0;
    while let Some(word) = memory.get(ip).copied() {
        let header = Header::decode(word);
        let opcode = match Opcode::from_value(header.opcode) {
            Some(Opcode::Label) | None => {
                warn!("unknown opcode word {} at {}", word, ip);
                return Err(ExecutionError::UnknownOpcode { address: ip, word });
            }
            Some(op) => op,
        };
        context.load_parameters(memory, ip, &header, opcode)?;
        let mut next = ip
            .checked_add(header.width())
            .ok_or(out_of_bounds(ip, opcode, Word::MAX))?;

        match opcode {
            Opcode::End => break,
            Opcode::Add => {
                let value = context.parameter(0).wrapping_add(context.parameter(1));
                context.push(value, ip, opcode)?;
            }
            Opcode::Sub => {
                let value = context.parameter(0).wrapping_sub(context.parameter(1));
                context.push(value, ip, opcode)?;
            }
            Opcode::Set => match header.operand_count {
                1 => {
                    let value = context.pop(ip, opcode)?;
                    write_cell(memory, context.parameter(0), value, ip, opcode)?;
                }
                2 => {
                    write_cell(memory, context.parameter(0), context.parameter(1), ip, opcode)?;
                }
                _ => {}
            },
            Opcode::Get => {
                let target = context.pop(ip, opcode)?;
                let value = read_cell(memory, target, ip, opcode)?;
                context.push(value, ip, opcode)?;
            }
            Opcode::Push => {
                context.push(context.parameter(0), ip, opcode)?;
            }
            Opcode::Jump => {
                let target = context.parameter(0);
                next = usize::try_from(target).map_err(|_| out_of_bounds(ip, opcode, target))?;
            }
            Opcode::If => {
                if context.pop(ip, opcode)? == 0 {
                    let skip = context.parameter(0);
                    next = isize::try_from(skip)
                        .ok()
                        .and_then(|offset| next.checked_add_signed(offset))
                        .ok_or(out_of_bounds(ip, opcode, skip))?;
                }
            }
            Opcode::Equal => {
                let result = context.parameter(0) == context.parameter(1);
                context.push(Word::from(result), ip, opcode)?;
            }
            Opcode::Greater => {
                let result = context.parameter(0) > context.parameter(1);
                context.push(Word::from(result), ip, opcode)?;
            }
            Opcode::Lesser => {
                let result = context.parameter(0) < context.parameter(1);
                context.push(Word::from(result), ip, opcode)?;
            }
            Opcode::GreaterEqual => {
                let result = context.parameter(0) >= context.parameter(1);
                context.push(Word::from(result), ip, opcode)?;
            }
            Opcode::LesserEqual => {
                let result = context.parameter(0) <= context.parameter(1);
                context.push(Word::from(result), ip, opcode)?;
            }
            Opcode::Debug => {
                debug!("debug trap at {}", ip);
                trap.trap(ip, context.stack(), memory);
            }
            // Rejected above.
            Opcode::Label => {}
        }
        ip = next;
    }

    let register = memory.get(MOVE_ADDRESS).copied().unwrap_or(0);
    Ok(MoveDelta::from_move_register(register))
}

fn read_cell(memory: &Memory, target: Word, address: usize, opcode: Opcode) -> Result<Word, ExecutionError> {
    usize::try_from(target)
        .ok()
        .and_then(|index| memory.get(index))
        .copied()
        .ok_or(out_of_bounds(address, opcode, target))
}

fn write_cell(
    memory: &mut Memory,
    target: Word,
    value: Word,
    address: usize,
    opcode: Opcode,
) -> Result<(), ExecutionError> {
    let cell = usize::try_from(target)
        .ok()
        .and_then(|index| memory.get_mut(index))
        .ok_or(out_of_bounds(address, opcode, target))?;
    *cell = value;
    Ok(())
}

fn out_of_bounds(address: usize, opcode: Opcode, target: Word) -> ExecutionError {
    ExecutionError::OutOfBoundsAccess {
        address,
        opcode,
        target,
    }
}

fn usize_to_word(value: usize) -> Word {
    Word::try_from(value).unwrap_or(Word::MAX)
}

#[cfg(test)]
mod test;
