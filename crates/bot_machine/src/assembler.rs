// Assembler for the bot language. Source is whitespace separated words,
// one pass per concern:
//
//   tokens -> ALIAS prefix -> block spans -> instruction headers
//          -> labels -> symbol resolution -> words
//
// Every error carries the source line it was raised for.

use heapless::Vec;
use thiserror_no_std::Error;

use crate::{
    Direction, Header, Opcode, Word, AUTO_ALIAS_ZONE, AUTO_ALIAS_ZONE_SIZE, CODE_ZONE_SIZE,
    MOVE_ADDRESS,
};

/// Reserved, a token containing it is rejected.
pub const RESERVED_DELIMITER: char = '+';
pub const IMMEDIATE_MARKER: char = '#';
pub const BLOCK_OPEN: &str = "{";
pub const BLOCK_CLOSE: &str = "}";
pub const ALIAS_DIRECTIVE: &str = "ALIAS";
const COMMENT_MARKER: char = ';';

pub const TOKEN_CAP: usize = 4096;
pub const SYMBOL_CAP: usize = 512;
pub const BLOCK_CAP: usize = 512;

const MEMORY_NAMES: [(&str, Word); 5] = [
    ("UP", Direction::Up as Word),
    ("RIGHT", Direction::Right as Word),
    ("DOWN", Direction::Down as Word),
    ("LEFT", Direction::Left as Word),
    ("MOVE", MOVE_ADDRESS as Word),
];

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("{kind} on line {line}")]
pub struct CompileError {
    line: u32,
    kind: CompileErrorKind,
}

impl CompileError {
    pub fn new(line: u32, kind: CompileErrorKind) -> Self {
        Self { line, kind }
    }

    pub fn line_number(&self) -> u32 {
        self.line
    }

    pub fn error_kind(&self) -> CompileErrorKind {
        self.kind
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    #[error("token contains the reserved delimiter")]
    IllegalToken,
    #[error("ALIAS needs a name and a value and must come before any instruction")]
    MalformedAlias,
    #[error("LABEL needs a name")]
    MalformedLabel,
    #[error("unmatched brace")]
    BraceMismatch,
    #[error("built-in names can not be redefined")]
    ReservedName,
    #[error("instruction has more than seven operands")]
    TooManyOperands,
    #[error("program does not fit in the code zone")]
    ProgramTooLarge,
    #[error("no space left for auto-assigned symbols")]
    AutoAliasZoneFull,
    #[error("too many tokens")]
    TooManyTokens,
    #[error("too many aliases, labels or blocks")]
    TooManySymbols,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token<'a> {
    pub text: &'a str,
    pub line: u32,
}

/// Right hand side of an `ALIAS` or `LABEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol<'a> {
    Number(Word),
    Name(&'a str),
}

impl<'a> Symbol<'a> {
    fn parse(text: &'a str) -> Self {
        match parse_number(text) {
            Some(value) => Symbol::Number(value),
            None => Symbol::Name(text),
        }
    }
}

#[derive(Clone, Copy)]
struct Entry<'a> {
    name: &'a str,
    value: Symbol<'a>,
}

/// Name to value mapping used while assembling.
///
/// Built-ins (mnemonics and memory names) are fixed and answered first,
/// user `ALIAS`/`LABEL` entries follow with last write wins, and any other
/// name is given the next free word of the auto-alias zone on first use.
pub struct AliasTable<'a> {
    entries: Vec<Entry<'a>, SYMBOL_CAP>,
    auto: Vec<&'a str, AUTO_ALIAS_ZONE_SIZE>,
}

impl<'a> AliasTable<'a> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            auto: Vec::new(),
        }
    }

    pub fn builtin(name: &str) -> Option<Word> {
        if let Some(op) = Opcode::from_mnemonic(name) {
            return Word::try_from(op.value()).ok();
        }
        MEMORY_NAMES
            .iter()
            .find(|(builtin, _)| *builtin == name)
            .map(|(_, value)| *value)
    }

    pub fn is_reserved(name: &str) -> bool {
        name.eq_ignore_ascii_case(ALIAS_DIRECTIVE) || Self::builtin(name).is_some()
    }

    pub fn define(&mut self, name: &'a str, value: Symbol<'a>, line: u32) -> Result<(), CompileError> {
        if Self::is_reserved(name) {
            return Err(CompileError::new(line, CompileErrorKind::ReservedName));
        }
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.name == name) {
            entry.value = value;
            return Ok(());
        }
        self.entries
            .push(Entry { name, value })
            .map_err(|_| CompileError::new(line, CompileErrorKind::TooManySymbols))
    }

    /// Resolves without allocating.
    pub fn lookup(&self, name: &str) -> Option<Word> {
        if let Some(value) = Self::builtin(name) {
            return Some(value);
        }
        if let Some(entry) = self.entries.iter().find(|entry| entry.name == name) {
            return match entry.value {
                Symbol::Number(value) => Some(value),
                Symbol::Name(target) => self.lookup_target(target),
            };
        }
        self.auto_address(name)
    }

    /// Resolves `name`, assigning an auto-alias when nothing else matches.
    pub fn resolve(&mut self, name: &'a str, line: u32) -> Result<Word, CompileError> {
        let target = match self.entries.iter().find(|entry| entry.name == name) {
            Some(Entry {
                value: Symbol::Number(value),
                ..
            }) => return Ok(*value),
            Some(Entry {
                value: Symbol::Name(target),
                ..
            }) => *target,
            None => name,
        };
        if let Some(value) = Self::builtin(target) {
            return Ok(value);
        }
        // An alias to a name goes one level further: labels and numeric aliases only.
        if target != name {
            if let Some(Entry {
                value: Symbol::Number(value),
                ..
            }) = self.entries.iter().find(|entry| entry.name == target)
            {
                return Ok(*value);
            }
        }
        if let Some(address) = self.auto_address(target) {
            return Ok(address);
        }
        self.auto
            .push(target)
            .map_err(|_| CompileError::new(line, CompileErrorKind::AutoAliasZoneFull))?;
        trace!("auto alias {} at {}", target, self.auto.len());
        self.auto_address(target)
            .ok_or(CompileError::new(line, CompileErrorKind::AutoAliasZoneFull))
    }

    pub fn auto_alias_count(&self) -> usize {
        self.auto.len()
    }

    /// Auto-assigned names with their addresses, in assignment order.
    pub fn auto_aliases(&self) -> impl Iterator<Item = (&'a str, Word)> + '_ {
        self.auto
            .iter()
            .enumerate()
            .filter_map(|(index, name)| Some((*name, auto_alias_address(index)?)))
    }

    fn lookup_target(&self, target: &str) -> Option<Word> {
        if let Some(value) = Self::builtin(target) {
            return Some(value);
        }
        if let Some(Entry {
            value: Symbol::Number(value),
            ..
        }) = self.entries.iter().find(|entry| entry.name == target)
        {
            return Some(*value);
        }
        self.auto_address(target)
    }

    fn auto_address(&self, name: &str) -> Option<Word> {
        let index = self.auto.iter().position(|auto| *auto == name)?;
        auto_alias_address(index)
    }
}

impl Default for AliasTable<'_> {
    fn default() -> Self {
        Self::new()
    }
}

fn auto_alias_address(index: usize) -> Option<Word> {
    let address = AUTO_ALIAS_ZONE.start.checked_add(index)?;
    if !AUTO_ALIAS_ZONE.contains(&address) {
        return None;
    }
    Word::try_from(address).ok()
}

/// A `{ ... }` group. `open` and `close` index the brace tokens, `width` is the
/// number of words emitted between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
    pub open: usize,
    pub close: usize,
    pub width: usize,
}

/// Finds every block, outermost first in source order.
pub fn expand_blocks(tokens: &[Token<'_>]) -> Result<Vec<Block, BLOCK_CAP>, CompileError> {
    let mut blocks = Vec::new();
    let mut index = 0;
    while let Some(token) = tokens.get(index) {
        if token.text == BLOCK_OPEN {
            let (close, _) = expand_block(tokens, index, &mut blocks)?;
            index = close;
        } else if token.text == BLOCK_CLOSE {
            return Err(CompileError::new(token.line, CompileErrorKind::BraceMismatch));
        } else if is_label_directive(token.text) {
            label_name(tokens, index)?;
            index = index.saturating_add(1);
        }
        index = index.saturating_add(1);
    }
    Ok(blocks)
}

/// Returns the index of the matching close brace and the block width.
fn expand_block(
    tokens: &[Token<'_>],
    open: usize,
    blocks: &mut Vec<Block, BLOCK_CAP>,
) -> Result<(usize, usize), CompileError> {
    let open_line = tokens.get(open).map(|token| token.line).unwrap_or(0);
    let slot = blocks.len();
    blocks
        .push(Block {
            open,
            close: open,
            width: 0,
        })
        .map_err(|_| CompileError::new(open_line, CompileErrorKind::TooManySymbols))?;

    let mut width: usize = 0;
    let mut index = open.saturating_add(1);
    while let Some(token) = tokens.get(index) {
        if token.text == BLOCK_OPEN {
            let (close, inner) = expand_block(tokens, index, blocks)?;
            // The inner block keeps one word for its own skip count.
            width = width.saturating_add(inner).saturating_add(1);
            index = close;
        } else if token.text == BLOCK_CLOSE {
            if let Some(block) = blocks.get_mut(slot) {
                block.close = index;
                block.width = width;
            }
            return Ok((index, width));
        } else if is_label_directive(token.text) {
            label_name(tokens, index)?;
            index = index.saturating_add(1);
        } else {
            width = width.saturating_add(1);
        }
        index = index.saturating_add(1);
    }
    Err(CompileError::new(open_line, CompileErrorKind::BraceMismatch))
}

/// One word of output before symbols are resolved. Labels take no space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<'a> {
    Instruction(Header),
    Operand(&'a str),
    Skip(usize),
    Label(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placed<'a> {
    pub slot: Slot<'a>,
    pub line: u32,
}

/// Builds instruction headers: operand count plus one immediate bit per operand.
///
/// An instruction's operands are the tokens up to the next mnemonic, label or
/// brace. A block is itself an immediate operand holding its width.
pub fn encode_instructions<'a>(
    tokens: &[Token<'a>],
    blocks: &[Block],
) -> Result<Vec<Placed<'a>, TOKEN_CAP>, CompileError> {
    let mut placed: Vec<Placed<'a>, TOKEN_CAP> = Vec::new();
    let mut current: Option<usize> = None;
    let mut blocks = blocks.iter();
    let mut index = 0;

    while let Some(token) = tokens.get(index) {
        let line = token.line;
        if token.text == BLOCK_OPEN {
            let block = blocks
                .next()
                .ok_or(CompileError::new(line, CompileErrorKind::BraceMismatch))?;
            if let Some(at) = current {
                add_operand(&mut placed, at, true)?;
            }
            place(&mut placed, Slot::Skip(block.width), line)?;
            current = None;
        } else if token.text == BLOCK_CLOSE {
            current = None;
        } else if is_label_directive(token.text) {
            let name = label_name(tokens, index)?;
            place(&mut placed, Slot::Label(name.text), line)?;
            current = None;
            index = index.saturating_add(1);
        } else if let Some(op) = Opcode::from_mnemonic(token.text) {
            place(&mut placed, Slot::Instruction(Header::new(op)), line)?;
            current = Some(placed.len().saturating_sub(1));
        } else {
            let (text, immediate) = strip_immediate(token.text);
            if let Some(at) = current {
                add_operand(&mut placed, at, immediate)?;
            }
            place(&mut placed, Slot::Operand(text), line)?;
        }
        index = index.saturating_add(1);
    }
    Ok(placed)
}

fn place<'a>(
    placed: &mut Vec<Placed<'a>, TOKEN_CAP>,
    slot: Slot<'a>,
    line: u32,
) -> Result<(), CompileError> {
    placed
        .push(Placed { slot, line })
        .map_err(|_| CompileError::new(line, CompileErrorKind::TooManyTokens))
}

fn add_operand(placed: &mut [Placed<'_>], at: usize, immediate: bool) -> Result<(), CompileError> {
    if let Some(Placed {
        slot: Slot::Instruction(header),
        line,
    }) = placed.get_mut(at)
    {
        if !header.push_operand(immediate) {
            return Err(CompileError::new(*line, CompileErrorKind::TooManyOperands));
        }
    }
    Ok(())
}

/// Compiled program, ready to be copied in to the code zone of a bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledProgram {
    words: Vec<Word, CODE_ZONE_SIZE>,
    lines: Vec<u32, CODE_ZONE_SIZE>,
    auto_alias_count: usize,
}

impl CompiledProgram {
    fn new() -> Self {
        Self {
            words: Vec::new(),
            lines: Vec::new(),
            auto_alias_count: 0,
        }
    }

    fn push(&mut self, word: Word, line: u32) -> Result<(), CompileError> {
        self.words
            .push(word)
            .map_err(|_| CompileError::new(line, CompileErrorKind::ProgramTooLarge))?;
        self.lines
            .push(line)
            .map_err(|_| CompileError::new(line, CompileErrorKind::ProgramTooLarge))
    }

    pub fn words(&self) -> &[Word] {
        self.words.as_slice()
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Source line a word was compiled from.
    pub fn line_of(&self, address: usize) -> Option<u32> {
        self.lines.get(address).copied()
    }

    pub fn auto_alias_count(&self) -> usize {
        self.auto_alias_count
    }

    /// Walks the program as a chain of instructions starting at address 0.
    pub fn instructions(&self) -> Instructions<'_> {
        Instructions {
            words: self.words(),
            address: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction<'p> {
    pub address: usize,
    pub header: Header,
    pub operands: &'p [Word],
}

impl DecodedInstruction<'_> {
    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_value(self.header.opcode)
    }
}

pub struct Instructions<'p> {
    words: &'p [Word],
    address: usize,
}

impl<'p> Iterator for Instructions<'p> {
    type Item = DecodedInstruction<'p>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = Header::decode(*self.words.get(self.address)?);
        let start = self.address.checked_add(1)?;
        let end = start
            .checked_add(header.operand_count)?
            .min(self.words.len());
        let operands = self.words.get(start..end).unwrap_or(&[]);
        let item = DecodedInstruction {
            address: self.address,
            header,
            operands,
        };
        self.address = self.address.checked_add(header.width())?;
        Some(item)
    }
}

/// Collects source lines and turns them in to a `CompiledProgram`.
pub struct Assembler<'a> {
    tokens: Vec<Token<'a>, TOKEN_CAP>,
    line_number: u32,
}

impl<'a> Assembler<'a> {
    pub fn new() -> Self {
        Self {
            tokens: Vec::new(),
            line_number: 0,
        }
    }

    /// Splits one line in to tokens on spaces and tabs. A `;` starts a comment.
    pub fn add_line(&mut self, line: &'a str) -> Result<(), CompileError> {
        self.line_number = self.line_number.saturating_add(1);
        let line_number = self.line_number;
        let code = strip_comment(line);
        for text in code
            .split(|c: char| c == ' ' || c == '\t' || c == '\r')
            .filter(|text| !text.is_empty())
        {
            if text.contains(RESERVED_DELIMITER) {
                return Err(CompileError::new(line_number, CompileErrorKind::IllegalToken));
            }
            self.tokens
                .push(Token {
                    text,
                    line: line_number,
                })
                .map_err(|_| CompileError::new(line_number, CompileErrorKind::TooManyTokens))?;
        }
        Ok(())
    }

    pub fn tokens(&self) -> &[Token<'a>] {
        self.tokens.as_slice()
    }

    pub fn finish(self) -> Result<CompiledProgram, CompileError> {
        trace!("assembling {} tokens from {} lines", self.tokens.len(), self.line_number);
        let mut table = AliasTable::new();
        let body_start = consume_aliases(&self.tokens, &mut table)?;
        let body = self.tokens.get(body_start..).unwrap_or(&[]);
        if let Some(stray) = body.iter().find(|token| is_alias_directive(token.text)) {
            return Err(CompileError::new(stray.line, CompileErrorKind::MalformedAlias));
        }

        let blocks = expand_blocks(body)?;
        let mut placed = encode_instructions(body, &blocks)?;
        bind_labels(&placed, &mut table)?;
        append_terminator(&mut placed, self.line_number)?;

        let mut program = CompiledProgram::new();
        for Placed { slot, line } in placed.iter().copied() {
            let word = match slot {
                Slot::Instruction(header) => header.encode(),
                Slot::Operand(text) => match parse_number(text) {
                    Some(value) => value,
                    None => table.resolve(text, line)?,
                },
                Slot::Skip(width) => Word::try_from(width)
                    .map_err(|_| CompileError::new(line, CompileErrorKind::ProgramTooLarge))?,
                Slot::Label(_) => continue,
            };
            program.push(word, line)?;
        }
        program.auto_alias_count = table.auto_alias_count();
        debug!(
            "compiled {} tokens in to {} words, {} auto aliases",
            self.tokens.len(),
            program.len(),
            program.auto_alias_count
        );
        Ok(program)
    }
}

impl Default for Assembler<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Compiles a whole source text.
pub fn compile(source: &str) -> Result<CompiledProgram, CompileError> {
    let mut assembler = Assembler::new();
    for line in source.lines() {
        assembler.add_line(line)?;
    }
    assembler.finish().inspect_err(|err| {
        warn!("compile failed on line {}", err.line_number());
    })
}

/// Reads the leading `ALIAS name value` directives, returns where the body starts.
fn consume_aliases<'a>(tokens: &[Token<'a>], table: &mut AliasTable<'a>) -> Result<usize, CompileError> {
    let mut index = 0;
    while let Some(token) = tokens.get(index) {
        if !is_alias_directive(token.text) {
            break;
        }
        let malformed = CompileError::new(token.line, CompileErrorKind::MalformedAlias);
        let name = tokens.get(index.saturating_add(1)).ok_or(malformed)?;
        let value = tokens.get(index.saturating_add(2)).ok_or(malformed)?;
        if !is_symbol_name(name.text) || !is_symbol_value(value.text) {
            return Err(malformed);
        }
        table.define(name.text, Symbol::parse(value.text), token.line)?;
        index = index.saturating_add(3);
    }
    Ok(index)
}

fn bind_labels<'a>(placed: &[Placed<'a>], table: &mut AliasTable<'a>) -> Result<(), CompileError> {
    let mut address: usize = 0;
    for Placed { slot, line } in placed.iter() {
        match slot {
            Slot::Label(name) => {
                let value = Word::try_from(address)
                    .map_err(|_| CompileError::new(*line, CompileErrorKind::ProgramTooLarge))?;
                table.define(name, Symbol::Number(value), *line)?;
            }
            _ => address = address.saturating_add(1),
        }
    }
    Ok(())
}

fn append_terminator(placed: &mut Vec<Placed<'_>, TOKEN_CAP>, last_line: u32) -> Result<(), CompileError> {
    let last = placed
        .iter()
        .rev()
        .find(|placed| !matches!(placed.slot, Slot::Label(_)));
    let ends = matches!(
        last,
        Some(Placed {
            slot: Slot::Instruction(header),
            ..
        }) if header.opcode == Opcode::End.value()
    );
    if ends {
        return Ok(());
    }
    let line = last.map(|placed| placed.line).unwrap_or(last_line);
    place(placed, Slot::Instruction(Header::new(Opcode::End)), line.saturating_add(1))
}

fn label_name<'t, 'a>(tokens: &'t [Token<'a>], directive: usize) -> Result<&'t Token<'a>, CompileError> {
    let line = tokens.get(directive).map(|token| token.line).unwrap_or(0);
    match tokens.get(directive.saturating_add(1)) {
        Some(name) if is_symbol_name(name.text) => Ok(name),
        _ => Err(CompileError::new(line, CompileErrorKind::MalformedLabel)),
    }
}

fn is_alias_directive(text: &str) -> bool {
    text.eq_ignore_ascii_case(ALIAS_DIRECTIVE)
}

fn is_label_directive(text: &str) -> bool {
    Opcode::from_mnemonic(text) == Some(Opcode::Label)
}

fn is_symbol_name(text: &str) -> bool {
    !text.starts_with(IMMEDIATE_MARKER)
        && text != BLOCK_OPEN
        && text != BLOCK_CLOSE
        && parse_number(text).is_none()
}

fn is_symbol_value(text: &str) -> bool {
    !text.starts_with(IMMEDIATE_MARKER) && text != BLOCK_OPEN && text != BLOCK_CLOSE
}

fn strip_immediate(text: &str) -> (&str, bool) {
    match text.strip_prefix(IMMEDIATE_MARKER) {
        Some(rest) => (rest, true),
        None => (text, false),
    }
}

/// Decimal with an optional `-`, or `0x` hex for raw bit patterns.
pub fn parse_number(text: &str) -> Option<Word> {
    if let Some(hex) = text.strip_prefix("0x") {
        return u32::from_str_radix(hex, 16).ok().map(|bits| bits as Word);
    }
    text.parse::<Word>().ok()
}

fn strip_comment(line: &str) -> &str {
    match line.split(COMMENT_MARKER).next() {
        Some(part) => part,
        None => line,
    }
}
