use super::*;

extern crate std;
use std::format;
use std::vec::Vec as StdVec;

const STACK_CAP: usize = 32;
const A: usize = AUTO_ALIAS_ZONE.start;

const BASELINE: &str = "
ADD a #1
SET #a
GREATER a #4
IF
{
    SET #a #1
}
SET #MOVE a
";

fn bot(source: &str) -> Bot {
    let program = compile(source).unwrap();
    Bot::new(&program, Position::new(5, 5))
}

fn tick(bot: &mut Bot) -> Result<(MoveDelta, StdVec<Word>), ExecutionError> {
    let mut context = ExecutionContext::<STACK_CAP>::new();
    let delta = bot.run_tick(&mut context, &mut ())?;
    Ok((delta, context.stack().to_vec()))
}

#[derive(Default)]
struct RecordingTrap {
    hits: StdVec<(usize, StdVec<Word>)>,
}

impl DebugTrap for RecordingTrap {
    fn trap(&mut self, address: usize, stack: &[Word], _memory: &Memory) {
        self.hits.push((address, stack.to_vec()));
    }
}

#[test]
fn baseline_moves_up_when_sum_exceeds_four() -> Result<(), ExecutionError> {
    let mut bot = bot(BASELINE);
    bot.memory_mut()[A] = 5;
    let mut context = ExecutionContext::<STACK_CAP>::new();
    let delta = bot.step(&mut context, &mut ())?;
    assert_eq!(delta, Direction::Up.delta());
    assert_eq!(bot.memory()[A], 1);
    assert_eq!(bot.memory()[MOVE_ADDRESS], 1);
    assert_eq!(bot.position(), Position::new(5, 4));
    assert!(context.stack().is_empty());
    Ok(())
}

#[test]
fn baseline_moves_by_the_sum_otherwise() -> Result<(), ExecutionError> {
    let mut bot = bot(BASELINE);
    bot.memory_mut()[A] = 1;
    let mut context = ExecutionContext::<STACK_CAP>::new();
    bot.step(&mut context, &mut ())?;
    assert_eq!(bot.memory()[A], 2);
    assert_eq!(bot.position(), Position::new(6, 5));

    // a is now 2, 3 next tick is Down.
    bot.step(&mut context, &mut ())?;
    assert_eq!(bot.memory()[A], 3);
    assert_eq!(bot.position(), Position::new(6, 6));
    Ok(())
}

#[test]
fn immediate_and_indirect_operands() -> Result<(), ExecutionError> {
    let mut bot = bot("ADD a #7\nSUB #7 a\nEQUAL #3000 a\nPUSH a");
    bot.memory_mut()[A] = 10;
    let (_, stack) = tick(&mut bot)?;
    assert_eq!(stack, [17, -3, 0, 10]);
    Ok(())
}

#[test]
fn indirect_operand_reads_through_an_address() -> Result<(), ExecutionError> {
    // ptr holds 4100, #ptr is its own address.
    let mut bot = bot("SET #ptr #4100\nPUSH ptr\nGET\nPUSH #ptr");
    bot.memory_mut()[4100] = 42;
    let (_, stack) = tick(&mut bot)?;
    assert_eq!(stack, [42, A as Word]);
    Ok(())
}

#[test]
fn set_with_one_operand_pops() -> Result<(), ExecutionError> {
    let mut bot = bot("PUSH #9\nSET #4200\nSET #4201 #4");
    let (_, stack) = tick(&mut bot)?;
    assert!(stack.is_empty());
    assert_eq!(bot.memory()[4200], 9);
    assert_eq!(bot.memory()[4201], 4);
    Ok(())
}

#[test]
fn comparisons_push_one_or_zero() -> Result<(), ExecutionError> {
    let mut bot = bot(
        "GREATER #2 #1\nLESSER #2 #1\nGE #2 #2\nLE #3 #2\nEQ #5 #5\nGT #1 #1\nLT #1 #2",
    );
    let (_, stack) = tick(&mut bot)?;
    assert_eq!(stack, [1, 0, 1, 0, 1, 0, 1]);
    Ok(())
}

#[test]
fn jump_resumes_at_the_label() -> Result<(), ExecutionError> {
    let mut bot = bot("JUMP #skip\nSET #MOVE #UP\nLABEL skip\nSET #MOVE #RIGHT");
    let (delta, _) = tick(&mut bot)?;
    assert_eq!(delta, Direction::Right.delta());
    Ok(())
}

#[test]
fn jump_loop_counts_down() -> Result<(), ExecutionError> {
    let source = "
SET #n #3
LABEL loop
SUB n #1
SET #n
ADD total #1
SET #total
GREATER n #0
IF {
    JUMP #loop
}
";
    let mut bot = bot(source);
    tick(&mut bot)?;
    assert_eq!(bot.memory()[A], 0);
    assert_eq!(bot.memory()[A + 1], 3);
    Ok(())
}

#[test]
fn if_falls_through_on_true() -> Result<(), ExecutionError> {
    let mut bot = bot("PUSH #1\nIF {\nPUSH #7\n}\nPUSH #8");
    let (_, stack) = tick(&mut bot)?;
    assert_eq!(stack, [7, 8]);
    Ok(())
}

#[test]
fn if_skips_the_block_on_false() -> Result<(), ExecutionError> {
    let mut bot = bot("PUSH #0\nIF {\nPUSH #7\n}\nPUSH #8");
    let (_, stack) = tick(&mut bot)?;
    assert_eq!(stack, [8]);
    Ok(())
}

#[test]
fn nested_if_skips_both_blocks() -> Result<(), ExecutionError> {
    let source = "
GREATER a #1
IF {
    GREATER b #2
    IF {
        SET #c #1
    }
    SET #d #2
}
DEBUG
";
    // Outer condition false: resume right after the outer block.
    let mut outer_false = bot(source);
    let mut trap = RecordingTrap::default();
    let mut context = ExecutionContext::<STACK_CAP>::new();
    outer_false.run_tick(&mut context, &mut trap)?;
    assert_eq!(trap.hits, [(16, StdVec::new())]);
    assert_eq!(outer_false.memory()[A + 2], 0);
    assert_eq!(outer_false.memory()[A + 3], 0);

    // Outer true, inner false: only the inner block is skipped.
    let mut inner_false = bot(source);
    inner_false.memory_mut()[A] = 2;
    inner_false.run_tick(&mut context, &mut trap)?;
    assert_eq!(trap.hits.len(), 2);
    assert_eq!(trap.hits[1].0, 16);
    assert_eq!(inner_false.memory()[A + 2], 0);
    assert_eq!(inner_false.memory()[A + 3], 2);

    // Both true.
    let mut both = bot(source);
    both.memory_mut()[A] = 2;
    both.memory_mut()[A + 1] = 3;
    both.run_tick(&mut context, &mut trap)?;
    assert_eq!(both.memory()[A + 2], 1);
    assert_eq!(both.memory()[A + 3], 2);
    Ok(())
}

#[test]
fn debug_trap_sees_the_stack() -> Result<(), ExecutionError> {
    let mut bot = bot("PUSH #3\nPUSH #4\nDEBUG\nADD #1 #1");
    let mut trap = RecordingTrap::default();
    let mut context = ExecutionContext::<STACK_CAP>::new();
    bot.run_tick(&mut context, &mut trap)?;
    assert_eq!(trap.hits, [(4, std::vec![3, 4])]);
    assert_eq!(context.stack(), &[3, 4, 2]);
    Ok(())
}

#[test]
fn move_register_maps_to_deltas() -> Result<(), ExecutionError> {
    let cases = [
        (1, (0, -1)),
        (2, (1, 0)),
        (3, (0, 1)),
        (4, (-1, 0)),
        (0, (0, 0)),
        (7, (0, 0)),
        (-1, (0, 0)),
    ];
    for (value, (dx, dy)) in cases {
        let mut bot = bot(&format!("SET #MOVE #{}", value));
        let mut context = ExecutionContext::<STACK_CAP>::new();
        let delta = bot.step(&mut context, &mut ())?;
        assert_eq!(delta, MoveDelta { dx, dy });
        assert_eq!(bot.position(), Position::new(5 + dx, 5 + dy));
    }
    Ok(())
}

#[test]
fn system_zone_is_cleared_every_tick() -> Result<(), ExecutionError> {
    let mut bot = bot("END");
    bot.memory_mut()[MOVE_ADDRESS] = 3;
    bot.memory_mut()[SYSTEM_ZONE.end - 1] = 9;
    bot.memory_mut()[GENERAL_ZONE.start] = 9;
    let (delta, _) = tick(&mut bot)?;
    assert!(delta.is_none());
    assert_eq!(bot.memory()[SYSTEM_ZONE.end - 1], 0);
    assert_eq!(bot.memory()[GENERAL_ZONE.start], 9);
    Ok(())
}

#[test]
fn context_is_reset_between_ticks() -> Result<(), ExecutionError> {
    let mut bot = bot("PUSH #1");
    let mut context = ExecutionContext::<STACK_CAP>::new();
    bot.run_tick(&mut context, &mut ())?;
    bot.run_tick(&mut context, &mut ())?;
    assert_eq!(context.stack(), &[1]);
    Ok(())
}

#[test]
fn get_on_empty_stack_underflows() {
    let mut bot = bot("PUSH #1\nSET #4100\nGET");
    let err = tick(&mut bot).unwrap_err();
    assert_eq!(
        err,
        ExecutionError::StackUnderflow {
            address: 4,
            opcode: Opcode::Get
        }
    );
    assert_eq!(err.address(), 4);
    assert_eq!(err.opcode(), Some(Opcode::Get));
}

#[test]
fn if_on_empty_stack_underflows() {
    let mut bot = bot("IF {\n}");
    assert_eq!(
        tick(&mut bot).unwrap_err(),
        ExecutionError::StackUnderflow {
            address: 0,
            opcode: Opcode::If
        }
    );
}

#[test]
fn write_out_of_memory_fails() {
    let mut bot = bot("PUSH #1\nSET #10050");
    assert_eq!(
        tick(&mut bot).unwrap_err(),
        ExecutionError::OutOfBoundsAccess {
            address: 2,
            opcode: Opcode::Set,
            target: 10050
        }
    );
}

#[test]
fn indirect_read_out_of_memory_fails() {
    let mut bot = bot("PUSH #1\nADD 10050 #1");
    assert_eq!(
        tick(&mut bot).unwrap_err(),
        ExecutionError::OutOfBoundsAccess {
            address: 2,
            opcode: Opcode::Add,
            target: 10050
        }
    );
}

#[test]
fn negative_addresses_fail() {
    let mut get = bot("PUSH #-1\nGET");
    assert!(matches!(
        tick(&mut get),
        Err(ExecutionError::OutOfBoundsAccess { address: 2, target: -1, .. })
    ));
    let mut jump = bot("JUMP #-5");
    assert!(matches!(
        tick(&mut jump),
        Err(ExecutionError::OutOfBoundsAccess {
            address: 0,
            opcode: Opcode::Jump,
            ..
        })
    ));
}

#[test]
fn jump_past_memory_ends_the_tick() -> Result<(), ExecutionError> {
    let mut bot = bot("SET #MOVE #LEFT\nJUMP #20000\nSET #MOVE #RIGHT");
    let (delta, _) = tick(&mut bot)?;
    assert_eq!(delta, Direction::Left.delta());
    Ok(())
}

#[test]
fn unknown_opcode_fails() {
    let mut data = bot("99");
    assert_eq!(
        tick(&mut data).unwrap_err(),
        ExecutionError::UnknownOpcode {
            address: 0,
            word: 99
        }
    );

    // LABEL only exists at compile time.
    let mut label = bot("8\nPUSH #1");
    assert_eq!(
        tick(&mut label).unwrap_err(),
        ExecutionError::UnknownOpcode {
            address: 0,
            word: Opcode::Label.value() as Word
        }
    );
}

#[test]
fn stack_overflow_is_reported() {
    let mut bot = bot("PUSH #1\nPUSH #2\nPUSH #3");
    let mut context = ExecutionContext::<2>::new();
    assert_eq!(
        bot.run_tick(&mut context, &mut ()).unwrap_err(),
        ExecutionError::StackOverflow {
            address: 4,
            opcode: Opcode::Push
        }
    );
}

#[test]
fn failed_tick_keeps_memory() {
    let program = compile("SET #4100 #5\nGET").unwrap();
    let mut bot = Bot::new(&program, Position::new(1, 1));
    assert!(tick(&mut bot).is_err());
    assert_eq!(bot.memory()[4100], 5);
    assert_eq!(bot.position(), Position::new(1, 1));

    bot.reload(&program);
    assert_eq!(bot.memory()[4100], 0);
    assert_eq!(&bot.memory()[..program.len()], program.words());
}

#[test]
fn header_round_trip() {
    let mut header = Header::new(Opcode::Set);
    assert!(header.push_operand(true));
    assert!(header.push_operand(false));
    assert_eq!(Header::decode(header.encode()), header);
    assert_eq!(header.width(), 3);

    let mut full = Header::new(Opcode::Debug);
    for _ in 0..MAX_OPERANDS {
        assert!(full.push_operand(true));
    }
    assert!(!full.push_operand(true));
    assert_eq!(Header::decode(full.encode()), full);
    assert_eq!(full.modifier(), MODIFIER_MASK);
}

#[test]
fn negative_skip_below_zero_fails() {
    let mut bot = bot("PUSH #0\nIF #-10");
    assert_eq!(
        tick(&mut bot).unwrap_err(),
        ExecutionError::OutOfBoundsAccess {
            address: 2,
            opcode: Opcode::If,
            target: -10
        }
    );
}

#[test]
fn mnemonics_round_trip() {
    for op in OPCODES {
        assert_eq!(Opcode::from_mnemonic(op.mnemonic()), Some(op));
        assert_eq!(Opcode::from_value(op.value()), Some(op));
    }
    assert_eq!(Opcode::from_mnemonic("GE"), Some(Opcode::GreaterEqual));
    assert_eq!(Opcode::GreaterEqual.mnemonic(), "GREATEREQUAL");
}

#[test]
fn default_stack_holds_default_stack_size_words() {
    let mut source = std::string::String::new();
    for _ in 0..DEFAULT_STACK_SIZE {
        source.push_str("PUSH #1\n");
    }
    let mut full = bot(&source);
    let mut context: ExecutionContext = ExecutionContext::new();
    assert!(full.run_tick(&mut context, &mut ()).is_ok());
    assert_eq!(context.stack().len(), DEFAULT_STACK_SIZE);

    source.push_str("PUSH #1\n");
    let mut over = bot(&source);
    assert_eq!(
        over.run_tick(&mut context, &mut ()).unwrap_err(),
        ExecutionError::StackOverflow {
            address: DEFAULT_STACK_SIZE * 2,
            opcode: Opcode::Push
        }
    );
}
