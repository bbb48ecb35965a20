// This is the place for the basic processor implementation: the register
// file, the flags word, the program counter and the stack, plus the tick
// loop that fetches, decodes and executes one instruction at a time. How
// individual opcodes behave is implemented in the instructions module; how
// addresses are validated is implemented in the memory module.

use crate::devices::Signal;
use crate::error::Error;
use crate::fields::{clamp16, Flags, Operand, NUM_REGISTERS};
use crate::memory::Memory;
use crate::parser;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use termion::cursor;

/// What the executed instruction asks the tick loop to do with the PC.
pub(crate) enum Step {
    /// Fall through to the next instruction.
    Next,
    /// PC was set explicitly (branch, call, return); leave it alone.
    Jump,
    /// A keyboard read began; PC stays pinned on this instruction.
    Block,
}

/// The processor is either running normally or parked on a load from the
/// keyboard port, accumulating a line of input.
#[derive(Debug, Clone, PartialEq)]
pub enum State {
    Running,
    Reading { dest: Operand, buffer: String },
}

pub struct Interpreter {
    registers: [i16; NUM_REGISTERS],
    flags: Flags,
    // None until the first program is assembled
    pc: Option<i32>,
    stack: Vec<i32>,
    memory: Memory,
    state: State,
    source: Option<PathBuf>,
    parsed: bool,
}

impl Interpreter {
    pub fn new(memory: Memory) -> Interpreter {
        Interpreter {
            registers: [0; NUM_REGISTERS],
            flags: Flags::default(),
            pc: None,
            stack: Vec::new(),
            memory,
            state: State::Running,
            source: None,
            parsed: false,
        }
    }

    /// Point the interpreter at a (possibly new) source file. The program
    /// is assembled lazily on the next tick, and execution restarts at 0.
    pub fn set_source(&mut self, path: &Path) {
        self.source = Some(path.to_path_buf());
        self.parsed = false;
        self.pc = None;
        self.state = State::Running;
    }

    /// Perform one step: at most one instruction, or one drain of the
    /// keyboard queue while a blocking read is in progress. Every fault
    /// surfaces here with PC still on the faulting instruction.
    pub fn tick(&mut self) -> Result<Signal, Error> {
        if !self.parsed {
            if let Some(path) = self.source.clone() {
                self.load_program(&path)?;
                self.parsed = true;
                self.pc = None;
            }
        }
        if let State::Reading { .. } = self.state {
            return self.service_read();
        }
        let pc = match self.pc {
            Some(pc) => pc,
            None => {
                self.pc = Some(0);
                0
            }
        };
        if !self.memory.is_valid_instr_addr(pc) {
            return Ok(Signal::Halted);
        }
        let instruction = self.memory.get_instruction(pc as usize)?.clone();
        tracing::trace!(pc, instr = %instruction.as_asm(), "executing");
        match instruction.execute(self)? {
            Step::Next => {
                self.pc = Some(pc + 1);
                Ok(Signal::Ok)
            }
            Step::Jump => Ok(Signal::Ok),
            Step::Block => Ok(Signal::Reading),
        }
    }

    fn load_program(&mut self, path: &Path) -> Result<(), Error> {
        let source = fs::read_to_string(path)?;
        self.memory.clear_program();
        parser::assemble(&source, &mut self.memory)?;
        Ok(())
    }

    /// Pull characters off the keyboard FIFO until a carriage return (13)
    /// completes the line; then convert, store, and move past the load.
    fn service_read(&mut self) -> Result<Signal, Error> {
        let keyboard = match self.memory.get_keyboard_pointer() {
            Some(keyboard) => keyboard,
            None => return Ok(Signal::Reading),
        };
        let mut completed = None;
        if let State::Reading { dest, buffer } = &mut self.state {
            while let Some(code) = keyboard.pop() {
                if code == 13 {
                    completed = Some((dest.clone(), convert_keyboard_input(buffer)));
                    break;
                }
                buffer.push(code as char);
            }
        }
        match completed {
            Some((dest, value)) => {
                self.store(&dest, value)?;
                tracing::debug!(value, dest = %dest.as_asm(), "keyboard read complete");
                self.state = State::Running;
                self.pc = Some(self.current_pc() + 1);
                Ok(Signal::Ok)
            }
            None => Ok(Signal::Reading),
        }
    }

    /// The value of an operand. Memory operands go through the full address
    /// validation; the keyboard port is rejected here because reads from it
    /// are only meaningful through the MOV blocking path.
    pub(crate) fn eval(&self, operand: &Operand) -> Result<i16, Error> {
        match operand {
            Operand::Reg(i) => Ok(self.registers[*i]),
            Operand::Imm(n) => Ok(*n),
            Operand::MemConst(a) => self.memory.get_data(*a as i32),
            Operand::MemReg(i) => self.memory.get_data(self.registers[*i] as i32),
            Operand::LabelRef(_) => panic!("label reference has no value"),
        }
    }

    /// Commit a result. Registers saturate to 16 bits; memory applies its
    /// own clamping and video masking.
    pub(crate) fn store(&mut self, dest: &Operand, value: i64) -> Result<(), Error> {
        match dest {
            Operand::Reg(i) => {
                self.registers[*i] = clamp16(value);
                Ok(())
            }
            Operand::MemConst(a) => self.memory.set_data(*a as i32, value),
            Operand::MemReg(i) => self.memory.set_data(self.registers[*i] as i32, value),
            _ => panic!("destination operand is not writable"),
        }
    }

    /// The data address a memory operand refers to, or None for operands
    /// that never touch memory.
    pub(crate) fn memory_address(&self, operand: &Operand) -> Option<i32> {
        match operand {
            Operand::MemConst(a) => Some(*a as i32),
            Operand::MemReg(i) => Some(self.registers[*i] as i32),
            _ => None,
        }
    }

    pub(crate) fn branch_target(&self, operand: &Operand) -> Result<usize, Error> {
        match operand {
            Operand::LabelRef(name) => self.memory.resolve_label(name),
            _ => panic!("branch target must be a label"),
        }
    }

    pub(crate) fn begin_read(&mut self, dest: Operand) {
        tracing::debug!(dest = %dest.as_asm(), "entering keyboard read");
        self.state = State::Reading { dest, buffer: String::new() };
    }

    pub(crate) fn jump_to(&mut self, target: usize) {
        self.pc = Some(target as i32);
    }

    pub(crate) fn set_pc(&mut self, pc: i32) {
        self.pc = Some(pc);
    }

    pub(crate) fn current_pc(&self) -> i32 {
        match self.pc {
            Some(pc) => pc,
            None => panic!("PC unset during execution"),
        }
    }

    pub(crate) fn stack_push(&mut self, value: i32) {
        self.stack.push(value);
    }

    pub(crate) fn stack_pop(&mut self) -> Option<i32> {
        self.stack.pop()
    }

    pub(crate) fn flags_mut(&mut self) -> &mut Flags {
        &mut self.flags
    }

    // Read-only inspection for the host.

    pub fn registers(&self) -> &[i16; NUM_REGISTERS] {
        &self.registers
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn pc(&self) -> Option<i32> {
        self.pc
    }

    pub fn stack(&self) -> &[i32] {
        &self.stack
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn is_reading(&self) -> bool {
        matches!(self.state, State::Reading { .. })
    }

    /// Text of the instruction under the PC, for fault reporting.
    pub fn current_instruction_text(&self) -> String {
        match self.pc {
            Some(pc) if self.memory.is_valid_instr_addr(pc) => self
                .memory
                .get_instruction(pc as usize)
                .map(|instruction| instruction.as_asm())
                .unwrap_or_else(|_| String::from("<none>")),
            _ => String::from("<none>"),
        }
    }
}

/// Turn a finished input line into the value the program sees: a run of
/// digits becomes its decimal value, a lone non-digit character becomes its
/// code point, and everything else becomes -1.
fn convert_keyboard_input(input: &str) -> i64 {
    let mut chars = input.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) if !c.is_ascii_digit() => c as i64,
        (Some(_), _) if input.chars().all(|c| c.is_ascii_digit()) => {
            input.parse().unwrap_or(i64::MAX)
        }
        _ => -1,
    }
}

impl fmt::Display for Interpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = String::new();
        s.push_str(&format!("{r}╔═════════════════════════════╗", r = cursor::Goto(1, 1)));
        s.push_str(&format!("{r}║ CPU state                   ║", r = cursor::Goto(1, 2)));
        s.push_str(&format!("{r}╟─────┬────────┬─────┬────────╢", r = cursor::Goto(1, 3)));
        for j in 0..4 {
            s.push_str(&format!(
                "{r}║ R{j}  │ {a:>6} │ R{k}  │ {b:>6} ║",
                j = j,
                k = j + 4,
                a = self.registers[j],
                b = self.registers[j + 4],
                r = cursor::Goto(1, (j + 4) as u16),
            ));
        }
        s.push_str(&format!("{r}╟─────┴────────┴─────┴────────╢", r = cursor::Goto(1, 8)));
        s.push_str(&format!(
            "{r}║ ZF {z}  SF {n}  CF {c}  OF {o}      ║",
            z = self.flags.zf as u8,
            n = self.flags.sf as u8,
            c = self.flags.cf as u8,
            o = self.flags.of as u8,
            r = cursor::Goto(1, 9),
        ));
        let pc_text = match self.pc {
            Some(pc) => pc.to_string(),
            None => String::from("-"),
        };
        let mode = if self.is_reading() { "read" } else { "run " };
        s.push_str(&format!(
            "{r}║ PC {pc:<6} STACK {d:<4} {m}   ║",
            pc = pc_text,
            d = self.stack.len(),
            m = mode,
            r = cursor::Goto(1, 10),
        ));
        s.push_str(&format!("{r}╚═════════════════════════════╝", r = cursor::Goto(1, 11)));
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::Keyboard;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn boot(source: &str) -> Interpreter {
        let mut memory = Memory::new(1024, 1024, 100, 0, 15).unwrap();
        parser::assemble(source, &mut memory).unwrap();
        Interpreter::new(memory)
    }

    fn run_to_halt(cpu: &mut Interpreter) {
        for _ in 0..10_000 {
            if cpu.tick().unwrap() == Signal::Halted {
                return;
            }
        }
        panic!("program did not halt");
    }

    #[test]
    fn fresh_interpreter_is_zeroed() {
        let cpu = boot("");
        assert_eq!(cpu.registers(), &[0; NUM_REGISTERS]);
        assert_eq!(cpu.flags(), Flags::default());
        assert_eq!(cpu.pc(), None);
        assert!(cpu.stack().is_empty());
    }

    #[test]
    fn ticking_an_empty_program_halts() {
        let mut cpu = boot("");
        assert_eq!(cpu.tick().unwrap(), Signal::Halted);
        // the first tick still primes the PC
        assert_eq!(cpu.pc(), Some(0));
    }

    #[test]
    fn mov_add_into_register() {
        let mut cpu = boot("MOV R0, #2\nMOV R1, #3\nADD R0, R1\n");
        for _ in 0..3 {
            assert_eq!(cpu.tick().unwrap(), Signal::Ok);
        }
        assert_eq!(cpu.registers()[0], 5);
        assert_eq!(cpu.registers()[1], 3);
        assert_eq!(&cpu.registers()[2..], &[0; 6]);
        assert!(!cpu.flags().zf);
        assert_eq!(cpu.pc(), Some(3));
    }

    #[test]
    fn oversized_immediate_saturates() {
        let mut cpu = boot("MOV R0, #40000\n");
        cpu.tick().unwrap();
        assert_eq!(cpu.registers()[0], 32767);
    }

    #[test]
    fn arithmetic_saturates_not_wraps() {
        let mut cpu = boot("MOV R0, #32767\nADD R0, #1\nMOV R1, #-32768\nSUB R1, #1\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 32767);
        assert_eq!(cpu.registers()[1], -32768);
    }

    #[test]
    fn counting_loop_with_cmp_and_jl() {
        let mut cpu = boot("MOV R0, #0\nloop:\nADD R0, #1\nCMP R0, #3\nJL loop\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 3);
    }

    #[test]
    fn call_and_ret_round_trip() {
        let mut cpu = boot("CALL f\nMOV R0, #7\nJMP done\nf:\nMOV R1, #9\nRET\ndone:\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 7);
        assert_eq!(cpu.registers()[1], 9);
        assert!(cpu.stack().is_empty());
    }

    #[test]
    fn cmp_sets_the_signed_relations() {
        let mut cpu = boot("CMP #1, #3\n");
        cpu.tick().unwrap();
        let flags = cpu.flags();
        assert!(!flags.zf);
        assert!(flags.sf);
        assert!(flags.cf);
        assert!(!flags.of);

        let mut cpu = boot("CMP #5, #5\n");
        cpu.tick().unwrap();
        assert!(cpu.flags().zf);
        assert!(!cpu.flags().sf);
    }

    #[test]
    fn cmp_overflow_uses_16_bit_thresholds() {
        let mut cpu = boot("MOV R0, #-32768\nCMP R0, #32767\n");
        cpu.tick().unwrap();
        cpu.tick().unwrap();
        let flags = cpu.flags();
        assert!(flags.of);
        assert!(flags.sf);
        assert!(flags.cf);
    }

    #[test]
    fn division_truncates_toward_zero() {
        let mut cpu = boot("MOV R0, #-7\nDIV R0, #2\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], -3);
    }

    #[test]
    fn division_by_zero_is_fatal_and_leaves_state() {
        let mut cpu = boot("MOV R0, #4\nDIV R0, #0\n");
        cpu.tick().unwrap();
        let err = cpu.tick().unwrap_err();
        assert!(matches!(err, Error::DivisionByZero));
        // PC stays on the faulting instruction, the register keeps its value
        assert_eq!(cpu.pc(), Some(1));
        assert_eq!(cpu.registers()[0], 4);
    }

    #[test]
    fn push_pop_move_evaluated_values() {
        let mut cpu = boot("MOV R0, #42\nPUSH R0\nMOV R0, #0\nPOP R1\n");
        cpu.tick().unwrap();
        cpu.tick().unwrap();
        assert_eq!(cpu.stack(), &[42]);
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[1], 42);
        assert!(cpu.stack().is_empty());
    }

    #[test]
    fn pop_and_ret_underflow_on_an_empty_stack() {
        let mut cpu = boot("POP R0\n");
        assert!(matches!(cpu.tick().unwrap_err(), Error::StackUnderflow));
        assert_eq!(cpu.pc(), Some(0));

        let mut cpu = boot("RET\n");
        assert!(matches!(cpu.tick().unwrap_err(), Error::StackUnderflow));
    }

    #[test]
    fn double_not_is_the_identity_mod_2_16() {
        let mut cpu = boot("MOV R0, #-12345\nNOT R0\nNOT R0\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], -12345);
    }

    #[test]
    fn not_flips_all_16_bits() {
        let mut cpu = boot("MOV R0, #0\nNOT R0\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], -1);
    }

    #[test]
    fn bitwise_ops_work_on_the_low_16_bits() {
        let mut cpu = boot(
            "MOV R0, #170\nMOV R1, #204\nAND R0, R1\nMOV R2, #170\nOR R2, R1\nMOV R3, #170\nXOR R3, R1\n",
        );
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 170 & 204);
        assert_eq!(cpu.registers()[2], 170 | 204);
        assert_eq!(cpu.registers()[3], 170 ^ 204);
    }

    #[test]
    fn shl_saturates_and_shr_is_logical() {
        let mut cpu = boot("MOV R0, #8\nSHL R0, #1\nSHR R0, #2\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 4);

        // -1 is 0xFFFF; a logical shift right by 1 gives 0x7FFF
        let mut cpu = boot("MOV R0, #-1\nSHR R0, #1\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 32767);

        let mut cpu = boot("MOV R0, #2\nSHL R0, #20\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 32767);
    }

    #[test]
    fn video_writes_are_masked_through_stores() {
        let mut cpu = boot("MOV M0, #321\n");
        cpu.tick().unwrap();
        assert_eq!(cpu.memory().read_video_memory()[0], Some(65));
    }

    #[test]
    fn register_indirect_addressing_reads_and_writes() {
        let mut cpu = boot("MOV R0, #500\nMOV MR0, #99\nMOV R1, MR0\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[1], 99);
        assert_eq!(cpu.memory().get_data(500).unwrap(), 99);
    }

    #[test]
    fn data_address_fault_leaves_pc_in_place() {
        let mut cpu = boot("MOV R0, M2000\n");
        assert!(matches!(cpu.tick().unwrap_err(), Error::InvalidDataAddress { address: 2000 }));
        assert_eq!(cpu.pc(), Some(0));
        assert_eq!(cpu.registers()[0], 0);
    }

    #[test]
    fn non_mov_keyboard_read_is_an_address_fault() {
        let mut cpu = boot("ADD R0, M100\n");
        assert!(matches!(cpu.tick().unwrap_err(), Error::InvalidDataAddress { address: 100 }));
    }

    #[test]
    fn keyboard_read_blocks_until_carriage_return() {
        let mut memory = Memory::new(1024, 1024, 100, 0, 15).unwrap();
        parser::assemble("MOV R0, M100\nMOV R1, #1\n", &mut memory).unwrap();
        let keyboard = Arc::new(Keyboard::new());
        memory.set_keyboard_pointer(Arc::clone(&keyboard));
        let mut cpu = Interpreter::new(memory);

        assert_eq!(cpu.tick().unwrap(), Signal::Reading);
        assert_eq!(cpu.pc(), Some(0));
        assert!(cpu.is_reading());

        // nothing queued yet: still reading
        assert_eq!(cpu.tick().unwrap(), Signal::Reading);

        keyboard.push(b'4');
        keyboard.push(b'2');
        assert_eq!(cpu.tick().unwrap(), Signal::Reading);

        keyboard.push(13);
        assert_eq!(cpu.tick().unwrap(), Signal::Ok);
        assert_eq!(cpu.registers()[0], 42);
        assert_eq!(cpu.pc(), Some(1));
        assert!(!cpu.is_reading());

        // execution continues normally afterwards
        assert_eq!(cpu.tick().unwrap(), Signal::Ok);
        assert_eq!(cpu.registers()[1], 1);
    }

    #[test]
    fn keyboard_read_through_register_indirect() {
        let mut memory = Memory::new(1024, 1024, 100, 0, 15).unwrap();
        parser::assemble("MOV R7, #100\nMOV R0, MR7\n", &mut memory).unwrap();
        let keyboard = Arc::new(Keyboard::new());
        memory.set_keyboard_pointer(Arc::clone(&keyboard));
        let mut cpu = Interpreter::new(memory);

        cpu.tick().unwrap();
        assert_eq!(cpu.tick().unwrap(), Signal::Reading);
        keyboard.push(b'A');
        keyboard.push(13);
        cpu.tick().unwrap();
        assert_eq!(cpu.registers()[0], 65);
    }

    #[test]
    fn keyboard_line_conversion_rules() {
        assert_eq!(convert_keyboard_input("42"), 42);
        assert_eq!(convert_keyboard_input("007"), 7);
        assert_eq!(convert_keyboard_input("A"), 65);
        assert_eq!(convert_keyboard_input("7"), 7);
        assert_eq!(convert_keyboard_input("ab"), -1);
        assert_eq!(convert_keyboard_input("-5"), -1);
        assert_eq!(convert_keyboard_input(""), -1);
    }

    #[test]
    fn oversized_keyboard_number_saturates_on_store() {
        let mut memory = Memory::new(1024, 1024, 100, 0, 15).unwrap();
        parser::assemble("MOV R0, M100\n", &mut memory).unwrap();
        let keyboard = Arc::new(Keyboard::new());
        memory.set_keyboard_pointer(Arc::clone(&keyboard));
        let mut cpu = Interpreter::new(memory);
        cpu.tick().unwrap();
        for code in b"99999" {
            keyboard.push(*code);
        }
        keyboard.push(13);
        cpu.tick().unwrap();
        assert_eq!(cpu.registers()[0], 32767);
    }

    #[test]
    fn labels_cost_one_tick_and_are_otherwise_inert() {
        let mut cpu = boot("a:\nb:\nMOV R0, #1\n");
        assert_eq!(cpu.tick().unwrap(), Signal::Ok);
        assert_eq!(cpu.pc(), Some(1));
        assert_eq!(cpu.registers()[0], 0);
        cpu.tick().unwrap();
        cpu.tick().unwrap();
        assert_eq!(cpu.registers()[0], 1);
    }

    #[test]
    fn jump_to_a_label_past_the_end_halts() {
        let mut cpu = boot("JMP end\nMOV R0, #1\nend:\n");
        run_to_halt(&mut cpu);
        assert_eq!(cpu.registers()[0], 0);
    }

    #[test]
    fn unknown_branch_target_faults() {
        let mut cpu = boot("JMP nowhere\n");
        assert!(matches!(cpu.tick().unwrap_err(), Error::UnknownLabel { .. }));
        assert_eq!(cpu.pc(), Some(0));
    }

    #[test]
    fn conditional_branch_truth_table() {
        // (a, b, opcode, taken)
        let cases = [
            (1, 1, "JE", true),
            (1, 2, "JE", false),
            (1, 2, "JNE", true),
            (3, 2, "JG", true),
            (2, 2, "JG", false),
            (-1, 2, "JL", true),
            (2, -1, "JL", false),
            (2, 2, "JGE", true),
            (-3, 2, "JGE", false),
            (2, 2, "JLE", true),
            (3, 2, "JLE", false),
        ];
        for (a, b, op, taken) in cases.iter() {
            let source =
                format!("CMP #{}, #{}\n{} hit\nMOV R0, #1\nJMP out\nhit:\nMOV R1, #1\nout:\n", a, b, op);
            let mut cpu = boot(&source);
            run_to_halt(&mut cpu);
            if *taken {
                assert_eq!(cpu.registers()[1], 1, "{} {} {}", a, op, b);
            } else {
                assert_eq!(cpu.registers()[0], 1, "{} {} {}", a, op, b);
            }
        }
    }

    #[test]
    fn set_source_resets_pc_and_reparses() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "MOV R0, #1").unwrap();
        let memory = Memory::new(1024, 1024, 100, 0, 15).unwrap();
        let mut cpu = Interpreter::new(memory);
        cpu.set_source(file.path());
        cpu.tick().unwrap();
        assert_eq!(cpu.registers()[0], 1);
        assert_eq!(cpu.pc(), Some(1));

        // rewrite the program; the interpreter restarts from scratch
        let mut file2 = tempfile::NamedTempFile::new().unwrap();
        writeln!(file2, "MOV R1, #2").unwrap();
        cpu.set_source(file2.path());
        cpu.tick().unwrap();
        assert_eq!(cpu.registers()[1], 2);
        assert_eq!(cpu.pc(), Some(1));
        assert_eq!(cpu.memory().instruction_count(), 1);
    }

    #[test]
    fn missing_source_file_surfaces_io_error() {
        let memory = Memory::new(1024, 1024, 100, 0, 15).unwrap();
        let mut cpu = Interpreter::new(memory);
        cpu.set_source(Path::new("/nonexistent/program.asm"));
        assert!(matches!(cpu.tick().unwrap_err(), Error::Io(_)));
    }
}
