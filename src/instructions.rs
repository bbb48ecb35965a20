//! The instruction record as stored in instruction memory, and its
//! execution against the processor state. Decoding happened at load time,
//! so executing is one `match` over the opcode; every arm computes its
//! result first and only then commits writes and flags, which is what keeps
//! a faulting instruction from leaving half an effect behind.

use crate::error::Error;
use crate::fields::{clamp16, FlagUpdate, Opcode, Operand};
use crate::processor::{Interpreter, Step};

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    /// A label placeholder. Occupies a slot, does nothing at execute time.
    Label(String),
    Op { opcode: Opcode, operands: Vec<Operand> },
}

impl Instruction {
    pub fn as_asm(&self) -> String {
        match self {
            Instruction::Label(name) => format!("{}:", name),
            Instruction::Op { opcode, operands } => {
                if operands.is_empty() {
                    opcode.mnemonic().to_string()
                } else {
                    let rendered: Vec<String> = operands.iter().map(|op| op.as_asm()).collect();
                    format!("{} {}", opcode.mnemonic(), rendered.join(", "))
                }
            }
        }
    }

    pub fn execute(&self, cpu: &mut Interpreter) -> Result<Step, Error> {
        let (opcode, operands) = match self {
            Instruction::Label(_) => return Ok(Step::Next),
            Instruction::Op { opcode, operands } => (*opcode, operands.as_slice()),
        };
        match opcode {
            Opcode::Mov => {
                // A load from the keyboard port does not complete now; it
                // parks the processor in the reading state instead.
                if let Some(address) = cpu.memory_address(&operands[1]) {
                    if cpu.memory().is_keyboard_port(address) {
                        cpu.begin_read(operands[0].clone());
                        return Ok(Step::Block);
                    }
                }
                let value = cpu.eval(&operands[1])?;
                cpu.store(&operands[0], value as i64)?;
                Ok(Step::Next)
            }
            Opcode::Add => arithmetic(cpu, operands, |a, b| a + b),
            Opcode::Sub => arithmetic(cpu, operands, |a, b| a - b),
            Opcode::Mul => arithmetic(cpu, operands, |a, b| a * b),
            Opcode::Div => {
                let dividend = cpu.eval(&operands[0])? as i64;
                let divisor = cpu.eval(&operands[1])? as i64;
                if divisor == 0 {
                    return Err(Error::DivisionByZero);
                }
                // truncation toward zero, like the hardware would
                let result = clamp16(dividend / divisor);
                cpu.store(&operands[0], result as i64)?;
                FlagUpdate::result(result).apply(cpu.flags_mut());
                Ok(Step::Next)
            }
            Opcode::Cmp => {
                let a = cpu.eval(&operands[0])? as i64;
                let b = cpu.eval(&operands[1])? as i64;
                let difference = a - b;
                let update = FlagUpdate {
                    zf: Some(a == b),
                    sf: Some(difference < 0),
                    cf: Some(a < b),
                    of: Some(difference > i16::MAX as i64 || difference < i16::MIN as i64),
                };
                update.apply(cpu.flags_mut());
                Ok(Step::Next)
            }
            Opcode::Jmp
            | Opcode::Je
            | Opcode::Jne
            | Opcode::Jg
            | Opcode::Jl
            | Opcode::Jge
            | Opcode::Jle => {
                let flags = cpu.flags();
                let taken = match opcode {
                    Opcode::Jmp => true,
                    Opcode::Je => flags.zf,
                    Opcode::Jne => !flags.zf,
                    Opcode::Jg => !flags.zf && flags.sf == flags.of,
                    Opcode::Jl => flags.sf && !flags.zf,
                    Opcode::Jge => flags.sf == flags.of,
                    Opcode::Jle => flags.zf || flags.sf != flags.of,
                    _ => unreachable!(),
                };
                if taken {
                    let target = cpu.branch_target(&operands[0])?;
                    cpu.jump_to(target);
                    Ok(Step::Jump)
                } else {
                    Ok(Step::Next)
                }
            }
            Opcode::Push => {
                let value = cpu.eval(&operands[0])?;
                cpu.stack_push(value as i32);
                Ok(Step::Next)
            }
            Opcode::Pop => {
                let value = cpu.stack_pop().ok_or(Error::StackUnderflow)?;
                cpu.store(&operands[0], value as i64)?;
                Ok(Step::Next)
            }
            Opcode::Call => {
                let target = cpu.branch_target(&operands[0])?;
                let return_address = cpu.current_pc() + 1;
                cpu.stack_push(return_address);
                cpu.jump_to(target);
                Ok(Step::Jump)
            }
            Opcode::Ret => {
                let return_address = cpu.stack_pop().ok_or(Error::StackUnderflow)?;
                cpu.set_pc(return_address);
                Ok(Step::Jump)
            }
            Opcode::Not => {
                let value = cpu.eval(&operands[0])? as u16;
                cpu.store(&operands[0], (!value as i16) as i64)?;
                Ok(Step::Next)
            }
            Opcode::And => bitwise(cpu, operands, |a, b| a & b),
            Opcode::Or => bitwise(cpu, operands, |a, b| a | b),
            Opcode::Xor => bitwise(cpu, operands, |a, b| a ^ b),
            Opcode::Shl => {
                let value = cpu.eval(&operands[0])? as i64;
                let amount = cpu.eval(&operands[1])?;
                let shifted = if amount <= 0 {
                    value
                } else if amount >= 32 {
                    // far enough left that only the sign survives clamping
                    match value {
                        0 => 0,
                        v if v > 0 => i64::MAX,
                        _ => i64::MIN,
                    }
                } else {
                    value << amount
                };
                cpu.store(&operands[0], shifted)?;
                Ok(Step::Next)
            }
            Opcode::Shr => {
                // logical shift of the unsigned 16-bit view
                let value = cpu.eval(&operands[0])? as u16;
                let amount = cpu.eval(&operands[1])?;
                let shifted = if amount <= 0 {
                    value
                } else if amount >= 16 {
                    0
                } else {
                    value >> amount
                };
                cpu.store(&operands[0], (shifted as i16) as i64)?;
                Ok(Step::Next)
            }
        }
    }
}

fn arithmetic(
    cpu: &mut Interpreter,
    operands: &[Operand],
    op: impl Fn(i64, i64) -> i64,
) -> Result<Step, Error> {
    let a = cpu.eval(&operands[0])? as i64;
    let b = cpu.eval(&operands[1])? as i64;
    let result = clamp16(op(a, b));
    cpu.store(&operands[0], result as i64)?;
    FlagUpdate::result(result).apply(cpu.flags_mut());
    Ok(Step::Next)
}

fn bitwise(
    cpu: &mut Interpreter,
    operands: &[Operand],
    op: impl Fn(u16, u16) -> u16,
) -> Result<Step, Error> {
    let a = cpu.eval(&operands[0])? as u16;
    let b = cpu.eval(&operands[1])? as u16;
    cpu.store(&operands[0], (op(a, b) as i16) as i64)?;
    Ok(Step::Next)
}
