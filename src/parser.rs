// This is where the dirty grunt work of making sense of our source text
// happens. One pass over the file: every line is stripped of its comment,
// split on whitespace and commas, and turned into either a label placeholder
// or a decoded instruction that gets appended to instruction memory. Label
// references stay symbolic; they are resolved against the label table when a
// branch actually executes, which is what makes forward references work.

use crate::error::Error;
use crate::fields::{clamp16, Opcode, Operand, NUM_REGISTERS};
use crate::instructions::Instruction;
use crate::memory::Memory;

/// Assemble a whole source file into `memory`, in file order.
pub fn assemble(source: &str, memory: &mut Memory) -> Result<(), Error> {
    for (index, raw_line) in source.lines().enumerate() {
        parse_line(raw_line, index + 1, memory)?;
    }
    tracing::debug!(instructions = memory.instruction_count(), "program assembled");
    Ok(())
}

fn parse_line(raw_line: &str, line: usize, memory: &mut Memory) -> Result<(), Error> {
    // everything from the first ';' is comment
    let text = raw_line.split(';').next().unwrap_or("").trim();
    if text.is_empty() {
        return Ok(());
    }
    let tokens: Vec<&str> = text
        .split_whitespace()
        .flat_map(|token| token.split(','))
        .filter(|token| !token.is_empty())
        .collect();
    // a line of bare commas lexes to nothing
    let head = match tokens.first() {
        Some(head) => *head,
        None => return Ok(()),
    };
    if let Some(name) = head.strip_suffix(':') {
        if !is_identifier(name) {
            return Err(Error::InvalidOperand { token: head.to_string(), line });
        }
        if tokens.len() > 1 {
            tracing::warn!(line, label = name, "tokens after a label are ignored");
        }
        return memory.add_instruction(Instruction::Label(name.to_string()), Some(name));
    }

    let opcode = Opcode::from_mnemonic(head)
        .ok_or_else(|| Error::UnknownOpcode { mnemonic: head.to_string(), line })?;

    let raw_operands = &tokens[1..];
    let (min, max) = opcode.arity();
    if raw_operands.len() < min || raw_operands.len() > max {
        return Err(Error::BadOperandArity {
            mnemonic: opcode.mnemonic(),
            expected: arity_text(min, max),
            got: raw_operands.len(),
            line,
        });
    }

    // RET tolerates a historic operand; it carries no meaning
    if opcode == Opcode::Ret {
        if !raw_operands.is_empty() {
            tracing::warn!(line, "RET operand is ignored");
        }
        return memory.add_instruction(Instruction::Op { opcode, operands: Vec::new() }, None);
    }

    let operands = raw_operands
        .iter()
        .map(|token| parse_operand(token, opcode, line))
        .collect::<Result<Vec<_>, _>>()?;

    if opcode.writes_first_operand() && !operands[0].is_writable() {
        return Err(Error::InvalidOperand { token: operands[0].as_asm(), line });
    }

    memory.add_instruction(Instruction::Op { opcode, operands }, None)
}

fn parse_operand(token: &str, opcode: Opcode, line: usize) -> Result<Operand, Error> {
    if opcode.is_branch() {
        // branch targets are label identifiers, nothing else
        return if is_identifier(token) {
            Ok(Operand::LabelRef(token.to_string()))
        } else {
            Err(Error::InvalidOperand { token: token.to_string(), line })
        };
    }
    if let Some(rest) = token.strip_prefix('M') {
        if let Some(register) = rest.strip_prefix('R') {
            return Ok(Operand::MemReg(parse_register_index(register, token, line)?));
        }
        return match rest.parse::<u16>() {
            Ok(address) => Ok(Operand::MemConst(address)),
            Err(_) => Err(Error::InvalidOperand { token: token.to_string(), line }),
        };
    }
    if let Some(rest) = token.strip_prefix('R') {
        return Ok(Operand::Reg(parse_register_index(rest, token, line)?));
    }
    if let Some(rest) = token.strip_prefix('#') {
        return match rest.parse::<i64>() {
            Ok(value) => Ok(Operand::Imm(clamp16(value))),
            Err(_) => Err(Error::InvalidOperand { token: token.to_string(), line }),
        };
    }
    Err(Error::InvalidOperand { token: token.to_string(), line })
}

fn parse_register_index(digits: &str, token: &str, line: usize) -> Result<usize, Error> {
    match digits.parse::<usize>() {
        Ok(index) if index < NUM_REGISTERS => Ok(index),
        _ => Err(Error::InvalidOperand { token: token.to_string(), line }),
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn arity_text(min: usize, max: usize) -> &'static str {
    match (min, max) {
        (0, 0) => "0",
        (0, 1) => "0 or 1",
        (1, 1) => "1",
        (2, 2) => "2",
        _ => "a different number of",
    }
}
