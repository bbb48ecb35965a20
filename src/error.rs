//! The failure taxonomy of the machine. Every fault surfaces out of
//! `Interpreter::tick` (or out of the loader/configuration entry points);
//! the core never continues past one.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Memory sizes must be positive multiples of 1 KB, up to 64 KB.
    #[error("invalid memory size {size}: must be a multiple of 1024 and at most 65536")]
    InvalidMemorySize { size: usize },

    /// Out-of-range data address, or a program access to the keyboard cell.
    #[error("invalid data memory address {address}")]
    InvalidDataAddress { address: i32 },

    #[error("invalid instruction memory address {address}")]
    InvalidInstrAddress { address: i32 },

    #[error("instruction memory overflow: capacity of {capacity} reached")]
    InstructionOverflow { capacity: usize },

    #[error("unknown opcode \"{mnemonic}\" on line {line}")]
    UnknownOpcode { mnemonic: String, line: usize },

    #[error("unknown label \"{name}\"")]
    UnknownLabel { name: String },

    #[error("{mnemonic} expects {expected} operand(s), got {got} (line {line})")]
    BadOperandArity {
        mnemonic: &'static str,
        expected: &'static str,
        got: usize,
        line: usize,
    },

    #[error("invalid operand \"{token}\" on line {line}")]
    InvalidOperand { token: String, line: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("stack underflow")]
    StackUnderflow,

    #[error("configuration error: {message}")]
    Config { message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
