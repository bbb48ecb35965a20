//! The segmented store of the machine: an append-only instruction region,
//! a data region with two memory-mapped windows carved out of it (the
//! keyboard cell and the video range), and the label table the loader fills
//! in. All address validation lives here; the processor only ever goes
//! through `get_data`/`set_data`.

use crate::devices::Keyboard;
use crate::error::Error;
use crate::fields::clamp16;
use crate::instructions::Instruction;
use std::collections::HashMap;
use std::sync::Arc;

pub const MAX_MEMORY_SIZE: usize = 65536;
pub const MIN_MEMORY_SIZE: usize = 1024;

pub struct Memory {
    instruction_memory_size: usize,
    data_memory_size: usize,
    instruction_memory: Vec<Instruction>,
    data_memory: Vec<Option<i16>>,
    keyboard_buffer_address: i32,
    video_memory_start: i32,
    video_memory_end: i32,
    labels: HashMap<String, usize>,
    // The live peripheral handle. The keyboard is *addressed* through its
    // data-memory cell but never stored in one; the cell itself stays
    // untouched by programs.
    keyboard: Option<Arc<Keyboard>>,
}

impl Memory {
    pub fn new(
        instruction_memory_size: usize,
        data_memory_size: usize,
        keyboard_buffer_address: usize,
        video_memory_start: usize,
        video_memory_end: usize,
    ) -> Result<Memory, Error> {
        validate_memory_size(instruction_memory_size)?;
        validate_memory_size(data_memory_size)?;
        if keyboard_buffer_address >= data_memory_size {
            return Err(Error::InvalidDataAddress { address: keyboard_buffer_address as i32 });
        }
        if video_memory_start >= data_memory_size
            || video_memory_end >= data_memory_size
            || video_memory_end < video_memory_start
        {
            return Err(Error::InvalidDataAddress { address: video_memory_end as i32 });
        }
        if (video_memory_start..=video_memory_end).contains(&keyboard_buffer_address) {
            // the keyboard cell and the video window must stay disjoint
            return Err(Error::InvalidDataAddress { address: keyboard_buffer_address as i32 });
        }
        Ok(Memory {
            instruction_memory_size,
            data_memory_size,
            instruction_memory: Vec::new(),
            data_memory: vec![None; data_memory_size],
            keyboard_buffer_address: keyboard_buffer_address as i32,
            video_memory_start: video_memory_start as i32,
            video_memory_end: video_memory_end as i32,
            labels: HashMap::new(),
            keyboard: None,
        })
    }

    /// Append one decoded instruction (or label placeholder). A supplied
    /// label name is bound to the index just appended.
    pub fn add_instruction(
        &mut self,
        instruction: Instruction,
        label: Option<&str>,
    ) -> Result<(), Error> {
        if self.instruction_memory.len() >= self.instruction_memory_size {
            return Err(Error::InstructionOverflow { capacity: self.instruction_memory_size });
        }
        self.instruction_memory.push(instruction);
        if let Some(name) = label {
            let index = self.instruction_memory.len() - 1;
            if let Some(previous) = self.labels.insert(name.to_string(), index) {
                tracing::warn!(label = name, previous, index, "label redefined");
            }
        }
        Ok(())
    }

    pub fn get_instruction(&self, address: usize) -> Result<&Instruction, Error> {
        self.instruction_memory
            .get(address)
            .ok_or(Error::InvalidInstrAddress { address: address as i32 })
    }

    /// True iff `address` falls inside the written prefix of the program.
    pub fn is_valid_instr_addr(&self, address: i32) -> bool {
        address >= 0 && (address as usize) < self.instruction_memory.len()
    }

    pub fn instruction_count(&self) -> usize {
        self.instruction_memory.len()
    }

    /// Store a value into data memory. Video cells keep only the low byte;
    /// everything else is clamped to the signed 16-bit range. The keyboard
    /// cell rejects program writes.
    pub fn set_data(&mut self, address: i32, value: i64) -> Result<(), Error> {
        self.check_data_address(address)?;
        let cell = if self.is_video(address) { (value & 0xff) as i16 } else { clamp16(value) };
        self.data_memory[address as usize] = Some(cell);
        Ok(())
    }

    /// Read a data cell; uninitialised cells read as 0. The keyboard cell is
    /// not a readable data cell; the processor intercepts that address
    /// before ever calling this.
    pub fn get_data(&self, address: i32) -> Result<i16, Error> {
        self.check_data_address(address)?;
        Ok(self.data_memory[address as usize].unwrap_or(0))
    }

    /// Is this address the memory-mapped keyboard port?
    pub fn is_keyboard_port(&self, address: i32) -> bool {
        address == self.keyboard_buffer_address
    }

    /// Host-only back channel: hand the keyboard FIFO to the interpreter.
    pub fn set_keyboard_pointer(&mut self, keyboard: Arc<Keyboard>) {
        self.keyboard = Some(keyboard);
    }

    pub fn get_keyboard_pointer(&self) -> Option<Arc<Keyboard>> {
        self.keyboard.as_ref().map(Arc::clone)
    }

    /// An ordered snapshot of the video window, `ve - vs + 1` cells long.
    /// `None` marks cells no program has written yet.
    pub fn read_video_memory(&self) -> Vec<Option<u8>> {
        self.data_memory[self.video_memory_start as usize..=self.video_memory_end as usize]
            .iter()
            .map(|cell| cell.map(|value| value as u8))
            .collect()
    }

    pub fn resolve_label(&self, name: &str) -> Result<usize, Error> {
        self.labels
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownLabel { name: name.to_string() })
    }

    /// Drop the program and its labels so a changed source file can be
    /// assembled from scratch. Data memory is left alone.
    pub(crate) fn clear_program(&mut self) {
        self.instruction_memory.clear();
        self.labels.clear();
    }

    fn is_video(&self, address: i32) -> bool {
        address >= self.video_memory_start && address <= self.video_memory_end
    }

    fn check_data_address(&self, address: i32) -> Result<(), Error> {
        if address < 0 || address as usize >= self.data_memory_size {
            return Err(Error::InvalidDataAddress { address });
        }
        if address == self.keyboard_buffer_address {
            return Err(Error::InvalidDataAddress { address });
        }
        Ok(())
    }
}

fn validate_memory_size(size: usize) -> Result<(), Error> {
    if size == 0 || size % MIN_MEMORY_SIZE != 0 || size > MAX_MEMORY_SIZE {
        return Err(Error::InvalidMemorySize { size });
    }
    Ok(())
}
