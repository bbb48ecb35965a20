use std::path::Path;
use std::sync::Arc;

pub mod config;
pub mod devices;
mod error;
pub mod fields;
pub mod instructions;
pub mod memory;
pub mod parser;
pub mod processor;

pub use config::MachineConfig;
pub use devices::{Keyboard, Screen, Signal};
pub use error::{Error, Result};
pub use memory::Memory;
pub use processor::Interpreter;

/// One assembled machine: memory with the peripherals mapped in, the
/// interpreter on top, and a handle to the keyboard FIFO for the host UI to
/// push key codes into.
pub struct Emulator {
    pub cpu: Interpreter,
    pub keyboard: Arc<Keyboard>,
}

impl Emulator {
    /// Build a machine from its configuration: validate the memory layout,
    /// create the keyboard and hand it to the interpreter through memory.
    pub fn new(config: &MachineConfig) -> Result<Emulator> {
        let mut memory = Memory::new(
            config.instruction_memory_size,
            config.data_memory_size,
            config.keyboard_buffer,
            config.video_memory_start,
            config.video_memory_end,
        )?;
        let keyboard = Arc::new(Keyboard::new());
        memory.set_keyboard_pointer(Arc::clone(&keyboard));
        Ok(Emulator { cpu: Interpreter::new(memory), keyboard })
    }

    /// Queue a program file; it is assembled on the next tick.
    pub fn load(&mut self, program: &Path) {
        self.cpu.set_source(program);
    }

    pub fn tick(&mut self) -> Result<Signal> {
        self.cpu.tick()
    }
}
