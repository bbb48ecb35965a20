//! The machine configuration file: `key: value` lines fixing the two memory
//! sizes and the three peripheral mapping addresses. Only shape and
//! completeness are checked here; `Memory::new` owns the range rules.

use crate::error::Error;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const KEYS: [&str; 5] = [
    "instruction_memory_size",
    "data_memory_size",
    "keyboard_buffer",
    "video_memory_start",
    "video_memory_end",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    pub instruction_memory_size: usize,
    pub data_memory_size: usize,
    pub keyboard_buffer: usize,
    pub video_memory_start: usize,
    pub video_memory_end: usize,
}

impl MachineConfig {
    pub fn from_file(path: &Path) -> Result<MachineConfig, Error> {
        let text = fs::read_to_string(path)?;
        MachineConfig::parse(&text)
    }

    pub fn parse(text: &str) -> Result<MachineConfig, Error> {
        let mut values: HashMap<&str, usize> = HashMap::new();
        for (index, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (key, value) = match line.split_once(':') {
                Some(pair) => pair,
                None => {
                    return Err(Error::Config {
                        message: format!("line {}: expected key: value, got \"{}\"", index + 1, line),
                    })
                }
            };
            let key = key.trim();
            let key = match KEYS.iter().find(|known| **known == key) {
                Some(known) => *known,
                None => {
                    return Err(Error::Config {
                        message: format!("line {}: unknown key \"{}\"", index + 1, key),
                    })
                }
            };
            let value = value.trim().parse::<usize>().map_err(|_| Error::Config {
                message: format!("line {}: value for {} is not a positive integer", index + 1, key),
            })?;
            values.insert(key, value);
        }
        for key in &KEYS {
            if !values.contains_key(key) {
                return Err(Error::Config { message: format!("missing key \"{}\"", key) });
            }
        }
        Ok(MachineConfig {
            instruction_memory_size: values["instruction_memory_size"],
            data_memory_size: values["data_memory_size"],
            keyboard_buffer: values["keyboard_buffer"],
            video_memory_start: values["video_memory_start"],
            video_memory_end: values["video_memory_end"],
        })
    }
}
