//! Terminal front panel for the em16 machine. Owns the tick timer, routes
//! typed keys into the keyboard FIFO, and repaints the video grid and the
//! CPU panel after every tick. A fault pauses execution with the PC left on
//! the offending instruction; `r` resumes, `q` quits.

use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::exit;
use std::sync::mpsc;
use std::thread;

use termion::event::Key;
use termion::input::TermRead;
use termion::raw::IntoRawMode;
use termion::{clear, color, cursor};
use tracing_subscriber::EnvFilter;

use em16::{Emulator, MachineConfig, Screen, Signal};

const TICK_MS: i64 = 500;
const SCREEN_WIDTH: usize = 100;
const SCREEN_HEIGHT: usize = 16;

// rows below the CPU panel where the status line and the video grid live
const STATUS_ROW: u16 = 13;
const SCREEN_ROW: u16 = 15;

enum HostEvent {
    Tick,
    Input(Key),
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut args = env::args().skip(1);
    let program = match args.next() {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("usage: console <program.asm> [machine.cfg]");
            exit(1);
        }
    };
    let config_path = PathBuf::from(args.next().unwrap_or_else(|| String::from("machine.cfg")));

    if let Err(err) = run(&program, &config_path) {
        eprintln!("fatal: {}", err);
        exit(1);
    }
}

fn run(program: &Path, config_path: &Path) -> em16::Result<()> {
    let config = MachineConfig::from_file(config_path)?;
    let mut em = Emulator::new(&config)?;
    em.load(program);
    let screen = Screen::new(SCREEN_WIDTH, SCREEN_HEIGHT);

    let (tx, rx) = mpsc::channel();

    // tick source
    let timer = timer::Timer::new();
    let tick_tx = tx.clone();
    let _tick_guard = timer.schedule_repeating(chrono::Duration::milliseconds(TICK_MS), move || {
        let _ = tick_tx.send(HostEvent::Tick);
    });

    // key source
    thread::spawn(move || {
        for key in io::stdin().keys() {
            match key {
                Ok(key) => {
                    if tx.send(HostEvent::Input(key)).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let mut stdout = io::stdout().into_raw_mode()?;
    write!(stdout, "{}{}", clear::All, cursor::Hide)?;
    draw(&mut stdout, &em, &screen, "running")?;

    let mut paused = false;
    for event in rx.iter() {
        match event {
            HostEvent::Input(Key::Ctrl('c')) | HostEvent::Input(Key::Esc) => break,
            HostEvent::Input(Key::Char('q')) if paused => break,
            HostEvent::Input(Key::Char('r')) if paused => {
                paused = false;
                draw(&mut stdout, &em, &screen, "resumed")?;
            }
            HostEvent::Input(Key::Char(c)) if !paused => {
                // Enter completes a line for the machine as code 13
                if c == '\n' || c == '\r' {
                    em.keyboard.push(13);
                } else if (c as u32) < 256 {
                    em.keyboard.push(c as u8);
                }
            }
            HostEvent::Input(_) => {}
            HostEvent::Tick if !paused => match em.tick() {
                Ok(Signal::Ok) => draw(&mut stdout, &em, &screen, "running")?,
                Ok(Signal::Reading) => draw(&mut stdout, &em, &screen, "waiting for input")?,
                Ok(Signal::Halted) => draw(&mut stdout, &em, &screen, "halted")?,
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        pc = ?em.cpu.pc(),
                        instr = %em.cpu.current_instruction_text(),
                        "execution fault"
                    );
                    paused = true;
                    let status = format!(
                        "{}fault: {} at PC {:?} ({}): r to retry, q to quit{}",
                        color::Fg(color::Red),
                        err,
                        em.cpu.pc(),
                        em.cpu.current_instruction_text(),
                        color::Fg(color::Reset),
                    );
                    draw(&mut stdout, &em, &screen, &status)?;
                }
            },
            HostEvent::Tick => {}
        }
    }

    write!(stdout, "{}{}{}", clear::All, cursor::Goto(1, 1), cursor::Show)?;
    stdout.flush()?;
    Ok(())
}

fn draw<W: Write>(out: &mut W, em: &Emulator, screen: &Screen, status: &str) -> io::Result<()> {
    write!(out, "{}", em.cpu)?;
    write!(out, "{}{}{}", cursor::Goto(1, STATUS_ROW), clear::CurrentLine, status)?;
    let rows = screen.render(&em.cpu.memory().read_video_memory());
    for (index, row) in rows.iter().enumerate() {
        write!(out, "{}{}", cursor::Goto(1, SCREEN_ROW + index as u16), row)?;
    }
    out.flush()
}
