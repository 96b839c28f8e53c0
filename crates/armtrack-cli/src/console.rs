//! Operator console on stdin.
//!
//! Commands:
//!   pause | resume  – freeze / unfreeze the published estimate
//!   (empty line)    – toggle pause
//!   emu pause | emu resume | emu
//!                   – freeze / unfreeze / toggle the emulated robot
//!   status          – print run state, counters and stream health
//!   help            – show this list
//!   quit | exit     – shut down

use colored::Colorize;
use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use armtrack_hal::EmulatorControl;
use armtrack_runtime::FusionController;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Toggle,
    EmulatorPause,
    EmulatorResume,
    EmulatorToggle,
    Status,
    Help,
    Quit,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let lower = line.to_ascii_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        match words.as_slice() {
            ["emu"] => return Command::EmulatorToggle,
            ["emu", "pause" | "p"] => return Command::EmulatorPause,
            ["emu", "resume" | "r"] => return Command::EmulatorResume,
            _ => {}
        }
        match line.trim().to_ascii_lowercase().as_str() {
            "" => Command::Toggle,
            "pause" | "p" => Command::Pause,
            "resume" | "r" => Command::Resume,
            "status" | "s" => Command::Status,
            "help" | "?" => Command::Help,
            "quit" | "exit" | "q" => Command::Quit,
            _ => Command::Unknown(line.trim().to_string()),
        }
    }
}

/// Execute `command` against `controller` or `emulator`.  Returns `false`
/// once the console should stop reading.
pub fn apply(
    controller: &FusionController,
    emulator: &EmulatorControl,
    command: &Command,
    shutdown: &AtomicBool,
) -> bool {
    let transition = match command {
        Command::Pause => controller.pause(),
        Command::Resume => controller.resume(),
        Command::Toggle => controller.toggle_pause(),
        Command::EmulatorPause => {
            emulator.pause();
            print_emulator(emulator);
            return true;
        }
        Command::EmulatorResume => {
            emulator.resume();
            print_emulator(emulator);
            return true;
        }
        Command::EmulatorToggle => {
            emulator.toggle_pause();
            print_emulator(emulator);
            return true;
        }
        Command::Status => {
            print_status(controller);
            return true;
        }
        Command::Help => {
            print_help();
            return true;
        }
        Command::Quit => {
            println!("{}", "Shutting down.".green());
            shutdown.store(true, Ordering::SeqCst);
            return false;
        }
        Command::Unknown(other) => {
            println!(
                "{} '{}'. Type {} for available commands.",
                "Unknown command:".red(),
                other.yellow(),
                "help".bold()
            );
            return true;
        }
    };
    match transition {
        Ok(state) => println!("  tracker {}", state.to_string().bold()),
        Err(e) => println!("{}: {e}", "Rejected".red()),
    }
    true
}

/// Read commands from stdin until `quit`, EOF or `shutdown`.
///
/// Runs on its own thread because stdin reads block.
pub fn run(controller: FusionController, emulator: EmulatorControl, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut line = String::new();
    while !shutdown.load(Ordering::SeqCst) {
        line.clear();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }
        if !apply(&controller, &emulator, &Command::parse(&line), &shutdown) {
            break;
        }
    }
}

fn print_emulator(emulator: &EmulatorControl) {
    let state = if emulator.is_paused() { "paused" } else { "running" };
    println!("  emulator {}", state.bold());
}

fn print_status(controller: &FusionController) {
    println!("  state: {}", controller.run_state().to_string().bold());
    match serde_json::to_string(&controller.stats()) {
        Ok(json) => println!("  stats: {json}"),
        Err(e) => println!("{}: {e}", "Stats unavailable".red()),
    }
    for (stream, health) in controller.stream_health() {
        println!("  {stream:?}: {health:?}");
    }
}

fn print_help() {
    println!("  {}  freeze the estimate", "pause ".bold());
    println!("  {}  continue tracking", "resume".bold());
    println!("  {}  toggle pause", "<enter>".bold());
    println!("  {}  freeze / unfreeze / toggle the robot", "emu pause|resume|".bold());
    println!("  {}  counters and stream health", "status".bold());
    println!("  {}  exit", "quit  ".bold());
}
