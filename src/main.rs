use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use log::{debug, info};

use r16::bus::Bus;
use r16::cpu::assembler::{assemble, Image};
use r16::machine::{Exit, Machine};
use r16::rom::{Rom, ROM_START};
use r16::serial::Serial;
use r16::shell::MemShell;

#[derive(Parser)]
#[command(name = "r16", version, about = "Assembler and emulator for the r16 toy computer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Assemble a source file
    Asm {
        source: PathBuf,
        /// Output file, defaults to the source with a .bin extension
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print a hex listing of the image
        #[arg(long)]
        listing: bool,
    },
    /// Run a ROM with the serial port on stdin/stdout
    Run {
        /// Assembly source (.s, .asm) or a 4 KiB binary
        rom: PathBuf,
        #[arg(long)]
        max_steps: Option<u64>,
        /// Print every instruction to stderr before it runs
        #[arg(long)]
        trace: bool,
    },
    /// Run the processor against a memory answered from the terminal
    Shell {
        #[arg(long)]
        max_steps: Option<u64>,
    },
}

fn assemble_file(path: &Path) -> Result<Image> {
    let source = fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let image = assemble(&source).with_context(|| format!("failed to assemble {}", path.display()))?;
    debug!(
        "{}: {} bytes at {:04x}",
        path.display(),
        image.bytes.len(),
        image.origin
    );
    Ok(image)
}

fn is_source(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("s") | Some("asm")
    )
}

fn load_rom(path: &Path) -> Result<Rom> {
    if is_source(path) {
        let image = assemble_file(path)?;
        Ok(image.to_rom()?)
    } else {
        Ok(Rom::new_from_file(path)?)
    }
}

fn exit_code(exit: Exit) -> i32 {
    match exit {
        Exit::Requested => 0,
        Exit::StepLimit => 2,
    }
}

fn asm(source: &Path, output: Option<PathBuf>, listing: bool) -> Result<()> {
    let image = assemble_file(source)?;
    if listing {
        println!("{}", image.to_hex_listing());
    }

    let bytes = if image.origin == ROM_START {
        image.to_rom()?.as_bytes().to_vec()
    } else {
        image.bytes.clone()
    };
    let output = output.unwrap_or_else(|| source.with_extension("bin"));
    fs::write(&output, &bytes).with_context(|| format!("failed to write {}", output.display()))?;
    info!("wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}

fn run(rom: &Path, max_steps: Option<u64>, trace: bool) -> Result<i32> {
    let rom = load_rom(rom)?;

    // stdin blocks, so it is read on its own thread and handed over byte by byte
    let (host_tx, host_rx) = unbounded();
    thread::spawn(move || {
        let stdin = io::stdin();
        for byte in stdin.lock().bytes() {
            match byte {
                Ok(b) => {
                    if host_tx.send(b).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let serial = Serial::with_host_input(io::stdout(), host_rx);
    let mut machine = Machine::new(Bus::new(rom, serial));
    let exit = if trace {
        machine.run_with_callback(max_steps, |m| eprintln!("{}", m.cpu.trace(&mut m.mem)))
    } else {
        machine.run(max_steps)
    };
    info!("{:?} after {} steps", exit, machine.cpu.steps());
    Ok(exit_code(exit))
}

fn shell(max_steps: Option<u64>) -> Result<i32> {
    let stdin = io::stdin();
    let shell = MemShell::new(stdin.lock(), io::stdout());
    let mut machine = Machine::new(shell);
    let exit = machine.run(max_steps);
    Ok(exit_code(exit))
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let code = match cli.command {
        Command::Asm {
            source,
            output,
            listing,
        } => {
            asm(&source, output, listing)?;
            0
        }
        Command::Run {
            rom,
            max_steps,
            trace,
        } => run(&rom, max_steps, trace)?,
        Command::Shell { max_steps } => shell(max_steps)?,
    };
    std::process::exit(code);
}
