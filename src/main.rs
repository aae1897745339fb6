//! trace-vm - Main Entry Point
//!
//! Usage:
//!   trace-vm trace [--frames <hex>] <trace_file>
//!   trace-vm frames <script_file>
//!
//! `trace` builds a page directory for one process on a simulated MMU and
//! runs the memory operations of the trace file against its virtual address
//! space. `frames` drives the page frame allocator from a small script.
//!
//! Exit status: 0 on success, 2 for unreadable or malformed input, 3 for an
//! `alloc`/`writable` range that is not page aligned.

use std::io::{self, BufWriter};
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::error;

use trace_vm::io::FrameScript;
use trace_vm::{run_trace_file, TraceError};

#[derive(Parser)]
#[command(name = "trace-vm")]
#[command(about = "Virtual memory trace simulator with a two-level page table MMU")]
struct Cli {
    /// Log page table and allocator activity
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Run a memory trace
    Trace {
        /// Trace file, one command per line
        file: PathBuf,

        /// Number of physical page frames, in hex (0x100 = 1 MiB, at most 0x100000)
        #[arg(long, value_parser = parse_hex, default_value = "100")]
        frames: u32,
    },
    /// Run a page frame allocator script
    Frames {
        /// Script file: hex frame count, then `0 n`, `1 n` or `2` per line
        file: PathBuf,
    },
}

fn parse_hex(s: &str) -> Result<u32, String> {
    u32::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| format!("invalid hex number '{}': {}", s, e))
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level)).init();

    // Run and map fatal errors to exit codes
    if let Err(e) = run(cli.command) {
        error!("{:#}", e);
        let code = e.downcast_ref::<TraceError>().map_or(1, TraceError::exit_code);
        process::exit(code);
    }
}

fn run(mode: Mode) -> Result<()> {
    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());

    match mode {
        Mode::Trace { file, frames } => {
            run_trace_file(&file, frames, &mut out)
                .with_context(|| format!("trace {}", file.display()))?;
        }
        Mode::Frames { file } => {
            let script = FrameScript::from_file(&file)?;
            script
                .run(&mut out)
                .with_context(|| format!("frame script {}", file.display()))?;
        }
    }
    Ok(())
}
