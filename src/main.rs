//! Thin CLI shell around the compiler core: reads a hardware-mapping
//! document and a schedule document from disk and writes the compiled
//! artifact as JSON.

use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, warn};

use qblox_backend::compile_schedule;

#[derive(Parser, Debug)]
#[command(name = "qblox_backend_cli", about = "Compile a pulse schedule into per-sequencer Q1ASM programs")]
struct Cli {
    /// Path to the hardware-mapping JSON document.
    #[arg(long)]
    mapping: PathBuf,

    /// Path to the schedule JSON document.
    #[arg(long)]
    schedule: PathBuf,

    /// Path the compiled artifact is written to.
    #[arg(long)]
    out: PathBuf,
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let mapping_text = match fs::read_to_string(&cli.mapping) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to read {:?}: {e}", cli.mapping);
            return ExitCode::FAILURE;
        }
    };
    let schedule_text = match fs::read_to_string(&cli.schedule) {
        Ok(text) => text,
        Err(e) => {
            error!("failed to read {:?}: {e}", cli.schedule);
            return ExitCode::FAILURE;
        }
    };

    let mapping: serde_json::Value = match serde_json::from_str(&mapping_text) {
        Ok(v) => v,
        Err(e) => {
            error!("{:?} is not valid JSON: {e}", cli.mapping);
            return ExitCode::FAILURE;
        }
    };
    let schedule = match serde_json::from_str(&schedule_text) {
        Ok(s) => s,
        Err(e) => {
            error!("{:?} does not match the schedule document shape: {e}", cli.schedule);
            return ExitCode::FAILURE;
        }
    };

    let (artifact, warnings) = match compile_schedule(&mapping, &schedule) {
        Ok(result) => result,
        Err(e) => {
            error!("compilation failed: {e}");
            return ExitCode::FAILURE;
        }
    };
    for warning in &warnings {
        warn!("{warning}");
    }

    let json = match artifact.to_json_string() {
        Ok(json) => json,
        Err(e) => {
            error!("failed to serialise compiled artifact: {e}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = fs::write(&cli.out, json) {
        error!("failed to write {:?}: {e}", cli.out);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
