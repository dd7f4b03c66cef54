//! `bittern-cache`: constructs a cache engine over a backing device and a
//! cache device, then serves a line-oriented control protocol on stdin/
//! stdout so an operator (or a script) can drive the same set/get control
//! plane `bittern_core::Cache` exposes internally.
//!
//! This binary is deliberately thin: argument parsing, wiring the two
//! device files into `Cache::create`/`Cache::restore`, and relaying
//! control/observability text. It does not register a device-mapper
//! target, expose a sysfs tree, or reimplement trace plumbing -- those
//! remain outside this crate, same as the engine itself.

use std::fs::OpenOptions;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use clap::{Parser, Subcommand};

use bittern_core::{Cache, Tunables};

#[derive(Parser)]
#[command(name = "bittern-cache", about = "Block-level writeback/writethrough cache engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initializes a fresh on-media layout on `cache_device` and opens it.
    Create {
        backing_device: PathBuf,
        cache_device: PathBuf,
    },
    /// Opens an existing on-media layout on `cache_device`.
    Restore {
        backing_device: PathBuf,
        cache_device: PathBuf,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Create { backing_device, cache_device } => run_create(backing_device, cache_device),
        Command::Restore { backing_device, cache_device } => run_restore(backing_device, cache_device),
    };

    if let Err(err) = result {
        eprintln!("bittern-cache: {err}");
        std::process::exit(1);
    }
}

fn open_devices(backing_device: &PathBuf, cache_device: &PathBuf, create: bool) -> io::Result<(std::fs::File, std::fs::File)> {
    let backing = OpenOptions::new().read(true).write(true).open(backing_device)?;
    let cache_dev = OpenOptions::new().read(true).write(true).open(cache_device)?;
    let _ = create;
    Ok((backing, cache_dev))
}

fn run_create(backing_device: PathBuf, cache_device: PathBuf) -> Result<(), String> {
    let (backing, cache_dev) = open_devices(&backing_device, &cache_device, true).map_err(|e| e.to_string())?;
    let device_size = cache_dev.metadata().map_err(|e| e.to_string())?.len();
    let slot_count = bittern_core::layout::max_slot_count_for_device_size(device_size);
    if slot_count == 0 {
        return Err(format!("{} is too small to hold even one cache block", cache_device.display()));
    }
    log::info!("creating cache: {} slots on {}", slot_count, cache_device.display());
    let cache = Cache::create(backing, cache_dev, slot_count, Tunables::defaults(slot_count)).map_err(|e| e.to_string())?;
    serve_control_plane(&cache)
}

fn run_restore(backing_device: PathBuf, cache_device: PathBuf) -> Result<(), String> {
    let (backing, cache_dev) = open_devices(&backing_device, &cache_device, false).map_err(|e| e.to_string())?;
    log::info!("restoring cache from {}", cache_device.display());
    // `Tunables::defaults` is rebuilt against the restored slot count inside
    // `Cache::restore`'s superblock read; the value passed here only seeds
    // bgwriter/bypass/verifier defaults, all overridable afterwards via `set`.
    let cache = Cache::restore(backing, cache_dev, Tunables::defaults(1)).map_err(|e| e.to_string())?;
    serve_control_plane(&cache)
}

/// Reads `key=value` or bare `key` lines from stdin, dispatching `set`/
/// `get` against the cache's control plane and writing the response
/// (or `ERR <message>`) back to stdout, one line per request. Exits
/// cleanly on EOF or a line of `quit`.
fn serve_control_plane(cache: &std::sync::Arc<Cache>) -> Result<(), String> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    for line in stdin.lock().lines() {
        let line = line.map_err(|e| e.to_string())?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" {
            break;
        }
        let response = match line.split_once('=') {
            Some((key, value)) => cache.set(key.trim(), value.trim()).map(|()| "OK".to_string()),
            None => cache.get(line),
        };
        let out = match response {
            Ok(text) => text,
            Err(err) => format!("ERR {err}"),
        };
        writeln!(stdout, "{out}").map_err(|e| e.to_string())?;
        stdout.flush().map_err(|e| e.to_string())?;
    }
    Ok(())
}
