//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::render::WalkFormat;

#[derive(Parser, Debug)]
#[command(
    name = "salt",
    version,
    about = "Trace SLUB allocator activity in a kernel running under a GDB stub",
    after_help = "\
EXAMPLES:
    salt --vmlinux ./vmlinux                         Interactive tracing on 127.0.0.1:1234
    salt --vmlinux ./vmlinux --walk json             One-shot snapshot of every cache
    salt --vmlinux ./vmlinux --trace bash --record --export history.json --duration 30"
)]
pub struct Args {
    /// Uncompressed kernel image with symbols and DWARF
    #[arg(long, value_name = "FILE")]
    pub vmlinux: PathBuf,

    /// GDB remote stub (qemu -s listens on 127.0.0.1:1234)
    #[arg(long, default_value = "127.0.0.1:1234", value_name = "HOST:PORT")]
    pub remote: String,

    /// KASLR slide added to every text/data symbol (hex)
    #[arg(long, value_name = "HEX", value_parser = parse_hex, default_value = "0")]
    pub kaslr_offset: u64,

    /// Print one cache snapshot and detach instead of tracing
    #[arg(long, value_enum, value_name = "FORMAT")]
    pub walk: Option<WalkFormat>,

    /// Restrict --walk output to these caches (repeatable)
    #[arg(long = "cache", value_name = "NAME", requires = "walk")]
    pub caches: Vec<String>,

    /// Start with tracing restricted to these processes (repeatable)
    #[arg(long = "trace", value_name = "PROCESS", conflicts_with = "walk")]
    pub trace: Vec<String>,

    /// Start with recording on
    #[arg(long, conflicts_with = "walk")]
    pub record: bool,

    /// Append the calling kernel function to every trace line
    #[arg(long)]
    pub call_sites: bool,

    /// Write the recorded history to FILE on exit
    #[arg(long, value_name = "FILE", conflicts_with = "walk")]
    pub export: Option<PathBuf>,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

/// `0x`-prefixed or bare hexadecimal
fn parse_hex(text: &str) -> Result<u64, String> {
    let digits = text.trim_start_matches("0x").trim_start_matches("0X");
    u64::from_str_radix(digits, 16).map_err(|e| format!("invalid hex value '{text}': {e}"))
}
