//! # salt - Main Entry Point
//!
//! Supports two operational modes:
//! - **Snapshot** (`--walk text|json|html`): print every cache once and detach
//! - **Trace** (default): resume the kernel, print allocator events as they
//!   happen and accept commands on stdin (`help` lists them)

// Main function is intentionally long for clarity; time conversions lose precision for display
#![allow(clippy::too_many_lines, clippy::cast_precision_loss)]

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::{bounded, Receiver};
use log::{debug, info, warn};
use std::io::BufRead;
use std::time::{Duration, Instant};

use salt::backend::gdb_remote::{GdbRemote, StopEvent};
use salt::backend::Hit;
use salt::cli::commands::export_history;
use salt::cli::{execute, parse_command, Args};
use salt::kernel::dwarf::discover_layouts;
use salt::kernel::KernelImage;
use salt::preflight::run_preflight_checks;
use salt::render::{self, text};
use salt::session::Session;
use salt::symbolization::Symbolizer;

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_NOPERM: i32 = 77;

/// How long one poll for a stop reply may block
const STOP_POLL: Duration = Duration::from_millis(20);

fn main() {
    env_logger::init();
    std::process::exit(match run() {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            let code = exit_code_for(&e);
            eprintln!("error: {e:#}");
            code
        }
    });
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let msg = format!("{err:#}").to_lowercase();
    if msg.contains("permission denied") {
        EXIT_NOPERM
    } else if msg.contains("invalid stub address") {
        EXIT_USAGE
    } else {
        EXIT_ERROR
    }
}

/// Forward stdin lines to the trace loop
fn spawn_command_reader() -> Receiver<String> {
    let (tx, rx) = bounded(64);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// Dispatch one hit and print the accepted event
fn handle_hit(
    session: &mut Session,
    remote: &mut GdbRemote,
    hit: &Hit,
    call_sites: Option<&Symbolizer>,
) {
    match session.dispatch(remote, hit) {
        Ok(Some(event)) => {
            let line = text::trace_line(&event);
            match call_sites.zip(event.call_site) {
                Some((symbolizer, site)) => {
                    println!("{line} [{}]", symbolizer.resolve(site).short());
                }
                None => println!("{line}"),
            }
        }
        Ok(None) => {}
        Err(e) => warn!("failed to handle probe {:?}: {e}", hit.probe()),
    }
}

#[tokio::main]
async fn run() -> Result<()> {
    let args = Args::parse();
    let quiet = args.quiet;

    // Run pre-flight checks before anything else
    let stub = run_preflight_checks(&args.vmlinux, &args.remote)?;

    if !quiet {
        println!("salt v{}", env!("CARGO_PKG_VERSION"));
        println!("vmlinux: {}", args.vmlinux.display());
        println!("remote: {stub}");
    }

    // ── Kernel image: symbols and struct layouts ────────────────────────
    let image = KernelImage::load(&args.vmlinux).context("Failed to load kernel image")?;
    let symbols = image.symbols()?.with_slide(args.kaslr_offset);
    let layout = discover_layouts(&image.dwarf()?).context("Failed to read struct layouts")?;
    info!("kernel layouts resolved, kmem_cache is {} bytes", layout.kmem_cache.size);

    let symbolizer = if args.call_sites || args.export.is_some() {
        match Symbolizer::new(&image, args.kaslr_offset) {
            Ok(symbolizer) => Some(symbolizer),
            Err(e) => {
                warn!("call-site symbolization unavailable: {e:#}");
                None
            }
        }
    } else {
        None
    };
    let call_sites = symbolizer.as_ref().filter(|_| args.call_sites);

    // ── Attach: the stub halts the kernel on connect ────────────────────
    let mut remote = GdbRemote::connect(&stub.to_string(), symbols)
        .with_context(|| format!("Failed to connect to GDB stub at {stub}"))?;
    let mut session = Session::new(&mut remote, layout)?;

    if let Some(format) = args.walk {
        let snapshot = session.walk(&mut remote).context("Failed to read slab_caches")?;
        let targets = (!args.caches.is_empty()).then_some(args.caches.as_slice());
        print!("{}", render::render_snapshot(format, &snapshot, targets)?);
        remote.detach()?;
        return Ok(());
    }

    if !args.trace.is_empty() {
        session.trace_processes(&args.trace);
    }
    if args.record {
        session.set_recording(true);
    }
    if !quiet {
        println!("probes: {}", session.armed_probes().join(", "));
        if let Some(ref export_path) = args.export {
            println!("export: {}", export_path.display());
        }
        println!("type 'help' for commands");
    }

    let commands = spawn_command_reader();

    // Setup Ctrl+C handler
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    // Track start time for duration limit
    let tracing_start = Instant::now();
    let duration_limit =
        if args.duration > 0 { Some(Duration::from_secs(args.duration)) } else { None };

    // Track why we exited the loop
    let mut exit_reason = "interrupted";
    let mut target_alive = true;

    remote.resume()?;
    'tracing: loop {
        // Check for duration timeout
        if let Some(limit) = duration_limit {
            if tracing_start.elapsed() >= limit {
                exit_reason = "duration limit reached";
                break;
            }
        }

        // Drain every stop that is already waiting
        while let Some(stop) = remote.poll_stop(STOP_POLL)? {
            match stop {
                StopEvent::Hit(hit) => handle_hit(&mut session, &mut remote, &hit, call_sites),
                StopEvent::Interrupted | StopEvent::Spurious => {}
                StopEvent::Exited(reason) => {
                    info!("target exited: {reason}");
                    exit_reason = "target exited";
                    target_alive = false;
                    break 'tracing;
                }
            }
            remote.resume()?;
        }

        // Commands run with the kernel halted
        let pending: Vec<String> = commands.try_iter().collect();
        if !pending.is_empty() {
            match remote.halt()? {
                StopEvent::Hit(hit) => handle_hit(&mut session, &mut remote, &hit, call_sites),
                StopEvent::Exited(reason) => {
                    info!("target exited: {reason}");
                    exit_reason = "target exited";
                    target_alive = false;
                    break;
                }
                StopEvent::Interrupted | StopEvent::Spurious => {}
            }
            let mut quit = false;
            for line in pending {
                let command = match parse_command(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(e) => {
                        print!("{}", e.render());
                        continue;
                    }
                };
                debug!("command: {command:?}");
                match execute(command, &mut session, &mut remote, symbolizer.as_ref()) {
                    Ok(outcome) => {
                        for line in &outcome.lines {
                            println!("{line}");
                        }
                        quit |= outcome.quit;
                    }
                    Err(e) => println!("{e:#}"),
                }
            }
            if quit {
                exit_reason = "quit";
                break;
            }
            remote.resume()?;
        }

        // Use select to handle both sleep and Ctrl+C
        tokio::select! {
            () = tokio::time::sleep(Duration::from_millis(10)) => {
                // Continue loop
            }
            _ = &mut ctrl_c => {
                break;
            }
        }
    }

    // Stop the kernel before reading counters or removing breakpoints
    if target_alive && remote.is_running() {
        if let StopEvent::Hit(hit) = remote.halt()? {
            handle_hit(&mut session, &mut remote, &hit, call_sites);
        }
    }

    if !quiet {
        let stats = session.stats();
        let probes = session.correlator_stats();
        eprintln!(
            "\n{}: {:.1}s, {} events (hits: {}, filtered: {}, failed: {}, recorded: {}, stale kmalloc: {})",
            exit_reason,
            tracing_start.elapsed().as_secs_f64(),
            stats.accepted,
            probes.hits,
            stats.filtered,
            stats.failed,
            session.history().len(),
            probes.stale_flags,
        );
    }

    // Export history if requested
    if let Some(ref export_path) = args.export {
        export_history(&session, symbolizer.as_ref(), export_path)?;
        if !quiet {
            println!("saved: {}", export_path.display());
        }
    }

    if target_alive {
        remote.detach()?;
    }
    Ok(())
}
