//! Interactive command language
//!
//! One line of stdin is one command. Lines are split on whitespace and fed to
//! clap, so `help` and per-command `--help` come for free. Commands run while
//! the target is halted; replies are returned as lines for the caller to
//! print.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use crate::backend::Backend;
use crate::domain::FilterTarget;
use crate::export::HistoryExporter;
use crate::filter::{tokenize, FilterRule, Relation};
use crate::render::{self, text, WalkFormat};
use crate::session::Session;
use crate::symbolization::Symbolizer;

#[derive(Parser, Debug)]
#[command(name = "salt", no_binary_name = true, disable_version_flag = true)]
struct CommandLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Manage event filtering
    Filter {
        #[command(subcommand)]
        action: FilterAction,
    },
    /// Manage the event history
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Reset all filters and follow only these processes
    Trace {
        #[arg(required = true)]
        processes: Vec<String>,
    },
    /// Navigate all active caches and print them
    Walk { caches: Vec<String> },
    /// Same as walk, as an HTML page
    #[command(name = "walk_html")]
    WalkHtml {
        caches: Vec<String>,
        /// Write the page here instead of stdout
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Same as walk, as JSON
    #[command(name = "walk_json")]
    WalkJson {
        caches: Vec<String>,
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Write the recorded history to FILE as JSON
    Export { file: PathBuf },
    /// Probe and filter counters
    Stats,
    /// Detach and exit
    #[command(alias = "exit")]
    Quit,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum FilterAction {
    /// Only filtered events are displayed
    Enable,
    /// Events of every process are displayed
    Disable,
    /// Display the current filter
    Status,
    /// Add one or more names to a filter set
    Add {
        target: TargetArg,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Remove one or more names from a filter set
    Remove {
        target: TargetArg,
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// How the process and cache sets combine (default OR)
    Relation { relation: Relation },
    /// Install `(caches...) AND (processes...)`
    Expr {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        tokens: Vec<String>,
    },
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordAction {
    On,
    Off,
    Show,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TargetArg {
    Process,
    Cache,
}

impl From<TargetArg> for FilterTarget {
    fn from(target: TargetArg) -> Self {
        match target {
            TargetArg::Process => FilterTarget::Process,
            TargetArg::Cache => FilterTarget::Cache,
        }
    }
}

/// What the caller prints, and whether it should stop
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Outcome {
    pub lines: Vec<String>,
    pub quit: bool,
}

impl Outcome {
    fn say(line: impl Into<String>) -> Self {
        Self { lines: vec![line.into()], quit: false }
    }

    fn lines(lines: Vec<String>) -> Self {
        Self { lines, quit: false }
    }
}

/// Parse one input line; `Ok(None)` for a blank line
///
/// # Errors
/// clap's error, which also carries `help` output
pub fn parse_command(line: &str) -> Result<Option<Command>, clap::Error> {
    let words: Vec<&str> = line.split_whitespace().collect();
    if words.is_empty() {
        return Ok(None);
    }
    CommandLine::try_parse_from(words).map(|parsed| Some(parsed.command))
}

/// Run `command` against a halted target
///
/// # Errors
/// Walk failures, file writes and filter errors; the session is unchanged
/// when a filter command fails
pub fn execute(
    command: Command,
    session: &mut Session,
    backend: &mut dyn Backend,
    symbolizer: Option<&Symbolizer>,
) -> Result<Outcome> {
    match command {
        Command::Filter { action } => filter(action, session),
        Command::Record { action } => Ok(record(action, session, symbolizer)),
        Command::Trace { processes } => {
            session.trace_processes(&processes);
            Ok(Outcome::say("Tracing enabled."))
        }
        Command::Walk { caches } => walk(session, backend, WalkFormat::Text, &caches, None),
        Command::WalkHtml { caches, output } => {
            walk(session, backend, WalkFormat::Html, &caches, output)
        }
        Command::WalkJson { caches, output } => {
            walk(session, backend, WalkFormat::Json, &caches, output)
        }
        Command::Export { file } => {
            export_history(session, symbolizer, &file)?;
            Ok(Outcome::say(format!(
                "Exported {} events to {}.",
                session.history().len(),
                file.display()
            )))
        }
        Command::Stats => Ok(Outcome::lines(text::stats_lines(
            &session.stats(),
            &session.correlator_stats(),
            session.history().len(),
        ))),
        Command::Quit => Ok(Outcome { lines: Vec::new(), quit: true }),
    }
}

fn filter(action: FilterAction, session: &mut Session) -> Result<Outcome> {
    let engine = session.filter_mut();
    let outcome = match action {
        FilterAction::Enable => {
            engine.enable();
            Outcome::say("Filtering enabled.")
        }
        FilterAction::Disable => {
            engine.disable();
            Outcome::say("Filtering disabled.")
        }
        FilterAction::Status => Outcome::lines(engine.status_lines()),
        FilterAction::Add { target, names } => {
            let target = FilterTarget::from(target);
            engine.add(target, &names);
            Outcome::lines(names.iter().map(|n| format!("Added '{n}' to filtered {target}.")).collect())
        }
        FilterAction::Remove { target, names } => {
            let target = FilterTarget::from(target);
            engine.remove(target, &names)?;
            Outcome::lines(
                names.iter().map(|n| format!("Removed '{n}' from filtered {target}.")).collect(),
            )
        }
        FilterAction::Relation { relation } => {
            engine.set_relation(relation);
            Outcome::say(format!("Subfilter relation set to {relation}."))
        }
        FilterAction::Expr { tokens } => {
            engine.set_expression(&tokenize(&tokens.join(" ")))?;
            let rule = engine.current_filter();
            let mut lines = vec![format!("Filter expression set: {}", describe(&rule))];
            if !engine.is_enabled() {
                lines.push("Filtering is off; run 'filter enable' to apply it.".to_string());
            }
            Outcome::lines(lines)
        }
    };
    Ok(outcome)
}

fn describe(rule: &FilterRule) -> String {
    match rule {
        FilterRule::Expression(expr) => expr.to_string(),
        FilterRule::Simple { relation, .. } => format!("simple ({relation})"),
    }
}

fn record(action: RecordAction, session: &mut Session, symbolizer: Option<&Symbolizer>) -> Outcome {
    match action {
        RecordAction::On => {
            session.set_recording(true);
            Outcome::say("Recording enabled.")
        }
        RecordAction::Off => {
            session.set_recording(false);
            Outcome::say("Recording disabled.")
        }
        RecordAction::Show => Outcome::lines(
            session
                .history()
                .iter()
                .enumerate()
                .map(|(idx, event)| {
                    let line = text::history_line(idx, event);
                    match symbolizer.zip(event.call_site) {
                        Some((s, site)) => format!("{line}  {}", s.resolve(site).short()),
                        None => line,
                    }
                })
                .collect(),
        ),
        RecordAction::Clear => {
            session.clear_history();
            Outcome::say("History cleared.")
        }
    }
}

fn walk(
    session: &Session,
    backend: &mut dyn Backend,
    format: WalkFormat,
    caches: &[String],
    output: Option<PathBuf>,
) -> Result<Outcome> {
    let snapshot = session.walk(backend).context("Failed to read slab_caches")?;
    let targets = (!caches.is_empty()).then_some(caches);
    let rendered = render::render_snapshot(format, &snapshot, targets)?;
    match output {
        Some(path) => {
            std::fs::write(&path, rendered)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            Ok(Outcome::say(format!("Wrote {}.", path.display())))
        }
        None => Ok(Outcome::lines(rendered.lines().map(str::to_string).collect())),
    }
}

/// Write the session history to `path`
///
/// # Errors
/// File creation or serialization failure
pub fn export_history(
    session: &Session,
    symbolizer: Option<&Symbolizer>,
    path: &std::path::Path,
) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create history file {}", path.display()))?;
    let mut exporter = HistoryExporter::new(session.history());
    if let Some(symbolizer) = symbolizer {
        exporter = exporter.with_symbolizer(symbolizer);
    }
    exporter.export(BufWriter::new(file)).context("Failed to export history")?;
    Ok(())
}
