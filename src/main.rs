mod cli;
mod console;
mod logging;

use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands};
use colored::*;
use console::CliObserver;
use dotenv::dotenv;
use import_triage::config::{self, AppConfig};
use import_triage::error::Error;
use import_triage::format::pattern::pattern_format;
use import_triage::history::{CsvHistory, MultiHistory, TracingHistory};
use import_triage::{
    CancellationToken, ClassificationEngine, DiskFolder, DispositionHandler, DryRun, FolderSource,
    FormatDispatch, FormatRegistry, GroupHandoff, GroupStatus, HistorySink, ImportPart, Pipeline,
};
use tracing::{error, info, warn};

fn main() -> Result<()> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let args = Cli::parse();

    let config = match config::load_configuration(args.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            return Err(err).context("loading configuration");
        }
    };

    match args.command {
        Some(Commands::Run { passes }) => run(&config, passes)?,
        Some(Commands::Check { path }) => check(&config, &path)?,
        Some(Commands::PrintConfig) => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        None => {
            let _ = Cli::command().print_long_help();
        }
    }

    Ok(())
}

fn registry(config: &AppConfig) -> Result<FormatRegistry> {
    let mut registry = FormatRegistry::new();
    for format in &config.formats {
        let descriptor =
            pattern_format(format).with_context(|| format!("format '{}'", format.id))?;
        registry.register(descriptor)?;
    }
    if registry.is_empty() {
        warn!("No formats configured, every file will expire as an unknown format");
    }
    Ok(registry)
}

fn history(config: &AppConfig) -> Arc<dyn HistorySink> {
    let mut sinks: Vec<Arc<dyn HistorySink>> = vec![Arc::new(TracingHistory)];
    if let Some(path) = &config.history_csv {
        sinks.push(Arc::new(CsvHistory::new(path)));
    }
    Arc::new(MultiHistory::new(sinks))
}

fn run(config: &AppConfig, passes: Option<u64>) -> Result<()> {
    let roots = config::non_overlapping_directories(config.root_paths.clone());
    if roots.is_empty() {
        bail!("no root_paths configured");
    }
    info!("Processing import parts: {:?}", roots);

    let handler: Arc<dyn DispositionHandler> = if config.dry_run {
        Arc::new(DryRun)
    } else {
        Arc::new(FormatDispatch::new(true))
    };
    let history = history(config);

    let mut pipeline =
        Pipeline::new(config.tick_interval()).with_observer(Arc::new(CliObserver::new()));
    for root in &roots {
        let engine = ClassificationEngine::new(registry(config)?.into_chain(), config.policy())
            .with_history(history.clone())
            .with_handler(handler.clone());
        let source = DiskFolder::new(root, &config.ignore_patterns);
        pipeline.add_part(ImportPart::new(root, Box::new(source), engine));
    }

    let cancel = CancellationToken::new();
    install_signal_handlers(&cancel)?;
    let stopper = cancel.clone();
    thread::spawn(move || {
        let mut line = String::new();
        // EOF means no terminal; signals still stop the run
        if matches!(io::stdin().read_line(&mut line), Ok(n) if n > 0) {
            info!("Enter pressed, initiating shutdown...");
            stopper.cancel();
        }
    });

    let started = Instant::now();
    let completed = pipeline.run(&cancel, passes);
    pipeline.shutdown();

    info!(
        "{} passes in {}",
        completed.to_string().cyan(),
        format!("{:.2}s", started.elapsed().as_secs_f64()).green(),
    );
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM (Ctrl+C on Windows) so the in-flight
/// pass is abandoned and groups are released before exit.
fn install_signal_handlers(token: &CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals = Signals::new([SIGINT, SIGTERM])?;
        let stopper = token.clone();
        thread::spawn(move || {
            if let Some(sig) = signals.forever().next() {
                info!("Received signal {}, initiating shutdown...", sig);
                stopper.cancel();
            }
        });
    }

    #[cfg(windows)]
    {
        let stopper = token.clone();
        ctrlc::set_handler(move || {
            info!("Received Ctrl+C, initiating shutdown...");
            stopper.cancel();
        })?;
    }

    Ok(())
}

/// Dry-run handler that remembers what it was given.
#[derive(Default)]
struct Collected {
    resolved: Mutex<Vec<(GroupStatus, GroupHandoff)>>,
}

impl DispositionHandler for Collected {
    fn import(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        resolved.push((GroupStatus::Imported, handoff.clone()));
        Ok(())
    }

    fn discard(&self, handoff: &GroupHandoff) -> Result<(), Error> {
        let mut resolved = self.resolved.lock().unwrap_or_else(|e| e.into_inner());
        resolved.push((GroupStatus::Discarded, handoff.clone()));
        Ok(())
    }
}

fn check(config: &AppConfig, path: &str) -> Result<()> {
    let folder = DiskFolder::new(path, &config.ignore_patterns)
        .snapshot()
        .with_context(|| format!("reading {}", path))?;
    info!("{} files under {}", folder.file_count(), path);

    let collected = Arc::new(Collected::default());
    let mut engine = ClassificationEngine::new(registry(config)?.into_chain(), config.policy())
        .with_history(Arc::new(TracingHistory))
        .with_handler(collected.clone());
    let report = engine.run_pass(&folder, &CancellationToken::new());

    println!(
        "{:<8} {:<14} {:<16} {}",
        "GROUP".bold(),
        "STATUS".bold(),
        "FORMAT".bold(),
        "FILES".bold()
    );

    let resolved = collected.resolved.lock().unwrap_or_else(|e| e.into_inner());
    for (status, handoff) in resolved.iter() {
        let files: Vec<&str> = handoff.files().map(|f| f.relative_path()).collect();
        print_row(
            &handoff.group.to_string(),
            *status,
            handoff.format_name(),
            &files.join(", "),
        );
    }
    for group in engine.groups() {
        let files: Vec<&str> = group.files().map(|f| f.relative_path()).collect();
        let mut listed = files.join(", ");
        if !group.missing().is_empty() {
            listed.push_str(&format!(" (missing {})", group.missing().join(", ")));
        }
        print_row(
            &group.id().to_string(),
            group.status(),
            group.owner().map(|f| f.as_str()).unwrap_or("-"),
            &listed,
        );
    }

    println!();
    println!(
        "{} imported, {} discarded, {} retrying, {} unclaimed, {} faults",
        report.imported.to_string().green(),
        report.discarded.to_string().red(),
        report.retrying.to_string().yellow(),
        report.unclaimed,
        report.faults.to_string().red(),
    );
    Ok(())
}

fn print_row(group: &str, status: GroupStatus, format: &str, files: &str) {
    let label = format!("{:<14}", status.to_string());
    let label = match status {
        GroupStatus::Imported | GroupStatus::Importing => label.green(),
        GroupStatus::Discarded | GroupStatus::Discarding => label.red(),
        GroupStatus::RetryImport | GroupStatus::RetryDiscard => label.yellow(),
        GroupStatus::Unclaimed => label.dimmed(),
    };
    println!("{:<8} {} {:<16} {}", group, label, format, files);
}
