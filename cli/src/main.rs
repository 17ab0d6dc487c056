//! tsbridge CLI - opens files in a tsserver-like language server and prints
//! their diagnostics as they arrive.
//!
//! ```text
//! tsbridge [--config PATH] [--watch] FILE...
//! ```
//!
//! Without `--watch` the process exits once every file has been checked and
//! prints a summary. With it, diagnostics keep streaming until Ctrl-C.

mod config;

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use url::Url;

use tsbridge_client::{ClientEvent, ProcessLauncher, TextDocument, TracingTelemetry, TsClient};
use tsbridge_types::Diagnostic;

/// Quiet period after the last event before a one-shot run ends.
const SETTLE_DURATION: Duration = Duration::from_millis(1500);

/// Files without problems publish nothing, so a one-shot run also ends after
/// this long without any event while files are still unreported.
const IDLE_TIMEOUT: Duration = Duration::from_secs(15);

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Diagnostics go to stdout; keep logs out of it.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: <data dir>/tsbridge/logs/tsbridge.log
    if let Some(data_dir) = dirs::data_local_dir() {
        candidates.push(data_dir.join("tsbridge").join("logs").join("tsbridge.log"));
    }

    // Fallback: ./.tsbridge/logs/tsbridge.log
    candidates.push(PathBuf::from(".tsbridge").join("logs").join("tsbridge.log"));

    candidates
}

#[derive(Debug, Parser)]
#[command(name = "tsbridge")]
#[command(about = "Print tsserver diagnostics for TypeScript and JavaScript files")]
struct Args {
    /// Config file (default: ~/.tsbridge/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Keep streaming diagnostics until Ctrl-C
    #[arg(long)]
    watch: bool,
    /// Files to check
    #[arg(required = true)]
    files: Vec<PathBuf>,
}

fn language_id(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "ts" | "mts" | "cts" => Some("typescript"),
        "tsx" => Some("typescriptreact"),
        "js" | "mjs" | "cjs" => Some("javascript"),
        "jsx" => Some("javascriptreact"),
        _ => None,
    }
}

async fn open_files(client: &TsClient, files: &[PathBuf]) -> Result<HashSet<Url>> {
    let mut opened = HashSet::new();
    for file in files {
        let Some(language) = language_id(file) else {
            eprintln!("skipping {}: not a TypeScript or JavaScript file", file.display());
            continue;
        };
        let path = fs::canonicalize(file)
            .with_context(|| format!("resolving {}", file.display()))?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let uri = Url::from_file_path(&path)
            .map_err(|()| anyhow::anyhow!("not an absolute path: {}", path.display()))?;
        let mut document = TextDocument::new(uri.clone(), language, 1, text);
        if let Ok(cwd) = std::env::current_dir() {
            document = document.with_project_root(cwd);
        }
        client.open_document(document).await?;
        opened.insert(uri);
    }
    Ok(opened)
}

fn print_diagnostics(uri: &Url, diagnostics: &[Diagnostic]) {
    let path = uri
        .to_file_path()
        .unwrap_or_else(|()| PathBuf::from(uri.as_str()));
    for diagnostic in diagnostics {
        println!("{}", diagnostic.display_with_path(&path));
    }
}

/// Print events until every file has reported and things have settled, or
/// until Ctrl-C in watch mode.
async fn stream_events(
    mut events: broadcast::Receiver<ClientEvent>,
    mut pending: HashSet<Url>,
    watch: bool,
) -> Result<()> {
    loop {
        let settle = match (watch, pending.is_empty()) {
            (true, _) => None,
            (false, true) => Some(SETTLE_DURATION),
            (false, false) => Some(IDLE_TIMEOUT),
        };
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::signal::ctrl_c() => return Ok(()),
            () = sleep_or_pending(settle) => return Ok(()),
        };
        match event {
            Ok(ClientEvent::Diagnostics { uri, diagnostics }) => {
                print_diagnostics(&uri, &diagnostics);
                pending.remove(&uri);
            }
            Ok(ClientEvent::ConfigFileDiagnostics {
                config_file,
                diagnostics,
                ..
            }) => print_diagnostics(&config_file, &diagnostics),
            Ok(ClientEvent::ServerCrashed(report)) => {
                if let Some(message) = &report.message {
                    eprintln!("{message}");
                }
                if report.offers_issue_report() {
                    bail!("language server keeps crashing: {}", report.reason);
                }
            }
            Ok(ClientEvent::ServerStartFailed { message }) => bail!("{message}"),
            Ok(ClientEvent::TypesInstallerFailed { message }) => {
                eprintln!("automatic type acquisition is unavailable: {message}");
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Dropped client events");
            }
            Err(RecvError::Closed) => return Ok(()),
        }
    }
}

async fn sleep_or_pending(duration: Option<Duration>) {
    match duration {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    let config = config::load(args.config.as_deref())?;

    let client = TsClient::start(
        config,
        Arc::new(ProcessLauncher),
        Arc::new(TracingTelemetry),
    )?;

    let events = client.subscribe();
    let result = async {
        let opened = open_files(&client, &args.files).await?;
        if opened.is_empty() {
            return Ok(());
        }
        stream_events(events, opened, args.watch).await?;
        let snapshot = client.snapshot().await?;
        if !snapshot.is_empty() {
            println!("{}", snapshot.status_string());
        }
        Ok::<_, anyhow::Error>(())
    }
    .await;

    client.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args, clap::Error> {
        Args::try_parse_from(std::iter::once("tsbridge").chain(list.iter().copied()))
    }

    #[test]
    fn test_parse_args() {
        let parsed = args(&["--config", "c.toml", "--watch", "a.ts", "b.tsx"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("c.toml")));
        assert!(parsed.watch);
        assert_eq!(parsed.files.len(), 2);
    }

    #[test]
    fn test_args_definition_is_valid() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_args_rejects_bad_input() {
        assert!(args(&[]).is_err());
        assert!(args(&["--config"]).is_err());
        assert!(args(&["--verbose", "a.ts"]).is_err());
    }

    #[test]
    fn test_language_id_from_extension() {
        assert_eq!(language_id(Path::new("a.ts")), Some("typescript"));
        assert_eq!(language_id(Path::new("a.tsx")), Some("typescriptreact"));
        assert_eq!(language_id(Path::new("a.mjs")), Some("javascript"));
        assert_eq!(language_id(Path::new("a.jsx")), Some("javascriptreact"));
        assert_eq!(language_id(Path::new("a.py")), None);
        assert_eq!(language_id(Path::new("Makefile")), None);
    }
}
