//! Watch command
//!
//! Opens an engine over the given roots and prints every change until Ctrl-C.

use crate::rescan;
use crate::system_config::{self, validate_latency};
use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use fsw_watcher::{ChangeEvent, ChangeKind, Engine, WatchOptions, WatchStatus};
use owo_colors::OwoColorize;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

pub async fn run(roots: Vec<PathBuf>, latency_ms: Option<u64>, json: bool) -> Result<()> {
    let config = system_config::load()?;

    let latency = match latency_ms {
        Some(ms) => {
            validate_latency(ms)?;
            Some(Duration::from_millis(ms))
        }
        None => config.watch.latency(),
    };
    let options = WatchOptions { latency };

    let (tx, rx) = crossbeam_channel::unbounded();
    let (engine, statuses) =
        Engine::open(&roots, options, tx).context("Failed to start watch engine")?;

    for (root, status) in roots.iter().zip(&statuses) {
        print_status(root, *status, json);
    }

    if !statuses.contains(&WatchStatus::Listening) {
        tokio::task::spawn_blocking(move || engine.close())
            .await
            .context("Watch engine shutdown task failed")??;
        anyhow::bail!("No root could be watched");
    }

    let rescan_on_invalidate = config.watch.rescan_on_invalidate;
    let printer = tokio::task::spawn_blocking(move || print_events(rx, json, rescan_on_invalidate));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, closing watch engine");

    tokio::task::spawn_blocking(move || engine.close())
        .await
        .context("Watch engine shutdown task failed")??;

    // The printer ends once the engine has dropped its sender
    let printed = printer.await.context("Event printer failed")?;
    debug!("Printed {} event(s)", printed);
    Ok(())
}

fn print_status(root: &std::path::Path, status: WatchStatus, json: bool) {
    if json {
        let line = serde_json::json!({
            "root": root.display().to_string(),
            "status": status,
        });
        println!("{}", line);
        return;
    }
    match status {
        WatchStatus::Listening => {
            println!("{} {}", "Watching".green().bold(), root.display())
        }
        other => println!(
            "{} {} ({})",
            "Not watching".red().bold(),
            root.display(),
            other
        ),
    }
}

fn print_events(rx: Receiver<ChangeEvent>, json: bool, rescan_on_invalidate: bool) -> usize {
    let mut printed = 0;
    for event in rx.iter() {
        println!("{}", format_event(&event, json));
        printed += 1;

        if event.kind == ChangeKind::Invalidate && rescan_on_invalidate {
            match rescan::rescan(&event.path) {
                Ok(summary) => {
                    if !json {
                        println!(
                            "  {} {} files, {} dirs",
                            "rescanned:".dimmed(),
                            summary.files,
                            summary.dirs
                        );
                    }
                }
                Err(e) => warn!("Rescan of {} failed: {:#}", event.path.display(), e),
            }
        }
    }
    printed
}

fn format_event(event: &ChangeEvent, json: bool) -> String {
    if json {
        return match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode event: {}", e);
                String::new()
            }
        };
    }
    let kind = format!("{:<10}", event.kind.as_str());
    let kind = match event.kind {
        ChangeKind::Created => kind.green().to_string(),
        ChangeKind::Removed => kind.red().to_string(),
        ChangeKind::Modified => kind.yellow().to_string(),
        ChangeKind::Invalidate => kind.magenta().bold().to_string(),
        ChangeKind::Unknown => kind.dimmed().to_string(),
    };
    format!("{} {}", kind, event.path.display())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_event_line() {
        let event = ChangeEvent::new(ChangeKind::Created, "/w/a.txt");
        assert_eq!(
            format_event(&event, true),
            r#"{"kind":"CREATED","path":"/w/a.txt"}"#
        );
    }

    #[test]
    fn test_plain_event_line_mentions_kind_and_path() {
        let event = ChangeEvent::invalidate("/w");
        let line = format_event(&event, false);
        assert!(line.contains("INVALIDATE"));
        assert!(line.ends_with("/w"));
    }
}
