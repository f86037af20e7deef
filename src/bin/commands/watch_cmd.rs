use anyhow::{Context, Result};
use ipatlas::{LoaderEvent, Registry};
use std::time::Duration;

use crate::cli_utils::{loader_options, origin_arg, CLI_DATABASE_ID};
use crate::LoadArgs;

/// Print each loader event as one JSON line
fn print_event(event: &LoaderEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("[WARN] Could not encode event: {}", e),
    }
}

pub fn cmd_watch(database: String, refresh: Option<u64>, load: LoadArgs) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("Failed to install Ctrl-C handler")?;

    let mut options = loader_options(&load)
        .with_watch_filesystem(true)
        .with_event_subscriber(print_event);
    if let Some(secs) = refresh {
        options = options.with_refresh_interval(Duration::from_secs(secs));
    }

    let registry = Registry::new();
    registry
        .start(CLI_DATABASE_ID, &origin_arg(&database), options)
        .with_context(|| format!("Invalid database: {}", database))?;
    eprintln!("[INFO] Watching {} (Ctrl+C to stop)...", database);

    let _ = shutdown_rx.recv();

    registry.stop(CLI_DATABASE_ID)?;
    eprintln!("[INFO] Watch stopped");
    Ok(())
}
