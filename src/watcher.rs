// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Config Watcher
//!
//! Watches the broker configuration file and calls a reload callback the first
//! time it is written or removed. The watch ends with that reload; callers
//! that want to keep watching start a new one after reloading.

use crate::errors::AmqpError;
use notify::{
    event::ModifyKind, recommended_watcher, Event, EventKind, RecursiveMode, Watcher,
};
use std::{future::Future, path::Path};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Watches `path` and runs `reload` once it is written or removed.
///
/// # Parameters
/// * `path` - Configuration file to watch
/// * `reload` - Called once, on the first write or removal
///
/// # Returns
/// The result of `reload`, or `AmqpError::ConfigError` when the file cannot be
/// watched or the watcher stops before any change.
pub async fn watch_config<F, Fut>(path: &Path, reload: F) -> Result<(), AmqpError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), AmqpError>>,
{
    let (tx, rx) = mpsc::unbounded_channel();

    let mut watcher = recommended_watcher(move |res: notify::Result<Event>| {
        // The receiver only goes away once the watch is over.
        let _ = tx.send(res);
    })
    .map_err(|err| {
        error!(error = err.to_string(), "failure to create config watcher");
        AmqpError::ConfigError(err.to_string())
    })?;

    watcher
        .watch(path, RecursiveMode::NonRecursive)
        .map_err(|err| {
            error!(
                error = err.to_string(),
                path = %path.display(),
                "failure to watch config file"
            );
            AmqpError::ConfigError(err.to_string())
        })?;

    info!(path = %path.display(), "watching broker config for changes");
    let res = reload_on_change(rx, path, reload).await;
    drop(watcher);

    res
}

/// Consumes watcher events until one changes `path`, then reloads.
async fn reload_on_change<F, Fut>(
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    path: &Path,
    reload: F,
) -> Result<(), AmqpError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), AmqpError>>,
{
    while let Some(event) = events.recv().await {
        match event {
            Ok(event) if changes(&event, path) => {
                info!(event = ?event.kind, path = %path.display(), "broker config changed");
                return reload().await.inspect_err(|err| {
                    error!(error = err.to_string(), "failure to reload broker config")
                });
            }
            Ok(_) => {}
            Err(err) => warn!(error = err.to_string(), "config watcher error"),
        }
    }

    Err(AmqpError::ConfigError("config watcher stopped".to_owned()))
}

/// Whether `event` writes to or removes `path`.
fn changes(event: &Event, path: &Path) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Remove(_)
    );

    relevant && event.paths.iter().any(|p| p.ends_with(path))
}
