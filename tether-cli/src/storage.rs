use anyhow::{bail, Context};
use std::path::Path;

use tether_core::{CoordinationOptions, TetherClient};

/// Build a client for a `--storage` value, with options from `config` if given.
pub fn create_client(storage: &str, config: Option<&Path>) -> anyhow::Result<TetherClient> {
    let options = match config {
        Some(path) => CoordinationOptions::load(path)
            .with_context(|| format!("loading options from {}", path.display()))?,
        None => CoordinationOptions::default(),
    };

    if storage == "memory" {
        tracing::info!("storage backend: in-memory (nothing persists past this process)");
        return Ok(TetherClient::in_memory(options)?);
    }

    let Some(path) = storage.strip_prefix("sqlite:") else {
        bail!("unknown storage backend '{storage}', use 'memory' or 'sqlite:<path>'");
    };
    open_sqlite(path, options)
}

#[cfg(feature = "sqlite")]
fn open_sqlite(path: &str, options: CoordinationOptions) -> anyhow::Result<TetherClient> {
    tracing::info!(path = %path, prefix = %options.prefix, "storage backend: sqlite");
    TetherClient::with_sqlite(path, options)
        .with_context(|| format!("opening sqlite database {path}"))
}

#[cfg(not(feature = "sqlite"))]
fn open_sqlite(path: &str, _options: CoordinationOptions) -> anyhow::Result<TetherClient> {
    bail!("sqlite storage '{path}' requested but this build lacks the `sqlite` feature")
}
