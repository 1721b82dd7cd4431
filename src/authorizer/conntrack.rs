use std::{collections::HashSet, io, path::PathBuf};

use thiserror::Error;
use tokio::task;

const CONNTRACK_PATH: &str = "/proc/net/nf_conntrack";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("conntrack snapshot failed: {0}")]
    Transport(#[from] io::Error),
}

/// Snapshot of the kernel connection-tracking table. Collects the source and
/// destination addresses of both the original and the reply tuple of every
/// tracked IPv4 connection.
#[derive(Debug)]
pub struct ActivityProbe {
    path: PathBuf,
}

impl ActivityProbe {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from(CONNTRACK_PATH),
        }
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Dump the table and return every IPv4 endpoint seen in it. Reading can
    /// be slow on hosts with many connections, so the read runs on the
    /// blocking pool and callers must not hold any cache lock across it.
    pub async fn active_endpoints(&self) -> Result<HashSet<String>, ProbeError> {
        let path = self.path.clone();
        let snapshot = task::spawn_blocking(move || std::fs::read_to_string(path))
            .await
            .map_err(|err| ProbeError::Transport(io::Error::other(err)))??;
        Ok(parse_snapshot(&snapshot))
    }
}

impl Default for ActivityProbe {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_snapshot(snapshot: &str) -> HashSet<String> {
    let mut endpoints = HashSet::new();
    for line in snapshot.lines() {
        // Lines lead with the l3 protocol; v6 entries are never authorized.
        if !line.starts_with("ipv4") {
            continue;
        }
        for field in line.split_whitespace() {
            if let Some(addr) = field
                .strip_prefix("src=")
                .or_else(|| field.strip_prefix("dst="))
            {
                endpoints.insert(addr.to_string());
            }
        }
    }
    endpoints
}
