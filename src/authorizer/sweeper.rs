use std::{sync::Arc, time::Duration};

use anyhow::{bail, Result};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::AuthorizedHosts;
use super::conntrack::ActivityProbe;
use crate::firewall::Firewall;

/// Periodic expiry loop for the authorization cache. Hosts past their TTL
/// are renewed while conntrack still sees traffic for them and revoked from
/// both the kernel set and the cache otherwise.
#[derive(Debug)]
pub struct Sweeper {
    cache: Arc<AuthorizedHosts>,
    firewall: Arc<Firewall>,
    probe: ActivityProbe,
    authorized_set: String,
    interval: Duration,
    preserve_on_exit: bool,
}

impl Sweeper {
    pub fn new(
        cache: Arc<AuthorizedHosts>,
        firewall: Arc<Firewall>,
        probe: ActivityProbe,
        authorized_set: &str,
        ttl_check_ticker: u64,
        preserve_on_exit: bool,
    ) -> Result<Self> {
        if ttl_check_ticker < 1 {
            bail!("ttl ticker can not be 0 or negative");
        }
        if ttl_check_ticker < 30 {
            warn!(
                seconds = ttl_check_ticker,
                "ttl ticker is short; expiry scans hold the authorization-cache lock"
            );
        }
        Ok(Self {
            cache,
            firewall,
            probe,
            authorized_set: authorized_set.to_string(),
            interval: Duration::from_secs(ttl_check_ticker),
            preserve_on_exit,
        })
    }

    /// Run until cancelled. On shutdown every cached host is removed from
    /// the kernel set unless the operator asked for preservation.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            period = self.interval.as_secs(),
            "Starting authorization TTL sweeper"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    if !self.preserve_on_exit {
                        self.deauthorize_all().await;
                    }
                    info!("Authorization TTL sweeper stopped");
                    return;
                }
                _ = sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    async fn sweep(&self) {
        if self.cache.ttl() < 0 {
            return;
        }

        // Snapshot activity before touching the cache; the dump can be slow
        // and must not stall request serving behind the cache lock.
        debug!("Gathering active hosts from conntrack");
        let active = match self.probe.active_endpoints().await {
            Ok(active) => active,
            Err(err) => {
                error!(error = %err, "Conntrack snapshot failed, skipping this sweep");
                return;
            }
        };

        for host in self.cache.expired() {
            if active.contains(&host) {
                debug!(host, "Host expired but is still active, renewing");
                self.cache.renew(&host);
                continue;
            }

            debug!(host, "Host expired, removing from firewall rules");
            if let Err(err) = self
                .firewall
                .delete_from_set(&self.authorized_set, &host)
                .await
            {
                error!(host, error = %err, "Failed to remove host from the authorized set");
            }
            self.cache.delete(&host);
        }
    }

    async fn deauthorize_all(&self) {
        for host in self.cache.snapshot() {
            info!(host, "Removing host from firewall rules");
            if let Err(err) = self
                .firewall
                .delete_from_set(&self.authorized_set, &host)
                .await
            {
                error!(host, error = %err, "Failed to remove host from the authorized set");
            }
            self.cache.delete(&host);
        }
    }
}
