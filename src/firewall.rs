pub mod nftables;

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::config::{FirewallHook, Ipv4Network};

/// Errors surfaced by the packet-filter backend.
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("not supported firewall backend [{0}]")]
    UnsupportedBackend(String),

    #[error("[{0}] is not yet supported")]
    ReservedBackend(String),

    #[error("[{0}] does not appear to be a valid ipv4 ipaddr")]
    InvalidAddress(String),

    #[error("nft {action} failed: {stderr}")]
    Kernel { action: String, stderr: String },

    #[error("failed to execute nft: {0}")]
    Exec(#[from] std::io::Error),

    #[error("unexpected nft output: {0}")]
    Parse(String),

    #[error("firewall worker task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, FirewallError>;

/// Netfilter hook a managed chain attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainHook {
    Output,
    Forward,
    Input,
}

impl ChainHook {
    pub(crate) fn keyword(self) -> &'static str {
        match self {
            ChainHook::Output => "output",
            ChainHook::Forward => "forward",
            ChainHook::Input => "input",
        }
    }
}

impl From<FirewallHook> for ChainHook {
    fn from(hook: FirewallHook) -> Self {
        match hook {
            FirewallHook::Output => ChainHook::Output,
            FirewallHook::Forward => ChainHook::Forward,
        }
    }
}

/// Facade over the concrete packet-filter backend. All operations are
/// idempotent: adding an existing rule or set element is a no-op, deleting
/// an absent one returns success.
#[derive(Debug)]
pub struct Firewall {
    backend: Backend,
}

#[derive(Debug)]
enum Backend {
    Nftables(nftables::NftBackend),
    #[cfg(test)]
    Mock(std::sync::Arc<mock::MockBackend>),
}

impl Firewall {
    /// Select a backend by name and ensure the managed table and chain
    /// exist. Only nftables is implemented; the iptables family is reserved.
    pub async fn new(kind: &str, table: &str, chain: &str, hook: ChainHook) -> Result<Self> {
        match kind {
            "nftables" => {
                let backend = nftables::NftBackend::new(table, chain);
                backend.create_table().await?;
                backend.create_chain(chain, hook).await?;
                Ok(Self {
                    backend: Backend::Nftables(backend),
                })
            }
            "iptables" | "iptables-legacy" | "iptables-nft" => {
                Err(FirewallError::ReservedBackend(kind.to_string()))
            }
            other => Err(FirewallError::UnsupportedBackend(other.to_string())),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_mock() -> (Self, std::sync::Arc<mock::MockBackend>) {
        let backend = std::sync::Arc::new(mock::MockBackend::default());
        (
            Self {
                backend: Backend::Mock(backend.clone()),
            },
            backend,
        )
    }

    pub async fn create_table(&self) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.create_table().await,
            #[cfg(test)]
            Backend::Mock(be) => be.create_table(),
        }
    }

    pub async fn create_chain(&self, chain: &str, hook: ChainHook) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.create_chain(chain, hook).await,
            #[cfg(test)]
            Backend::Mock(be) => be.create_chain(chain, hook),
        }
    }

    /// Accept a single destination address in the managed chain. Only used
    /// for fixed rules installed at setup time, never for authorizations.
    pub async fn add_address_rule(&self, ip: Ipv4Addr) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.add_address_rule(ip).await,
            #[cfg(test)]
            Backend::Mock(be) => be.add_address_rule(ip),
        }
    }

    pub async fn delete_address_rule(&self, ip: Ipv4Addr) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.delete_address_rule(ip).await,
            #[cfg(test)]
            Backend::Mock(be) => be.delete_address_rule(ip),
        }
    }

    /// Accept a whole destination network in the managed chain.
    pub async fn add_network_rule(&self, network: Ipv4Network) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.add_network_rule(network).await,
            #[cfg(test)]
            Backend::Mock(be) => be.add_network_rule(network),
        }
    }

    pub async fn delete_network_rule(&self, network: Ipv4Network) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.delete_network_rule(network).await,
            #[cfg(test)]
            Backend::Mock(be) => be.delete_network_rule(network),
        }
    }

    /// Ensure a named IPv4 address set exists in the managed table.
    pub async fn add_set(&self, name: &str) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.add_set(name).await,
            #[cfg(test)]
            Backend::Mock(be) => be.add_set(name),
        }
    }

    /// Ensure the managed chain accepts destinations found in the named set.
    pub async fn add_set_lookup_rule(&self, name: &str) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.add_set_lookup_rule(name).await,
            #[cfg(test)]
            Backend::Mock(be) => be.add_set_lookup_rule(name),
        }
    }

    /// Insert a host into a named set. The address must be a syntactically
    /// valid dotted quad; anything else is rejected before touching the
    /// kernel.
    pub async fn add_to_set(&self, name: &str, ip: &str) -> Result<()> {
        let ip = parse_set_address(ip)?;
        match &self.backend {
            Backend::Nftables(be) => be.add_to_set(name, ip).await,
            #[cfg(test)]
            Backend::Mock(be) => be.add_to_set(name, ip),
        }
    }

    pub async fn delete_from_set(&self, name: &str, ip: &str) -> Result<()> {
        let ip = parse_set_address(ip)?;
        match &self.backend {
            Backend::Nftables(be) => be.delete_from_set(name, ip).await,
            #[cfg(test)]
            Backend::Mock(be) => be.delete_from_set(name, ip),
        }
    }

    /// Current members of a named set. Used at startup to reconcile the
    /// authorization cache with pre-existing kernel state.
    pub async fn enumerate_set(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        match &self.backend {
            Backend::Nftables(be) => be.enumerate_set(name).await,
            #[cfg(test)]
            Backend::Mock(be) => be.enumerate_set(name),
        }
    }

    /// Ensure the counter+reject marker is the last rule of the managed
    /// chain, repositioning it if another rule was appended after it.
    pub async fn append_tailing_reject(&self) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.append_tailing_reject().await,
            #[cfg(test)]
            Backend::Mock(be) => be.append_tailing_reject(),
        }
    }

    /// Install the fixed INPUT posture: accept established/related traffic
    /// and loopback ingress. Skipped when a ct-state rule is already there.
    pub async fn install_input_baseline(&self, chain: &str) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.install_input_baseline(chain).await,
            #[cfg(test)]
            Backend::Mock(be) => be.install_input_baseline(chain),
        }
    }

    pub async fn flush_table(&self) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.flush_table().await,
            #[cfg(test)]
            Backend::Mock(be) => be.flush_table(),
        }
    }

    pub async fn delete_chain(&self, chain: &str) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.delete_chain(chain).await,
            #[cfg(test)]
            Backend::Mock(be) => be.delete_chain(chain),
        }
    }

    pub async fn delete_table(&self) -> Result<()> {
        match &self.backend {
            Backend::Nftables(be) => be.delete_table().await,
            #[cfg(test)]
            Backend::Mock(be) => be.delete_table(),
        }
    }
}

fn parse_set_address(ip: &str) -> Result<Ipv4Addr> {
    ip.parse()
        .map_err(|_| FirewallError::InvalidAddress(ip.to_string()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn iptables_family_is_reserved() {
        let err = Firewall::new("iptables-nft", "net-trust", "authorized-output", ChainHook::Output)
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::ReservedBackend(_)));

        let err = Firewall::new("pf", "net-trust", "authorized-output", ChainHook::Output)
            .await
            .unwrap_err();
        assert!(matches!(err, FirewallError::UnsupportedBackend(_)));
    }

    #[tokio::test]
    async fn set_addresses_are_validated_before_the_backend_runs() {
        let (fw, backend) = Firewall::with_mock();
        let err = fw.add_to_set("authorized", "999.1.1.1").await.unwrap_err();
        assert!(matches!(err, FirewallError::InvalidAddress(_)));
        assert!(backend.log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn deleting_an_absent_member_succeeds() {
        let (fw, _backend) = Firewall::with_mock();
        fw.add_set("authorized").await.unwrap();
        fw.delete_from_set("authorized", "10.0.0.9").await.unwrap();
    }

    #[tokio::test]
    async fn reject_marker_is_always_last() {
        let (fw, backend) = Firewall::with_mock();
        fw.append_tailing_reject().await.unwrap();
        fw.add_network_rule(crate::config::parse_ipv4_network("10.0.0.0/8").unwrap())
            .await
            .unwrap();
        // A rule landed after the marker; re-appending must move it back.
        fw.append_tailing_reject().await.unwrap();
        let rules = backend.rules.lock().unwrap();
        assert_eq!(rules.last().map(String::as_str), Some("counter reject"));
        assert_eq!(
            rules.iter().filter(|r| r.as_str() == "counter reject").count(),
            1
        );
    }
}
