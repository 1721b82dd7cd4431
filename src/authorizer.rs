pub mod cache;
pub mod conntrack;
pub mod sweeper;

use std::{net::Ipv4Addr, sync::Arc};

use anyhow::{bail, Context, Result};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use tracing::{debug, error, info, warn};

use crate::config::Ipv4Network;
use crate::firewall::Firewall;
use cache::AuthorizedHosts;

/// Turns upstream DNS responses into authorization decisions: every accepted
/// A record lands in the authorization cache and the kernel authorized set.
pub struct Authorizer {
    cache: Arc<AuthorizedHosts>,
    firewall: Arc<Firewall>,
    authorized_set: String,
    blacklist_hosts: Vec<Ipv4Addr>,
    blacklist_networks: Vec<Ipv4Network>,
}

impl Authorizer {
    pub fn new(
        ttl: i64,
        authorized_set: &str,
        blacklist_hosts: Vec<Ipv4Addr>,
        blacklist_networks: Vec<Ipv4Network>,
        firewall: Arc<Firewall>,
    ) -> Result<Self> {
        if authorized_set.is_empty() {
            bail!("authorized set can not be empty");
        }
        Ok(Self {
            cache: Arc::new(AuthorizedHosts::new(ttl)),
            firewall,
            authorized_set: authorized_set.to_string(),
            blacklist_hosts,
            blacklist_networks,
        })
    }

    pub fn cache(&self) -> Arc<AuthorizedHosts> {
        Arc::clone(&self.cache)
    }

    /// Import hosts already present in the kernel set, so a restart does not
    /// strand members the previous run authorized. Must run after the set
    /// exists and before listeners accept traffic.
    pub async fn reconcile(&self) -> Result<()> {
        let hosts = self
            .firewall
            .enumerate_set(&self.authorized_set)
            .await
            .with_context(|| format!("Failed to enumerate set [{}]", self.authorized_set))?;
        for host in hosts {
            debug!(host = %host, set = %self.authorized_set, "Importing kernel set member into cache");
            self.cache.register(&host.to_string());
        }
        if !self.cache.is_empty() {
            info!(
                hosts = self.cache.len(),
                "Reconciled authorization cache from kernel set"
            );
        }
        Ok(())
    }

    /// Inspect a response and authorize what it resolves to. Per-record
    /// failures are logged and skipped; one bad record never aborts the rest.
    pub async fn handle_response(&self, resp: &Message) {
        let Some(query) = resp.queries().first() else {
            return;
        };
        let question = query.name().to_string();

        match resp.response_code() {
            ResponseCode::NoError => {}
            ResponseCode::NXDomain => {
                info!(question, "Name error, nothing to authorize");
                return;
            }
            code => {
                warn!(question, rcode = %code, "Query returned an unexpected response code");
                return;
            }
        }

        if resp.answers().is_empty() {
            info!(question, "Blocked, response carries no answers");
            return;
        }

        for answer in resp.answers() {
            match answer.data() {
                Some(RData::A(a)) => {
                    self.auth_ipv4(&question, &a.to_string()).await;
                }
                Some(RData::AAAA(aaaa)) => {
                    warn!(question, host = %aaaa, "IPv6 is not supported yet, host was not authorized");
                }
                Some(RData::CNAME(_)) => {
                    // A CNAME carries no address; the matching A records are
                    // expected in the same answer section.
                }
                Some(RData::PTR(ptr)) => {
                    let trimmed = question.trim_end_matches('.');
                    if trimmed.ends_with(".ip6.arpa") {
                        warn!(question, target = %ptr, "IPv6 PTR is not supported yet, host was not authorized");
                    } else if let Some(addr) = reverse_in_addr(trimmed) {
                        info!(question, host = %addr, target = %ptr, "PTR question resolved");
                        self.auth_ipv4(&question, &addr).await;
                    } else {
                        warn!(question, "PTR question is not an in-addr.arpa name");
                    }
                }
                Some(_) => {
                    warn!(
                        question,
                        rtype = %answer.record_type(),
                        "Record type is not supported, nothing to authorize"
                    );
                }
                None => {}
            }
        }
    }

    /// The decision table for a single resolved address. The cache insert is
    /// the linearization point between concurrent requests: exactly one
    /// caller observes the insert and performs the kernel add.
    async fn auth_ipv4(&self, question: &str, ip: &str) {
        let addr: Ipv4Addr = match ip.parse() {
            Ok(addr) => addr,
            Err(_) => {
                warn!(question, host = ip, "Answer is not a valid ipv4 address, skipping");
                return;
            }
        };

        if self.is_blacklisted(addr) {
            info!(question, host = %addr, "Blacklisted");
            return;
        }

        if addr == Ipv4Addr::UNSPECIFIED {
            info!(question, "Blocked, sinkhole answer");
            return;
        }

        if !self.cache.register(ip) {
            self.cache.renew(ip);
            info!(question, host = %addr, "Already authorized");
            return;
        }

        // Cache before kernel. If the kernel add fails the entry stays, and
        // later queries renew it without retrying the add (see DESIGN.md).
        if let Err(err) = self.firewall.add_to_set(&self.authorized_set, ip).await {
            error!(question, host = %addr, error = %err, "Failed to add host to the authorized set");
            return;
        }
        info!(question, host = %addr, "Authorized");
    }

    fn is_blacklisted(&self, addr: Ipv4Addr) -> bool {
        self.blacklist_hosts.contains(&addr)
            || self.blacklist_networks.iter().any(|net| net.contains(addr))
    }
}

/// Rebuild the forward address from a reverse question: the dotted prefix of
/// `d.c.b.a.in-addr.arpa` reversed is `a.b.c.d`.
fn reverse_in_addr(question: &str) -> Option<String> {
    let prefix = question.strip_suffix(".in-addr.arpa")?;
    let mut octets: Vec<&str> = prefix.split('.').collect();
    octets.reverse();
    Some(octets.join("."))
}
