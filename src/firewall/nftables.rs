//! nftables backend driving the `nft` binary.
//!
//! Reads go through `nft -j list …` (JSON) and `nft -a list chain` (ordered
//! rules with handles); every mutation is staged as an `nft -f -` batch so
//! the kernel applies it atomically. One exclusive lock serializes all
//! backend work; each public method acquires it, scans, applies, releases.

use std::{
    io::Write,
    net::Ipv4Addr,
    path::PathBuf,
    process::{Command, Stdio},
    sync::Arc,
};

use tokio::{sync::Mutex, task};
use tracing::info;

use super::{ChainHook, FirewallError, Result};
use crate::config::Ipv4Network;

const REJECT_MARKER: &str = "counter reject";

#[derive(Debug)]
pub struct NftBackend {
    inner: Arc<Mutex<Nft>>,
}

#[derive(Debug)]
struct Nft {
    program: PathBuf,
    table: String,
    chain: String,
}

impl NftBackend {
    pub fn new(table: &str, chain: &str) -> Self {
        Self::with_program("nft", table, chain)
    }

    pub fn with_program(program: impl Into<PathBuf>, table: &str, chain: &str) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Nft {
                program: program.into(),
                table: table.to_string(),
                chain: chain.to_string(),
            })),
        }
    }

    /// Run `f` on the worker pool with the backend lock held.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Nft) -> Result<T> + Send + 'static,
    {
        let inner = self.inner.clone();
        task::spawn_blocking(move || {
            let nft = inner.blocking_lock();
            f(&nft)
        })
        .await
        .map_err(|err| FirewallError::Task(err.to_string()))?
    }

    pub async fn create_table(&self) -> Result<()> {
        self.with_conn(|nft| nft.apply(&format!("add table ip {}\n", nft.table)))
            .await
    }

    pub async fn create_chain(&self, chain: &str, hook: ChainHook) -> Result<()> {
        let chain = chain.to_string();
        self.with_conn(move |nft| {
            // Drop by default: if the tailing reject is ever missing the
            // chain still refuses traffic instead of leaking it.
            nft.apply(&format!(
                "add chain ip {} {} {{ type filter hook {} priority filter ; policy drop ; }}\n",
                nft.table,
                chain,
                hook.keyword(),
            ))
        })
        .await
    }

    pub async fn add_address_rule(&self, ip: Ipv4Addr) -> Result<()> {
        self.with_conn(move |nft| {
            let rule = format!("ip daddr {ip} counter accept");
            if nft.chain_rules(&nft.chain)?.iter().any(|r| r.text == rule) {
                return Ok(());
            }
            nft.apply(&format!("add rule ip {} {} {rule}\n", nft.table, nft.chain))
        })
        .await
    }

    pub async fn delete_address_rule(&self, ip: Ipv4Addr) -> Result<()> {
        self.with_conn(move |nft| {
            let rule = format!("ip daddr {ip} counter accept");
            nft.delete_matching_rule(&rule)
        })
        .await
    }

    pub async fn add_network_rule(&self, network: Ipv4Network) -> Result<()> {
        self.with_conn(move |nft| {
            let rule = format!("ip daddr {} counter accept", network_text(network));
            if nft.chain_rules(&nft.chain)?.iter().any(|r| r.text == rule) {
                return Ok(());
            }
            nft.apply(&format!("add rule ip {} {} {rule}\n", nft.table, nft.chain))
        })
        .await
    }

    pub async fn delete_network_rule(&self, network: Ipv4Network) -> Result<()> {
        self.with_conn(move |nft| {
            let rule = format!("ip daddr {} counter accept", network_text(network));
            nft.delete_matching_rule(&rule)
        })
        .await
    }

    pub async fn add_set(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.with_conn(move |nft| {
            nft.apply(&format!(
                "add set ip {} {name} {{ type ipv4_addr ; }}\n",
                nft.table
            ))
        })
        .await
    }

    pub async fn add_set_lookup_rule(&self, name: &str) -> Result<()> {
        let name = name.to_string();
        self.with_conn(move |nft| {
            let rule = format!("ip daddr @{name} accept");
            if nft.chain_rules(&nft.chain)?.iter().any(|r| r.text == rule) {
                return Ok(());
            }
            nft.apply(&format!("add rule ip {} {} {rule}\n", nft.table, nft.chain))
        })
        .await
    }

    pub async fn add_to_set(&self, name: &str, ip: Ipv4Addr) -> Result<()> {
        let name = name.to_string();
        self.with_conn(move |nft| {
            if nft.set_members(&name)?.contains(&ip) {
                return Ok(());
            }
            nft.apply(&format!(
                "add element ip {} {name} {{ {ip} }}\n",
                nft.table
            ))
        })
        .await
    }

    pub async fn delete_from_set(&self, name: &str, ip: Ipv4Addr) -> Result<()> {
        let name = name.to_string();
        self.with_conn(move |nft| {
            if !nft.set_members(&name)?.contains(&ip) {
                return Ok(());
            }
            nft.apply(&format!(
                "delete element ip {} {name} {{ {ip} }}\n",
                nft.table
            ))
        })
        .await
    }

    pub async fn enumerate_set(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let name = name.to_string();
        self.with_conn(move |nft| nft.set_members(&name)).await
    }

    pub async fn append_tailing_reject(&self) -> Result<()> {
        self.with_conn(|nft| {
            let rules = nft.chain_rules(&nft.chain)?;
            let marker = rules.iter().position(|r| r.text == REJECT_MARKER);
            match marker {
                Some(at) if at == rules.len() - 1 => Ok(()),
                Some(at) => {
                    // Add the replacement first so the chain never lacks a
                    // reject, then drop the misplaced one by handle.
                    info!("reject is not a tailing rule, re-creating as tailing");
                    nft.apply(&format!(
                        "add rule ip {} {} {REJECT_MARKER}\n",
                        nft.table, nft.chain
                    ))?;
                    let handle = rules[at].handle.ok_or_else(|| {
                        FirewallError::Parse("reject rule listed without a handle".into())
                    })?;
                    nft.apply(&format!(
                        "delete rule ip {} {} handle {handle}\n",
                        nft.table, nft.chain
                    ))
                }
                None => nft.apply(&format!(
                    "add rule ip {} {} {REJECT_MARKER}\n",
                    nft.table, nft.chain
                )),
            }
        })
        .await
    }

    pub async fn install_input_baseline(&self, chain: &str) -> Result<()> {
        let chain = chain.to_string();
        self.with_conn(move |nft| {
            nft.apply(&format!(
                "add chain ip {} {chain} {{ type filter hook input priority filter ; policy drop ; }}\n",
                nft.table,
            ))?;
            let present = nft
                .chain_rules(&chain)?
                .iter()
                .any(|r| r.text.starts_with("ct state"));
            if present {
                return Ok(());
            }
            nft.apply(&format!(
                "add rule ip {} {chain} ct state established,related counter accept\n",
                nft.table,
            ))?;
            nft.apply(&format!(
                "add rule ip {} {chain} iif \"lo\" accept\n",
                nft.table,
            ))
        })
        .await
    }

    pub async fn flush_table(&self) -> Result<()> {
        self.with_conn(|nft| nft.apply_teardown(&format!("flush table ip {}\n", nft.table)))
            .await
    }

    pub async fn delete_chain(&self, chain: &str) -> Result<()> {
        let chain = chain.to_string();
        self.with_conn(move |nft| {
            nft.apply_teardown(&format!("delete chain ip {} {chain}\n", nft.table))
        })
        .await
    }

    pub async fn delete_table(&self) -> Result<()> {
        self.with_conn(|nft| nft.apply_teardown(&format!("delete table ip {}\n", nft.table)))
            .await
    }
}

struct RuleLine {
    text: String,
    handle: Option<u64>,
}

impl Nft {
    fn run(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.program).args(args).output()?;
        if !output.status.success() {
            return Err(FirewallError::Kernel {
                action: args.join(" "),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Apply a batch atomically via `nft -f -`.
    fn apply(&self, batch: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(["-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        child
            .stdin
            .as_mut()
            .expect("stdin was piped")
            .write_all(batch.as_bytes())?;
        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(FirewallError::Kernel {
                action: batch.trim().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    /// Teardown variant: deleting something that is already gone is success.
    fn apply_teardown(&self, batch: &str) -> Result<()> {
        match self.apply(batch) {
            Err(FirewallError::Kernel { stderr, .. })
                if stderr.contains("No such file or directory") =>
            {
                Ok(())
            }
            other => other,
        }
    }

    fn chain_rules(&self, chain: &str) -> Result<Vec<RuleLine>> {
        let listing = self.run(&["-a", "list", "chain", "ip", &self.table, chain])?;
        Ok(parse_chain_listing(&listing))
    }

    fn delete_matching_rule(&self, rule: &str) -> Result<()> {
        let existing = self.chain_rules(&self.chain)?;
        let Some(found) = existing.iter().find(|r| r.text == rule) else {
            return Ok(());
        };
        let handle = found
            .handle
            .ok_or_else(|| FirewallError::Parse(format!("rule [{rule}] listed without a handle")))?;
        self.apply(&format!(
            "delete rule ip {} {} handle {handle}\n",
            self.table, self.chain
        ))
    }

    fn set_members(&self, name: &str) -> Result<Vec<Ipv4Addr>> {
        let raw = self.run(&["-j", "list", "set", "ip", &self.table, name])?;
        parse_set_listing(&raw, name)
    }
}

/// `/32` networks are listed by nft as bare addresses.
fn network_text(network: Ipv4Network) -> String {
    if network.prefix() == 32 {
        network.addr().to_string()
    } else {
        network.to_string()
    }
}

fn parse_chain_listing(listing: &str) -> Vec<RuleLine> {
    let mut rules = Vec::new();
    for line in listing.lines() {
        let line = line.trim();
        if line.starts_with("table ") || line.starts_with("chain ") || line.starts_with("type ") {
            continue;
        }
        let Some((body, handle)) = line.rsplit_once("# handle ") else {
            continue;
        };
        rules.push(RuleLine {
            text: normalize_rule(body),
            handle: handle.trim().parse().ok(),
        });
    }
    rules
}

/// Strip counter readouts so rule text compares structurally:
/// `counter packets 5 bytes 300 reject` becomes `counter reject`.
fn normalize_rule(text: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut tokens = text.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if token == "packets" && out.last() == Some(&"counter") {
            tokens.next();
            if tokens.peek() == Some(&"bytes") {
                tokens.next();
                tokens.next();
            }
            continue;
        }
        out.push(token);
    }
    out.join(" ")
}

fn parse_set_listing(raw: &str, name: &str) -> Result<Vec<Ipv4Addr>> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| FirewallError::Parse(format!("set [{name}] listing: {err}")))?;
    let objects = value
        .get("nftables")
        .and_then(|v| v.as_array())
        .ok_or_else(|| FirewallError::Parse(format!("set [{name}] listing has no nftables key")))?;

    let mut members = Vec::new();
    for object in objects {
        let Some(set) = object.get("set") else {
            continue;
        };
        let Some(elems) = set.get("elem").and_then(|e| e.as_array()) else {
            continue;
        };
        for elem in elems {
            // Plain members are strings; members carrying attributes are
            // wrapped as {"elem": {"val": ...}}.
            let addr = elem
                .as_str()
                .or_else(|| {
                    elem.get("elem")
                        .and_then(|e| e.get("val"))
                        .and_then(|v| v.as_str())
                })
                .ok_or_else(|| {
                    FirewallError::Parse(format!("set [{name}] has a non-address element"))
                })?;
            let addr = addr.parse().map_err(|_| {
                FirewallError::Parse(format!("set [{name}] element [{addr}] is not ipv4"))
            })?;
            members.push(addr);
        }
    }
    Ok(members)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, os::unix::fs::PermissionsExt, path::Path};
    use tempfile::tempdir;

    const CHAIN_WITH_TAILING_REJECT: &str = r#"table ip net-trust {
	chain authorized-output { # handle 1
		type filter hook output priority filter; policy drop;
		ip daddr 127.0.0.0/8 counter packets 3 bytes 252 accept # handle 7
		ip daddr @whitelist accept # handle 8
		ip daddr @authorized accept # handle 9
		counter packets 11 bytes 660 reject # handle 10
	}
}"#;

    const CHAIN_WITH_MISPLACED_REJECT: &str = r#"table ip net-trust {
	chain authorized-output { # handle 1
		type filter hook output priority filter; policy drop;
		counter packets 11 bytes 660 reject # handle 4
		ip daddr @authorized accept # handle 9
	}
}"#;

    const SET_JSON: &str = r#"{"nftables": [{"metainfo": {"version": "1.0.2"}}, {"set": {"family": "ip", "name": "authorized", "table": "net-trust", "type": "ipv4_addr", "handle": 2, "elem": ["93.184.216.34", {"elem": {"val": "1.1.1.1", "counter": {"packets": 0, "bytes": 0}}}]}}]}"#;

    /// Stand-in `nft` that records batches and replies with canned listings.
    fn fake_nft(dir: &Path, chain_listing: &str, fail_batches: Option<&str>) -> (PathBuf, PathBuf) {
        let batches = dir.join("batches.log");
        let script = dir.join("nft");
        let failure = match fail_batches {
            Some(stderr) => format!("echo '{stderr}' >&2\n    exit 1"),
            None => format!("cat >> {}", batches.display()),
        };
        let body = format!(
            r#"#!/bin/sh
case "$*" in
  "-f -")
    {failure}
    ;;
  "-a list chain ip net-trust authorized-output")
    cat <<'LISTING'
{chain_listing}
LISTING
    ;;
  "-a list chain ip net-trust input")
    cat <<'LISTING'
{chain_listing}
LISTING
    ;;
  "-j list set ip net-trust authorized")
    cat <<'JSON'
{SET_JSON}
JSON
    ;;
esac
exit 0
"#
        );
        fs::write(&script, body).expect("write fake nft");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).expect("chmod");
        (script, batches)
    }

    fn backend(script: &Path) -> NftBackend {
        NftBackend::with_program(script, "net-trust", "authorized-output")
    }

    fn batches(path: &Path) -> String {
        fs::read_to_string(path).unwrap_or_default()
    }

    #[test]
    fn chain_listing_parses_rules_and_handles() {
        let rules = parse_chain_listing(CHAIN_WITH_TAILING_REJECT);
        assert_eq!(rules.len(), 4);
        assert_eq!(rules[0].text, "ip daddr 127.0.0.0/8 counter accept");
        assert_eq!(rules[0].handle, Some(7));
        assert_eq!(rules[3].text, "counter reject");
        assert_eq!(rules[3].handle, Some(10));
    }

    #[test]
    fn set_listing_parses_plain_and_wrapped_elements() {
        let members = parse_set_listing(SET_JSON, "authorized").expect("parses");
        assert_eq!(
            members,
            vec![
                "93.184.216.34".parse::<Ipv4Addr>().unwrap(),
                "1.1.1.1".parse::<Ipv4Addr>().unwrap(),
            ]
        );
    }

    #[tokio::test]
    async fn existing_network_rule_is_not_re_added() {
        let dir = tempdir().expect("tempdir");
        let (script, log) = fake_nft(dir.path(), CHAIN_WITH_TAILING_REJECT, None);
        let be = backend(&script);
        be.add_network_rule(crate::config::parse_ipv4_network("127.0.0.0/8").unwrap())
            .await
            .expect("idempotent add");
        assert_eq!(batches(&log), "");
    }

    #[tokio::test]
    async fn missing_network_rule_is_applied() {
        let dir = tempdir().expect("tempdir");
        let (script, log) = fake_nft(dir.path(), CHAIN_WITH_TAILING_REJECT, None);
        let be = backend(&script);
        be.add_network_rule(crate::config::parse_ipv4_network("172.16.0.0/12").unwrap())
            .await
            .expect("add applies");
        assert_eq!(
            batches(&log),
            "add rule ip net-trust authorized-output ip daddr 172.16.0.0/12 counter accept\n"
        );
    }

    #[tokio::test]
    async fn address_rules_list_as_bare_addresses() {
        let dir = tempdir().expect("tempdir");
        let (script, log) = fake_nft(dir.path(), CHAIN_WITH_TAILING_REJECT, None);
        let be = backend(&script);
        be.add_address_rule("198.51.100.7".parse().unwrap())
            .await
            .expect("add applies");
        // A /32 network is the same rule shape as a bare address.
        be.add_network_rule(crate::config::parse_ipv4_network("198.51.100.7/32").unwrap())
            .await
            .expect("add applies");
        assert_eq!(
            batches(&log),
            "add rule ip net-trust authorized-output ip daddr 198.51.100.7 counter accept\n\
             add rule ip net-trust authorized-output ip daddr 198.51.100.7 counter accept\n"
        );
    }

    #[tokio::test]
    async fn misplaced_reject_is_re_created_then_deleted() {
        let dir = tempdir().expect("tempdir");
        let (script, log) = fake_nft(dir.path(), CHAIN_WITH_MISPLACED_REJECT, None);
        let be = backend(&script);
        be.append_tailing_reject().await.expect("repositions");
        assert_eq!(
            batches(&log),
            "add rule ip net-trust authorized-output counter reject\n\
             delete rule ip net-trust authorized-output handle 4\n"
        );
    }

    #[tokio::test]
    async fn tailing_reject_in_place_is_untouched() {
        let dir = tempdir().expect("tempdir");
        let (script, log) = fake_nft(dir.path(), CHAIN_WITH_TAILING_REJECT, None);
        let be = backend(&script);
        be.append_tailing_reject().await.expect("no-op");
        assert_eq!(batches(&log), "");
    }

    #[tokio::test]
    async fn set_membership_gates_element_mutations() {
        let dir = tempdir().expect("tempdir");
        let (script, log) = fake_nft(dir.path(), CHAIN_WITH_TAILING_REJECT, None);
        let be = backend(&script);

        be.add_to_set("authorized", "1.1.1.1".parse().unwrap())
            .await
            .expect("member already present");
        be.delete_from_set("authorized", "8.8.8.8".parse().unwrap())
            .await
            .expect("member already absent");
        assert_eq!(batches(&log), "");

        be.add_to_set("authorized", "8.8.8.8".parse().unwrap())
            .await
            .expect("new member applies");
        assert_eq!(
            batches(&log),
            "add element ip net-trust authorized { 8.8.8.8 }\n"
        );
    }

    #[tokio::test]
    async fn enumerate_set_returns_members() {
        let dir = tempdir().expect("tempdir");
        let (script, _log) = fake_nft(dir.path(), CHAIN_WITH_TAILING_REJECT, None);
        let be = backend(&script);
        let members = be.enumerate_set("authorized").await.expect("enumerates");
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn teardown_tolerates_missing_objects() {
        let dir = tempdir().expect("tempdir");
        let (script, _log) = fake_nft(
            dir.path(),
            CHAIN_WITH_TAILING_REJECT,
            Some("Error: No such file or directory"),
        );
        let be = backend(&script);
        be.delete_chain("authorized-output").await.expect("tolerated");
        be.delete_table().await.expect("tolerated");

        let (script, _log) = fake_nft(
            dir.path(),
            CHAIN_WITH_TAILING_REJECT,
            Some("Error: Operation not permitted"),
        );
        let be = backend(&script);
        let err = be.delete_table().await.unwrap_err();
        assert!(matches!(err, FirewallError::Kernel { .. }));
    }
}
