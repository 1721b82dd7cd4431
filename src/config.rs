use std::{
    collections::HashMap,
    fs,
    net::{Ipv4Addr, SocketAddrV4},
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use serde::Deserialize;
use tracing::warn;

/// Environment variables with this prefix are harvested into the
/// configuration map (prefix stripped, lowercased, `_` becomes `.`).
pub const ENV_PREFIX: &str = "NET_TRUST_";

const LOOPBACK_NETWORKS: [&str; 1] = ["127.0.0.0/8"];
const PRIVATE_NETWORKS: [&str; 4] = [
    "10.0.0.0/8",
    "172.16.0.0/12",
    "192.168.0.0/16",
    "100.64.0.0/10",
];

/// Upstream transport used to reach the forward resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FwdProtocol {
    Udp,
    Tcp,
}

impl std::fmt::Display for FwdProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FwdProtocol::Udp => write!(f, "udp"),
            FwdProtocol::Tcp => write!(f, "tcp"),
        }
    }
}

/// Hook the managed egress chain attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FirewallHook {
    Output,
    Forward,
}

/// Command line surface. Flags override config-file values which override
/// defaults; the resolved result is an immutable [`Config`].
#[derive(Parser, Debug, Default)]
#[command(name = "nettrust", version, about = "DNS-driven egress firewall", long_about = None)]
pub struct Args {
    /// Keep the managed table and chains in place on exit
    #[arg(long)]
    pub do_not_flush_table: bool,

    /// Keep the authorized-hosts kernel set in place on exit
    #[arg(long)]
    pub do_not_flush_authorized_hosts: bool,

    /// Upstream resolver address (ip:port)
    #[arg(long)]
    pub fwd_addr: Option<String>,

    /// Upstream transport
    #[arg(long, value_enum, ignore_case = true)]
    pub fwd_proto: Option<FwdProtocol>,

    /// Exchange with the upstream over DNS-over-TLS (requires tcp)
    #[arg(long)]
    pub fwd_tls: bool,

    /// CA certificate used to validate the upstream; system roots otherwise
    #[arg(long, value_name = "PATH")]
    pub fwd_tls_cert: Option<PathBuf>,

    /// Local bind address (ip:port)
    #[arg(long)]
    pub listen_addr: Option<String>,

    /// Serve DNS-over-TLS on the TCP listener (UDP stays plaintext)
    #[arg(long)]
    pub listen_tls: bool,

    /// Certificate served by the TCP listener when listen-tls is set
    #[arg(long, value_name = "PATH")]
    pub listen_cert: Option<PathBuf>,

    /// Private key served by the TCP listener when listen-tls is set
    #[arg(long, value_name = "PATH")]
    pub listen_cert_key: Option<PathBuf>,

    /// Packet filter backend (nftables is the only supported backend)
    #[arg(long)]
    pub firewall_type: Option<String>,

    /// Hook for the managed chain
    #[arg(long, value_enum, ignore_case = true)]
    pub firewall_backend: Option<FirewallHook>,

    /// Install an INPUT chain accepting established/related and loopback
    #[arg(long)]
    pub firewall_drop_input: bool,

    /// Whitelist 127.0.0.0/8
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub whitelist_loopback: bool,

    /// Whitelist RFC1918 and CGNAT networks
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub whitelist_private: bool,

    /// Seconds an authorized host stays active without a new query (-1 never expires)
    #[arg(long)]
    pub authorized_ttl: Option<i64>,

    /// Seconds between authorization-cache expiry sweeps
    #[arg(long)]
    pub ttl_check_ticker: Option<u64>,

    /// Seconds resolved queries stay in the answer cache (-1 disables caching)
    #[arg(long)]
    pub dns_ttl_cache: Option<i64>,

    /// Path to config.json
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity
    #[arg(long, action = ArgAction::SetTrue)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct FileHostLists {
    networks: Vec<String>,
    hosts: Vec<String>,
    domains: Vec<String>,
}

/// On-disk configuration (config.json). Field names mirror the flag surface.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct FileConfig {
    whitelist: FileHostLists,
    blacklist: FileHostLists,
    do_not_flush_table: bool,
    do_not_flush_authorized_hosts: bool,
    fwd_addr: Option<String>,
    fwd_proto: Option<String>,
    #[serde(rename = "fwdTLS")]
    fwd_tls: bool,
    fwd_ca_cert: Option<PathBuf>,
    listen_addr: Option<String>,
    #[serde(rename = "listenTLS")]
    listen_tls: bool,
    listen_cert: Option<PathBuf>,
    listen_cert_key: Option<PathBuf>,
    firewall_type: Option<String>,
    whitelist_lo_enabled: bool,
    whitelist_private_enabled: bool,
    #[serde(rename = "ttl")]
    authorized_ttl: Option<i64>,
    #[serde(rename = "ttlInterval")]
    ttl_check_ticker: Option<u64>,
    #[serde(rename = "dnsTTLCache")]
    dns_ttl_cache: Option<i64>,
}

/// Resolved, immutable runtime configuration handed to every constructor.
#[derive(Debug, Clone)]
pub struct Config {
    pub whitelist_networks: Vec<Ipv4Network>,
    pub whitelist_hosts: Vec<Ipv4Addr>,
    pub blacklist_networks: Vec<Ipv4Network>,
    pub blacklist_hosts: Vec<Ipv4Addr>,
    pub blacklist_domains: Vec<String>,
    pub do_not_flush_table: bool,
    pub do_not_flush_authorized_hosts: bool,
    pub fwd_addr: SocketAddrV4,
    pub fwd_proto: FwdProtocol,
    pub fwd_tls: bool,
    pub fwd_ca_cert: Option<PathBuf>,
    pub listen_addr: SocketAddrV4,
    pub listen_tls: bool,
    pub listen_cert: Option<PathBuf>,
    pub listen_cert_key: Option<PathBuf>,
    pub firewall_type: String,
    pub firewall_hook: FirewallHook,
    pub firewall_drop_input: bool,
    pub whitelist_lo: Vec<Ipv4Network>,
    pub whitelist_private: Vec<Ipv4Network>,
    pub authorized_ttl: i64,
    pub ttl_check_ticker: u64,
    pub dns_ttl_cache: i64,
    pub debug: bool,
}

impl Config {
    /// Resolve configuration from flags, the optional JSON file, and the
    /// `NET_TRUST_` environment.
    pub fn load(args: &Args) -> Result<Self> {
        let file = match &args.config {
            Some(path) => {
                ensure_file(path)?;
                let raw = fs::read_to_string(path)
                    .with_context(|| format!("Unable to read config at {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("Malformed config at {}", path.display()))?
            }
            None => FileConfig::default(),
        };
        let env = harvest_env(std::env::vars());
        Self::resolve(args, file, env)
    }

    fn resolve(args: &Args, file: FileConfig, env: HashMap<String, String>) -> Result<Self> {
        let fwd_addr = args
            .fwd_addr
            .clone()
            .or(file.fwd_addr)
            .context("forward dns address can not be empty (set --fwd-addr)")?;
        let listen_addr = args
            .listen_addr
            .clone()
            .or(file.listen_addr)
            .context("listen dns address can not be empty (set --listen-addr)")?;
        if listen_addr == fwd_addr {
            bail!("listen address can not be the same as forward address");
        }
        let fwd_addr = parse_socket_addr(&fwd_addr)?;
        let listen_addr = parse_socket_addr(&listen_addr)?;

        let fwd_proto = match args.fwd_proto {
            Some(proto) => proto,
            None => match file.fwd_proto.as_deref() {
                Some("tcp") => FwdProtocol::Tcp,
                Some("udp") | None => FwdProtocol::Udp,
                Some(other) => bail!("forward proto can be either tcp or udp, not [{other}]"),
            },
        };

        let fwd_tls = args.fwd_tls || file.fwd_tls;
        if fwd_tls && fwd_proto != FwdProtocol::Tcp {
            bail!("forward tls requires proto to be tcp");
        }
        if fwd_tls && fwd_addr.port() == 53 {
            warn!("forward tls is enabled but port is set to 53");
        }
        let fwd_ca_cert = args.fwd_tls_cert.clone().or(file.fwd_ca_cert);
        if fwd_tls {
            if let Some(ca) = &fwd_ca_cert {
                ensure_file(ca)?;
            }
        }

        let listen_tls = args.listen_tls || file.listen_tls;
        let listen_cert = args.listen_cert.clone().or(file.listen_cert);
        let listen_cert_key = args.listen_cert_key.clone().or(file.listen_cert_key);
        if listen_tls {
            let cert = listen_cert
                .as_ref()
                .context("listen-tls is enabled but no certificate was provided")?;
            let key = listen_cert_key
                .as_ref()
                .context("listen-tls is enabled but no private key was provided")?;
            ensure_file(cert)?;
            ensure_file(key)?;
        }

        let mut whitelist_networks = Vec::new();
        let mut whitelist_hosts = Vec::new();
        let mut blacklist_networks = Vec::new();
        let mut blacklist_hosts = Vec::new();
        for net in &file.whitelist.networks {
            whitelist_networks.push(parse_ipv4_network(net)?);
        }
        for host in &file.whitelist.hosts {
            whitelist_hosts.push(parse_ipv4(host)?);
        }
        for net in &file.blacklist.networks {
            blacklist_networks.push(parse_ipv4_network(net)?);
        }
        for host in &file.blacklist.hosts {
            blacklist_hosts.push(parse_ipv4(host)?);
        }

        // Environment list entries augment the file lists. Keys look like
        // whitelist.networks.0 after the prefix/underscore transform.
        for (key, value) in &env {
            if key.starts_with("whitelist.networks") {
                whitelist_networks.push(parse_ipv4_network(value)?);
            } else if key.starts_with("whitelist.hosts") {
                whitelist_hosts.push(parse_ipv4(value)?);
            } else if key.starts_with("blacklist.networks") {
                blacklist_networks.push(parse_ipv4_network(value)?);
            } else if key.starts_with("blacklist.hosts") {
                blacklist_hosts.push(parse_ipv4(value)?);
            }
        }

        let whitelist_lo = if args.whitelist_loopback || file.whitelist_lo_enabled {
            LOOPBACK_NETWORKS
                .iter()
                .map(|n| parse_ipv4_network(n))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };
        let whitelist_private = if args.whitelist_private || file.whitelist_private_enabled {
            PRIVATE_NETWORKS
                .iter()
                .map(|n| parse_ipv4_network(n))
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let debug = args.verbose || env.get("debug").map(String::as_str) == Some("true");

        Ok(Self {
            whitelist_networks,
            whitelist_hosts,
            blacklist_networks,
            blacklist_hosts,
            blacklist_domains: file.blacklist.domains,
            do_not_flush_table: args.do_not_flush_table || file.do_not_flush_table,
            do_not_flush_authorized_hosts: args.do_not_flush_authorized_hosts
                || file.do_not_flush_authorized_hosts,
            fwd_addr,
            fwd_proto,
            fwd_tls,
            fwd_ca_cert,
            listen_addr,
            listen_tls,
            listen_cert,
            listen_cert_key,
            firewall_type: args
                .firewall_type
                .clone()
                .or(file.firewall_type)
                .unwrap_or_else(|| "nftables".into()),
            firewall_hook: args.firewall_backend.unwrap_or(FirewallHook::Output),
            firewall_drop_input: args.firewall_drop_input,
            whitelist_lo,
            whitelist_private,
            authorized_ttl: args.authorized_ttl.or(file.authorized_ttl).unwrap_or(-1),
            ttl_check_ticker: args
                .ttl_check_ticker
                .or(file.ttl_check_ticker)
                .unwrap_or(30),
            dns_ttl_cache: args.dns_ttl_cache.or(file.dns_ttl_cache).unwrap_or(-1),
            debug,
        })
    }
}

/// Strip the `NET_TRUST_` prefix, lowercase, and turn `_` into `.` so that
/// e.g. `NET_TRUST_WHITELIST_HOSTS_DNS1` becomes `whitelist.hosts.dns1`.
fn harvest_env(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    let mut env = HashMap::new();
    for (key, value) in vars {
        if let Some(stripped) = key.strip_prefix(ENV_PREFIX) {
            env.insert(stripped.to_lowercase().replace('_', "."), value);
        }
    }
    env
}

fn ensure_file(path: &Path) -> Result<()> {
    let meta =
        fs::metadata(path).with_context(|| format!("[{}] does not exist", path.display()))?;
    if meta.is_dir() {
        bail!("[{}] is a directory", path.display());
    }
    Ok(())
}

/// An IPv4 network in CIDR form, canonicalized so the address has the host
/// bits masked off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Network {
    addr: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Network {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            bail!("not a valid ipv4 network [{addr}/{prefix}]");
        }
        let mask = Self::mask_for(prefix);
        Ok(Self {
            addr: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    fn mask_for(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix))
        }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_for(self.prefix) == u32::from(self.addr)
    }
}

impl std::fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

/// Parse a dotted-quad IPv4 address, rejecting anything else.
pub fn parse_ipv4(addr: &str) -> Result<Ipv4Addr> {
    Ipv4Addr::from_str(addr).with_context(|| format!("not a valid ipv4 address [{addr}]"))
}

/// Parse `a.b.c.d/len` into a canonical [`Ipv4Network`].
pub fn parse_ipv4_network(network: &str) -> Result<Ipv4Network> {
    let (addr, prefix) = network
        .split_once('/')
        .with_context(|| format!("not a valid ipv4 network [{network}]"))?;
    let addr = parse_ipv4(addr)?;
    let prefix: u8 = prefix
        .parse()
        .with_context(|| format!("not a valid ipv4 network [{network}]"))?;
    Ipv4Network::new(addr, prefix)
}

/// Parse `ip:port` with a non-zero port.
pub fn parse_socket_addr(address: &str) -> Result<SocketAddrV4> {
    let addr = SocketAddrV4::from_str(address)
        .with_context(|| format!("address [{address}] is not valid, expected ip:port"))?;
    if addr.port() == 0 {
        bail!("invalid port [0] number in [{address}]");
    }
    Ok(addr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn base_args() -> Args {
        Args {
            fwd_addr: Some("9.9.9.9:53".into()),
            listen_addr: Some("127.0.0.1:5300".into()),
            whitelist_loopback: true,
            whitelist_private: true,
            ..Args::default()
        }
    }

    #[test]
    fn harvest_env_transforms_keys() {
        let vars = vec![
            (
                "NET_TRUST_WHITELIST_HOSTS_DNS1".to_string(),
                "9.9.9.9".to_string(),
            ),
            ("NET_TRUST_DEBUG".to_string(), "true".to_string()),
            ("UNRELATED".to_string(), "x".to_string()),
        ];
        let env = harvest_env(vars.into_iter());
        assert_eq!(
            env.get("whitelist.hosts.dns1").map(String::as_str),
            Some("9.9.9.9")
        );
        assert_eq!(env.get("debug").map(String::as_str), Some("true"));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn resolve_applies_defaults() {
        let config = Config::resolve(&base_args(), FileConfig::default(), HashMap::new())
            .expect("config resolves");
        assert_eq!(config.fwd_proto, FwdProtocol::Udp);
        assert_eq!(config.firewall_type, "nftables");
        assert_eq!(config.authorized_ttl, -1);
        assert_eq!(config.ttl_check_ticker, 30);
        assert_eq!(config.dns_ttl_cache, -1);
        assert_eq!(config.whitelist_lo.len(), 1);
        assert_eq!(config.whitelist_private.len(), 4);
    }

    #[test]
    fn flags_override_file_values() {
        let file: FileConfig =
            serde_json::from_str(r#"{"fwdAddr": "8.8.8.8:53", "ttl": 120, "dnsTTLCache": 10}"#)
                .expect("file parses");
        let mut args = base_args();
        args.authorized_ttl = Some(60);
        let config = Config::resolve(&args, file, HashMap::new()).expect("config resolves");
        // Flag wins over the file for both addr and ttl.
        assert_eq!(config.fwd_addr.to_string(), "9.9.9.9:53");
        assert_eq!(config.authorized_ttl, 60);
        // File value survives where no flag was given.
        assert_eq!(config.dns_ttl_cache, 10);
    }

    #[test]
    fn file_lists_parse_into_typed_values() {
        let file: FileConfig = serde_json::from_str(
            r#"{
                "whitelist": {"networks": ["192.168.1.0/24"], "hosts": ["192.168.1.1"]},
                "blacklist": {"hosts": ["6.6.6.6"], "domains": ["ads.example.com"]}
            }"#,
        )
        .expect("file parses");
        let config = Config::resolve(&base_args(), file, HashMap::new()).expect("config resolves");
        assert_eq!(
            config.whitelist_networks,
            vec![parse_ipv4_network("192.168.1.0/24").unwrap()]
        );
        assert_eq!(config.whitelist_hosts, vec![Ipv4Addr::new(192, 168, 1, 1)]);
        assert_eq!(config.blacklist_hosts, vec![Ipv4Addr::new(6, 6, 6, 6)]);
        assert_eq!(config.blacklist_domains, vec!["ads.example.com".to_string()]);
    }

    #[test]
    fn env_lists_are_appended_and_validated() {
        let mut env = HashMap::new();
        env.insert(
            "blacklist.networks.lab".to_string(),
            "10.66.0.0/16".to_string(),
        );
        let config =
            Config::resolve(&base_args(), FileConfig::default(), env).expect("config resolves");
        assert_eq!(
            config.blacklist_networks,
            vec![parse_ipv4_network("10.66.0.0/16").unwrap()]
        );

        let mut env = HashMap::new();
        env.insert("whitelist.hosts.bad".to_string(), "not-an-ip".to_string());
        assert!(Config::resolve(&base_args(), FileConfig::default(), env).is_err());
    }

    #[test]
    fn listen_and_fwd_must_differ() {
        let mut args = base_args();
        args.listen_addr = Some("9.9.9.9:53".into());
        let err = Config::resolve(&args, FileConfig::default(), HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("can not be the same"));
    }

    #[test]
    fn fwd_tls_requires_tcp() {
        let mut args = base_args();
        args.fwd_tls = true;
        assert!(Config::resolve(&args, FileConfig::default(), HashMap::new()).is_err());
        args.fwd_proto = Some(FwdProtocol::Tcp);
        assert!(Config::resolve(&args, FileConfig::default(), HashMap::new()).is_ok());
    }

    #[test]
    fn listen_tls_requires_existing_material() {
        let mut args = base_args();
        args.listen_tls = true;
        assert!(Config::resolve(&args, FileConfig::default(), HashMap::new()).is_err());

        let mut cert = NamedTempFile::new().expect("tempfile");
        writeln!(cert, "not really a cert").unwrap();
        let mut key = NamedTempFile::new().expect("tempfile");
        writeln!(key, "not really a key").unwrap();
        args.listen_cert = Some(cert.path().to_path_buf());
        args.listen_cert_key = Some(key.path().to_path_buf());
        assert!(Config::resolve(&args, FileConfig::default(), HashMap::new()).is_ok());
    }

    #[test]
    fn ipv4_network_canonicalizes_and_contains() {
        let net = parse_ipv4_network("10.1.2.3/8").expect("parses");
        assert_eq!(net.addr(), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(net.prefix(), 8);
        assert!(net.contains(Ipv4Addr::new(10, 200, 0, 1)));
        assert!(!net.contains(Ipv4Addr::new(11, 0, 0, 1)));
        assert!(parse_ipv4_network("10.0.0.0/33").is_err());
        assert!(parse_ipv4_network("10.0.0.0").is_err());
    }

    #[test]
    fn socket_addr_rejects_port_zero_and_hostnames() {
        assert!(parse_socket_addr("1.1.1.1:53").is_ok());
        assert!(parse_socket_addr("1.1.1.1:0").is_err());
        assert!(parse_socket_addr("dns.example:53").is_err());
    }
}
