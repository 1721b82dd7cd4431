use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nettrust::authorizer::{conntrack::ActivityProbe, sweeper::Sweeper, Authorizer};
use nettrust::config::{Args, Config};
use nettrust::dns::Server;
use nettrust::firewall::Firewall;
use nettrust::tasks::{shutdown_signal, TaskHandle};

const TABLE_NAME: &str = "net-trust";
const CHAIN_OUTPUT: &str = "authorized-output";
const CHAIN_INPUT: &str = "input";
const AUTHORIZED_SET: &str = "authorized";
const WHITELIST_SET: &str = "whitelist";

fn init_tracing(verbose: bool) {
    let default_level = if verbose {
        "nettrust=debug"
    } else {
        "nettrust=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let debug = args.verbose
        || std::env::var("NET_TRUST_DEBUG").map(|v| v == "true").unwrap_or(false);
    init_tracing(debug);

    let config = Config::load(&args).context("Failed to load configuration")?;

    if !config.do_not_flush_table {
        warn!(
            "on exit flush table is enabled; set do-not-flush-table to keep denying traffic when NetTrust is not running"
        );
    }
    if config.do_not_flush_authorized_hosts {
        warn!("on exit NetTrust will not flush the authorized hosts list");
    }

    let firewall = Arc::new(
        Firewall::new(
            &config.firewall_type,
            TABLE_NAME,
            CHAIN_OUTPUT,
            config.firewall_hook.into(),
        )
        .await
        .context("Failed to initialise the firewall backend")?,
    );
    if config.firewall_drop_input {
        firewall
            .install_input_baseline(CHAIN_INPUT)
            .await
            .context("Failed to install the input baseline")?;
    }

    make_default_rules(&firewall, &config)
        .await
        .context("Failed to install default rules")?;

    let authorizer = Arc::new(Authorizer::new(
        config.authorized_ttl,
        AUTHORIZED_SET,
        config.blacklist_hosts.clone(),
        config.blacklist_networks.clone(),
        Arc::clone(&firewall),
    )?);
    // The set exists by now and no listener runs yet, so the cache picks up
    // exactly what the previous run left in the kernel.
    authorizer.reconcile().await?;

    let sweeper = Sweeper::new(
        authorizer.cache(),
        Arc::clone(&firewall),
        ActivityProbe::new(),
        AUTHORIZED_SET,
        config.ttl_check_ticker,
        config.do_not_flush_authorized_hosts,
    )?;

    let server = Server::new(&config, Arc::clone(&authorizer))
        .context("Failed to initialise the DNS server")?;

    let fatal = CancellationToken::new();

    let answer_cancel = CancellationToken::new();
    let answer_sweeper = TaskHandle::spawn(
        "dns-cache-sweeper",
        answer_cancel.clone(),
        Arc::clone(&server).run_answer_sweeper(answer_cancel.clone()),
    );

    let auth_cancel = CancellationToken::new();
    let auth_sweeper = TaskHandle::spawn(
        "authorization-sweeper",
        auth_cancel.clone(),
        sweeper.run(auth_cancel.clone()),
    );

    let udp_cancel = CancellationToken::new();
    let udp = TaskHandle::spawn(
        "udp-listener",
        udp_cancel.clone(),
        Arc::clone(&server).run_udp(udp_cancel.clone(), fatal.clone()),
    );

    let tcp_cancel = CancellationToken::new();
    let tcp = TaskHandle::spawn(
        "tcp-listener",
        tcp_cancel.clone(),
        Arc::clone(&server).run_tcp(tcp_cancel.clone(), fatal.clone()),
    );

    shutdown_signal(fatal).await;

    // Listeners stop first so no request races the teardown; the
    // authorization sweeper then deauthorizes (unless opted out) before the
    // answer sweeper goes.
    udp.shutdown().await;
    tcp.shutdown().await;
    auth_sweeper.shutdown().await;
    answer_sweeper.shutdown().await;

    if !config.do_not_flush_table {
        info!("flush table is enabled, flushing");
        firewall
            .flush_table()
            .await
            .context("Failed to flush the managed table")?;
        firewall
            .delete_chain(CHAIN_OUTPUT)
            .await
            .context("Failed to delete the managed chain")?;
        if config.firewall_drop_input {
            firewall
                .delete_chain(CHAIN_INPUT)
                .await
                .context("Failed to delete the input chain")?;
        }
        firewall
            .delete_table()
            .await
            .context("Failed to delete the managed table")?;
    }

    Ok(())
}

/// Install the static topology: whitelist network rules, the whitelist and
/// authorized sets with their lookup rules, and the tailing reject.
async fn make_default_rules(firewall: &Firewall, config: &Config) -> Result<()> {
    for network in config
        .whitelist_lo
        .iter()
        .chain(&config.whitelist_private)
        .chain(&config.whitelist_networks)
    {
        firewall.add_network_rule(*network).await?;
    }

    firewall.add_set(WHITELIST_SET).await?;
    firewall.add_set_lookup_rule(WHITELIST_SET).await?;

    // The proxy must reach its upstream and clients must reach the proxy
    // even before anything resolves.
    for addr in [config.listen_addr.ip(), config.fwd_addr.ip()] {
        firewall
            .add_to_set(WHITELIST_SET, &addr.to_string())
            .await?;
    }
    for host in &config.whitelist_hosts {
        firewall
            .add_to_set(WHITELIST_SET, &host.to_string())
            .await?;
    }

    firewall.add_set(AUTHORIZED_SET).await?;
    firewall.add_set_lookup_rule(AUTHORIZED_SET).await?;

    firewall.append_tailing_reject().await?;
    Ok(())
}
