use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use portkeeper::nat::upnp;
use portkeeper::{
    init_logging, GatewayClient, KeeperConfig, LeaseScheduler, MappingDescriptor, MemoryGateway,
    Protocol, Reconciler,
};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Keep ports forwarded on the local UPnP gateway",
    override_usage = "portkeeper [OPTIONS] PORT[:EXTERNAL[:PROTO]]..."
)]
struct Args {
    /// Ports to forward, local[:external[:protocol]]
    ports: Vec<String>,

    /// Forwarded port protocol for ports that do not name one
    #[arg(long)]
    proto: Option<Protocol>,

    /// Label for the forwarding shown in router menu
    #[arg(long)]
    label: Option<String>,

    /// Only accept traffic from this remote host
    #[arg(long)]
    remote_host: Option<String>,

    /// Lease duration in seconds, mappings are recreated this often
    #[arg(long)]
    lease: Option<u64>,

    /// Delay in seconds before retrying a failed renewal
    #[arg(long)]
    retry: Option<u64>,

    /// Seconds between checks that the mappings still exist
    #[arg(long)]
    check_interval: Option<u64>,

    /// Seconds allowed for removing the mappings at shutdown
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Seconds to wait for gateway discovery answers
    #[arg(long)]
    discovery_timeout: Option<u64>,

    /// JSON config file, command line flags take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Run against a simulated in-memory gateway
    #[arg(long)]
    dry_run: bool,
}

impl Args {
    fn into_config(self) -> Result<(KeeperConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => KeeperConfig::load(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => KeeperConfig::default(),
        };

        if !self.ports.is_empty() {
            config.ports = self.ports;
        }
        if let Some(proto) = self.proto {
            config.protocol = proto;
        }
        if let Some(label) = self.label {
            config.label = label;
        }
        if let Some(remote_host) = self.remote_host {
            config.remote_host = remote_host;
        }
        if let Some(lease) = self.lease {
            config.lease_secs = lease;
        }
        if let Some(retry) = self.retry {
            config.retry_secs = retry;
        }
        if let Some(check) = self.check_interval {
            config.check_secs = check;
        }
        if let Some(timeout) = self.shutdown_timeout {
            config.shutdown_timeout_secs = timeout;
        }
        if let Some(timeout) = self.discovery_timeout {
            config.discovery_timeout_secs = timeout;
        }
        if let Some(level) = self.log_level {
            config.log_level = level;
        }

        Ok((config, self.dry_run))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let (config, dry_run) = Args::parse().into_config()?;

    init_logging(&config.log_level);
    config.validate()?;

    let parsed = config.descriptors();
    for (spec, err) in &parsed.rejected {
        eprintln!("Failed to parse port string {:?}: {}", spec, err);
    }
    if parsed.descriptors.is_empty() {
        anyhow::bail!("empty port list, nothing to forward");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match wait_for_signal().await {
                Ok(name) => tracing::info!("Received {}, shutting down", name),
                Err(e) => tracing::error!("Failed to listen for signals: {}", e),
            }
            cancel.cancel();
        });
    }

    if dry_run {
        println!("Dry run: forwarding against a simulated gateway");
        keep_forwarded(MemoryGateway::default(), &config, parsed.descriptors, cancel).await?;
    } else {
        let gateway = upnp::discover(config.discovery_timeout())
            .await
            .context("failed to init forwarder")?;
        keep_forwarded(gateway, &config, parsed.descriptors, cancel).await?;
    }

    println!("Goodbye!");
    Ok(())
}

/// Keep the ports forwarded until `cancel` fires
async fn keep_forwarded<G: GatewayClient>(
    gateway: G,
    config: &KeeperConfig,
    ports: Vec<MappingDescriptor>,
    cancel: CancellationToken,
) -> Result<()> {
    let span = tracing::info_span!("forwarder", local = %gateway.local_address());
    let reconciler = Reconciler::with_span(gateway, span);

    for port in &ports {
        println!("Forwarding {} -> {}/{}", port.external_port, port.internal_port, port.protocol);
    }

    LeaseScheduler::new(reconciler, ports, config.forward_options(), config.schedule())
        .run(cancel)
        .await
        .context("forwarding stopped with errors")
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = hangup.recv() => "SIGHUP",
        _ = interrupt.recv() => "SIGINT",
        _ = terminate.recv() => "SIGTERM",
        _ = quit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
