use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing_subscriber::EnvFilter;

mod config;
mod dns;
mod logging;
mod mapping;
mod resolver;
mod smtp_server;
mod tls_helpers;
mod upstream;

use config::Config;
use resolver::Resolver;
use smtp_server::ServerParams;

/// Transparent SMTP proxy. Accepts mail, routes each message to an
/// upstream MX chosen from its first recipient, and relays the whole
/// transaction, returning the upstream's verdict to the client.
#[derive(Debug, Parser)]
#[command(name = "relayd", disable_version_flag = true)]
struct Opt {
    /// Path to the configuration file.
    #[arg(short = 'c', default_value = "relayd.toml")]
    config: PathBuf,

    /// Print version and exit.
    #[arg(short = 'V')]
    version: bool,

    /// Verbose logging: force the debug filter regardless of the
    /// configured loglevel.
    #[arg(short = 'v')]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let opts = Opt::parse();

    if opts.version {
        println!("relayd smtp proxy - version {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    // logging is not up yet, so the preamble goes to stderr directly
    eprintln!("Loading config file {}", opts.config.display());
    let config = Config::load(&opts.config)
        .with_context(|| format!("loading config file {}", opts.config.display()))?;

    init_logging(&config, opts.verbose)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(run(config))
}

fn init_logging(config: &Config, verbose: bool) -> anyhow::Result<()> {
    let filter = match std::env::var("RELAYD_LOG") {
        Ok(filter) => filter,
        Err(_) => {
            if verbose {
                "debug".to_string()
            } else {
                config.loglevel.clone()
            }
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&filter).with_context(|| format!("parsing log filter {filter:?}"))?,
        )
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing::info!("starting relayd version {}", env!("CARGO_PKG_VERSION"));

    let mut mappings = Vec::new();
    for spec in &config.mappings {
        let mapping = spec.create()?;
        tracing::info!("loaded mapping {mapping}");
        mappings.push(mapping);
    }
    let resolver = Resolver::new(mappings, config.recipient_delimiter.clone());

    let tls_mode = config.tls_mode();
    let tls_acceptor = match (&config.tls_cert, &config.tls_key) {
        (Some(cert), Some(key)) => {
            let server_config =
                tls_helpers::make_server_config(cert, key).context("loading TLS key/cert")?;
            Some(TlsAcceptor::from(server_config))
        }
        _ => None,
    };

    let listen = config.listen_addr();
    tracing::info!(
        listen = %listen,
        domain = %config.domain,
        tls = ?tls_mode,
        "configuration loaded"
    );

    let params = Arc::new(ServerParams {
        domain: config.domain,
        read_timeout: config.read_timeout,
        write_timeout: config.write_timeout,
        max_message_bytes: config.max_message_bytes,
        max_recipients: config.max_recipients,
        client_timeouts: config.upstream_timeouts,
        resolver,
        tls_acceptor,
        tls_mode,
    });

    smtp_server::run_listener(params, &listen).await
}
