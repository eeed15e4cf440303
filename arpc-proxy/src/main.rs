use std::sync::Arc;
use std::time::Duration;

use arpc_proto::SymphonyCipher;
use arpc_proxy::{BufferingProxy, ChainHolder, ElementRegistry, ProxyConfig, ProxyElementChain};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// aRPC fragment-buffering sidecar proxy.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Intercept ports to listen on.
    #[arg(long, default_values_t = [15002u16, 15006])]
    port: Vec<u16>,

    /// Seconds before a partially buffered RPC is discarded.
    #[arg(long, default_value_t = 30)]
    buffer_timeout: u64,

    /// Maximum UDP datagram size used when re-fragmenting.
    #[arg(long, default_value_t = 1500)]
    max_udp_payload: usize,

    /// Decrypt/re-encrypt public segments with the development keys.
    /// Production deployments provision real keys instead.
    #[arg(long)]
    encrypt: bool,

    /// Elements to run, in order, by registered name.
    #[arg(long)]
    element: Vec<String>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    // Deployments register their element constructors here; the chain is
    // assembled from the names given on the command line.
    let registry = ElementRegistry::new();
    let chain = if args.element.is_empty() {
        ProxyElementChain::new()
    } else {
        registry.build_chain(&args.element).map_err(std::io::Error::other)?
    };

    let cipher = args.encrypt.then(SymphonyCipher::dev);
    let config = ProxyConfig {
        listen_ports: args.port,
        buffer_timeout: Duration::from_secs(args.buffer_timeout),
        max_udp_payload: args.max_udp_payload,
        ..ProxyConfig::default()
    };

    let proxy = BufferingProxy::new(config, Arc::new(ChainHolder::new(chain)), cipher)?;
    proxy.start();
    info!("proxy running; press ctrl-c to stop");

    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
