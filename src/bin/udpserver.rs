use clap::Parser;
use tracing::Level;

use netcalc::net;
use netcalc::task::SeededRand;
use netcalc::udp::{UdpConfig, UdpEngine};

const DEFAULT_COMPLETE_TARGET: u64 = 100;

#[derive(Parser)]
#[command(name = "udpserver")]
struct Args {
    /// bind address as host:port, e.g. 127.0.0.1:4711
    address: String,

    /// enable the line-oriented text dialect alongside the binary one
    #[clap(long)]
    text: bool,

    /// suppress the periodic diagnostics line
    #[clap(long)]
    quiet: bool,

    /// terminate once enough answers were acknowledged OK (the TARGET_COMPLETE
    /// environment variable overrides the default of 100)
    #[clap(long)]
    exit_on_complete: bool,

    #[clap(long, default_value_t = false)]
    debug: bool,

    #[clap(long, default_value_t = false)]
    trace: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.debug, args.trace) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let (host, port) = net::split_host_port(&args.address)?;
    let addr = net::resolve_addr(host, port).await?;

    let mut config = UdpConfig::new();
    config.enable_text = args.text;
    config.quiet = args.quiet;
    if args.exit_on_complete {
        let target = std::env::var("TARGET_COMPLETE")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_COMPLETE_TARGET);
        config.complete_target = Some(target);
    }

    let mut engine = UdpEngine::bind(addr, config, SeededRand::from_entropy()).await?;
    engine.run().await
}
