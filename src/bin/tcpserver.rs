use clap::Parser;
use tracing::Level;

use netcalc::net;
use netcalc::tcp::{TcpConfig, TcpEngine};

#[derive(Parser)]
#[command(name = "tcpserver")]
struct Args {
    /// bind address as host:port, e.g. 127.0.0.1:4712
    address: String,

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

    let engine = TcpEngine::bind(addr, TcpConfig::new()).await?;
    engine.run().await
}
