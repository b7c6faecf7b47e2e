pub mod session;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::net;

#[derive(Debug)]
pub struct TcpConfig {
    /// deadline for every single read and write within a session
    pub op_timeout: Duration,
}

impl TcpConfig {
    pub fn new() -> TcpConfig {
        TcpConfig {
            op_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for TcpConfig {
    fn default() -> TcpConfig {
        TcpConfig::new()
    }
}

/// The TCP server engine: a serial accept loop that hands every connection to
///  an independent handler task. Handlers share nothing mutable with the
///  listener after hand-off, so a misbehaving peer can only ever stall its own
///  session.
pub struct TcpEngine {
    listener: TcpListener,
    config: Arc<TcpConfig>,
}

impl TcpEngine {
    pub async fn bind(addr: SocketAddr, config: TcpConfig) -> anyhow::Result<TcpEngine> {
        let listener = TcpListener::bind(addr).await?;
        info!("tcpserver listening on {}", listener.local_addr()?);
        Ok(TcpEngine {
            listener,
            config: Arc::new(config),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let shutdown = net::shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let config = self.config.clone();
                            tokio::spawn(async move {
                                match session::handle_connection(stream, peer, &config).await {
                                    Ok(()) => debug!(?peer, "session finished"),
                                    Err(e) => warn!(?peer, "session ended with an error: {}", e),
                                }
                            });
                        }
                        Err(e) => warn!("accept error: {}", e),
                    }
                }
            }
        }
    }
}
