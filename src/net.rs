use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{anyhow, bail};
use tokio::net::lookup_host;

/// Splits a `host:port` argument at the last colon, so bare IPv6 literals like
///  `::1:4711` keep their address part intact.
pub fn split_host_port(arg: &str) -> anyhow::Result<(&str, u16)> {
    let (host, port) = arg
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port, got {:?}", arg))?;
    if host.is_empty() {
        bail!("expected host:port, got {:?}", arg);
    }
    let port = port.parse::<u16>().map_err(|_| anyhow!("bad port in {:?}", arg))?;
    Ok((host, port))
}

/// Bind address policy: the localhost aliases pin the address family
///  explicitly, anything else goes through the system resolver. One socket,
///  no dual-stack fan-out.
pub async fn resolve_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    let host = host.trim_start_matches('[').trim_end_matches(']');

    match host {
        "localhost" | "ip4-localhost" | "127.0.0.1" => {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
        }
        "ip6-localhost" | "::1" => {
            return Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), port));
        }
        _ => {}
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }

    lookup_host((host, port))
        .await?
        .next()
        .ok_or_else(|| anyhow!("{:?} did not resolve to any address", host))
}

/// Resolves when the process was asked to shut down (SIGINT / SIGTERM).
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
