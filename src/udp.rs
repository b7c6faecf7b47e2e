pub mod transition;

use std::cmp::min;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, info, trace, warn};

use crate::net;
use crate::protocol::classify::{classify, Classified};
use crate::registry::{PeerKey, PeerRegistry, Session, SessionState};
use crate::task::{RandInt, TaskFactory};
use crate::udp::transition::{encode_task, on_datagram, Event};

/// How many datagrams to pull off the socket without blocking once it became
///  readable, so one sweep pass serves a whole queued burst.
const DRAIN_BURST: usize = 512;

const RECV_BUF_LEN: usize = 1500;

#[derive(Debug)]
pub struct UdpConfig {
    /// maximum age of an assignment; later answers validate as NOT_OK
    pub task_lifetime: Duration,
    /// how long a finalized session keeps answering duplicates with its stored ack
    pub finalize_grace: Duration,
    /// proactive resend schedule, indexed by resend count (the last entry repeats)
    pub resend_schedule_ms: Vec<u64>,
    /// per-id jitter added on top of the schedule to avoid synchronized waves
    pub resend_jitter_ms: u64,
    /// upper bound on how long the loop blocks before running the sweep
    pub select_tick: Duration,
    /// ceiling on concurrently outstanding (non-finalized) sessions
    pub max_awaiting_sessions: usize,
    pub enable_text: bool,
    /// suppress the periodic diagnostics line
    pub quiet: bool,
    /// shut down after this many correct answers
    pub complete_target: Option<u64>,
    pub diag_interval: Duration,
}

impl UdpConfig {
    pub fn new() -> UdpConfig {
        UdpConfig {
            task_lifetime: Duration::from_secs(10),
            finalize_grace: Duration::from_secs(2),
            resend_schedule_ms: vec![120, 200, 300, 400, 500, 650, 800, 1000, 1200, 1500],
            resend_jitter_ms: 60,
            select_tick: Duration::from_millis(10),
            max_awaiting_sessions: 500,
            enable_text: false,
            quiet: false,
            complete_target: None,
            diag_interval: Duration::from_secs(1),
        }
    }
}

impl Default for UdpConfig {
    fn default() -> UdpConfig {
        UdpConfig::new()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EngineStats {
    pub packets_received: u64,
    pub binary_packets: u64,
    pub text_packets: u64,
    /// datagrams dropped for any reason: malformed, unknown peer, capacity
    pub dropped_packets: u64,
    pub tasks_issued: u64,
    pub answers_ok: u64,
    pub answers_not_ok: u64,
    pub retransmits: u64,
    pub re_acks: u64,
}

/// The UDP server engine: one datagram socket, one cooperative loop owning all
///  state (registry, counters, id generator), so no locks are involved. Each
///  incoming datagram is classified, run through the pure transition function,
///  and answered with at most one datagram. A periodic sweep retransmits
///  outstanding tasks and evicts expired sessions.
pub struct UdpEngine<R> {
    socket: UdpSocket,
    config: UdpConfig,
    registry: PeerRegistry,
    factory: TaskFactory<R>,
    stats: EngineStats,
    started_at: Instant,
    last_diag: Instant,
}

impl<R: RandInt> UdpEngine<R> {
    pub async fn bind(addr: SocketAddr, config: UdpConfig, rand: R) -> anyhow::Result<UdpEngine<R>> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        info!(
            "udpserver listening on {} (text dialect {})",
            local,
            if config.enable_text { "on" } else { "off" }
        );

        let registry = PeerRegistry::new(config.max_awaiting_sessions);
        let now = Instant::now();
        Ok(UdpEngine {
            socket,
            config,
            registry,
            factory: TaskFactory::new(rand),
            stats: EngineStats::default(),
            started_at: now,
            last_diag: now,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        let shutdown = net::shutdown_signal();
        tokio::pin!(shutdown);

        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            self.handle_datagram(&buf[..len], from).await;
                            self.drain_burst(&mut buf).await;
                        }
                        Err(e) => warn!("receive error: {}", e),
                    }
                }
                _ = time::sleep(self.config.select_tick) => {}
            }

            self.tick(Instant::now()).await;

            if let Some(target) = self.config.complete_target {
                if self.stats.answers_ok >= target {
                    info!(
                        "COMPLETE ok={} fail={} elapsed_ms={}",
                        self.stats.answers_ok,
                        self.stats.answers_not_ok,
                        self.started_at.elapsed().as_millis()
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    async fn drain_burst(&mut self, buf: &mut [u8; RECV_BUF_LEN]) {
        for _ in 0..DRAIN_BURST {
            match self.socket.try_recv_from(buf) {
                Ok((len, from)) => {
                    let payload = buf[..len].to_vec();
                    self.handle_datagram(&payload, from).await;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("receive error while draining: {}", e);
                    break;
                }
            }
        }
    }

    async fn handle_datagram(&mut self, payload: &[u8], from: SocketAddr) {
        self.stats.packets_received += 1;

        let classified = classify(payload);
        match classified {
            Classified::Message(_) | Classified::Record(_) => self.stats.binary_packets += 1,
            Classified::TextHandshake | Classified::TextAnswer { .. } => self.stats.text_packets += 1,
            Classified::Malformed => {}
        }
        trace!(?from, len = payload.len(), ?classified, "datagram");

        let key = PeerKey::from(from);
        let state = self.registry.lookup(&key).map(|s| s.state.clone());
        let may_create = self.registry.may_create();

        let outcome = on_datagram(
            state.as_ref(),
            &classified,
            Instant::now(),
            &mut self.factory,
            &self.config,
            may_create,
        );

        match outcome.event {
            Event::TaskIssued => self.stats.tasks_issued += 1,
            Event::Retransmitted => self.stats.retransmits += 1,
            Event::Answered { ok: true } => self.stats.answers_ok += 1,
            Event::Answered { ok: false } => self.stats.answers_not_ok += 1,
            Event::ReAcked => self.stats.re_acks += 1,
            Event::Bounced => {}
            Event::Dropped(reason) => {
                self.stats.dropped_packets += 1;
                debug!(?from, ?reason, "dropping datagram");
            }
        }

        if let Some(new_state) = outcome.new_state {
            self.registry.insert(key, Session { addr: from, state: new_state });
        }
        if let Some(reply) = outcome.reply {
            self.send(&reply, from).await;
        }
    }

    async fn tick(&mut self, now: Instant) {
        self.registry.sweep(now, self.config.task_lifetime, self.config.finalize_grace);

        let resends = self.collect_due_resends(now);
        for (to, datagram) in resends {
            self.stats.retransmits += 1;
            self.send(&datagram, to).await;
        }

        if !self.config.quiet && now.saturating_duration_since(self.last_diag) >= self.config.diag_interval {
            self.last_diag = now;
            info!(
                "DIAG recv={} bin={} text={} issued={} ok={} fail={} resend={} reack={} pending={} elapsed_ms={}",
                self.stats.packets_received,
                self.stats.binary_packets,
                self.stats.text_packets,
                self.stats.tasks_issued,
                self.stats.answers_ok,
                self.stats.answers_not_ok,
                self.stats.retransmits,
                self.stats.re_acks,
                self.registry.awaiting_len(),
                self.started_at.elapsed().as_millis()
            );
        }
    }

    fn collect_due_resends(&mut self, now: Instant) -> Vec<(SocketAddr, Vec<u8>)> {
        let config = &self.config;
        let mut due = Vec::new();

        for (_, session) in self.registry.iter_mut() {
            if let SessionState::AwaitingAnswer {
                task,
                dialect,
                last_sent_at,
                resend_count,
            } = &mut session.state
            {
                if task.age(now) > config.task_lifetime {
                    // about to be evicted, not worth another datagram
                    continue;
                }
                let interval = resend_interval(config, *resend_count, task.id);
                if now.saturating_duration_since(*last_sent_at) >= interval {
                    *last_sent_at = now;
                    *resend_count += 1;
                    due.push((session.addr, encode_task(task, *dialect)));
                }
            }
        }
        due
    }

    /// A failed send is logged and otherwise ignored: the session stays, and
    ///  the resend sweep covers the gap.
    async fn send(&self, datagram: &[u8], to: SocketAddr) {
        if let Err(e) = self.socket.send_to(datagram, to).await {
            warn!(?to, "send error: {}", e);
        }
    }
}

/// The wait before resend number `resend_count + 1`, from the configured
///  schedule plus a deterministic per-id jitter.
fn resend_interval(config: &UdpConfig, resend_count: u32, task_id: u32) -> Duration {
    let index = min(resend_count as usize, config.resend_schedule_ms.len().saturating_sub(1));
    let base = config.resend_schedule_ms.get(index).copied().unwrap_or(1500);
    Duration::from_millis(base + jitter_ms(task_id, config.resend_jitter_ms))
}

fn jitter_ms(task_id: u32, max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    (task_id as u64).wrapping_mul(0x9e37_79b9) % (max_ms + 1)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::first(0, 120)]
    #[case::second(1, 200)]
    #[case::mid(4, 500)]
    #[case::last(9, 1500)]
    #[case::beyond_schedule(25, 1500)]
    fn test_resend_schedule(#[case] resend_count: u32, #[case] expected_base_ms: u64) {
        let mut config = UdpConfig::new();
        config.resend_jitter_ms = 0;
        assert_eq!(
            resend_interval(&config, resend_count, 1),
            Duration::from_millis(expected_base_ms)
        );
    }

    #[test]
    fn test_schedule_is_monotonic() {
        let config = UdpConfig::new();
        let mut previous = 0;
        for &ms in &config.resend_schedule_ms {
            assert!(ms >= previous);
            previous = ms;
        }
    }

    #[test]
    fn test_jitter_is_bounded_and_deterministic() {
        for id in 0..10_000u32 {
            let j = jitter_ms(id, 60);
            assert!(j <= 60);
            assert_eq!(j, jitter_ms(id, 60));
        }
    }

    #[test]
    fn test_jitter_zero_max() {
        assert_eq!(jitter_ms(1234, 0), 0);
    }
}
