//! Reference clients for both transports and both dialects. They exist to
//!  exercise the servers - the integration tests drive them, and the UDP
//!  driver can inject answer loss to provoke the server's retransmission path.

pub mod tcp;
pub mod udp;

/// How one client round ended, as seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundOutcome {
    pub task_id: u32,
    /// the server's acknowledgement: OK or NOT_OK
    pub accepted: bool,
}
