//! A small calculator service speaking a bespoke request / response protocol over
//!  two transports:
//!
//! * **UDP**: a single datagram socket multiplexes many concurrent client sessions,
//!    keyed by peer address. A session is one round: handshake, task, answer,
//!    acknowledgement. The engine tolerates packet loss through proactive
//!    retransmission and answers duplicate answers idempotently for a grace window.
//! * **TCP**: one session per connection. The server offers its supported dialects,
//!    the client selects one, and a single assignment round follows. Every read and
//!    write is bounded by a per-operation deadline.
//!
//! Both transports speak two framings of the same protocol:
//!
//! * **binary**: two fixed-layout records (`CalcMessage`, 12 bytes, and
//!    `CalcProtocol`, 26 bytes), all fields big-endian, serialized field by field
//! * **text**: line-oriented ASCII (`"<id> <op> <v1> <v2>\n"` and friends)
//!
//! The two framings are disambiguated from the payload alone: length first, then
//!  header validity, with printable text as the fallback (see [protocol::classify]).

pub mod client;
pub mod net;
pub mod protocol;
pub mod registry;
pub mod task;
pub mod tcp;
pub mod udp;
