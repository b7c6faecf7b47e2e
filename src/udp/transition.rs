use tokio::time::Instant;

use crate::protocol::classify::Classified;
use crate::protocol::records::{CalcMessage, CalcProtocol, RECORD_TYPE_ANSWER};
use crate::protocol::{text, Dialect};
use crate::registry::SessionState;
use crate::task::{RandInt, Task, TaskFactory};
use crate::udp::UdpConfig;

/// What a datagram did to its session, for the engine's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    TaskIssued,
    Retransmitted,
    Answered { ok: bool },
    ReAcked,
    /// NOT_OK bounce for the all-zero probe record
    Bounced,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    /// answer from a peer with no session
    UnknownPeer,
    /// well-formed record whose type has no meaning in this direction
    UnexpectedType,
    /// answer framing does not match the session's dialect
    DialectMismatch,
    /// text handshake while the text dialect is disabled
    TextDisabled,
    /// new-session creation refused at the registry ceiling
    CapacityExceeded,
    /// finalized session, answer for some other id
    StaleId,
}

/// Result of one transition step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// `Some` replaces the stored session state, `None` leaves it untouched.
    ///  Transitions never remove sessions; only the eviction sweep does.
    pub new_state: Option<SessionState>,
    pub reply: Option<Vec<u8>>,
    pub event: Event,
}

impl Outcome {
    fn drop(reason: DropReason) -> Outcome {
        Outcome {
            new_state: None,
            reply: None,
            event: Event::Dropped(reason),
        }
    }
}

/// The per-peer session state machine as a pure function: current state plus
///  classified datagram in, next state plus at most one reply datagram out.
///  All I/O and registry bookkeeping stay with the engine loop.
pub fn on_datagram<R: RandInt>(
    state: Option<&SessionState>,
    incoming: &Classified,
    now: Instant,
    factory: &mut TaskFactory<R>,
    config: &UdpConfig,
    may_create: bool,
) -> Outcome {
    match incoming {
        Classified::Malformed => Outcome::drop(DropReason::Malformed),

        Classified::Message(msg) => {
            if !msg.is_client_hello() {
                return Outcome::drop(DropReason::UnexpectedType);
            }
            on_handshake(state, Dialect::Binary, now, factory, may_create)
        }

        Classified::TextHandshake => {
            if !config.enable_text {
                return Outcome::drop(DropReason::TextDisabled);
            }
            on_handshake(state, Dialect::Text, now, factory, may_create)
        }

        Classified::Record(record) => on_record(state, record, now, factory, config, may_create),

        Classified::TextAnswer { id, result } => on_answer(state, *id, AnswerValue::Text(*result), now, config),
    }
}

fn on_record<R: RandInt>(
    state: Option<&SessionState>,
    record: &CalcProtocol,
    now: Instant,
    factory: &mut TaskFactory<R>,
    config: &UdpConfig,
    may_create: bool,
) -> Outcome {
    if record.is_all_zero() {
        return Outcome {
            new_state: None,
            reply: Some(CalcMessage::ack(false).encode()),
            event: Event::Bounced,
        };
    }

    // id 0 is never a real task id: such a record is an implicit handshake
    //  (new peer) or a resend request (known peer)
    if record.id == 0 {
        return on_handshake(state, Dialect::Binary, now, factory, may_create);
    }

    if record.record_type != RECORD_TYPE_ANSWER {
        return Outcome::drop(DropReason::UnexpectedType);
    }

    on_answer(state, record.id, AnswerValue::Binary(record.result), now, config)
}

/// Handshake handling, shared by all handshake-shaped datagrams: the 12-byte
///  client hello, the text handshake line, and a record with id 0.
fn on_handshake<R: RandInt>(
    state: Option<&SessionState>,
    dialect: Dialect,
    now: Instant,
    factory: &mut TaskFactory<R>,
    may_create: bool,
) -> Outcome {
    match state {
        // an outstanding assignment is retransmitted as-is, in the session's
        //  dialect and with its id unchanged
        Some(SessionState::AwaitingAnswer {
            task,
            dialect: session_dialect,
            resend_count,
            ..
        }) => Outcome {
            new_state: Some(SessionState::AwaitingAnswer {
                task: *task,
                dialect: *session_dialect,
                last_sent_at: now,
                resend_count: *resend_count,
            }),
            reply: Some(encode_task(task, *session_dialect)),
            event: Event::Retransmitted,
        },

        // no session, or a finalized one being re-handshaken: issue a fresh task
        None | Some(SessionState::Finalized { .. }) => {
            if !may_create {
                return Outcome::drop(DropReason::CapacityExceeded);
            }
            let task = factory.make_task(now);
            Outcome {
                new_state: Some(SessionState::AwaitingAnswer {
                    task,
                    dialect,
                    last_sent_at: now,
                    resend_count: 0,
                }),
                reply: Some(encode_task(&task, dialect)),
                event: Event::TaskIssued,
            }
        }
    }
}

enum AnswerValue {
    Binary(i32),
    Text(i64),
}

impl AnswerValue {
    fn dialect(&self) -> Dialect {
        match self {
            AnswerValue::Binary(_) => Dialect::Binary,
            AnswerValue::Text(_) => Dialect::Text,
        }
    }

    fn matches(&self, expected: i32) -> bool {
        match self {
            AnswerValue::Binary(result) => *result == expected,
            AnswerValue::Text(result) => *result == i64::from(expected),
        }
    }
}

fn on_answer(
    state: Option<&SessionState>,
    id: u32,
    value: AnswerValue,
    now: Instant,
    config: &UdpConfig,
) -> Outcome {
    match state {
        None => Outcome::drop(DropReason::UnknownPeer),

        Some(SessionState::AwaitingAnswer { task, dialect, .. }) => {
            if *dialect != value.dialect() {
                return Outcome::drop(DropReason::DialectMismatch);
            }

            let ok = if id == task.id {
                task.age(now) <= config.task_lifetime && value.matches(task.eval())
            } else {
                // an answer for some other id settles the session as failed
                false
            };
            finalize(task, *dialect, ok, now)
        }

        // duplicate answers within the grace window are answered with the
        //  stored acknowledgement, byte for byte
        Some(SessionState::Finalized { task_id, ack, .. }) => {
            if id == *task_id {
                Outcome {
                    new_state: None,
                    reply: Some(ack.clone()),
                    event: Event::ReAcked,
                }
            } else {
                Outcome::drop(DropReason::StaleId)
            }
        }
    }
}

fn finalize(task: &Task, dialect: Dialect, ok: bool, now: Instant) -> Outcome {
    let ack = encode_ack(ok, dialect);
    Outcome {
        new_state: Some(SessionState::Finalized {
            task_id: task.id,
            dialect,
            ok,
            ack: ack.clone(),
            finalized_at: now,
        }),
        reply: Some(ack),
        event: Event::Answered { ok },
    }
}

pub fn encode_task(task: &Task, dialect: Dialect) -> Vec<u8> {
    match dialect {
        Dialect::Binary => CalcProtocol::task(task).encode(),
        Dialect::Text => text::format_task_line(task).into_bytes(),
    }
}

fn encode_ack(ok: bool, dialect: Dialect) -> Vec<u8> {
    match dialect {
        Dialect::Binary => CalcMessage::ack(ok).encode(),
        Dialect::Text => if ok { text::ACK_OK_LINE } else { text::ACK_NOT_OK_LINE }
            .as_bytes()
            .to_vec(),
    }
}
