use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{self, Instant};
use tracing::{debug, trace};

use crate::client::RoundOutcome;
use crate::protocol::records::{CalcMessage, CalcProtocol, ACK_OK, MSG_TYPE_SERVER_ACK, RECORD_TYPE_TASK};
use crate::protocol::text;
use crate::task::{Operation, Task};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// answer with `eval + 1` instead of the correct result
    pub wrong_result: bool,
    /// probability (percent) of discarding an answer instead of sending it,
    ///  leaving it to the server's retransmission to ask again
    pub answer_drop_percent: u8,
    pub round_deadline: Duration,
}

impl ClientOptions {
    pub fn new() -> ClientOptions {
        ClientOptions {
            wrong_result: false,
            answer_drop_percent: 0,
            round_deadline: Duration::from_secs(60),
        }
    }
}

impl Default for ClientOptions {
    fn default() -> ClientOptions {
        ClientOptions::new()
    }
}

/// One binary-dialect round: handshake, receive the task (tolerating
///  retransmits), answer it, await the acknowledgement.
pub async fn run_binary(server: SocketAddr, options: &ClientOptions) -> anyhow::Result<RoundOutcome> {
    let socket = bind_for(server).await?;
    socket.send_to(&CalcMessage::client_hello().encode(), server).await?;

    let deadline = Instant::now() + options.round_deadline;
    let mut task_id = 0u32;
    let mut buf = [0u8; 128];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            bail!("round deadline expired waiting for the server");
        }

        let (len, _) = match time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => bail!("round deadline expired waiting for the server"),
        };
        let payload = &buf[..len];

        if len == CalcProtocol::SERIALIZED_LEN {
            let record = CalcProtocol::try_deser(payload)?;
            if record.record_type != RECORD_TYPE_TASK {
                continue;
            }
            task_id = record.id;

            let task = Task {
                id: record.id,
                op: Operation::try_from(record.op)?,
                v1: record.v1,
                v2: record.v2,
                created_at: Instant::now(),
            };
            let mut result = task.eval();
            if options.wrong_result {
                result = result.wrapping_add(1);
            }

            if roll_drop(options.answer_drop_percent) {
                debug!(id = task.id, "dropping answer to provoke a retransmit");
                continue;
            }
            let answer = CalcProtocol::answer(task.id, record.op, record.v1, record.v2, result);
            socket.send_to(&answer.encode(), server).await?;
        } else if len == CalcMessage::SERIALIZED_LEN {
            let msg = CalcMessage::try_deser(payload)?;
            if msg.msg_type != MSG_TYPE_SERVER_ACK {
                continue;
            }
            return Ok(RoundOutcome {
                task_id,
                accepted: msg.message == ACK_OK,
            });
        } else {
            trace!(len, "ignoring unexpected datagram");
        }
    }
}

/// One text-dialect round over UDP.
pub async fn run_text(server: SocketAddr, options: &ClientOptions) -> anyhow::Result<RoundOutcome> {
    let socket = bind_for(server).await?;
    socket.send_to(text::TEXT_UDP_HANDSHAKE.as_bytes(), server).await?;

    let deadline = Instant::now() + options.round_deadline;
    let mut buf = [0u8; 512];

    // the task line, possibly retransmitted
    let (task, mut line) = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (len, _) = match time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => bail!("round deadline expired waiting for the task line"),
        };
        let line = std::str::from_utf8(&buf[..len])?.to_owned();
        let mut tokens = line.split_whitespace();
        match (tokens.next(), tokens.next(), tokens.next(), tokens.next()) {
            (Some(id), Some(op), Some(v1), Some(v2)) => {
                let task = Task {
                    id: id.parse()?,
                    op: Operation::from_name(op)
                        .ok_or_else(|| anyhow::anyhow!("unknown operation {:?}", op))?,
                    v1: v1.parse()?,
                    v2: v2.parse()?,
                    created_at: Instant::now(),
                };
                break (task, line);
            }
            _ => continue,
        }
    };
    debug!(task_line = %line.trim_end(), "received task");

    let mut result = i64::from(task.eval());
    if options.wrong_result {
        result += 1;
    }
    socket
        .send_to(format!("{} {}\n", task.id, result).as_bytes(), server)
        .await?;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let (len, _) = match time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => bail!("round deadline expired waiting for the acknowledgement"),
        };
        line = std::str::from_utf8(&buf[..len])?.to_owned();
        let stripped = text::strip_crlf(&line);
        match stripped {
            "OK" => {
                return Ok(RoundOutcome {
                    task_id: task.id,
                    accepted: true,
                })
            }
            "NOT OK" => {
                return Ok(RoundOutcome {
                    task_id: task.id,
                    accepted: false,
                })
            }
            // a retransmitted task line may still be in flight
            _ => continue,
        }
    }
}

/// Runs `count` independent binary rounds concurrently, each on its own
///  socket, with the given answer-loss probability. Returns how many rounds
///  completed and how many were acknowledged OK.
pub async fn run_bulk(server: SocketAddr, count: usize, answer_drop_percent: u8) -> (usize, usize) {
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let options = ClientOptions {
            answer_drop_percent,
            ..ClientOptions::new()
        };
        handles.push(tokio::spawn(async move { run_binary(server, &options).await }));
    }

    let mut answered = 0;
    let mut ok = 0;
    for handle in handles {
        if let Ok(Ok(outcome)) = handle.await {
            answered += 1;
            if outcome.accepted {
                ok += 1;
            }
        }
    }
    (answered, ok)
}

async fn bind_for(server: SocketAddr) -> anyhow::Result<UdpSocket> {
    let local = if server.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    Ok(UdpSocket::bind(local).await?)
}

fn roll_drop(percent: u8) -> bool {
    percent > 0 && rand::thread_rng().gen_range(0..100) < u32::from(percent)
}
