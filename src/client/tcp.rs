use std::net::SocketAddr;

use anyhow::bail;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::client::RoundOutcome;
use crate::protocol::records::{CalcMessage, CalcProtocol, ACK_OK, RECORD_TYPE_TASK};
use crate::protocol::text;
use crate::task::{Operation, Task};
use tokio::time::Instant;

/// One text-dialect TCP session: read the offer, select, solve the one
///  assignment, return the server's status line.
pub async fn run_text(server: SocketAddr) -> anyhow::Result<String> {
    let stream = TcpStream::connect(server).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    read_offer(&mut reader).await?;
    writer.write_all(b"TEXT TCP 1.1 OK\n").await?;

    let mut assignment = String::new();
    reader.read_line(&mut assignment).await?;
    let (op, v1, v2) = text::parse_assignment_line(&assignment)?;
    debug!(assignment = %assignment.trim_end(), "received assignment");

    let result = Task {
        id: 0,
        op,
        v1,
        v2,
        created_at: Instant::now(),
    }
    .eval();
    writer.write_all(format!("{}\n", result).as_bytes()).await?;

    let mut response = String::new();
    reader.read_line(&mut response).await?;
    Ok(text::strip_crlf(&response).to_owned())
}

/// One binary-dialect TCP session: select, read the 26-byte task, answer,
///  read the 12-byte acknowledgement.
pub async fn run_binary(server: SocketAddr) -> anyhow::Result<RoundOutcome> {
    let stream = TcpStream::connect(server).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    read_offer(&mut reader).await?;
    writer.write_all(b"BINARY TCP 1.1 OK\n").await?;

    let mut record = [0u8; CalcProtocol::SERIALIZED_LEN];
    reader.read_exact(&mut record).await?;
    let task_record = CalcProtocol::try_deser(&record)?;
    if task_record.record_type != RECORD_TYPE_TASK {
        bail!("expected a task record, got type {}", task_record.record_type);
    }

    let task = Task {
        id: task_record.id,
        op: Operation::try_from(task_record.op)?,
        v1: task_record.v1,
        v2: task_record.v2,
        created_at: Instant::now(),
    };
    let answer = CalcProtocol::answer(task.id, task_record.op, task.v1, task.v2, task.eval());
    writer.write_all(&answer.encode()).await?;

    let mut ack = [0u8; CalcMessage::SERIALIZED_LEN];
    reader.read_exact(&mut ack).await?;
    let ack = CalcMessage::try_deser(&ack)?;

    Ok(RoundOutcome {
        task_id: task.id,
        accepted: ack.message == ACK_OK,
    })
}

/// Reads the dialect offer: one line per dialect, terminated by a blank line.
async fn read_offer<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> anyhow::Result<Vec<String>> {
    let mut offered = Vec::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            bail!("server closed the connection during the offer");
        }
        let stripped = text::strip_crlf(&line);
        if stripped.is_empty() {
            return Ok(offered);
        }
        offered.push(stripped.to_owned());
    }
}
