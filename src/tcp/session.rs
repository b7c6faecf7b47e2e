use std::fmt::{Display, Formatter};
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::time::{self, Instant};
use tracing::{debug, info};

use crate::protocol::records::{CalcMessage, CalcProtocol, RECORD_TYPE_ANSWER};
use crate::protocol::{text, Dialect};
use crate::task::{RandInt, SeededRand, Task, TaskFactory};
use crate::tcp::TcpConfig;

/// Marker error for an expired per-operation deadline, so the connection
///  handler can tell a timeout apart from other I/O failures.
#[derive(Debug, Clone, Copy)]
pub struct OpTimeout;

impl Display for OpTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "per-operation deadline expired")
    }
}

impl std::error::Error for OpTimeout {}

/// Drives one connection-scoped session: offer, selection, one assignment,
///  one acknowledgement, close. Every read and write is individually bounded
///  by the configured per-operation deadline; an expired deadline is reported
///  to the peer as `"ERROR TO\n"` unless the binary dialect was selected, and
///  the handler finishes with an error either way.
pub async fn handle_connection<S>(stream: S, peer: SocketAddr, config: &TcpConfig) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let factory = TaskFactory::new(SeededRand::from_entropy());
    handle_connection_with(stream, peer, config, factory).await
}

pub async fn handle_connection_with<S, R>(
    stream: S,
    peer: SocketAddr,
    config: &TcpConfig,
    mut factory: TaskFactory<R>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
    R: RandInt,
{
    debug!(?peer, "new session");

    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    let mut dialect = None;
    let result = drive_session(&mut reader, &mut writer, config, &mut factory, &mut dialect).await;

    match result {
        Err(e) if e.is::<OpTimeout>() && dialect != Some(Dialect::Binary) => {
            let _ = time::timeout(
                config.op_timeout,
                writer.write_all(text::ERROR_TIMEOUT_LINE.as_bytes()),
            )
            .await;
            Err(e)
        }
        other => other,
    }
}

async fn drive_session<S, R>(
    reader: &mut BufReader<ReadHalf<S>>,
    writer: &mut WriteHalf<S>,
    config: &TcpConfig,
    factory: &mut TaskFactory<R>,
    negotiated: &mut Option<Dialect>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
    R: RandInt,
{
    bounded(config.op_timeout, writer.write_all(text::format_offer().as_bytes())).await?;

    let selection = bounded_line(reader, config.op_timeout).await?;
    let Some(dialect) = text::parse_selection(&selection) else {
        bounded(config.op_timeout, writer.write_all(text::ERROR_LINE.as_bytes())).await?;
        bail!("unsupported dialect selection {:?}", selection.trim());
    };
    *negotiated = Some(dialect);
    debug!(?dialect, "dialect selected");

    // one id per connection, minted from the handler's own generator
    let task = Task {
        id: factory.random_task_id(),
        ..factory.make_task(Instant::now())
    };

    match dialect {
        Dialect::Text => text_session(reader, writer, config, &task).await,
        Dialect::Binary => binary_session(reader, writer, config, &task).await,
    }
}

async fn text_session<S>(
    reader: &mut BufReader<ReadHalf<S>>,
    writer: &mut WriteHalf<S>,
    config: &TcpConfig,
    task: &Task,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    bounded(
        config.op_timeout,
        writer.write_all(text::format_assignment_line(task).as_bytes()),
    )
    .await?;

    let line = bounded_line(reader, config.op_timeout).await?;
    match text::parse_tcp_answer(&line) {
        Ok(answer) if answer == i64::from(task.eval()) => {
            let response = format!("OK (myresult={})\n", answer);
            bounded(config.op_timeout, writer.write_all(response.as_bytes())).await?;
            info!(id = task.id, "assignment solved");
            Ok(())
        }
        Ok(answer) => {
            bounded(config.op_timeout, writer.write_all(text::ERROR_LINE.as_bytes())).await?;
            info!(id = task.id, answer, expected = task.eval(), "wrong answer");
            Ok(())
        }
        Err(e) => {
            bounded(config.op_timeout, writer.write_all(text::ERROR_LINE.as_bytes())).await?;
            Err(e)
        }
    }
}

async fn binary_session<S>(
    reader: &mut BufReader<ReadHalf<S>>,
    writer: &mut WriteHalf<S>,
    config: &TcpConfig,
    task: &Task,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Send,
{
    bounded(config.op_timeout, writer.write_all(&CalcProtocol::task(task).encode())).await?;

    let mut buf = [0u8; CalcProtocol::SERIALIZED_LEN];
    bounded(config.op_timeout, reader.read_exact(&mut buf)).await?;
    let answer = CalcProtocol::try_deser(&buf)?;

    let ok = answer.record_type == RECORD_TYPE_ANSWER
        && answer.version_matches()
        && answer.id == task.id
        && answer.result == task.eval();

    bounded(config.op_timeout, writer.write_all(&CalcMessage::ack(ok).encode())).await?;
    info!(id = task.id, ok, "assignment answered");
    Ok(())
}

async fn bounded<T>(limit: Duration, op: impl Future<Output = std::io::Result<T>>) -> anyhow::Result<T> {
    match time::timeout(limit, op).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(anyhow::Error::new(OpTimeout)),
    }
}

async fn bounded_line<S>(reader: &mut BufReader<ReadHalf<S>>, limit: Duration) -> anyhow::Result<String>
where
    S: AsyncRead + AsyncWrite + Send,
{
    let mut line = String::new();
    let read = match time::timeout(limit, reader.read_line(&mut line)).await {
        Ok(result) => result?,
        Err(_) => return Err(anyhow::Error::new(OpTimeout)),
    };
    if read == 0 {
        bail!("peer closed the connection");
    }
    Ok(line)
}
