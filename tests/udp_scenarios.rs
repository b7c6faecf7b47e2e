use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time;

use netcalc::client::udp::{run_binary, run_bulk, run_text, ClientOptions};
use netcalc::protocol::records::{CalcMessage, CalcProtocol};
use netcalc::task::SeededRand;
use netcalc::udp::{UdpConfig, UdpEngine};

async fn start_server(config: UdpConfig) -> (SocketAddr, JoinHandle<anyhow::Result<()>>) {
    let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let mut engine = UdpEngine::bind(bind, config, SeededRand::from_seed(4711))
        .await
        .unwrap();
    let addr = engine.local_addr().unwrap();
    let handle = tokio::spawn(async move { engine.run().await });
    (addr, handle)
}

fn quiet_config() -> UdpConfig {
    let mut config = UdpConfig::new();
    config.quiet = true;
    config
}

async fn client_socket() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

/// Receives datagrams until one of the wanted length arrives; retransmitted
///  task records may be interleaved with the acknowledgement.
async fn recv_with_len(socket: &UdpSocket, server: SocketAddr, wanted: usize) -> Vec<u8> {
    let mut buf = [0u8; 512];
    loop {
        let (len, from) = time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        assert_eq!(from, server);
        if len == wanted {
            return buf[..len].to_vec();
        }
    }
}

fn solve(record: &CalcProtocol) -> i32 {
    match record.op {
        1 => record.v1.wrapping_add(record.v2),
        2 => record.v1.wrapping_sub(record.v2),
        3 => record.v1.wrapping_mul(record.v2),
        4 => record.v1.wrapping_div(record.v2),
        other => panic!("unknown op {}", other),
    }
}

#[tokio::test]
async fn binary_happy_path() {
    let (server, engine) = start_server(quiet_config()).await;
    let socket = client_socket().await;

    socket
        .send_to(&CalcMessage::client_hello().encode(), server)
        .await
        .unwrap();

    let task_bytes = recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await;
    let task = CalcProtocol::try_deser(&task_bytes).unwrap();
    assert_eq!(task.record_type, 1);
    assert_eq!((task.major_version, task.minor_version), (1, 1));
    assert_ne!(task.id, 0);

    let answer = CalcProtocol::answer(task.id, task.op, task.v1, task.v2, solve(&task));
    socket.send_to(&answer.encode(), server).await.unwrap();

    let ack_bytes = recv_with_len(&socket, server, CalcMessage::SERIALIZED_LEN).await;
    assert_eq!(ack_bytes, CalcMessage::ack(true).encode());

    engine.abort();
}

#[tokio::test]
async fn binary_wrong_result_is_rejected() {
    let (server, engine) = start_server(quiet_config()).await;
    let socket = client_socket().await;

    socket
        .send_to(&CalcMessage::client_hello().encode(), server)
        .await
        .unwrap();
    let task_bytes = recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await;
    let task = CalcProtocol::try_deser(&task_bytes).unwrap();

    let answer = CalcProtocol::answer(task.id, task.op, task.v1, task.v2, solve(&task).wrapping_add(1));
    socket.send_to(&answer.encode(), server).await.unwrap();

    let ack_bytes = recv_with_len(&socket, server, CalcMessage::SERIALIZED_LEN).await;
    assert_eq!(ack_bytes, CalcMessage::ack(false).encode());

    engine.abort();
}

#[tokio::test]
async fn duplicate_answer_gets_identical_ack() {
    let (server, engine) = start_server(quiet_config()).await;
    let socket = client_socket().await;

    socket
        .send_to(&CalcMessage::client_hello().encode(), server)
        .await
        .unwrap();
    let task_bytes = recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await;
    let task = CalcProtocol::try_deser(&task_bytes).unwrap();

    let answer = CalcProtocol::answer(task.id, task.op, task.v1, task.v2, solve(&task)).encode();
    socket.send_to(&answer, server).await.unwrap();
    let first_ack = recv_with_len(&socket, server, CalcMessage::SERIALIZED_LEN).await;

    socket.send_to(&answer, server).await.unwrap();
    let second_ack = recv_with_len(&socket, server, CalcMessage::SERIALIZED_LEN).await;

    assert_eq!(first_ack, second_ack);

    engine.abort();
}

#[tokio::test]
async fn stale_answer_is_rejected() {
    let mut config = quiet_config();
    config.task_lifetime = Duration::from_millis(300);
    let (server, engine) = start_server(config).await;
    let socket = client_socket().await;

    socket
        .send_to(&CalcMessage::client_hello().encode(), server)
        .await
        .unwrap();
    let task_bytes = recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await;
    let task = CalcProtocol::try_deser(&task_bytes).unwrap();

    time::sleep(Duration::from_millis(400)).await;

    // the correct result, but too late
    let answer = CalcProtocol::answer(task.id, task.op, task.v1, task.v2, solve(&task));
    socket.send_to(&answer.encode(), server).await.unwrap();

    let ack_bytes = recv_with_len(&socket, server, CalcMessage::SERIALIZED_LEN).await;
    assert_eq!(ack_bytes, CalcMessage::ack(false).encode());

    engine.abort();
}

#[tokio::test]
async fn text_happy_path() {
    let mut config = quiet_config();
    config.enable_text = true;
    let (server, engine) = start_server(config).await;
    let socket = client_socket().await;

    socket.send_to(b"TEXT UDP 1.1", server).await.unwrap();

    let mut buf = [0u8; 512];
    let (len, _) = time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .unwrap()
        .unwrap();
    let task_line = std::str::from_utf8(&buf[..len]).unwrap().to_owned();
    assert!(task_line.ends_with('\n'));

    let mut tokens = task_line.split_whitespace();
    let id: u32 = tokens.next().unwrap().parse().unwrap();
    let op = tokens.next().unwrap().to_owned();
    let v1: i64 = tokens.next().unwrap().parse().unwrap();
    let v2: i64 = tokens.next().unwrap().parse().unwrap();
    let result = match op.as_str() {
        "add" => v1 + v2,
        "sub" => v1 - v2,
        "mul" => v1 * v2,
        "div" => v1 / v2,
        other => panic!("unknown op {:?}", other),
    };

    socket
        .send_to(format!("{} {}\n", id, result).as_bytes(), server)
        .await
        .unwrap();

    let ack = loop {
        let (len, _) = time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let line = std::str::from_utf8(&buf[..len]).unwrap().to_owned();
        // the task line may still be retransmitted while the answer is in flight
        if line != task_line {
            break line;
        }
    };
    assert_eq!(ack, "OK\n");

    engine.abort();
}

#[tokio::test]
async fn implicit_handshake_via_zero_id_record() {
    let (server, engine) = start_server(quiet_config()).await;
    let socket = client_socket().await;

    let request = CalcProtocol::answer(0, 0, 0, 0, 1);
    socket.send_to(&request.encode(), server).await.unwrap();

    let task_bytes = recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await;
    let task = CalcProtocol::try_deser(&task_bytes).unwrap();
    assert_eq!(task.record_type, 1);
    assert_ne!(task.id, 0);

    engine.abort();
}

#[tokio::test]
async fn all_zero_record_is_bounced_not_ok() {
    let (server, engine) = start_server(quiet_config()).await;
    let socket = client_socket().await;

    socket.send_to(&[0u8; 26], server).await.unwrap();

    let ack_bytes = recv_with_len(&socket, server, CalcMessage::SERIALIZED_LEN).await;
    assert_eq!(ack_bytes, CalcMessage::ack(false).encode());

    engine.abort();
}

#[tokio::test]
async fn rehandshake_after_finalize_issues_fresh_task() {
    let (server, engine) = start_server(quiet_config()).await;
    let socket = client_socket().await;

    socket
        .send_to(&CalcMessage::client_hello().encode(), server)
        .await
        .unwrap();
    let first = CalcProtocol::try_deser(&recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await).unwrap();

    let answer = CalcProtocol::answer(first.id, first.op, first.v1, first.v2, solve(&first));
    socket.send_to(&answer.encode(), server).await.unwrap();
    recv_with_len(&socket, server, CalcMessage::SERIALIZED_LEN).await;

    socket
        .send_to(&CalcMessage::client_hello().encode(), server)
        .await
        .unwrap();
    let second = CalcProtocol::try_deser(&recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await).unwrap();

    assert_ne!(second.id, first.id);

    engine.abort();
}

#[tokio::test]
async fn unanswered_task_is_retransmitted_with_stable_id() {
    let (server, engine) = start_server(quiet_config()).await;
    let socket = client_socket().await;

    socket
        .send_to(&CalcMessage::client_hello().encode(), server)
        .await
        .unwrap();

    let first = CalcProtocol::try_deser(&recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await).unwrap();
    // no answer: the proactive schedule must resend the very same task
    let second = CalcProtocol::try_deser(&recv_with_len(&socket, server, CalcProtocol::SERIALIZED_LEN).await).unwrap();

    assert_eq!(first, second);

    engine.abort();
}

#[tokio::test]
async fn driver_round_trips() {
    let mut config = quiet_config();
    config.enable_text = true;
    let (server, engine) = start_server(config).await;

    let binary = run_binary(server, &ClientOptions::new()).await.unwrap();
    assert!(binary.accepted);

    let text = run_text(server, &ClientOptions::new()).await.unwrap();
    assert!(text.accepted);

    let wrong = run_binary(
        server,
        &ClientOptions {
            wrong_result: true,
            ..ClientOptions::new()
        },
    )
    .await
    .unwrap();
    assert!(!wrong.accepted);

    engine.abort();
}

#[tokio::test]
async fn bulk_clients_with_answer_loss_all_complete() {
    let (server, engine) = start_server(quiet_config()).await;

    let (answered, ok) = run_bulk(server, 20, 30).await;
    assert_eq!(answered, 20);
    assert_eq!(ok, 20);

    engine.abort();
}
