// Integration tests for the live transport
//
// Most tests drive LiveTransport against an in-process fake connector; the
// last one runs a real WebSocket server on localhost.

mod common;

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use common::{accepted, next_event, FakeConnector, Outcome, WAIT};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use voice_coach::transport::{StatusState, WireFrame, NORMAL_CLOSURE};
use voice_coach::{
    AudioFrame, LinkState, LiveTransport, StartOptions, TransportError, TransportEvent,
    TransportOptions, WsConnector,
};

fn options() -> TransportOptions {
    TransportOptions::new("ws://fake.test/ws/live")
}

#[tokio::test]
async fn test_concurrent_connects_share_one_attempt() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept]);
    let (transport, mut events) = LiveTransport::new(options(), connector.clone());

    let (first, second) = tokio::join!(transport.connect(), transport.connect());
    assert_eq!(first, Ok(()));
    assert_eq!(second, Ok(()));
    assert_eq!(connector.attempts(), 1);
    assert_eq!(transport.state(), LinkState::Connected);

    let _server = accepted(&mut servers).await;
    match next_event(&mut events).await {
        TransportEvent::Status(status) => assert_eq!(status.state, StatusState::Connected),
        other => panic!("expected connected status, got {:?}", other),
    }

    // Already connected: resolves without another attempt
    transport.connect().await.unwrap();
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_audio_before_connect_is_dropped() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept]);
    let (transport, _events) = LiveTransport::new(options(), connector);

    transport.send_audio(AudioFrame::new(vec![9; 4], 24000));
    transport.connect().await.unwrap();
    let mut server = accepted(&mut servers).await;

    let frame = AudioFrame::new(vec![1, -2, 3], 24000);
    transport.send_audio(frame.clone());

    let batch = server.next_binary().await.expect("no audio batch");
    assert_eq!(batch, frame.to_le_bytes());
}

#[tokio::test]
async fn test_frames_are_batched_into_one_binary_message() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept]);
    let mut opts = options();
    opts.batch_interval = Duration::from_millis(200);
    let (transport, _events) = LiveTransport::new(opts, connector);

    transport.connect().await.unwrap();
    let mut server = accepted(&mut servers).await;

    let frames = [
        AudioFrame::new(vec![1, 2], 24000),
        AudioFrame::new(vec![3, 4], 24000),
        AudioFrame::new(vec![5, 6], 24000),
    ];
    for frame in &frames {
        transport.send_audio(frame.clone());
    }
    // Empty frames never reach the worker
    transport.send_audio(AudioFrame::new(Vec::new(), 24000));

    let expected: Vec<u8> = frames.iter().flat_map(|f| f.to_le_bytes()).collect();
    let batch = server.next_binary().await.expect("no audio batch");
    assert_eq!(batch, expected);

    let mut stats = None;
    for _ in 0..50 {
        transport.get_stats();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stats = transport.last_stats();
        if stats.is_some() {
            break;
        }
    }
    let stats = stats.expect("stats never arrived");
    assert_eq!(stats.total_batches_sent, 1);
    assert_eq!(stats.total_bytes_sent, 12);
    assert_eq!(stats.avg_batch_size, 12);
}

#[tokio::test]
async fn test_error_while_connecting_rejects() {
    let (connector, _servers) = FakeConnector::new(&[Outcome::Refuse]);
    let mut opts = options();
    opts.max_reconnect_attempts = 0;
    let (transport, mut events) = LiveTransport::new(opts, connector);

    let result = transport.connect().await;
    assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));

    match next_event(&mut events).await {
        TransportEvent::Error(message) => assert!(message.starts_with("WebSocket error")),
        other => panic!("expected error event, got {:?}", other),
    }
    match next_event(&mut events).await {
        TransportEvent::Status(status) => {
            assert_eq!(status.state, StatusState::Disconnected);
            assert_eq!(status.code, Some(1006));
            assert_eq!(status.has_backup, Some(false));
        }
        other => panic!("expected disconnected status, got {:?}", other),
    }
    assert_eq!(transport.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_connect_times_out() {
    let (connector, _servers) = FakeConnector::new(&[Outcome::Hang]);
    let mut opts = options();
    opts.connect_timeout = Duration::from_secs(10);
    let (transport, _events) = LiveTransport::new(opts, connector);

    let result = transport.connect().await;
    assert_eq!(result, Err(TransportError::ConnectionTimeout(10_000)));
    assert_eq!(transport.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_attempts_then_disconnect() {
    let (connector, mut servers) =
        FakeConnector::new(&[Outcome::Accept, Outcome::Refuse, Outcome::Refuse]);
    let mut opts = options();
    opts.max_reconnect_attempts = 2;
    let (transport, mut events) = LiveTransport::new(opts, connector.clone());

    transport.connect().await.unwrap();
    let server = accepted(&mut servers).await;
    assert!(matches!(next_event(&mut events).await, TransportEvent::Status(_)));

    server.drop_connection();

    let mut attempts = Vec::new();
    let mut errors = 0;
    let last = loop {
        match next_event(&mut events).await {
            TransportEvent::Status(status) if status.state == StatusState::Reconnecting => {
                assert_eq!(status.max_attempts, Some(2));
                assert_eq!(status.delay_ms, Some(600));
                attempts.push(status.attempt.unwrap());
            }
            TransportEvent::Status(status) if status.state == StatusState::Disconnected => {
                break status;
            }
            TransportEvent::Error(_) => errors += 1,
            other => panic!("unexpected event {:?}", other),
        }
    };

    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(errors, 2);
    assert_eq!(last.code, Some(1006));
    assert_eq!(connector.attempts(), 3);
    assert_eq!(transport.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_link_and_backs_up_transcript() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept, Outcome::Accept]);
    let (transport, mut events) = LiveTransport::new(options(), connector);

    transport.connect().await.unwrap();
    let server = accepted(&mut servers).await;
    assert!(matches!(next_event(&mut events).await, TransportEvent::Status(_)));

    server.send_text(r#"{"type":"transcript","role":"assistant","text":"Tell me about yourself","timestamp":"t1"}"#);
    match next_event(&mut events).await {
        TransportEvent::Transcript(t) => assert_eq!(t.text, "Tell me about yourself"),
        other => panic!("expected transcript, got {:?}", other),
    }

    server.drop_connection();

    match next_event(&mut events).await {
        TransportEvent::TranscriptBackup(backup) => {
            assert_eq!(backup.transcripts.len(), 1);
            assert_eq!(backup.transcripts[0].message.role, "assistant");
        }
        other => panic!("expected transcript backup, got {:?}", other),
    }
    match next_event(&mut events).await {
        TransportEvent::Status(status) => {
            assert_eq!(status.state, StatusState::Reconnecting);
            assert_eq!(status.attempt, Some(1));
        }
        other => panic!("expected reconnecting, got {:?}", other),
    }
    match next_event(&mut events).await {
        TransportEvent::Status(status) => assert_eq!(status.state, StatusState::Reconnected),
        other => panic!("expected reconnected, got {:?}", other),
    }

    let _second = accepted(&mut servers).await;
    assert_eq!(transport.state(), LinkState::Connected);
}

#[tokio::test]
async fn test_normal_server_close_does_not_reconnect() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept, Outcome::Accept]);
    let (transport, mut events) = LiveTransport::new(options(), connector.clone());

    transport.connect().await.unwrap();
    let server = accepted(&mut servers).await;
    assert!(matches!(next_event(&mut events).await, TransportEvent::Status(_)));

    server.close(NORMAL_CLOSURE, "Interview finished");
    match next_event(&mut events).await {
        TransportEvent::Status(status) => {
            assert_eq!(status.state, StatusState::Disconnected);
            assert_eq!(status.code, Some(NORMAL_CLOSURE));
            assert_eq!(status.reason.as_deref(), Some("Interview finished"));
        }
        other => panic!("expected disconnected, got {:?}", other),
    }
    assert_eq!(connector.attempts(), 1);
    assert_eq!(transport.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_runs_only_while_connected() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept]);
    let mut opts = options();
    opts.heartbeat_interval = Duration::from_secs(1);
    let (transport, mut events) = LiveTransport::new(opts, connector.clone());

    transport.connect().await.unwrap();
    let opened = tokio::time::Instant::now();
    let mut server = accepted(&mut servers).await;
    assert!(matches!(next_event(&mut events).await, TransportEvent::Status(_)));

    for beat in 1..=2u64 {
        let ping = server.next_json().await.expect("no heartbeat");
        assert_eq!(ping["type"], "ping");
        assert!(ping["ts"].as_i64().is_some_and(|ts| ts > 0));
        assert!(opened.elapsed() >= Duration::from_secs(beat));
    }

    server.close(NORMAL_CLOSURE, "Interview finished");
    match next_event(&mut events).await {
        TransportEvent::Status(status) => assert_eq!(status.state, StatusState::Disconnected),
        other => panic!("expected disconnected, got {:?}", other),
    }

    // Several intervals later the socket has seen nothing more
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(server.next_json().await.is_none());
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_server_messages_become_events() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept]);
    let (transport, mut events) = LiveTransport::new(options(), connector);

    transport.connect().await.unwrap();
    let server = accepted(&mut servers).await;
    assert!(matches!(next_event(&mut events).await, TransportEvent::Status(_)));

    let pcm: Vec<u8> = [100i16, -100].iter().flat_map(|s| s.to_le_bytes()).collect();
    let encoded = base64::engine::general_purpose::STANDARD.encode(&pcm);

    server.send_text("not json");
    server.send_text(r#"{"type":"mystery","payload":1}"#);
    server.send_text(&format!(r#"{{"type":"audio","data":"{}"}}"#, encoded));
    server.send_binary(pcm.clone());
    server.send_text(r#"{"type":"session","session_id":"srv-1","mode":"live"}"#);
    server.send_text(r#"{"type":"error","message":"model overloaded"}"#);

    match next_event(&mut events).await {
        TransportEvent::Error(message) => assert_eq!(message, "Invalid JSON from server"),
        other => panic!("expected invalid JSON error, got {:?}", other),
    }
    // The unknown type is logged and dropped
    for _ in 0..2 {
        match next_event(&mut events).await {
            TransportEvent::Audio(decoded) => assert_eq!(decoded.samples, vec![100, -100]),
            other => panic!("expected audio, got {:?}", other),
        }
    }
    match next_event(&mut events).await {
        TransportEvent::Session(session) => {
            assert_eq!(session.session_id, "srv-1");
            assert_eq!(session.mode, "live");
        }
        other => panic!("expected session, got {:?}", other),
    }
    match next_event(&mut events).await {
        TransportEvent::Error(message) => assert_eq!(message, "model overloaded"),
        other => panic!("expected server error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_control_messages_on_the_wire() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept]);
    let (transport, _events) = LiveTransport::new(options(), connector);

    transport.connect().await.unwrap();
    let mut server = accepted(&mut servers).await;

    transport.start(
        "int-1",
        "user-1",
        StartOptions {
            resume: true,
            live_model: None,
        },
    );
    transport.barge_in();
    transport.stop();

    let start = server.next_json().await.unwrap();
    assert_eq!(start["type"], "start");
    assert_eq!(start["interview_id"], "int-1");
    assert_eq!(start["user_id"], "user-1");
    assert_eq!(start["resume"], true);
    assert!(start.get("live_model").is_none());

    assert_eq!(server.next_json().await.unwrap()["type"], "barge_in");
    assert_eq!(server.next_json().await.unwrap()["type"], "stop");
}

#[tokio::test]
async fn test_close_is_terminal() {
    let (connector, mut servers) = FakeConnector::new(&[Outcome::Accept]);
    let (transport, _events) = LiveTransport::new(options(), connector.clone());

    transport.connect().await.unwrap();
    let mut server = accepted(&mut servers).await;

    transport.close();
    transport.close();
    assert_eq!(transport.state(), LinkState::Closed);

    match server.next_frame().await {
        Some(WireFrame::Close { code, reason }) => {
            assert_eq!(code, NORMAL_CLOSURE);
            assert_eq!(reason, "Client disconnect");
        }
        other => panic!("expected close frame, got {:?}", other),
    }

    assert_eq!(transport.connect().await, Err(TransportError::Closed));
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test]
async fn test_websocket_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        // Wait for the first audio batch, then answer with a transcript line
        let mut audio = Vec::new();
        while let Some(message) = ws.next().await {
            match message.unwrap() {
                Message::Binary(bytes) => {
                    audio = bytes.to_vec();
                    break;
                }
                _ => continue,
            }
        }
        ws.send(Message::Text(
            r#"{"type":"transcript","role":"user","text":"hello","is_final":true}"#.into(),
        ))
        .await
        .unwrap();
        audio
    });

    let url = format!("ws://{}/ws/live", addr);
    let (transport, mut events) = LiveTransport::new(TransportOptions::new(url), Arc::new(WsConnector));
    transport.connect().await.unwrap();

    let frame = AudioFrame::new(vec![7, 8, 9], 16000);
    transport.send_audio(frame.clone());

    let audio = tokio::time::timeout(WAIT, server).await.unwrap().unwrap();
    assert_eq!(audio, frame.to_le_bytes());

    let transcript = loop {
        if let TransportEvent::Transcript(t) = next_event(&mut events).await {
            break t;
        }
    };
    assert_eq!(transcript.text, "hello");
    assert_eq!(transcript.is_final, Some(true));

    transport.close();
}
