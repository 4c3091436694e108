// Shared fixtures for the integration tests: an in-process socket connector
// and WAV helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use voice_coach::transport::{SocketLink, WireFrame};
use voice_coach::{Connector, TransportError, TransportEvent};

pub const WAIT: Duration = Duration::from_secs(5);

/// What the fake server does with the next connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accept,
    Refuse,
    /// Never completes the handshake
    Hang,
}

/// Server side of an accepted fake connection.
pub struct ServerEnd {
    received: fmpsc::UnboundedReceiver<WireFrame>,
    push: fmpsc::UnboundedSender<Result<WireFrame, TransportError>>,
}

impl ServerEnd {
    pub fn send_text(&self, text: &str) {
        self.push
            .unbounded_send(Ok(WireFrame::Text(text.to_string())))
            .expect("client stream gone");
    }

    pub fn send_binary(&self, bytes: Vec<u8>) {
        self.push
            .unbounded_send(Ok(WireFrame::Binary(bytes)))
            .expect("client stream gone");
    }

    pub fn close(&self, code: u16, reason: &str) {
        let _ = self.push.unbounded_send(Ok(WireFrame::Close {
            code,
            reason: reason.to_string(),
        }));
    }

    /// Drop the connection without a close frame.
    pub fn drop_connection(self) {}

    /// Next frame the client sent, or `None` after `WAIT`.
    pub async fn next_frame(&mut self) -> Option<WireFrame> {
        tokio::time::timeout(WAIT, self.received.next())
            .await
            .ok()
            .flatten()
    }

    /// Next binary frame, skipping text (heartbeats, control messages).
    pub async fn next_binary(&mut self) -> Option<Vec<u8>> {
        loop {
            match self.next_frame().await? {
                WireFrame::Binary(bytes) => return Some(bytes),
                _ => continue,
            }
        }
    }

    /// Next text frame parsed as JSON, skipping binary audio.
    pub async fn next_json(&mut self) -> Option<serde_json::Value> {
        loop {
            match self.next_frame().await? {
                WireFrame::Text(text) => return serde_json::from_str(&text).ok(),
                _ => continue,
            }
        }
    }
}

/// Connector that plays back a script of outcomes, one per attempt.
/// Attempts past the end of the script are refused.
pub struct FakeConnector {
    script: Mutex<VecDeque<Outcome>>,
    attempts: AtomicUsize,
    servers: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeConnector {
    pub fn new(script: &[Outcome]) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (servers, accepted) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            attempts: AtomicUsize::new(0),
            servers,
        });
        (connector, accepted)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _url: &str) -> Result<SocketLink, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Refuse);

        match outcome {
            Outcome::Refuse => Err(TransportError::ConnectionFailed(
                "connection refused".to_string(),
            )),
            Outcome::Hang => std::future::pending().await,
            Outcome::Accept => {
                let (client_tx, server_rx) = fmpsc::unbounded();
                let (server_tx, client_rx) = fmpsc::unbounded();
                let _ = self.servers.send(ServerEnd {
                    received: server_rx,
                    push: server_tx,
                });
                Ok(SocketLink {
                    sink: Box::pin(
                        client_tx.sink_map_err(|e| TransportError::Socket(e.to_string())),
                    ),
                    stream: Box::pin(client_rx),
                })
            }
        }
    }
}

pub async fn accepted(servers: &mut mpsc::UnboundedReceiver<ServerEnd>) -> ServerEnd {
    tokio::time::timeout(WAIT, servers.recv())
        .await
        .expect("no connection accepted")
        .expect("connector dropped")
}

pub async fn next_event(events: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for transport event")
        .expect("transport event channel closed")
}

/// Write a mono 16-bit WAV of `seconds` length: a 440 Hz tone for the first
/// `tone_secs`, silence after.
pub fn write_tone_wav(path: &Path, sample_rate: u32, seconds: f32, tone_secs: f32) {
    write_segments_wav(
        path,
        sample_rate,
        &[(tone_secs, true), ((seconds - tone_secs).max(0.0), false)],
    );
}

/// Write a mono 16-bit WAV made of `(seconds, tone)` segments, where a tone
/// segment is a 440 Hz sine at half scale and the rest is silence.
pub fn write_segments_wav(path: &Path, sample_rate: u32, segments: &[(f32, bool)]) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let mut n = 0usize;
    for &(seconds, tone) in segments {
        let count = (sample_rate as f32 * seconds).round() as usize;
        for _ in 0..count {
            let value = if tone {
                let t = n as f32 / sample_rate as f32;
                (t * 440.0 * std::f32::consts::TAU).sin() * 0.5
            } else {
                0.0
            };
            writer.write_sample((value * 32767.0) as i16).unwrap();
            n += 1;
        }
    }
    writer.finalize().unwrap();
}
