use std::pin::Pin;

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

use crate::error::TransportError;

/// Close code sent when the client ends the connection on purpose.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Close code reported when the connection dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// One frame on the socket, independent of the WebSocket library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

pub type FrameSink = Pin<Box<dyn Sink<WireFrame, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<WireFrame, TransportError>> + Send>>;

/// An open socket split into its write and read halves.
pub struct SocketLink {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

/// Opens socket connections for the network worker.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<SocketLink, TransportError>;
}

/// WebSocket connector over tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, url: &str) -> Result<SocketLink, TransportError> {
        let (ws, response) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        debug!("WebSocket handshake with {} ({})", url, response.status());

        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|e| TransportError::Socket(e.to_string()))
            .with(|frame: WireFrame| future::ready(Ok::<_, TransportError>(to_message(frame))));

        let stream = stream.filter_map(|message| future::ready(from_message(message)));

        Ok(SocketLink {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

fn to_message(frame: WireFrame) -> Message {
    match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
        WireFrame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: reason.into(),
        })),
    }
}

/// Pings and pongs are answered by tungstenite itself and never surface.
fn from_message(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<WireFrame, TransportError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(WireFrame::Text(text.as_str().to_owned()))),
        Ok(Message::Binary(bytes)) => Some(Ok(WireFrame::Binary(bytes.to_vec()))),
        Ok(Message::Close(frame)) => {
            let (code, reason) = match frame {
                Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                None => (1005, String::new()),
            };
            Some(Ok(WireFrame::Close { code, reason }))
        }
        Ok(_) => None,
        Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
    }
}
