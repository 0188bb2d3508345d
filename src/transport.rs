//! Transport boundary: framed byte duplex over anything.
//!
//! A `Transport` is a pair of channels carrying opaque binary frames. The
//! session and relay only ever see `Transport`s, so the same code runs
//! over a real WebSocket, an in-process pair in tests, or whatever the
//! host wires up. A `Connector` produces fresh transports — that is what
//! the reconnect loop calls on every attempt.

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::ProtocolError;

/// One end of a framed binary duplex.
pub struct Transport {
    tx: mpsc::Sender<Vec<u8>>,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Transport {
    /// Assemble from raw channel halves (used by adapters).
    pub fn from_parts(tx: mpsc::Sender<Vec<u8>>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { tx, rx }
    }

    /// In-process connected pair; frames sent on one end arrive on the
    /// other. The backbone of every integration test and the memory relay.
    pub fn pair(capacity: usize) -> (Transport, Transport) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        (
            Transport { tx: a_tx, rx: a_rx },
            Transport { tx: b_tx, rx: b_rx },
        )
    }

    /// Send one frame. Fails when the peer is gone.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Receive the next frame; `None` means the peer closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// A clonable sender for writer tasks.
    pub fn sender(&self) -> mpsc::Sender<Vec<u8>> {
        self.tx.clone()
    }
}

/// Factory for fresh connections; called once per (re)connect attempt.
pub trait Connector: Send + Sync {
    fn connect(&self) -> BoxFuture<'static, Result<Transport, ProtocolError>>;
}

impl<F> Connector for F
where
    F: Fn() -> BoxFuture<'static, Result<Transport, ProtocolError>> + Send + Sync,
{
    fn connect(&self) -> BoxFuture<'static, Result<Transport, ProtocolError>> {
        self()
    }
}

/// WebSocket connector.
///
/// Dials `{url}/{doc_id}`, appending the opaque credential as a query
/// parameter; the relay validates it before admitting the client. Two
/// tasks bridge the socket to the channel pair: a writer draining the
/// outgoing channel into the sink, and a reader forwarding binary frames
/// until close.
pub struct WsConnector {
    url: String,
    doc_id: Uuid,
    credential: Option<String>,
}

impl WsConnector {
    pub fn new(url: impl Into<String>, doc_id: Uuid, credential: Option<String>) -> Self {
        Self {
            url: url.into(),
            doc_id,
            credential,
        }
    }

    fn endpoint(&self) -> String {
        match &self.credential {
            Some(token) => format!("{}/{}?token={}", self.url, self.doc_id, token),
            None => format!("{}/{}", self.url, self.doc_id),
        }
    }
}

impl Connector for WsConnector {
    fn connect(&self) -> BoxFuture<'static, Result<Transport, ProtocolError>> {
        let endpoint = self.endpoint();
        Box::pin(async move {
            let (ws_stream, _) = tokio_tungstenite::connect_async(&endpoint)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
            Ok(ws_transport(ws_stream))
        })
    }
}

/// Bridge an established WebSocket to a `Transport`.
///
/// Two tasks own the socket halves: a writer draining the outgoing
/// channel into the sink, and a reader forwarding binary frames until
/// close. Used by both the client connector and the relay's accept path.
pub fn ws_transport<S>(ws_stream: WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut ws_writer, mut ws_reader) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
    let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(256);

    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            if ws_writer
                .send(tokio_tungstenite::tungstenite::Message::Binary(frame.into()))
                .await
                .is_err()
            {
                break;
            }
        }
        let _ = ws_writer.close().await;
    });

    tokio::spawn(async move {
        while let Some(msg) = ws_reader.next().await {
            match msg {
                Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                    if in_tx.send(data.into()).await.is_err() {
                        break;
                    }
                }
                Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }
        // in_tx drops here; the consumer sees recv() -> None.
    });

    Transport::from_parts(out_tx, in_rx)
}
