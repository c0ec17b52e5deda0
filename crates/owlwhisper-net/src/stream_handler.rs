use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{AsyncReadExt, AsyncWriteExt, StreamExt};
use libp2p::{PeerId, StreamProtocol};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::APPLICATION_PROTOCOL;
use crate::error::{CoreError, CoreResult};
use crate::event_queue::EventQueueHandle;
use crate::events::{CoreEvent, RawMessage};
use crate::host::HostHandle;
use crate::metrics::MetricsSink;

const MESSAGES_CHANNEL_CAPACITY: usize = 100;

/// Accepts inbound `/owl-whisper/1.0.0` streams, reads each to EOF (the
/// writer signals "done" by half-closing, not by a length prefix), and
/// fans every decoded message out to the event queue and a bounded local
/// channel. `send`/`broadcast` open outbound streams through [`HostHandle`].
#[derive(Clone)]
pub struct StreamHandler {
    host:     HostHandle,
    events:   EventQueueHandle,
    outbound: mpsc::Sender<RawMessage>,
    metrics:  Arc<dyn MetricsSink>
}

pub struct StreamHandlerParts {
    pub handler:  StreamHandler,
    pub messages: mpsc::Receiver<RawMessage>
}

impl StreamHandler {
    pub fn new(host: HostHandle, events: EventQueueHandle, metrics: Arc<dyn MetricsSink>) -> StreamHandlerParts {
        let (outbound, messages) = mpsc::channel(MESSAGES_CHANNEL_CAPACITY);
        StreamHandlerParts { handler: StreamHandler { host, events, outbound, metrics }, messages }
    }

    /// Spawns the accept loop; returns once `cancel` fires or the stream
    /// control can no longer be registered.
    pub fn spawn_accept_loop(&self, read_timeout: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let host = self.host.clone();
        let events = self.events.clone();
        let outbound = self.outbound.clone();
        let metrics = self.metrics.clone();
        tokio::spawn(async move {
            let mut control = host.stream_control();
            let protocol = StreamProtocol::new(APPLICATION_PROTOCOL);
            let mut incoming = match control.accept(protocol) {
                Ok(incoming) => incoming,
                Err(e) => {
                    tracing::error!(error = %e, "failed to register application protocol for inbound streams");
                    return;
                }
            };

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    next = incoming.next() => {
                        let Some((peer_id, stream)) = next else { return };
                        let events = events.clone();
                        let outbound = outbound.clone();
                        let metrics = metrics.clone();
                        tokio::spawn(async move {
                            Self::handle_inbound(peer_id, stream, read_timeout, events, outbound, metrics).await;
                        });
                    }
                }
            }
        })
    }

    /// Reads the inbound stream to EOF. A stream that produced zero bytes or
    /// failed before close is dropped silently (spec.md 7's `ProtocolError`:
    /// no event, no error).
    async fn handle_inbound(
        peer_id: PeerId,
        mut stream: libp2p::Stream,
        read_timeout: Duration,
        events: EventQueueHandle,
        outbound: mpsc::Sender<RawMessage>,
        metrics: Arc<dyn MetricsSink>
    ) {
        let mut buf = Vec::new();
        let read = tokio::time::timeout(read_timeout, stream.read_to_end(&mut buf)).await;
        match read {
            Ok(Ok(_)) if buf.is_empty() => {
                tracing::debug!(peer_id = %peer_id, "inbound stream closed with zero bytes, dropping silently");
            }
            Ok(Ok(_)) => {
                metrics.message_received(buf.len());
                let message = RawMessage { sender: peer_id, bytes: Bytes::from(buf) };
                events.push(CoreEvent::new_message(message.sender, message.bytes.clone()));
                if outbound.try_send(message).is_err() {
                    tracing::warn!(peer_id = %peer_id, "messages channel full, dropping newest inbound message");
                }
            }
            Ok(Err(e)) => {
                tracing::debug!(peer_id = %peer_id, error = %e, "inbound stream dropped: protocol error");
            }
            Err(_) => {
                tracing::debug!(peer_id = %peer_id, "inbound stream read timed out, dropping");
            }
        }
    }

    /// Opens a stream to `peer_id`, writes `bytes`, then half-closes — the
    /// remote's read-to-EOF is what signals "message complete".
    pub async fn send(
        &self,
        peer_id: PeerId,
        bytes: Bytes,
        creation_timeout: Duration,
        write_timeout: Duration
    ) -> CoreResult<()> {
        let bytes_len = bytes.len();
        let mut stream = self.host.open_stream(peer_id, creation_timeout).await?;
        tokio::time::timeout(write_timeout, async {
            stream.write_all(&bytes).await?;
            stream.close().await
        })
        .await
        .map_err(|_| CoreError::Timeout)?
        .map_err(|e| CoreError::DialFailed { peer_id, reason: e.to_string() })?;
        self.metrics.message_sent(bytes_len);
        Ok(())
    }

    /// Fans a message out to every peer; every failure is logged, and the
    /// last one is returned so the caller can tell whether anything failed,
    /// per spec.md 4.8.
    pub async fn broadcast(
        &self,
        peers: Vec<PeerId>,
        bytes: Bytes,
        creation_timeout: Duration,
        write_timeout: Duration
    ) -> CoreResult<()> {
        let mut last_err = None;
        for peer_id in peers {
            if let Err(e) = self.send(peer_id, bytes.clone(), creation_timeout, write_timeout).await {
                tracing::debug!(peer_id = %peer_id, error = %e, "broadcast send failed");
                last_err = Some(e);
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(())
        }
    }
}
