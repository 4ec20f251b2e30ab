//! UDP signaling endpoint.
//!
//! Session descriptions are exchanged as `OFFER:`/`ANSWER:` messages over a
//! plain UDP socket. Messages larger than one datagram are split into
//! `FRAG:` chunks and paced out; the receiving side collects chunks until a
//! message with the expected prefix is complete or the deadline passes.
//!
//! There is no acknowledgment or retransmission. A lost chunk means the
//! message never completes and the waiting side times out.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::Bytes;
use protocol::error::{ProtocolError, Result};
use protocol::{
    decode_signal_payload, encode_signal, Fragmenter, Inbound, MessageId, Reassembler,
    SignalKind, DEFAULT_MAX_PENDING, DEFAULT_PENDING_TTL, MAX_CHUNK_SIZE,
};
use tokio::net::UdpSocket;

use crate::config::SignalingSettings;

/// Receive buffer size; large enough for any UDP datagram.
const RECV_BUFFER_SIZE: usize = 65_536;

/// Configuration for a UDP signaling endpoint.
#[derive(Debug, Clone)]
pub struct SignalingConfig {
    /// Local address to bind.
    pub bind_addr: SocketAddr,
    /// Maximum chunk data size per datagram.
    pub max_chunk_size: usize,
    /// Delay between consecutive chunk sends.
    pub chunk_pacing: Duration,
    /// TTL for incomplete messages during a wait.
    pub pending_ttl: Duration,
    /// Maximum number of concurrently pending messages during a wait.
    pub max_pending: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_chunk_size: MAX_CHUNK_SIZE,
            chunk_pacing: Duration::from_millis(1),
            pending_ttl: DEFAULT_PENDING_TTL,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

impl SignalingConfig {
    /// Creates a new configuration bound to the given address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the endpoint configuration from the `[signaling]` section.
    pub fn from_settings(settings: &SignalingSettings) -> anyhow::Result<Self> {
        Ok(Self {
            bind_addr: settings.bind_socket_addr()?,
            max_chunk_size: settings.max_chunk_size,
            chunk_pacing: settings.chunk_pacing(),
            pending_ttl: settings.pending_ttl(),
            max_pending: settings.max_pending_messages,
        })
    }

    /// Sets the maximum chunk data size.
    pub fn with_max_chunk_size(mut self, max_chunk_size: usize) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    /// Sets the delay between chunk sends.
    pub fn with_chunk_pacing(mut self, pacing: Duration) -> Self {
        self.chunk_pacing = pacing;
        self
    }

    /// Sets the TTL for incomplete messages.
    pub fn with_pending_ttl(mut self, ttl: Duration) -> Self {
        self.pending_ttl = ttl;
        self
    }
}

/// A bound UDP signaling endpoint.
///
/// Waits take `&mut self`, so one endpoint serves one wait at a time.
pub struct UdpSignaling {
    socket: UdpSocket,
    fragmenter: Fragmenter,
    config: SignalingConfig,
}

impl UdpSignaling {
    /// Binds the signaling socket.
    pub async fn bind(config: SignalingConfig) -> Result<Self> {
        let fragmenter = Fragmenter::new(config.max_chunk_size)?;
        let socket = UdpSocket::bind(config.bind_addr).await?;

        tracing::info!(
            local_addr = ?socket.local_addr().ok(),
            max_chunk_size = config.max_chunk_size,
            "Signaling socket bound"
        );

        Ok(Self {
            socket,
            fragmenter,
            config,
        })
    }

    /// Returns the bound local address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Sends `message` as `FRAG:` chunks with a fresh message id.
    ///
    /// Returns the number of chunks sent.
    pub async fn send_fragmented(&self, dest: SocketAddr, message: &[u8]) -> Result<usize> {
        let message_id = MessageId::random();
        let fragments = self.fragmenter.split(&message_id, message);
        let total = fragments.len();

        tracing::debug!(
            dest = %dest,
            message_id = %message_id,
            bytes = message.len(),
            chunks = total,
            "Sending fragmented message"
        );

        for (i, fragment) in fragments.iter().enumerate() {
            if i > 0 && !self.config.chunk_pacing.is_zero() {
                tokio::time::sleep(self.config.chunk_pacing).await;
            }
            self.socket.send_to(&fragment.encode(), dest).await?;
        }

        Ok(total)
    }

    /// Sends `message` as one datagram when it fits in a chunk, otherwise
    /// fragmented. Returns the number of datagrams sent.
    pub async fn send_message(&self, dest: SocketAddr, message: &[u8]) -> Result<usize> {
        if message.len() <= self.fragmenter.max_chunk_size() {
            self.socket.send_to(message, dest).await?;
            tracing::debug!(dest = %dest, bytes = message.len(), "Sent whole message");
            return Ok(1);
        }
        self.send_fragmented(dest, message).await
    }

    /// Encodes `payload` as a signaling message of `kind` and sends it.
    pub async fn send_signal(
        &self,
        dest: SocketAddr,
        kind: SignalKind,
        payload: &[u8],
    ) -> Result<usize> {
        let message = encode_signal(kind, payload);
        let sent = self.send_message(dest, &message).await?;
        tracing::info!(dest = %dest, kind = %kind, datagrams = sent, "Signal sent");
        Ok(sent)
    }

    /// Waits for a complete message starting with `prefix`.
    ///
    /// Returns the message with the prefix stripped and the sender's address.
    /// Malformed datagrams and complete messages with another prefix are
    /// dropped. Fails with [`ProtocolError::Timeout`] once `timeout` elapses,
    /// regardless of unrelated traffic.
    pub async fn wait_for_message(
        &mut self,
        prefix: &str,
        timeout: Duration,
    ) -> Result<(Bytes, SocketAddr)> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut reassembler = Reassembler::new(self.config.pending_ttl, self.config.max_pending);
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let received =
                tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await;

            let (len, from) = match received {
                Ok(Ok(r)) => r,
                Ok(Err(e)) if is_transient(&e) => {
                    tracing::debug!(error = %e, "Ignoring transient receive error");
                    continue;
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(ProtocolError::Timeout {
                        prefix: prefix.to_string(),
                        waited: started.elapsed(),
                    })
                }
            };

            let message = match Inbound::classify(&buf[..len]) {
                Ok(Inbound::Whole(message)) => message,
                Ok(Inbound::Fragment(fragment)) => {
                    match reassembler.add(fragment, Instant::now()) {
                        Ok(Some(message)) => message,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::debug!(from = %from, error = %e, "Dropping fragment");
                            continue;
                        }
                    }
                }
                Err(e) => {
                    tracing::debug!(from = %from, error = %e, "Dropping malformed datagram");
                    continue;
                }
            };

            if message.starts_with(prefix.as_bytes()) {
                tracing::debug!(
                    from = %from,
                    bytes = message.len(),
                    elapsed = ?started.elapsed(),
                    "Received {}message",
                    prefix
                );
                return Ok((message.slice(prefix.len()..), from));
            }

            tracing::debug!(from = %from, bytes = message.len(), "Discarding message with unexpected prefix");
        }
    }

    /// Waits for a signaling message of `kind` and decodes its payload.
    pub async fn wait_for_signal(
        &mut self,
        kind: SignalKind,
        timeout: Duration,
    ) -> Result<(Vec<u8>, SocketAddr)> {
        let (body, from) = self.wait_for_message(kind.prefix(), timeout).await?;
        let payload = decode_signal_payload(&body)?;
        tracing::info!(from = %from, kind = %kind, bytes = payload.len(), "Signal received");
        Ok((payload, from))
    }

    /// Sends an offer to `remote` and waits for its answer.
    pub async fn offer(
        &mut self,
        remote: SocketAddr,
        offer: &[u8],
        answer_timeout: Duration,
    ) -> Result<(Vec<u8>, SocketAddr)> {
        self.send_signal(remote, SignalKind::Offer, offer).await?;
        self.wait_for_signal(SignalKind::Answer, answer_timeout).await
    }
}

fn is_transient(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionRefused
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::Fragment;

    fn loopback() -> SignalingConfig {
        SignalingConfig::new("127.0.0.1:0".parse().unwrap()).with_chunk_pacing(Duration::ZERO)
    }

    async fn pair() -> (UdpSignaling, UdpSignaling) {
        let a = UdpSignaling::bind(loopback()).await.unwrap();
        let b = UdpSignaling::bind(loopback()).await.unwrap();
        (a, b)
    }

    #[test]
    fn test_signaling_config_default() {
        let config = SignalingConfig::default();
        assert_eq!(config.max_chunk_size, 1200);
        assert_eq!(config.chunk_pacing, Duration::from_millis(1));
        assert_eq!(config.max_pending, DEFAULT_MAX_PENDING);
    }

    #[test]
    fn test_signaling_config_from_settings() {
        let settings = SignalingSettings {
            bind_addr: "127.0.0.1:9000".to_string(),
            max_chunk_size: 500,
            chunk_pacing_ms: 3,
            ..Default::default()
        };
        let config = SignalingConfig::from_settings(&settings).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9000".parse().unwrap());
        assert_eq!(config.max_chunk_size, 500);
        assert_eq!(config.chunk_pacing, Duration::from_millis(3));
    }

    #[tokio::test]
    async fn test_bind_rejects_zero_chunk_size() {
        let result = UdpSignaling::bind(loopback().with_max_chunk_size(0)).await;
        assert!(matches!(result, Err(ProtocolError::InvalidChunkSize(0))));
    }

    #[tokio::test]
    async fn test_whole_message_roundtrip() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();

        let sent = a.send_message(dest, b"OFFER:abc").await.unwrap();
        assert_eq!(sent, 1);

        let (body, from) = b
            .wait_for_message("OFFER:", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&body[..], b"abc");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_fragmented_signal_roundtrip() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();

        let sent = a.send_signal(dest, SignalKind::Answer, &payload).await.unwrap();
        assert!(sent > 1);

        let (decoded, _) = b
            .wait_for_signal(SignalKind::Answer, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_out_of_order_fragments() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();
        let message = [b"ANSWER:".as_slice(), &[b'x'; 3000]].concat();

        let fragments = Fragmenter::new(1200)
            .unwrap()
            .split(&MessageId::new("77"), &message);
        for index in [2, 0, 1] {
            a.socket.send_to(&fragments[index].encode(), dest).await.unwrap();
        }

        let (body, _) = b
            .wait_for_message("ANSWER:", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&body[..], &message[7..]);
    }

    #[tokio::test]
    async fn test_wait_times_out_promptly() {
        let (_a, mut b) = pair().await;
        let started = Instant::now();

        let err = b
            .wait_for_message("ANSWER:", Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_timeout_despite_unrelated_traffic() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();

        let noise = tokio::spawn(async move {
            for _ in 0..50 {
                let _ = a.send_message(dest, b"OFFER:noise").await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });

        let started = Instant::now();
        let err = b
            .wait_for_message("ANSWER:", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
        noise.abort();
    }

    #[tokio::test]
    async fn test_malformed_and_mismatched_dropped() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();

        a.socket.send_to(b"FRAG:1:x:0:bad", dest).await.unwrap();
        a.socket.send_to(b"FRAG:only", dest).await.unwrap();
        a.send_message(dest, b"OFFER:wrong-kind").await.unwrap();
        a.send_message(dest, b"ANSWER:right").await.unwrap();

        let (body, _) = b
            .wait_for_message("ANSWER:", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&body[..], b"right");
    }

    #[tokio::test]
    async fn test_fragmented_message_with_other_prefix_discarded() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();

        let offer = [b"OFFER:".as_slice(), &[b'o'; 2500]].concat();
        a.send_fragmented(dest, &offer).await.unwrap();
        a.send_message(dest, b"ANSWER:ok").await.unwrap();

        let (body, _) = b
            .wait_for_message("ANSWER:", Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&body[..], b"ok");
    }

    #[tokio::test]
    async fn test_incomplete_message_times_out() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();

        let lone = Fragment {
            message_id: MessageId::new("5"),
            total_chunks: 2,
            chunk_index: 0,
            data: Bytes::from_static(b"ANSWER:half"),
        };
        a.socket.send_to(&lone.encode(), dest).await.unwrap();

        let err = b
            .wait_for_message("ANSWER:", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn test_invalid_base64_payload_is_decode_error() {
        let (a, mut b) = pair().await;
        let dest = b.local_addr().unwrap();
        a.send_message(dest, b"OFFER:!!!").await.unwrap();

        let err = b
            .wait_for_signal(SignalKind::Offer, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[tokio::test]
    async fn test_offer_answer_exchange() {
        let (mut host, mut controller) = pair().await;
        let controller_addr = controller.local_addr().unwrap();

        let responder = tokio::spawn(async move {
            let (offer, from) = controller
                .wait_for_signal(SignalKind::Offer, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(offer, b"offer-sdp");
            controller
                .send_signal(from, SignalKind::Answer, b"answer-sdp")
                .await
                .unwrap();
        });

        let (answer, from) = host
            .offer(controller_addr, b"offer-sdp", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(answer, b"answer-sdp");
        assert_eq!(from, controller_addr);
        responder.await.unwrap();
    }
}
