//! Frame dispatch loop.
//!
//! On every tick one frame is captured, serialized once, and written to the
//! next target of every registered client. Each write runs under its own
//! deadline and all writes of a tick run concurrently, so one stalled client
//! cannot hold up the others.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use protocol::FrameUnit;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::capture::CaptureError;
use crate::config::StreamConfig;
use crate::network::ConnectionHandle;
use crate::session::ClientRegistry;

/// Producer of one frame per dispatch tick.
pub trait FrameSource: Send + Sync + 'static {
    /// Captures the current frame.
    fn capture(&self) -> impl Future<Output = Result<FrameUnit, CaptureError>> + Send;
}

/// Dispatch loop configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Time between ticks.
    pub interval: Duration,
    /// Deadline for writing one frame to one connection.
    pub write_timeout: Duration,
    /// When set, frames are sent as chunked records of this many characters.
    pub frame_chunk_size: Option<usize>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

impl From<&StreamConfig> for DispatchConfig {
    fn from(config: &StreamConfig) -> Self {
        Self {
            interval: config.frame_interval(),
            write_timeout: config.write_timeout(),
            frame_chunk_size: config.frame_chunking(),
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    /// Whether a frame was captured and serialized.
    pub captured: bool,
    /// Clients that had a target.
    pub targets: usize,
    /// Writes that completed in time.
    pub delivered: usize,
    /// Writes that failed or timed out.
    pub failed: usize,
}

/// Periodic capture-and-fan-out task.
pub struct DispatchLoop<S: FrameSource> {
    registry: Arc<ClientRegistry>,
    source: Arc<S>,
    config: DispatchConfig,
    next_frame_id: u64,
}

impl<S: FrameSource> DispatchLoop<S> {
    /// Creates a dispatch loop over `registry` fed by `source`.
    pub fn new(registry: Arc<ClientRegistry>, source: Arc<S>, config: DispatchConfig) -> Self {
        Self {
            registry,
            source,
            config,
            next_frame_id: 0,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Runs until `shutdown` is cancelled.
    ///
    /// A tick in progress is abandoned when shutdown fires; its writes are
    /// dropped rather than awaited.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval = ?self.config.interval,
            write_timeout = ?self.config.write_timeout,
            chunked = self.config.frame_chunk_size.is_some(),
            "Dispatch loop started"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                outcome = self.tick() => {
                    tracing::trace!(?outcome, "Dispatch tick");
                }
            }
        }

        tracing::info!("Dispatch loop stopped");
    }

    /// Performs one capture and fan-out.
    pub async fn tick(&mut self) -> TickOutcome {
        let frame = match self.source.capture().await {
            Ok(frame) => frame,
            Err(e) => {
                tracing::debug!(error = %e, "Capture failed, skipping tick");
                return TickOutcome::default();
            }
        };

        let messages = match self.serialize(&frame) {
            Ok(messages) => messages,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to serialize frame, skipping tick");
                return TickOutcome::default();
            }
        };

        let mut targets: Vec<(String, ConnectionHandle)> = Vec::new();
        self.registry.for_each_client(|client_id| {
            if let Some(target) = self.registry.next_target(client_id) {
                targets.push((client_id.to_string(), target));
            }
        });

        let mut outcome = TickOutcome {
            captured: true,
            targets: targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            return outcome;
        }

        let write_timeout = self.config.write_timeout;
        let messages = &messages;
        let writes = targets.into_iter().map(|(client_id, connection)| async move {
            let result =
                tokio::time::timeout(write_timeout, write_frame(&connection, messages)).await;
            match result {
                Ok(Ok(())) => true,
                Ok(Err(e)) => {
                    tracing::warn!(
                        client_id = %client_id,
                        connection_id = %connection.id(),
                        error = %e,
                        "Frame write failed"
                    );
                    false
                }
                Err(_) => {
                    tracing::warn!(
                        client_id = %client_id,
                        connection_id = %connection.id(),
                        timeout = ?write_timeout,
                        "Frame write timed out"
                    );
                    false
                }
            }
        });

        for delivered in join_all(writes).await {
            if delivered {
                outcome.delivered += 1;
            } else {
                outcome.failed += 1;
            }
        }
        outcome
    }

    fn serialize(&mut self, frame: &FrameUnit) -> protocol::Result<Vec<String>> {
        match self.config.frame_chunk_size {
            Some(chunk_size) => {
                let id = self.next_frame_id;
                self.next_frame_id = self.next_frame_id.wrapping_add(1);
                frame.to_chunked_messages(id, chunk_size)
            }
            None => Ok(vec![frame.to_message()?]),
        }
    }
}

async fn write_frame(connection: &ConnectionHandle, messages: &[String]) -> protocol::Result<()> {
    for message in messages {
        connection.send_text(message).await?;
    }
    Ok(())
}
