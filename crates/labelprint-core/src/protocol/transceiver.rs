//! Request/response exchange
//!
//! Sends one request frame and polls the link a bounded number of rounds for
//! the frame answering it.

use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, warn, Span};

use super::commands::{ERROR_RESPONSE, UNIMPLEMENTED_RESPONSE};
use super::{Packet, PacketCodec, ProtocolError, ReceiveBuffer, Transport, READ_CHUNK_SIZE};
use crate::config::TimingConfig;

/// Polling bounds of one exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransceiverConfig {
    /// Read rounds before giving up
    pub rounds: u32,
    /// Pause between rounds
    pub round_delay: Duration,
}

impl Default for TransceiverConfig {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for TransceiverConfig {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            rounds: timing.response_rounds.max(1),
            round_delay: timing.round_delay(),
        }
    }
}

/// Pairs request frames with response frames over a [`Transport`]
pub struct Transceiver {
    transport: Box<dyn Transport>,
    codec: PacketCodec,
    buffer: ReceiveBuffer,
    config: TransceiverConfig,
    cancel: Option<CancellationToken>,
    /// Set while an exchange is in flight; still set afterwards means the
    /// exchange was abandoned and stale bytes may be pending
    desynced: bool,
    span: Span,
}

impl Transceiver {
    /// Create a transceiver with the default checksum
    pub fn new(transport: Box<dyn Transport>, config: TransceiverConfig) -> Self {
        Self::with_codec(transport, config, PacketCodec::default())
    }

    /// Create a transceiver with a specific codec
    pub fn with_codec(
        transport: Box<dyn Transport>,
        config: TransceiverConfig,
        codec: PacketCodec,
    ) -> Self {
        let span = info_span!("transceiver", link = %transport.describe());
        Self {
            transport,
            codec,
            buffer: ReceiveBuffer::new(),
            config,
            cancel: None,
            desynced: false,
            span,
        }
    }

    /// Abort exchanges between polling rounds once `token` fires
    pub fn set_cancellation(&mut self, token: CancellationToken) {
        self.cancel = Some(token);
    }

    /// The underlying link
    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    /// The underlying link, mutably
    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Polling bounds
    pub fn config(&self) -> TransceiverConfig {
        self.config
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// Send `code` with `payload` and wait for the frame of type
    /// `code + response_offset`.
    pub fn request(
        &mut self,
        code: u8,
        payload: &[u8],
        response_offset: u8,
    ) -> Result<Packet, ProtocolError> {
        let span = self.span.clone();
        let _enter = span.enter();

        let expected = code.wrapping_add(response_offset);
        let frame = self.codec.encode(&Packet::new(code, payload))?;

        if self.is_cancelled() {
            return Err(ProtocolError::Cancelled { code });
        }
        if self.desynced {
            self.discard_pending();
        }

        debug!("send: {}", hex::encode(&frame));
        self.desynced = true;
        self.transport.write(&frame)?;

        let rounds = self.config.rounds;
        let mut response = None;
        for round in 1..=rounds {
            if self.is_cancelled() {
                self.discard_pending();
                return Err(ProtocolError::Cancelled { code });
            }

            for packet in self.receive()? {
                match packet.kind {
                    ERROR_RESPONSE => {
                        self.desynced = false;
                        return Err(ProtocolError::DeviceRejected { code });
                    }
                    UNIMPLEMENTED_RESPONSE => {
                        self.desynced = false;
                        return Err(ProtocolError::Unsupported { code });
                    }
                    kind if kind == expected => response = Some(packet),
                    kind => trace!("Ignoring unrelated frame {:#04x}", kind),
                }
            }

            if let Some(packet) = response {
                self.desynced = false;
                return Ok(packet);
            }

            if round < rounds {
                std::thread::sleep(self.config.round_delay);
            }
        }

        debug!(code, rounds, "No response");
        Err(ProtocolError::Timeout { code, rounds })
    }

    /// Send a frame that gets no response
    pub fn send(&mut self, code: u8, payload: &[u8]) -> Result<(), ProtocolError> {
        let frame = self.codec.encode(&Packet::new(code, payload))?;
        trace!(parent: &self.span, "send: {}", hex::encode(&frame));
        self.transport.write(&frame)?;
        Ok(())
    }

    /// Drop buffered bytes and unread device input so the next exchange
    /// starts on a frame boundary
    pub fn discard_pending(&mut self) {
        let dropped = self.buffer.clear();
        if dropped > 0 {
            debug!(parent: &self.span, dropped, "Discarded buffered bytes");
        }
        if let Err(e) = self.transport.clear_input() {
            warn!(parent: &self.span, "Failed to clear device input: {}", e);
        }
        self.desynced = false;
    }

    fn receive(&mut self) -> Result<Vec<Packet>, ProtocolError> {
        let bytes = self.transport.read(READ_CHUNK_SIZE)?;
        if !bytes.is_empty() {
            self.buffer.extend(&bytes);
        }
        let packets = self.codec.decode_all(&mut self.buffer);
        for packet in &packets {
            debug!(
                "recv: type {:#04x} payload {}",
                packet.kind,
                hex::encode(&packet.payload)
            );
        }
        Ok(packets)
    }
}
