//! # Protocol Engine
//!
//! Per-connection state machine tying the buffer layer to the wire: receive
//! side validation/decryption, send side framing/compression/encryption, and
//! the session key handshake.
//!
//! ## Session lifecycle
//! A `Protocol` is created when a client socket is accepted and a handler
//! variant (login/game/status) is selected; it dies with the connection. The
//! first message may carry an RSA-encrypted key block; once the handler
//! recovers the key and calls [`Protocol::enable_encryption`], every later
//! frame is XTEA-encrypted both ways.
//!
//! ## Threading
//! A connection's receive stream is processed in order by whoever owns the
//! socket, so per-session state has no intra-connection races. The session
//! mutex exists because the [`scheduler`](crate::scheduler) also reaches in
//! during batched flushes. Nothing in this module blocks on I/O: every
//! operation is a bounded-time transform, and socket writes go through the
//! [`Connection`] collaborator.

pub mod checksum;
pub mod rsa;
pub mod xtea;

use crate::core::message::{
    NetworkMessage, CHECKSUM_LENGTH, CIPHER_BLOCK_SIZE, HEADER_RESERVE,
    MAX_PROTOCOL_BODY_LENGTH, SIZE_LENGTH,
};
use crate::core::output::OutputMessage;
use crate::error::{ProtocolError, Result};
use crate::scheduler::OutputMessagePool;
use crate::utils::compression::StreamCompressor;
use crate::utils::metrics::global_metrics;
use bytes::Bytes;
use checksum::{adler32, ChecksumMode};
use rsa::{RsaDecryptor, RSA_BLOCK_SIZE};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, warn};
use xtea::Xtea;

/// Byte offset where the cipher region starts: everything after the size and
/// checksum fields (the padding-amount byte is encrypted).
const CRYPTO_REGION_START: usize = SIZE_LENGTH + CHECKSUM_LENGTH;

/// The transport collaborator owning the actual socket.
///
/// Implementations queue bytes for asynchronous writing; nothing here may
/// block.
pub trait Connection: Send + Sync {
    /// Queue a finished frame for transmission.
    fn deliver(&self, frame: Bytes);

    /// Tear the connection down.
    fn close(&self);

    /// Remote endpoint, for logging and ban bookkeeping.
    fn peer_addr(&self) -> SocketAddr;
}

/// The payload collaborator: one of a small closed set of variants
/// (login/game/status) selected at accept time.
///
/// The engine validates and decrypts; these hooks interpret. Implementations
/// get the owning [`Protocol`] back so they can enable encryption, queue
/// replies, or disconnect.
pub trait PacketHandler: Send {
    /// First message of the connection, after validation. This is where the
    /// RSA key block lives for variants that use one.
    fn on_recv_first_message(&mut self, protocol: &Protocol, msg: &mut NetworkMessage);

    /// Every subsequent validated message.
    fn parse_packet(&mut self, protocol: &Protocol, msg: &mut NetworkMessage);

    /// Optional challenge sent right after accept, before any client bytes.
    fn send_login_challenge(&mut self, _protocol: &Protocol) {}
}

struct SessionState {
    key: [u32; 4],
    encryption_enabled: bool,
    checksum_mode: ChecksumMode,
    outbound_sequence: u32,
    inbound_sequence: u32,
    compressor: Option<StreamCompressor>,
    raw_messages: bool,
    received_first: bool,
    output_buffer: Option<OutputMessage>,
}

/// Per-connection protocol engine.
pub struct Protocol {
    connection: Weak<dyn Connection>,
    pool: Arc<OutputMessagePool>,
    handler: Mutex<Box<dyn PacketHandler>>,
    state: Mutex<SessionState>,
    autosend_registered: AtomicBool,
}

impl Protocol {
    pub fn new(
        connection: Weak<dyn Connection>,
        pool: Arc<OutputMessagePool>,
        handler: Box<dyn PacketHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            connection,
            pool,
            handler: Mutex::new(handler),
            state: Mutex::new(SessionState {
                key: [0; 4],
                encryption_enabled: false,
                checksum_mode: ChecksumMode::None,
                outbound_sequence: 0,
                inbound_sequence: 0,
                compressor: None,
                raw_messages: false,
                received_first: false,
                output_buffer: None,
            }),
            autosend_registered: AtomicBool::new(false),
        })
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// True once the underlying connection is gone; every operation on an
    /// expired protocol is a no-op or an error, never a dangling dereference.
    pub fn is_connection_expired(&self) -> bool {
        self.connection.upgrade().is_none()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.connection.upgrade().map(|c| c.peer_addr())
    }

    /// Set the XTEA session key recovered from the key exchange.
    pub fn set_xtea_key(&self, key: [u32; 4]) {
        self.state().key = key;
    }

    /// Switch the session cipher on. Intended for the handler of the first
    /// message, after [`Protocol::rsa_decrypt`] recovered the key.
    pub fn enable_encryption(&self) {
        self.state().encryption_enabled = true;
        debug!("session encryption enabled");
    }

    /// Select the checksum policing mode. Fixed for the lifetime of the
    /// connection once traffic flows; switching later desynchronizes the
    /// sequence counters.
    pub fn set_checksum_mode(&self, mode: ChecksumMode) {
        self.state().checksum_mode = mode;
    }

    /// Attach a persistent deflate stream to the send path.
    pub fn enable_compression(&self, level: u32) {
        self.state().compressor = Some(StreamCompressor::new(level));
        debug!(level, "session compression enabled");
    }

    /// Raw mode bypasses framing entirely on send (status variant).
    pub fn set_raw_messages(&self, raw: bool) {
        self.state().raw_messages = raw;
    }

    pub(crate) fn mark_autosend(&self, registered: bool) {
        self.autosend_registered.store(registered, Ordering::Release);
    }

    pub(crate) fn is_autosend(&self) -> bool {
        self.autosend_registered.load(Ordering::Acquire)
    }

    /// Receive-side entry point. `msg` holds a complete frame as staged by
    /// the connection layer ([`NetworkMessage::from_wire`]).
    ///
    /// Decrypts, re-derives and cross-checks the length, polices the
    /// checksum, then hands the payload to the handler. A rejected message
    /// is dropped here; whether to also disconnect the peer is the caller's
    /// decision.
    pub fn on_recv_message(&self, msg: &mut NetworkMessage) -> Result<()> {
        if self.is_connection_expired() {
            global_metrics().expired_drop();
            return Err(ProtocolError::ConnectionExpired);
        }

        let total = msg.length();
        let declared = msg.decode_header() as usize;
        let first;
        {
            let mut state = self.state();

            if total < HEADER_RESERVE {
                global_metrics().framing_failure();
                return Err(ProtocolError::FramingMismatch {
                    declared,
                    actual: total,
                });
            }
            let region_len = total - CRYPTO_REGION_START;

            if state.encryption_enabled {
                if region_len % CIPHER_BLOCK_SIZE != 0 {
                    global_metrics().framing_failure();
                    return Err(ProtocolError::Misaligned(region_len));
                }
                let cipher = Xtea::new(state.key);
                let region =
                    &mut msg.buffer_mut()[CRYPTO_REGION_START..CRYPTO_REGION_START + region_len];
                cipher.decrypt(region);
            }

            // The outer size field counts cipher blocks; it must agree with
            // what was actually read off the socket.
            if declared * CIPHER_BLOCK_SIZE != region_len {
                global_metrics().framing_failure();
                warn!(
                    declared_blocks = declared,
                    region_len, "frame length mismatch"
                );
                return Err(ProtocolError::FramingMismatch {
                    declared: declared * CIPHER_BLOCK_SIZE,
                    actual: region_len,
                });
            }

            let padding = msg.padding_amount() as usize;
            if padding >= CIPHER_BLOCK_SIZE || padding + 1 > region_len {
                global_metrics().framing_failure();
                warn!(padding, region_len, "invalid padding amount");
                return Err(ProtocolError::FramingMismatch {
                    declared: padding + 1,
                    actual: region_len,
                });
            }
            let payload_len = region_len - 1 - padding;

            match state.checksum_mode {
                ChecksumMode::None => {}
                ChecksumMode::RollingSum => {
                    let header = msg.header_checksum();
                    let computed = adler32(
                        &msg.buffer()[CRYPTO_REGION_START..CRYPTO_REGION_START + region_len],
                    );
                    if header != computed {
                        global_metrics().checksum_failure();
                        warn!(header, computed, "checksum mismatch, dropping frame");
                        return Err(ProtocolError::ChecksumMismatch { header, computed });
                    }
                }
                ChecksumMode::Sequence => {
                    let received = msg.header_checksum();
                    let expected = state.inbound_sequence.wrapping_add(1);
                    if received != expected {
                        global_metrics().checksum_failure();
                        warn!(received, expected, "sequence violation, dropping frame");
                        return Err(ProtocolError::SequenceViolation { expected, received });
                    }
                    state.inbound_sequence = received;
                }
            }

            msg.set_length(HEADER_RESERVE + payload_len);
            msg.set_position(HEADER_RESERVE);

            first = !state.received_first;
            state.received_first = true;
        }

        global_metrics().message_received(total as u64);

        let mut handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if first {
            handler.on_recv_first_message(self, msg);
        } else {
            handler.parse_packet(self, msg);
        }
        Ok(())
    }

    /// Send-side framing: compress, pad, attach the crypto header stack,
    /// encrypt. Skipped entirely in raw mode.
    fn on_send_message(&self, state: &mut SessionState, msg: &mut OutputMessage) {
        if state.raw_messages {
            return;
        }

        if let Some(compressor) = state.compressor.as_mut() {
            match compressor.compress(msg.body()) {
                Ok(compressed) => {
                    let before = msg.length();
                    msg.set_length(0);
                    msg.set_position(HEADER_RESERVE);
                    msg.add_bytes(compressed);
                    debug!(before, after = msg.length(), "compressed outgoing message");
                }
                Err(e) => {
                    // Never send uncompressed on a stream the peer will run
                    // through its inflate context; an empty payload is the
                    // lesser failure.
                    warn!(error = %e, "compression failed, dropping payload");
                    msg.set_length(0);
                    msg.set_position(HEADER_RESERVE);
                }
            }
        }

        msg.write_padding_amount();

        let checksum = match state.checksum_mode {
            ChecksumMode::None => 0,
            ChecksumMode::RollingSum => adler32(msg.output_buffer()),
            ChecksumMode::Sequence => {
                state.outbound_sequence = state.outbound_sequence.wrapping_add(1);
                state.outbound_sequence
            }
        };
        msg.add_crypto_header(true, checksum);

        if state.encryption_enabled {
            let cipher = Xtea::new(state.key);
            let wire = msg.output_buffer_mut();
            cipher.encrypt(&mut wire[CRYPTO_REGION_START..]);
        }
    }

    fn send_locked(&self, state: &mut SessionState, mut msg: OutputMessage) {
        if let Some(connection) = self.connection.upgrade() {
            self.on_send_message(state, &mut msg);
            let frame = Bytes::copy_from_slice(msg.output_buffer());
            global_metrics().message_sent(frame.len() as u64);
            connection.deliver(frame);
        } else {
            global_metrics().expired_drop();
        }
        self.pool.recycle(msg);
    }

    /// Frame and transmit one message immediately, bypassing batching.
    pub fn send(&self, msg: OutputMessage) {
        let mut state = self.state();
        self.send_locked(&mut state, msg);
    }

    /// Hand the caller the connection's pending output buffer, flushing it
    /// first when `size` more bytes would overflow the batching threshold.
    /// This is how payload-building code appends to the current batch.
    pub fn with_output_buffer<F>(&self, size: usize, f: F)
    where
        F: FnOnce(&mut OutputMessage),
    {
        let mut state = self.state();
        let full = state
            .output_buffer
            .as_ref()
            .is_some_and(|b| b.length() + size > MAX_PROTOCOL_BODY_LENGTH);
        if full {
            if let Some(pending) = state.output_buffer.take() {
                self.send_locked(&mut state, pending);
            }
        }
        let buffer = state
            .output_buffer
            .get_or_insert_with(|| self.pool.get_output_message());
        f(buffer);
    }

    /// Append a pre-built message to the connection's current batch.
    pub fn queue_message(&self, msg: &NetworkMessage) {
        self.with_output_buffer(msg.length(), |out| out.append(msg));
    }

    /// Flush the pending batch, if any. Called by the scheduler's
    /// [`send_all`](crate::scheduler::OutputMessagePool::send_all) pass and
    /// on disconnect.
    pub fn flush_pending(&self) {
        let mut state = self.state();
        if let Some(pending) = state.output_buffer.take() {
            if pending.length() > 0 {
                self.send_locked(&mut state, pending);
            } else {
                self.pool.recycle(pending);
            }
        }
    }

    /// True when a batch with payload is waiting for the next flush pass.
    pub fn has_pending_output(&self) -> bool {
        self.state()
            .output_buffer
            .as_ref()
            .is_some_and(|b| b.length() > 0)
    }

    /// Ask the connection to tear down. The protocol stays usable as a
    /// no-op shell until the last reference drops.
    pub fn disconnect(&self) {
        if let Some(connection) = self.connection.upgrade() {
            connection.close();
        }
    }

    /// Run the handler's post-accept hook.
    pub fn send_login_challenge(&self) {
        let mut handler = self
            .handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        handler.send_login_challenge(self);
    }

    /// Decrypt the 128-byte RSA key block at the message cursor in place.
    ///
    /// Only ever invoked on the first message of a connection, before the
    /// session cipher is enabled. Returns false when too few bytes remain or
    /// the mandatory zero lead byte is absent; the cursor ends just past the
    /// lead byte on success.
    pub fn rsa_decrypt(rsa: &RsaDecryptor, msg: &mut NetworkMessage) -> bool {
        if !msg.can_read(RSA_BLOCK_SIZE) {
            warn!(
                remaining = msg.length().saturating_sub(msg.position()),
                "message too short for RSA block"
            );
            return false;
        }
        let pos = msg.position();
        let mut block = [0u8; RSA_BLOCK_SIZE];
        block.copy_from_slice(&msg.buffer()[pos..pos + RSA_BLOCK_SIZE]);
        rsa.decrypt_block(&mut block);
        msg.buffer_mut()[pos..pos + RSA_BLOCK_SIZE].copy_from_slice(&block);
        msg.get_byte() == 0
    }
}

impl std::fmt::Debug for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protocol")
            .field("expired", &self.is_connection_expired())
            .field("autosend", &self.is_autosend())
            .finish_non_exhaustive()
    }
}
