//! End-to-end protocol engine tests: framing, checksum policing, the XTEA
//! session cipher, the RSA key handshake, batching and the flush scheduler.

#![allow(clippy::unwrap_used)]

use bytes::Bytes;
use num_bigint::BigUint;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use worldgate::config::PoolConfig;
use worldgate::protocol::checksum::adler32;
use worldgate::protocol::rsa::{RsaDecryptor, RSA_BLOCK_SIZE};
use worldgate::protocol::xtea::Xtea;
use worldgate::{
    ChecksumMode, Connection, NetworkMessage, OutputMessage, OutputMessagePool, PacketHandler,
    Protocol, ProtocolError,
};

#[derive(Default)]
struct TestConnection {
    delivered: Mutex<Vec<Bytes>>,
}

impl TestConnection {
    fn frames(&self) -> Vec<Bytes> {
        self.delivered.lock().unwrap().clone()
    }
}

impl Connection for TestConnection {
    fn deliver(&self, frame: Bytes) {
        self.delivered.lock().unwrap().push(frame);
    }

    fn close(&self) {}

    fn peer_addr(&self) -> SocketAddr {
        "127.0.0.1:7171".parse().unwrap()
    }
}

/// Records the undecoded remainder of every dispatched message.
struct RecordingHandler {
    first: Arc<Mutex<Vec<Vec<u8>>>>,
    parsed: Arc<Mutex<Vec<Vec<u8>>>>,
}

fn remaining(msg: &NetworkMessage) -> Vec<u8> {
    msg.buffer()[msg.position()..msg.length()].to_vec()
}

impl PacketHandler for RecordingHandler {
    fn on_recv_first_message(&mut self, _protocol: &Protocol, msg: &mut NetworkMessage) {
        self.first.lock().unwrap().push(remaining(msg));
    }

    fn parse_packet(&mut self, _protocol: &Protocol, msg: &mut NetworkMessage) {
        self.parsed.lock().unwrap().push(remaining(msg));
    }
}

struct Harness {
    connection: Arc<TestConnection>,
    pool: Arc<OutputMessagePool>,
    protocol: Arc<Protocol>,
    first: Arc<Mutex<Vec<Vec<u8>>>>,
    parsed: Arc<Mutex<Vec<Vec<u8>>>>,
}

fn harness(mode: ChecksumMode) -> Harness {
    let connection = Arc::new(TestConnection::default());
    let pool = OutputMessagePool::new(&PoolConfig::default());
    let first = Arc::new(Mutex::new(Vec::new()));
    let parsed = Arc::new(Mutex::new(Vec::new()));
    let handler = Box::new(RecordingHandler {
        first: Arc::clone(&first),
        parsed: Arc::clone(&parsed),
    });
    let as_dyn: Arc<dyn Connection> = connection.clone();
    let protocol = Protocol::new(Arc::downgrade(&as_dyn), Arc::clone(&pool), handler);
    protocol.set_checksum_mode(mode);
    Harness {
        connection,
        pool,
        protocol,
        first,
        parsed,
    }
}

enum FrameChecksum {
    Zero,
    Rolling,
    Sequence(u32),
}

/// Build a client-side wire frame the same way the send path does.
fn client_frame(payload: &[u8], checksum: FrameChecksum, key: Option<[u32; 4]>) -> Vec<u8> {
    let mut out = OutputMessage::new();
    out.add_bytes(payload);
    out.write_padding_amount();
    let value = match checksum {
        FrameChecksum::Zero => 0,
        FrameChecksum::Rolling => adler32(out.output_buffer()),
        FrameChecksum::Sequence(n) => n,
    };
    out.add_crypto_header(true, value);
    if let Some(key) = key {
        Xtea::new(key).encrypt(&mut out.output_buffer_mut()[6..]);
    }
    out.output_buffer().to_vec()
}

fn receive(protocol: &Protocol, frame: &[u8]) -> worldgate::Result<()> {
    let mut msg = NetworkMessage::from_wire(frame)?;
    protocol.on_recv_message(&mut msg)
}

#[test]
fn test_plain_frame_dispatch() {
    let h = harness(ChecksumMode::None);
    let one = client_frame(&[0x0A, 1, 2, 3], FrameChecksum::Zero, None);
    let two = client_frame(&[0x0B, 9, 9], FrameChecksum::Zero, None);

    receive(&h.protocol, &one).unwrap();
    receive(&h.protocol, &two).unwrap();

    // First message goes to the handshake hook, the rest to parse_packet.
    assert_eq!(h.first.lock().unwrap().as_slice(), &[vec![0x0A, 1, 2, 3]]);
    assert_eq!(h.parsed.lock().unwrap().as_slice(), &[vec![0x0B, 9, 9]]);
}

#[test]
fn test_declared_size_must_match() {
    let h = harness(ChecksumMode::None);
    let mut frame = client_frame(&[1, 2, 3, 4], FrameChecksum::Zero, None);
    frame[0] = frame[0].wrapping_add(1);
    assert!(matches!(
        receive(&h.protocol, &frame),
        Err(ProtocolError::FramingMismatch { .. })
    ));
}

#[test]
fn test_sequence_policing() {
    let h = harness(ChecksumMode::Sequence);

    receive(
        &h.protocol,
        &client_frame(b"one", FrameChecksum::Sequence(1), None),
    )
    .unwrap();
    receive(
        &h.protocol,
        &client_frame(b"two", FrameChecksum::Sequence(2), None),
    )
    .unwrap();

    // Replay of the last counter value.
    let replay = receive(
        &h.protocol,
        &client_frame(b"two again", FrameChecksum::Sequence(2), None),
    );
    assert!(matches!(
        replay,
        Err(ProtocolError::SequenceViolation {
            expected: 3,
            received: 2
        })
    ));

    // A gap is rejected just like a replay.
    let gap = receive(
        &h.protocol,
        &client_frame(b"five", FrameChecksum::Sequence(5), None),
    );
    assert!(matches!(gap, Err(ProtocolError::SequenceViolation { .. })));

    // Rejected frames do not advance the counter.
    receive(
        &h.protocol,
        &client_frame(b"three", FrameChecksum::Sequence(3), None),
    )
    .unwrap();
    assert_eq!(h.parsed.lock().unwrap().len(), 2);
}

#[test]
fn test_rolling_sum_rejects_every_bit_flip() {
    let h = harness(ChecksumMode::RollingSum);
    let valid = client_frame(b"integrity", FrameChecksum::Rolling, None);
    receive(&h.protocol, &valid).unwrap();

    // Any single-bit corruption anywhere in the frame must be rejected:
    // in the size field as a framing mismatch, elsewhere as a checksum
    // mismatch (or an invalid padding amount).
    for i in 0..valid.len() {
        for bit in 0..8 {
            let mut corrupted = valid.clone();
            corrupted[i] ^= 1 << bit;
            assert!(
                receive(&h.protocol, &corrupted).is_err(),
                "byte {i} bit {bit} accepted"
            );
        }
    }
    assert_eq!(h.first.lock().unwrap().len(), 1);
    assert_eq!(h.parsed.lock().unwrap().len(), 0);
}

#[test]
fn test_xtea_session_traffic() {
    let key = [0xDEAD_BEEF, 0x0BAD_F00D, 0x1234_5678, 0x9ABC_DEF0];
    let h = harness(ChecksumMode::RollingSum);
    h.protocol.set_xtea_key(key);
    h.protocol.enable_encryption();

    let payload = b"encrypted game payload";
    let frame = client_frame(payload, FrameChecksum::Rolling, Some(key));
    // Ciphertext on the wire, plaintext after dispatch.
    assert_ne!(&frame[7..7 + payload.len()], payload.as_slice());
    receive(&h.protocol, &frame).unwrap();
    assert_eq!(h.first.lock().unwrap().as_slice(), &[payload.to_vec()]);

    // A frame enciphered under the wrong key decrypts to garbage and fails
    // the rolling sum.
    let wrong_key = [0, 0, 0, 1];
    let frame = client_frame(payload, FrameChecksum::Rolling, Some(wrong_key));
    assert!(receive(&h.protocol, &frame).is_err());

    // Replies from the engine decrypt on the client side.
    let mut reply = OutputMessage::new();
    reply.add_bytes(b"server says hi");
    h.protocol.send(reply);

    let frames = h.connection.frames();
    assert_eq!(frames.len(), 1);
    let mut wire = frames[0].to_vec();
    Xtea::new(key).decrypt(&mut wire[6..]);
    let pad = wire[6] as usize;
    assert!(pad < 8);
    assert_eq!(&wire[7..wire.len() - pad], b"server says hi");
}

#[test]
fn test_misaligned_region_rejected() {
    let h = harness(ChecksumMode::None);
    h.protocol.set_xtea_key([1, 2, 3, 4]);
    h.protocol.enable_encryption();

    // 7-byte cipher region: not a block multiple.
    let mut frame = vec![0u8; 13];
    frame[0] = 1;
    assert!(matches!(
        receive(&h.protocol, &frame),
        Err(ProtocolError::Misaligned(7))
    ));
}

/// A login-style handler: RSA-decrypts the key block of the first message,
/// installs the session key and switches the cipher on.
struct LoginHandler {
    rsa: RsaDecryptor,
    keys_seen: Arc<Mutex<Vec<[u32; 4]>>>,
    parsed: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl PacketHandler for LoginHandler {
    fn on_recv_first_message(&mut self, protocol: &Protocol, msg: &mut NetworkMessage) {
        if !Protocol::rsa_decrypt(&self.rsa, msg) {
            protocol.disconnect();
            return;
        }
        let key = [
            msg.get::<u32>(),
            msg.get::<u32>(),
            msg.get::<u32>(),
            msg.get::<u32>(),
        ];
        self.keys_seen.lock().unwrap().push(key);
        protocol.set_xtea_key(key);
        protocol.enable_encryption();
    }

    fn parse_packet(&mut self, _protocol: &Protocol, msg: &mut NetworkMessage) {
        self.parsed.lock().unwrap().push(remaining(msg));
    }
}

// d = 1 with an oversized modulus makes RSA the identity transform, so the
// handshake plumbing can be tested without a real key pair.
fn identity_rsa() -> RsaDecryptor {
    RsaDecryptor::new(BigUint::from(1u8) << 1023, BigUint::from(1u8))
}

#[test]
fn test_rsa_login_handshake() {
    let connection = Arc::new(TestConnection::default());
    let pool = OutputMessagePool::new(&PoolConfig::default());
    let keys_seen = Arc::new(Mutex::new(Vec::new()));
    let parsed = Arc::new(Mutex::new(Vec::new()));
    let handler = Box::new(LoginHandler {
        rsa: identity_rsa(),
        keys_seen: Arc::clone(&keys_seen),
        parsed: Arc::clone(&parsed),
    });
    let as_dyn: Arc<dyn Connection> = connection.clone();
    let protocol = Protocol::new(Arc::downgrade(&as_dyn), pool, handler);
    protocol.set_checksum_mode(ChecksumMode::Sequence);

    // Client hello: a 128-byte key block whose plaintext starts with the
    // mandatory zero byte, followed by the four session key words.
    let session_key = [0x1111_1111u32, 0x2222_2222, 0x3333_3333, 0x4444_4444];
    let mut block = [0u8; RSA_BLOCK_SIZE];
    for (i, word) in session_key.iter().enumerate() {
        block[1 + i * 4..5 + i * 4].copy_from_slice(&word.to_le_bytes());
    }
    let frame = client_frame(&block, FrameChecksum::Sequence(1), None);
    receive(&protocol, &frame).unwrap();
    assert_eq!(keys_seen.lock().unwrap().as_slice(), &[session_key]);

    // Everything after the handshake is encrypted.
    let frame = client_frame(b"in session", FrameChecksum::Sequence(2), Some(session_key));
    receive(&protocol, &frame).unwrap();
    assert_eq!(parsed.lock().unwrap().as_slice(), &[b"in session".to_vec()]);

    // A frame whose outer size disagrees with the encrypted region is
    // rejected before reaching the handler.
    let mut frame = client_frame(b"tampered", FrameChecksum::Sequence(3), Some(session_key));
    frame[0] = frame[0].wrapping_add(1);
    assert!(matches!(
        receive(&protocol, &frame),
        Err(ProtocolError::FramingMismatch { .. })
    ));
    assert_eq!(parsed.lock().unwrap().len(), 1);
}

#[test]
fn test_rsa_decrypt_requires_full_block() {
    let rsa = identity_rsa();
    let mut msg = NetworkMessage::new();
    msg.add_bytes(&[0u8; 40]);
    msg.set_length(worldgate::core::message::HEADER_RESERVE + 40);
    msg.set_position(worldgate::core::message::HEADER_RESERVE);
    assert!(!Protocol::rsa_decrypt(&rsa, &mut msg));
}

#[test]
fn test_batching_concatenates_messages() {
    let h = harness(ChecksumMode::None);
    h.pool.add_protocol_to_autosend(&h.protocol);

    let chunks: Vec<Vec<u8>> = vec![vec![0xA1; 10], vec![0xB2; 20], vec![0xC3; 30]];
    for chunk in &chunks {
        let mut msg = NetworkMessage::new();
        msg.add_bytes(chunk);
        h.protocol.queue_message(&msg);
    }
    assert!(h.protocol.has_pending_output());
    assert!(h.connection.frames().is_empty());

    h.pool.send_all();

    let frames = h.connection.frames();
    assert_eq!(frames.len(), 1, "batch must flush as a single frame");
    let wire = &frames[0];
    let pad = wire[6] as usize;
    let expected: Vec<u8> = chunks.concat();
    assert_eq!(&wire[7..wire.len() - pad], expected.as_slice());
    assert!(!h.protocol.has_pending_output());
}

#[test]
fn test_batch_overflow_flushes_inline() {
    use worldgate::core::message::MAX_PROTOCOL_BODY_LENGTH;

    let h = harness(ChecksumMode::None);
    h.protocol
        .with_output_buffer(MAX_PROTOCOL_BODY_LENGTH - 4, |out| {
            out.add_padding_bytes(MAX_PROTOCOL_BODY_LENGTH - 4);
        });
    assert!(h.connection.frames().is_empty());

    // This no longer fits; the pending batch goes out first.
    h.protocol.with_output_buffer(16, |out| {
        out.add_bytes(&[7u8; 16]);
    });
    assert_eq!(h.connection.frames().len(), 1);

    h.protocol.flush_pending();
    assert_eq!(h.connection.frames().len(), 2);
    let tail = &h.connection.frames()[1];
    let pad = tail[6] as usize;
    assert_eq!(&tail[7..tail.len() - pad], &[7u8; 16]);
}

#[test]
fn test_expired_connection_is_inert() {
    let h = harness(ChecksumMode::None);
    let protocol = Arc::clone(&h.protocol);
    drop(h);

    assert!(protocol.is_connection_expired());
    assert!(protocol.peer_addr().is_none());

    let frame = client_frame(b"late", FrameChecksum::Zero, None);
    let mut msg = NetworkMessage::from_wire(&frame).unwrap();
    assert!(matches!(
        protocol.on_recv_message(&mut msg),
        Err(ProtocolError::ConnectionExpired)
    ));

    // Sends are absorbed without panicking.
    let mut out = OutputMessage::new();
    out.add_bytes(b"into the void");
    protocol.send(out);
    protocol.flush_pending();
}

#[test]
fn test_compression_stream_spans_messages() {
    use worldgate::utils::compression::StreamDecompressor;

    let h = harness(ChecksumMode::None);
    h.protocol.enable_compression(6);

    let payload = vec![0x5Au8; 600];
    for _ in 0..2 {
        let mut out = OutputMessage::new();
        out.add_bytes(&payload);
        h.protocol.send(out);
    }

    let frames = h.connection.frames();
    assert_eq!(frames.len(), 2);

    let mut decomp = StreamDecompressor::new();
    let mut sizes = Vec::new();
    for frame in &frames {
        let pad = frame[6] as usize;
        let deflated = &frame[7..frame.len() - pad];
        sizes.push(deflated.len());
        assert_eq!(decomp.decompress(deflated).unwrap(), payload.as_slice());
    }
    // The second message leans on the dictionary built by the first.
    assert!(sizes[1] <= sizes[0]);
    assert!(sizes[0] < payload.len());
}

#[test]
fn test_raw_messages_bypass_framing() {
    let h = harness(ChecksumMode::RollingSum);
    h.protocol.set_raw_messages(true);

    let mut out = OutputMessage::new();
    out.add_bytes(b"HTTP-ish status blob");
    h.protocol.send(out);

    let frames = h.connection.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].as_ref(), b"HTTP-ish status blob");
}

#[test]
fn test_autosend_deregistration() {
    let h = harness(ChecksumMode::None);
    h.pool.add_protocol_to_autosend(&h.protocol);
    h.pool.remove_protocol_from_autosend(&h.protocol);

    let mut msg = NetworkMessage::new();
    msg.add_bytes(b"stuck");
    h.protocol.queue_message(&msg);

    h.pool.send_all();
    assert!(h.connection.frames().is_empty());
    assert!(h.protocol.has_pending_output());
}

#[tokio::test]
async fn test_schedule_send_all_coalesces() {
    let h = harness(ChecksumMode::None);
    h.pool.add_protocol_to_autosend(&h.protocol);

    for i in 0..5u8 {
        let mut msg = NetworkMessage::new();
        msg.add_bytes(&[i; 4]);
        h.protocol.queue_message(&msg);
        h.pool.schedule_send_all();
    }

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(
        h.connection.frames().len(),
        1,
        "burst must flush as one frame"
    );
}
