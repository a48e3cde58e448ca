//! Wire framing: `[u32 big-endian length][encrypted body]`.
//!
//! The body is the JSON form of a [`Packet`] encrypted with AES-256-CBC and
//! PKCS#7 padding under a key and IV compiled into every peer.
//!
//! **Known weakness:** the key material is a pinned protocol constant, not a
//! secret. Anyone holding this source can read and forge traffic. It only
//! keeps casual observers out. Changing it breaks interoperability with every
//! deployed peer.

use aes::Aes256;
use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::error::OverlayError;
use crate::packet::Packet;

type Aes256CbcEnc = cbc::Encryptor<Aes256>;
type Aes256CbcDec = cbc::Decryptor<Aes256>;

/// Length prefix size.
pub const HEADER_LEN: usize = 4;

/// Default upper bound on a single frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const WIRE_KEY: [u8; 32] = [
    0x48, 0x69, 0x76, 0x65, 0x4f, 0x76, 0x65, 0x72, 0x6c, 0x61, 0x79, 0x2d, 0x53, 0x68, 0x61, 0x72,
    0x65, 0x64, 0x2d, 0x4b, 0x65, 0x79, 0x2d, 0x76, 0x31, 0x2e, 0x30, 0x21, 0x9c, 0x3e, 0x51, 0xa7,
];

const WIRE_IV: [u8; 16] = [
    0x1f, 0x8b, 0x42, 0x6d, 0xe0, 0x37, 0x95, 0x0c, 0xa4, 0x5b, 0x72, 0xc9, 0x13, 0xfe, 0x68, 0x2d,
];

/// Encrypting packet serializer shared by all sessions of a node.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    key: [u8; 32],
    iv: [u8; 16],
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            key: WIRE_KEY,
            iv: WIRE_IV,
            max_frame_size,
        }
    }

    /// A codec with different key material. Peers using it cannot talk to
    /// peers using the pinned key.
    pub fn with_key(key: [u8; 32], iv: [u8; 16], max_frame_size: usize) -> Self {
        Self {
            key,
            iv,
            max_frame_size,
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Serialize and encrypt a packet (no length prefix).
    pub fn encode_body(&self, packet: &Packet) -> Result<Vec<u8>, OverlayError> {
        let plain = serde_json::to_vec(packet)?;
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| OverlayError::Crypto(format!("Cipher init failed: {e}")))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(&plain))
    }

    /// Decrypt and deserialize a frame body.
    pub fn decode_body(&self, body: &[u8]) -> Result<Packet, OverlayError> {
        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| OverlayError::Crypto(format!("Cipher init failed: {e}")))?;
        let plain = cipher
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|e| OverlayError::Crypto(format!("Decryption failed: {e}")))?;
        Ok(serde_json::from_slice(&plain)?)
    }

    /// Full wire frame: length prefix followed by the encrypted body.
    pub fn encode_frame(&self, packet: &Packet) -> Result<Vec<u8>, OverlayError> {
        let body = self.encode_body(packet)?;
        if body.len() > self.max_frame_size {
            return Err(OverlayError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_size,
            });
        }
        let len = u32::try_from(body.len()).map_err(|_| OverlayError::FrameTooLarge {
            len: body.len(),
            max: self.max_frame_size,
        })?;
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.extend_from_slice(&len.to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

/// Reassembly state of a [`FrameReader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    AwaitingHeader,
    AwaitingBody { len: usize },
}

/// Incremental frame reassembler for one inbound byte stream.
///
/// Bytes arrive in arbitrary chunks: a chunk may hold part of a header, a
/// frame split across reads, or several coalesced frames.
#[derive(Debug)]
pub struct FrameReader {
    codec: FrameCodec,
    state: ReadState,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            state: ReadState::AwaitingHeader,
            buf: Vec::new(),
        }
    }

    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Bytes held but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Feed received bytes; returns every packet completed by them.
    ///
    /// An error leaves the reader unusable; the stream must be dropped.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Packet>, OverlayError> {
        self.buf.extend_from_slice(bytes);
        let mut packets = Vec::new();
        loop {
            match self.state {
                ReadState::AwaitingHeader => {
                    if self.buf.len() < HEADER_LEN {
                        break;
                    }
                    let mut header = [0u8; HEADER_LEN];
                    header.copy_from_slice(&self.buf[..HEADER_LEN]);
                    let len = u32::from_be_bytes(header) as usize;
                    if len == 0 {
                        return Err(OverlayError::EmptyFrame);
                    }
                    if len > self.codec.max_frame_size() {
                        return Err(OverlayError::FrameTooLarge {
                            len,
                            max: self.codec.max_frame_size(),
                        });
                    }
                    self.buf.drain(..HEADER_LEN);
                    self.state = ReadState::AwaitingBody { len };
                }
                ReadState::AwaitingBody { len } => {
                    if self.buf.len() < len {
                        break;
                    }
                    let body: Vec<u8> = self.buf.drain(..len).collect();
                    self.state = ReadState::AwaitingHeader;
                    packets.push(self.codec.decode_body(&body)?);
                }
            }
        }
        Ok(packets)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBody;
    use crate::testing::hop;

    fn sample(payload: &str) -> Packet {
        let mut p = Packet::data("hive-x", "text/plain", payload);
        p.stamp(hop("peer-a"));
        p
    }

    #[test]
    fn test_encode_decode_inverse() {
        let codec = FrameCodec::default();
        let packet = sample("hello");
        let body = codec.encode_body(&packet).unwrap();
        assert_eq!(body.len() % 16, 0);
        assert!(!body.windows(5).any(|w| w == b"hello"));
        assert_eq!(codec.decode_body(&body).unwrap(), packet);
    }

    #[test]
    fn test_frame_header_is_big_endian_length() {
        let codec = FrameCodec::default();
        let frame = codec.encode_frame(&sample("x")).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - HEADER_LEN);
    }

    #[test]
    fn test_reader_handles_byte_at_a_time() {
        let codec = FrameCodec::default();
        let packet = sample("split across many reads");
        let frame = codec.encode_frame(&packet).unwrap();

        let mut reader = FrameReader::new(codec);
        let mut out = Vec::new();
        for (i, byte) in frame.iter().enumerate() {
            out.extend(reader.push(&[*byte]).unwrap());
            if i == HEADER_LEN - 1 {
                assert!(matches!(reader.state(), ReadState::AwaitingBody { .. }));
            }
        }
        assert_eq!(out, vec![packet]);
        assert_eq!(reader.state(), ReadState::AwaitingHeader);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_handles_coalesced_frames_and_leftover() {
        let codec = FrameCodec::default();
        let a = sample("first");
        let b = sample("second");
        let c = sample("third");

        let mut bytes = codec.encode_frame(&a).unwrap();
        bytes.extend(codec.encode_frame(&b).unwrap());
        let third = codec.encode_frame(&c).unwrap();
        bytes.extend_from_slice(&third[..7]);

        let mut reader = FrameReader::new(codec);
        let out = reader.push(&bytes).unwrap();
        assert_eq!(out, vec![a, b]);
        assert!(matches!(reader.state(), ReadState::AwaitingBody { .. }));

        let out = reader.push(&third[7..]).unwrap();
        assert_eq!(out, vec![c]);
    }

    #[test]
    fn test_reader_rejects_oversized_frame() {
        let mut reader = FrameReader::new(FrameCodec::new(64));
        let err = reader.push(&1000u32.to_be_bytes()).unwrap_err();
        assert!(matches!(err, OverlayError::FrameTooLarge { len: 1000, max: 64 }));
    }

    #[test]
    fn test_reader_rejects_empty_frame() {
        let mut reader = FrameReader::new(FrameCodec::default());
        assert!(matches!(
            reader.push(&[0, 0, 0, 0]),
            Err(OverlayError::EmptyFrame)
        ));
    }

    #[test]
    fn test_encoder_rejects_oversized_packet() {
        let codec = FrameCodec::new(32);
        let err = codec.encode_frame(&sample(&"y".repeat(256))).unwrap_err();
        assert!(matches!(err, OverlayError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_wrong_key_fails_to_decode() {
        let ours = FrameCodec::default();
        let theirs = FrameCodec::with_key([7u8; 32], [9u8; 16], DEFAULT_MAX_FRAME_SIZE);
        let body = theirs.encode_body(&sample("secret")).unwrap();
        assert!(ours.decode_body(&body).is_err());
    }

    #[test]
    fn test_corrupt_body_fails_to_decode() {
        let codec = FrameCodec::default();
        assert!(codec.decode_body(&[1, 2, 3]).is_err());
        let mut body = codec.encode_body(&sample("z")).unwrap();
        let last = body.len() - 1;
        body[last] ^= 0xff;
        assert!(codec.decode_body(&body).is_err());
    }

    #[test]
    fn test_every_body_kind_survives_the_wire() {
        let codec = FrameCodec::default();
        let mut synchro = Packet::synchro("h");
        synchro.body = PacketBody::Synchro {
            root_hash: Some("abc".into()),
            request_list: Some(vec!["i1".into()]),
            response_list: None,
        };
        for packet in [Packet::welcome(), synchro] {
            let frame = codec.encode_frame(&packet).unwrap();
            let mut reader = FrameReader::new(codec.clone());
            assert_eq!(reader.push(&frame).unwrap(), vec![packet]);
        }
    }
}
