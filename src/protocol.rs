//! Binary wire protocol for document synchronization.
//!
//! Every frame starts with a varint message tag. SYNC frames nest a second
//! varint sub-type, AWARENESS frames carry one length-prefixed delta blob:
//!
//! ```text
//! ┌─────────────┬──────────────┬───────────────┬─────────────┐
//! │ msg tag     │ sync subtype │ payload len   │ payload     │
//! │ varint (0)  │ varint 0|1|2 │ varint        │ variable    │
//! ├─────────────┼──────────────┴───────────────┼─────────────┤
//! │ msg tag     │ delta len                    │ delta       │
//! │ varint (1)  │ varint                       │ variable    │
//! └─────────────┴──────────────────────────────┴─────────────┘
//! ```
//!
//! All integers are unsigned LEB128. Payloads are opaque at this layer:
//! state vectors and operation diffs are produced and consumed by the
//! replica, awareness deltas by the awareness table.
//!
//! Sync handlers return `Option<SyncMessage>`; `None` means "nothing to
//! send" and no frame is emitted at all, so the bare-tag response some
//! peers use as a no-op never reaches the wire.

/// Top-level message tag: synchronization traffic.
pub const MSG_SYNC: u64 = 0;
/// Top-level message tag: presence traffic.
pub const MSG_AWARENESS: u64 = 1;

/// SYNC sub-type: state vector announcement.
pub const SYNC_STEP1: u64 = 0;
/// SYNC sub-type: diff covering everything the peer is missing.
pub const SYNC_STEP2: u64 = 1;
/// SYNC sub-type: one incremental operation.
pub const SYNC_UPDATE: u64 = 2;

/// Growable frame buffer with helpers for the protocol primitives.
pub(crate) struct FrameWriter {
    buf: Vec<u8>,
}

impl FrameWriter {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(32),
        }
    }

    #[inline]
    pub fn push_byte(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    /// Encode an unsigned LEB128 integer.
    pub fn push_varint(&mut self, mut n: u64) {
        loop {
            let byte = (n & 0x7f) as u8;
            n >>= 7;
            if n == 0 {
                self.push_byte(byte);
                break;
            }
            self.push_byte(byte | 0x80);
        }
    }

    #[inline]
    pub fn push_var_bytes(&mut self, bytes: &[u8]) {
        self.push_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    #[inline]
    pub fn push_var_string(&mut self, s: &str) {
        self.push_var_bytes(s.as_bytes());
    }

    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received frame.
pub(crate) struct FrameReader<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }

    pub fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        if self.off >= self.buf.len() {
            return Err(ProtocolError::UnexpectedEof);
        }
        let b = self.buf[self.off];
        self.off += 1;
        Ok(b)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self
            .off
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or(ProtocolError::UnexpectedEof)?;
        let slice = &self.buf[self.off..end];
        self.off = end;
        Ok(slice)
    }

    /// Decode an unsigned LEB128 integer, guarding against runaway shifts.
    pub fn read_varint(&mut self) -> Result<u64, ProtocolError> {
        let mut result: u64 = 0;
        let mut shift: u32 = 0;
        loop {
            let byte = self.read_byte()?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                return Err(ProtocolError::VarintTooLong);
            }
        }
        Ok(result)
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = usize::try_from(self.read_varint()?).map_err(|_| ProtocolError::VarintTooLong)?;
        self.read_bytes(len)
    }

    pub fn read_var_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_var_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Sub-messages of the SYNC kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// State vector: a compact summary of what the sender already has.
    Step1(Vec<u8>),
    /// Diff containing exactly the operations the receiver is missing.
    Step2(Vec<u8>),
    /// One incremental operation.
    Update(Vec<u8>),
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Sync(SyncMessage),
    /// Encoded per-actor presence delta, opaque to this layer.
    Awareness(Vec<u8>),
}

impl Message {
    /// Create a STEP1 message carrying a state vector.
    pub fn sync_step1(state_vector: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Step1(state_vector))
    }

    /// Create a STEP2 message carrying a diff payload.
    pub fn sync_step2(diff: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Step2(diff))
    }

    /// Create an UPDATE message carrying one incremental operation.
    pub fn update(op: Vec<u8>) -> Self {
        Message::Sync(SyncMessage::Update(op))
    }

    /// Create an AWARENESS message carrying an encoded presence delta.
    pub fn awareness(delta: Vec<u8>) -> Self {
        Message::Awareness(delta)
    }

    /// Serialize to the binary wire format.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = FrameWriter::new();
        match self {
            Message::Sync(sync) => {
                w.push_varint(MSG_SYNC);
                match sync {
                    SyncMessage::Step1(sv) => {
                        w.push_varint(SYNC_STEP1);
                        w.push_var_bytes(sv);
                    }
                    SyncMessage::Step2(diff) => {
                        w.push_varint(SYNC_STEP2);
                        w.push_var_bytes(diff);
                    }
                    SyncMessage::Update(op) => {
                        w.push_varint(SYNC_UPDATE);
                        w.push_var_bytes(op);
                    }
                }
            }
            Message::Awareness(delta) => {
                w.push_varint(MSG_AWARENESS);
                w.push_var_bytes(delta);
            }
        }
        w.into_vec()
    }

    /// Deserialize one message from a binary frame.
    ///
    /// Bytes past the encoded message are ignored, matching the reader
    /// semantics of the wire peers this protocol interoperates with.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = FrameReader::new(bytes);
        match r.read_varint()? {
            MSG_SYNC => {
                let sub = r.read_varint()?;
                let payload = r.read_var_bytes()?.to_vec();
                match sub {
                    SYNC_STEP1 => Ok(Message::Sync(SyncMessage::Step1(payload))),
                    SYNC_STEP2 => Ok(Message::Sync(SyncMessage::Step2(payload))),
                    SYNC_UPDATE => Ok(Message::Sync(SyncMessage::Update(payload))),
                    other => Err(ProtocolError::UnknownSyncType(other)),
                }
            }
            MSG_AWARENESS => Ok(Message::Awareness(r.read_var_bytes()?.to_vec())),
            other => Err(ProtocolError::UnknownMessage(other)),
        }
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Frame ended before the message did.
    UnexpectedEof,
    /// Varint ran past the 64-bit range.
    VarintTooLong,
    /// Unrecognized top-level message tag.
    UnknownMessage(u64),
    /// Unrecognized SYNC sub-type.
    UnknownSyncType(u64),
    /// Length-prefixed string was not valid UTF-8.
    InvalidUtf8,
    /// Operation payload the replica refused to decode or merge.
    BadUpdate(String),
    /// Malformed state vector payload.
    BadStateVector(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "Unexpected end of frame"),
            Self::VarintTooLong => write!(f, "Varint exceeds 64 bits"),
            Self::UnknownMessage(tag) => write!(f, "Unknown message tag: {tag}"),
            Self::UnknownSyncType(tag) => write!(f, "Unknown sync sub-type: {tag}"),
            Self::InvalidUtf8 => write!(f, "Invalid UTF-8 in string payload"),
            Self::BadUpdate(e) => write!(f, "Bad update payload: {e}"),
            Self::BadStateVector(e) => write!(f, "Bad state vector: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
