//! The `Message` envelope: an unencrypted routing header followed by an
//! encrypted, variable-length body.
//!
//! The header (offsets `0..HEADER_LEN`) never needs decryption to route —
//! a router can read `source`/`vnet`/`destination`/`serviceName`/
//! `serviceArea`/`priority`/`multicastMode` straight off the wire. Nothing
//! in this module should threaten that property; if you find yourself
//! wanting to move a routing-relevant field into the encrypted body, don't.
//!
//! `action` and `transactionState` each get their own byte in the body
//! (offsets 0 and 1). An earlier revision of this protocol packed both
//! into a single `action << 4 | state` byte; this crate deliberately does
//! not do that — see `SPEC_FULL.md` §9.

use crate::wire::{
    self, Action, MulticastMode, Priority, TransactionState, WireError, HEADER_LEN,
    SERVICE_NAME_LEN, UUID_LEN,
};

/// Fixed byte length of the non-transaction body up to and including the
/// payload-size prefix but before the payload itself: action(1) +
/// state(1) + aaaId(36) + sequence(4) + timeout(2) + flags(1) +
/// failMessageSize(1) + payloadSize(4) = 50.
const BODY_FIXED_LEN: usize = 1 + 1 + UUID_LEN + 4 + 2 + 1 + 1 + 4;

/// Fixed byte length of the transaction extension block, excluding the
/// variable-length `errMsg`: transactionId(36) + errMsgSize(1) +
/// 5 * timestamp(8) + replicaNumber(1) + isReplica(1) = 79.
const TX_EXT_FIXED_LEN: usize = UUID_LEN + 1 + 5 * 8 + 1 + 1;

/// The routing + dispatch envelope. Constructed by the dispatcher, cloned
/// when replicated, serialized exactly once per send, and never mutated
/// after that.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub source: String,
    pub vnet: String,
    pub destination: String,
    pub service_name: String,
    pub service_area: u8,
    pub priority: Priority,
    pub multicast_mode: MulticastMode,

    pub action: Action,
    pub transaction_state: TransactionState,
    pub aaa_id: String,
    pub sequence: u32,
    pub timeout: u16,
    pub request: bool,
    pub reply: bool,
    pub fail_message: String,
    pub payload: Vec<u8>,

    /// Present (meaningfully) only when `transaction_state !=
    /// NotATransaction`; otherwise these are the type's defaults and are
    /// not written to the wire at all.
    pub transaction_id: String,
    pub err_msg: String,
    pub tr_created: i64,
    pub tr_queued: i64,
    pub tr_running: i64,
    pub tr_end: i64,
    pub tr_timeout: i64,
    pub replica_number: u8,
    pub is_replica: bool,
}

impl Default for Message {
    fn default() -> Self {
        Message {
            source: String::new(),
            vnet: String::new(),
            destination: String::new(),
            service_name: String::new(),
            service_area: 0,
            priority: Priority::default(),
            multicast_mode: MulticastMode::default(),
            action: Action::Post,
            transaction_state: TransactionState::default(),
            aaa_id: String::new(),
            sequence: 0,
            timeout: 0,
            request: false,
            reply: false,
            fail_message: String::new(),
            payload: Vec::new(),
            transaction_id: String::new(),
            err_msg: String::new(),
            tr_created: 0,
            tr_queued: 0,
            tr_running: 0,
            tr_end: 0,
            tr_timeout: 0,
            replica_number: 0,
            is_replica: false,
        }
    }
}

impl Message {
    /// Build a fresh non-transactional unicast/multicast message. Most
    /// dispatch call sites start here and set `transaction_state` and its
    /// associated fields afterward when a transaction is required.
    pub fn new(
        source: impl Into<String>,
        vnet: impl Into<String>,
        destination: impl Into<String>,
        service_name: impl Into<String>,
        service_area: u8,
        action: Action,
        payload: Vec<u8>,
    ) -> Self {
        Message {
            source: source.into(),
            vnet: vnet.into(),
            destination: destination.into(),
            service_name: service_name.into(),
            service_area,
            action,
            payload,
            ..Message::default()
        }
    }

    /// Exact copy, per SPEC_FULL §3.1.
    pub fn clone_exact(&self) -> Self {
        self.clone()
    }

    /// Build the reply to this message: destination becomes this
    /// message's source, source becomes `local_uuid`, vnet becomes
    /// `remote_uuid`, action becomes `Reply`, and request/reply flags are
    /// flipped accordingly. Everything else — including `sequence`, which
    /// is how the caller correlates the reply back to its pending
    /// request — is preserved.
    pub fn clone_reply(&self, local_uuid: impl Into<String>, remote_uuid: impl Into<String>) -> Self {
        Message {
            source: local_uuid.into(),
            vnet: remote_uuid.into(),
            destination: self.source.clone(),
            action: Action::Reply,
            request: false,
            reply: true,
            ..self.clone()
        }
    }

    /// Build a failure reply: source and destination are swapped, the
    /// original action and request/reply flags are preserved, and
    /// `fail_message` carries the failure text.
    pub fn clone_fail(&self, fail_message: impl Into<String>, remote_uuid: impl Into<String>) -> Self {
        Message {
            source: self.destination.clone(),
            vnet: remote_uuid.into(),
            destination: self.source.clone(),
            fail_message: fail_message.into(),
            ..self.clone()
        }
    }

    /// Serialize this message to its wire representation: the
    /// unencrypted header followed by the plaintext (not-yet-encrypted)
    /// body. Encryption is the caller's concern (see `mesh-runtime::frame`).
    pub fn serialize(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(HEADER_LEN + BODY_FIXED_LEN + self.payload.len());
        self.write_header(&mut out);
        self.write_body(&mut out)?;
        Ok(out)
    }

    fn write_header(&self, out: &mut Vec<u8>) {
        write_fixed(out, &self.source, UUID_LEN);
        write_fixed(out, &self.vnet, UUID_LEN);
        write_fixed(out, &self.destination, UUID_LEN);
        write_fixed(out, &self.service_name, SERVICE_NAME_LEN);
        out.push(self.service_area);
        out.push(wire::pack_priority_mode(self.priority, self.multicast_mode));
    }

    fn write_body(&self, out: &mut Vec<u8>) -> Result<(), WireError> {
        if self.fail_message.len() > u8::MAX as usize {
            return Err(WireError::FailMessageTooLong(self.fail_message.len()));
        }
        out.push(u8::from(self.action));
        out.push(u8::from(self.transaction_state));
        write_fixed(out, &self.aaa_id, UUID_LEN);
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.timeout.to_be_bytes());
        out.push(pack_request_reply(self.request, self.reply));
        out.push(self.fail_message.len() as u8);
        out.extend_from_slice(self.fail_message.as_bytes());
        out.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        out.extend_from_slice(&self.payload);

        if self.transaction_state.has_extension() {
            if self.err_msg.len() > u8::MAX as usize {
                return Err(WireError::ErrMessageTooLong(self.err_msg.len()));
            }
            write_fixed(out, &self.transaction_id, UUID_LEN);
            out.push(self.err_msg.len() as u8);
            out.extend_from_slice(self.err_msg.as_bytes());
            out.extend_from_slice(&self.tr_created.to_be_bytes());
            out.extend_from_slice(&self.tr_queued.to_be_bytes());
            out.extend_from_slice(&self.tr_running.to_be_bytes());
            out.extend_from_slice(&self.tr_end.to_be_bytes());
            out.extend_from_slice(&self.tr_timeout.to_be_bytes());
            out.push(self.replica_number);
            out.push(self.is_replica as u8);
        }
        Ok(())
    }

    /// Parse a message out of the concatenation of its unencrypted header
    /// and its (already decrypted) body, as produced by `serialize`.
    pub fn deserialize(data: &[u8]) -> Result<Self, WireError> {
        if data.len() < HEADER_LEN {
            return Err(WireError::Truncated {
                expected: HEADER_LEN,
                got: data.len(),
            });
        }
        let mut msg = Message {
            source: read_fixed(&data[0..UUID_LEN]),
            vnet: read_fixed(&data[UUID_LEN..UUID_LEN * 2]),
            destination: read_fixed(&data[UUID_LEN * 2..UUID_LEN * 3]),
            service_name: read_service_name(&data[UUID_LEN * 3..UUID_LEN * 3 + SERVICE_NAME_LEN]),
            service_area: data[HEADER_LEN - 2],
            ..Message::default()
        };
        let (priority, mode) = wire::unpack_priority_mode(data[HEADER_LEN - 1])?;
        msg.priority = priority;
        msg.multicast_mode = mode;

        let body = &data[HEADER_LEN..];
        if body.len() < BODY_FIXED_LEN {
            return Err(WireError::Truncated {
                expected: BODY_FIXED_LEN,
                got: body.len(),
            });
        }
        msg.action = Action::try_from(body[0])?;
        msg.transaction_state = TransactionState::try_from(body[1])?;
        msg.aaa_id = read_fixed(&body[2..2 + UUID_LEN]);

        let mut off = 2 + UUID_LEN;
        msg.sequence = u32::from_be_bytes(body[off..off + 4].try_into().unwrap());
        off += 4;
        msg.timeout = u16::from_be_bytes(body[off..off + 2].try_into().unwrap());
        off += 2;
        let (request, reply) = unpack_request_reply(body[off]);
        msg.request = request;
        msg.reply = reply;
        off += 1;
        let fms = body[off] as usize;
        off += 1;

        if body.len() < off + fms + 4 {
            return Err(WireError::Truncated {
                expected: off + fms + 4,
                got: body.len(),
            });
        }
        msg.fail_message = String::from_utf8_lossy(&body[off..off + fms]).into_owned();
        off += fms;
        let payload_len = u32::from_be_bytes(body[off..off + 4].try_into().unwrap()) as usize;
        off += 4;

        if body.len() < off + payload_len {
            return Err(WireError::Truncated {
                expected: off + payload_len,
                got: body.len(),
            });
        }
        msg.payload = body[off..off + payload_len].to_vec();
        off += payload_len;

        if msg.transaction_state.has_extension() {
            if body.len() < off + TX_EXT_FIXED_LEN {
                return Err(WireError::Truncated {
                    expected: off + TX_EXT_FIXED_LEN,
                    got: body.len(),
                });
            }
            msg.transaction_id = read_fixed(&body[off..off + UUID_LEN]);
            off += UUID_LEN;
            let ems = body[off] as usize;
            off += 1;
            if body.len() < off + ems + 5 * 8 + 2 {
                return Err(WireError::Truncated {
                    expected: off + ems + 5 * 8 + 2,
                    got: body.len(),
                });
            }
            msg.err_msg = String::from_utf8_lossy(&body[off..off + ems]).into_owned();
            off += ems;
            msg.tr_created = read_i64(body, off);
            off += 8;
            msg.tr_queued = read_i64(body, off);
            off += 8;
            msg.tr_running = read_i64(body, off);
            off += 8;
            msg.tr_end = read_i64(body, off);
            off += 8;
            msg.tr_timeout = read_i64(body, off);
            off += 8;
            msg.replica_number = body[off];
            off += 1;
            msg.is_replica = body[off] != 0;
        }

        Ok(msg)
    }
}

fn write_fixed(out: &mut Vec<u8>, value: &str, width: usize) {
    let bytes = value.as_bytes();
    let n = bytes.len().min(width);
    out.extend_from_slice(&bytes[..n]);
    out.resize(out.len() + (width - n), 0);
}

/// Strip trailing NUL padding from a fixed-width identifier field. A
/// field whose first two bytes are NUL is read back as the empty string,
/// matching the `destination`-all-NUL sentinel for "multicast/any".
fn read_fixed(buf: &[u8]) -> String {
    if buf.len() >= 2 && buf[0] == 0 && buf[1] == 0 {
        return String::new();
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Read `serviceName` up to the first NUL or the field boundary.
fn read_service_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

fn pack_request_reply(request: bool, reply: bool) -> u8 {
    (request as u8) | ((reply as u8) << 1)
}

fn unpack_request_reply(byte: u8) -> (bool, bool) {
    (byte & 0b01 != 0, byte & 0b10 != 0)
}

fn read_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}
