//! Wire-format constants and enums for the mesh `Message` envelope.
//!
//! These ARE the protocol: every offset, every fixed width, every sentinel
//! value here is load-bearing. `message.rs` builds the byte layout from the
//! constants defined in this module; nothing here does I/O.

use static_assertions::assert_eq_size;

// ── Fixed-width identifier fields ────────────────────────────────────────

/// Width, in bytes, of every fixed-width identifier field on the wire:
/// `source`, `vnet`, `destination`, `aaaId`, `transactionId`.
pub const UUID_LEN: usize = 36;

/// Width, in bytes, of the `serviceName` header field. Names longer than
/// this are truncated on write; on read, the field is interpreted up to
/// the first NUL byte or this width, whichever comes first.
pub const SERVICE_NAME_LEN: usize = 10;

/// Total size of the unencrypted routing header: source, vnet,
/// destination, serviceName, serviceArea, and the packed priority/mode
/// byte.
pub const HEADER_LEN: usize = UUID_LEN * 3 + SERVICE_NAME_LEN + 1 + 1;
assert_eq_size!([u8; HEADER_LEN], [u8; 120]);

/// Sentinel destination requesting round-robin single-destination
/// selection. 36 bytes, generated rather than hand-typed so the padding
/// is exact by construction.
pub fn destination_single() -> String {
    format!("signle{}", "X".repeat(UUID_LEN - 6))
}

/// Sentinel destination requesting leader-targeted selection.
pub fn destination_leader() -> String {
    format!("leader{}", "X".repeat(UUID_LEN - 6))
}

// ── Priority / multicast mode ─────────────────────────────────────────────

/// Message priority, packed into the high nibble of the routing header's
/// last byte. `P8` is the lowest priority, `P1` the highest — the naming
/// mirrors the protocol's own "P1 through P8" scheme, not a numeric scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Priority {
    #[default]
    P8 = 0,
    P7 = 1,
    P6 = 2,
    P5 = 3,
    P4 = 4,
    P3 = 5,
    P2 = 6,
    P1 = 7,
}

impl TryFrom<u8> for Priority {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Priority::P8),
            1 => Ok(Priority::P7),
            2 => Ok(Priority::P6),
            3 => Ok(Priority::P5),
            4 => Ok(Priority::P4),
            5 => Ok(Priority::P3),
            6 => Ok(Priority::P2),
            7 => Ok(Priority::P1),
            other => Err(WireError::UnknownPriority(other)),
        }
    }
}

/// Destination-selection mode, packed into the low nibble of the routing
/// header's last byte alongside `Priority`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum MulticastMode {
    /// All known providers of the service/area.
    #[default]
    All = 0,
    /// One provider, chosen by a per-(service, area) round-robin cursor.
    RoundRobin = 1,
    /// One provider, chosen by a locality/latency heuristic.
    Proximity = 2,
    /// The in-process provider on this same VNic, no wire traffic.
    Local = 3,
    /// The elected leader for the service/area.
    Leader = 4,
    /// A caller-supplied destination UUID overrides mode-based selection
    /// entirely; this value exists so the byte round-trips, not because
    /// dispatch ever branches on it directly.
    Unicast = 5,
}

impl TryFrom<u8> for MulticastMode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MulticastMode::All),
            1 => Ok(MulticastMode::RoundRobin),
            2 => Ok(MulticastMode::Proximity),
            3 => Ok(MulticastMode::Local),
            4 => Ok(MulticastMode::Leader),
            5 => Ok(MulticastMode::Unicast),
            other => Err(WireError::UnknownMulticastMode(other)),
        }
    }
}

/// Pack `priority` into the high nibble and `mode` into the low nibble of
/// a single header byte.
pub fn pack_priority_mode(priority: Priority, mode: MulticastMode) -> u8 {
    ((priority as u8) << 4) | (mode as u8)
}

/// Inverse of [`pack_priority_mode`].
pub fn unpack_priority_mode(byte: u8) -> Result<(Priority, MulticastMode), WireError> {
    let priority = Priority::try_from(byte >> 4)?;
    let mode = MulticastMode::try_from(byte & 0x0F)?;
    Ok((priority, mode))
}

// ── Action ────────────────────────────────────────────────────────────────

/// The operation a message carries, occupying its own byte in the
/// encrypted body (offset 0). This crate never packs `Action` and
/// `TransactionState` into a shared byte — see the module docs on
/// `message.rs` for why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Action {
    Post = 1,
    Put = 2,
    Patch = 3,
    Delete = 4,
    Get = 5,
    Reply = 6,
    Notify = 7,
    Handle = 8,
    EndPoints = 9,

    // Leader election sub-protocol.
    ElectionRequest = 10,
    ElectionResponse = 11,
    LeaderAnnouncement = 12,
    LeaderHeartbeat = 13,
    LeaderQuery = 14,
    LeaderResign = 15,
    LeaderChallenge = 16,

    // Service registry.
    ServiceRegister = 17,
    ServiceUnregister = 18,
    ServiceQuery = 19,

    // Map-reduce variants.
    MapPost = 21,
    MapPut = 22,
    MapPatch = 23,
    MapDelete = 24,
    MapGet = 25,
}

impl TryFrom<u8> for Action {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Action::*;
        Ok(match value {
            1 => Post,
            2 => Put,
            3 => Patch,
            4 => Delete,
            5 => Get,
            6 => Reply,
            7 => Notify,
            8 => Handle,
            9 => EndPoints,
            10 => ElectionRequest,
            11 => ElectionResponse,
            12 => LeaderAnnouncement,
            13 => LeaderHeartbeat,
            14 => LeaderQuery,
            15 => LeaderResign,
            16 => LeaderChallenge,
            17 => ServiceRegister,
            18 => ServiceUnregister,
            19 => ServiceQuery,
            21 => MapPost,
            22 => MapPut,
            23 => MapPatch,
            24 => MapDelete,
            25 => MapGet,
            other => return Err(WireError::UnknownAction(other)),
        })
    }
}

impl From<Action> for u8 {
    fn from(a: Action) -> u8 {
        a as u8
    }
}

// ── Transaction state ────────────────────────────────────────────────────

/// Transaction lifecycle state, occupying its own byte in the encrypted
/// body (offset 1). `NotATransaction` is terminal and means the
/// transaction extension block (§3.1) is absent entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TransactionState {
    #[default]
    NotATransaction = 0,
    Created = 1,
    Queued = 2,
    Running = 3,
    Committed = 4,
    Rollback = 5,
    Failed = 6,
    Cleanup = 7,
}

impl TransactionState {
    /// Whether this state carries a transaction extension block on the wire.
    pub fn has_extension(self) -> bool {
        !matches!(self, TransactionState::NotATransaction)
    }

    /// Whether this state is terminal — no further transition is expected
    /// other than an optional move to `Cleanup`.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransactionState::NotATransaction
                | TransactionState::Committed
                | TransactionState::Failed
                | TransactionState::Cleanup
        )
    }
}

impl TryFrom<u8> for TransactionState {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use TransactionState::*;
        Ok(match value {
            0 => NotATransaction,
            1 => Created,
            2 => Queued,
            3 => Running,
            4 => Committed,
            5 => Rollback,
            6 => Failed,
            7 => Cleanup,
            other => return Err(WireError::UnknownTransactionState(other)),
        })
    }
}

impl From<TransactionState> for u8 {
    fn from(s: TransactionState) -> u8 {
        s as u8
    }
}

// ── Errors ────────────────────────────────────────────────────────────────

/// Errors raised interpreting or building wire-format bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown action byte: {0}")]
    UnknownAction(u8),

    #[error("unknown transaction state byte: {0}")]
    UnknownTransactionState(u8),

    #[error("unknown priority nibble: {0}")]
    UnknownPriority(u8),

    #[error("unknown multicast mode nibble: {0}")]
    UnknownMulticastMode(u8),

    #[error("message body is truncated: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("failMessage length {0} exceeds the 255-byte wire limit")]
    FailMessageTooLong(usize),

    #[error("errMsg length {0} exceeds the 255-byte wire limit")]
    ErrMessageTooLong(usize),
}
