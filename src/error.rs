// LNP/BP Core Library implementing LNPBP specifications & standards
// Written in 2020-2026 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Error taxonomy for the hosted-channels core (see `spec.md` §7).

use crate::ids::ChannelId;

/// Errors produced while decoding or validating a peer message before it
/// ever reaches channel state.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum CodecError {
    /// peer sent a message tagged {0} that could not be parsed
    Malformed(u64),

    /// message sig material did not round-trip through its own codec
    SigMaterialMismatch,
}

/// Errors that cause a channel to move into `Suspended`.
///
/// Every variant here is, per `spec.md` §7, surfaced to the peer as an
/// `Error` wire message before the channel suspends.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ChannelError {
    /// channel {0} received a message with a bad codec: {1}
    Codec(ChannelId, CodecError),

    /// signature on the proposed state did not verify against the peer's
    /// known public key
    BadSignature,

    /// local and remote balances ({local}, {remote}) do not sum to channel
    /// capacity {capacity}
    BalanceMismatch {
        local: u64,
        remote: u64,
        capacity: u64,
    },

    /// htlc amount {amount} is below the channel's minimum of {minimum}
    HtlcBelowMinimum { amount: u64, minimum: u64 },

    /// accepting this htlc would bring the in-flight count to {proposed},
    /// exceeding the channel limit of {allowed}
    TooManyHtlcs { proposed: u16, allowed: u16 },

    /// accepting this htlc would bring in-flight value to {proposed} msat,
    /// exceeding the channel limit of {allowed} msat
    HtlcValueInFlightExceeded { proposed: u64, allowed: u64 },

    /// blockday too stale
    StaleBlockDay,

    /// update counters diverged from the peer's view (ours: {ours},
    /// peer's: {theirs}) after {retries} retries
    CounterMismatch {
        ours: u32,
        theirs: u32,
        retries: u8,
    },

    /// referenced htlc id {0} is not present in the channel's update set
    UnknownHtlc(u64),

    /// resize to {proposed} sat is not an increase over current capacity
    /// of {current} sat
    ResizeNotGrowth { proposed: u64, current: u64 },

    /// channel is suspended and refuses new updates
    ChannelSuspended,

    /// channel is not active (current stage: {0})
    NotActive(&'static str),

    /// underlying database operation failed: {0}
    Database(DbError),

    /// peer sent an explicit protocol error: {0}
    PeerReported(String),
}

impl From<DbError> for ChannelError {
    fn from(e: DbError) -> Self {
        ChannelError::Database(e)
    }
}

/// Database errors. Per `spec.md` §7 these are fatal: the process is
/// expected to exit rather than silently diverge from disk. The library
/// itself never calls `process::exit`; that decision belongs to the
/// (out-of-scope) process entry point, so `DbError` is simply propagated.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum DbError {
    /// record for peer {0} not found
    NotFound(String),

    /// read-modify-write transaction failed: {0}
    TransactionFailed(String),

    /// underlying storage backend reported an I/O error: {0}
    Io(String),
}

/// Errors raised by `ChannelMaster` orchestration: a channel-level error,
/// a database failure, or the node driver reporting a failed RPC
/// (`spec.md` §4.7, §7). Node errors are carried as `String` rather than
/// the original [`crate::node::NodeError`] so this enum doesn't need to
/// depend back on the `node` module's error type for a single `Display`
/// forwarding case.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum MasterError {
    /// channel operation failed: {0}
    Channel(ChannelError),

    /// database operation failed: {0}
    Database(DbError),

    /// node driver operation failed: {0}
    Node(String),
}

impl From<ChannelError> for MasterError {
    fn from(e: ChannelError) -> Self {
        MasterError::Channel(e)
    }
}

impl From<DbError> for MasterError {
    fn from(e: DbError) -> Self {
        MasterError::Database(e)
    }
}

/// Errors surfaced by the JSON-RPC control API.
#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum ControlError {
    /// no channel is known for peer {0}
    UnknownPeer(String),

    /// channel operation rejected: {0}
    Rejected(ChannelError),

    /// underlying database operation failed: {0}
    Database(DbError),

    /// node driver operation failed: {0}
    Node(String),
}

impl From<ChannelError> for ControlError {
    fn from(e: ChannelError) -> Self {
        ControlError::Rejected(e)
    }
}

impl From<DbError> for ControlError {
    fn from(e: DbError) -> Self {
        ControlError::Database(e)
    }
}

impl From<MasterError> for ControlError {
    fn from(e: MasterError) -> Self {
        match e {
            MasterError::Channel(ce) => ControlError::Rejected(ce),
            MasterError::Database(de) => ControlError::Database(de),
            MasterError::Node(s) => ControlError::Node(s),
        }
    }
}
