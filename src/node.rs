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

//! The abstract driver for the underlying Lightning node (`spec.md` §6,
//! "NodeInterface contract"). Everything in this module is an external
//! collaborator's contract, not core logic: the core only calls through
//! it and reacts to the events it produces.

use amplify::Slice32;
use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, SecretKey};

use crate::ids::ShortChannelId;
use crate::msgs::{OnionPacket, PeerMessage};

#[derive(Clone, PartialEq, Eq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum NodeError {
    /// sending a message to peer {0} failed (best-effort only, no delivery
    /// receipt is expected)
    SendFailed(String),

    /// chain query to the underlying node failed: {0}
    ChainQuery(String),
}

/// Outcome of [`NodeInterface::decrypt_onion`]: either the onion peels to
/// reveal the next hop, or the underlying node rejects it outright.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum OnionDecryption {
    Forward {
        next_short_channel_id: ShortChannelId,
        amount_msat: u64,
        cltv_expiry: u32,
        next_onion: OnionPacket,
    },
    Failure { reason: Vec<u8> },
}

/// How an outgoing HTLC the core tracked resolves, handed back to the
/// node so it can settle the corresponding intercepted HTLC.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum HtlcResolution {
    Fulfill { preimage: Slice32 },
    Fail { reason: Vec<u8> },
    FailMalformed { sha256_of_onion: Slice32, failure_code: u16 },
}

/// Events the node fans in to the core's single-threaded event loop
/// (`spec.md` §5): inbound peer messages, intercepted HTLCs awaiting a
/// resolve/continue/reject decision, and new chain tips. Modeled as a
/// plain enum consumed from an `mpsc` channel rather than as registered
/// callbacks, so ownership of "what happens next" stays entirely with
/// [`crate::channel_master::ChannelMaster`]'s event loop.
#[derive(Clone, PartialEq, Debug)]
pub enum NodeEvent {
    PeerMessage { peer: PublicKey, message: PeerMessage },
    PeerConnected { peer: PublicKey },
    PeerDisconnected { peer: PublicKey },
    InterceptedHtlc {
        incoming_short_channel_id: ShortChannelId,
        incoming_htlc_id: u64,
        amount_msat: u64,
        payment_hash: Slice32,
        cltv_expiry: u32,
        onion: OnionPacket,
    },
    ChainTip { height: u32 },
}

/// The driver contract itself (`spec.md` §6). `send_custom_message` is
/// fire-and-forget: delivery is the node's responsibility
/// (`spec.md` §5, "Shared resources").
#[async_trait]
pub trait NodeInterface: Send + Sync {
    async fn send_custom_message(&self, peer: PublicKey, message: PeerMessage) -> Result<(), NodeError>;

    async fn get_current_block(&self) -> Result<u32, NodeError>;

    async fn get_chain_hash(&self) -> Result<Slice32, NodeError>;

    async fn decrypt_onion(&self, onion: OnionPacket, payment_hash: Slice32) -> Result<OnionDecryption, NodeError>;

    /// Resolves an HTLC the node previously intercepted and reported via
    /// [`NodeEvent::InterceptedHtlc`].
    async fn resolve_htlc(
        &self,
        incoming_short_channel_id: ShortChannelId,
        incoming_htlc_id: u64,
        resolution: HtlcResolution,
    ) -> Result<(), NodeError>;

    /// Scans blocks at or after `from_height` for transactions whose
    /// witness data reveals a preimage for one of `tracked_hashes`
    /// (`spec.md` §4.8).
    async fn scan_for_preimages(
        &self,
        from_height: u32,
        tracked_hashes: &[Slice32],
    ) -> Result<Vec<(Slice32, Slice32)>, NodeError>;

    fn private_key(&self) -> SecretKey;

    fn public_key(&self) -> PublicKey;
}
