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

//! Identifiers used throughout the hosted-channels wire protocol and
//! database: channel ids, short channel ids and the htlc forwarding key.

use amplify::Slice32;
use bitcoin::secp256k1::PublicKey;
use std::fmt::{self, Display, Formatter};

/// Hosted-channel id: 256-bit value deterministically derived from the
/// ordered pair of host and client node public keys (`spec.md` §6).
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Display,
    Default,
    From,
    StrictEncode,
    StrictDecode,
    LightningEncode,
    LightningDecode,
)]
#[display(LowerHex)]
#[wrapper(LowerHex, UpperHex)]
pub struct ChannelId(Slice32);

impl ChannelId {
    /// Derives a channel id from the host and client public keys, matching
    /// whatever value `ShortChannelId::derive` will also settle on: both
    /// sides of the channel must compute identical output from identical
    /// input, regardless of which side is "local" or "remote".
    pub fn derive(host_pubkey: &PublicKey, client_pubkey: &PublicKey) -> Self {
        let hash = crate::crypto::sha256_of_ordered_pubkeys(host_pubkey, client_pubkey);
        ChannelId(Slice32::from_inner(hash.into_inner()))
    }

    /// A channel id consisting of all zeros is, per BOLT-1, a wildcard
    /// meaning "all channels with this peer".
    pub fn is_wildcard(&self) -> bool {
        self.0.to_inner() == [0u8; 32]
    }
}

/// Short channel id for a hosted channel. Unlike a regular Lightning
/// channel there is no block/tx/output triple to derive this from, so it
/// is instead derived deterministically from the two peers' identity
/// keys (`spec.md` §6, "Short channel id derivation").
#[derive(
    Wrapper,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Default,
    From,
    StrictEncode,
    StrictDecode,
    LightningEncode,
    LightningDecode,
)]
pub struct ShortChannelId(u64);

impl Display for ShortChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl ShortChannelId {
    /// Derives a short channel id from the host and client public keys.
    /// Both sides must land on the same value; we take the first 8 bytes
    /// of the same ordered-pubkey hash used for [`ChannelId::derive`] so
    /// the two ids are trivially related but not interchangeable.
    pub fn derive(host_pubkey: &PublicKey, client_pubkey: &PublicKey) -> Self {
        let hash = crate::crypto::sha256_of_ordered_pubkeys(host_pubkey, client_pubkey);
        let bytes = hash.into_inner();
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&bytes[0..8]);
        ShortChannelId(u64::from_be_bytes(buf))
    }
}

/// Identifies a single in-flight HTLC on a specific hosted channel, used
/// as both halves of the `HtlcForwards` table (`spec.md` §3).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct HtlcIdentifier {
    pub scid: ShortChannelId,
    pub htlc_id: u64,
}

impl HtlcIdentifier {
    pub fn new(scid: ShortChannelId, htlc_id: u64) -> Self {
        HtlcIdentifier { scid, htlc_id }
    }
}

impl Display for HtlcIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scid, self.htlc_id)
    }
}
