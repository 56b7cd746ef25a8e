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

//! Database contract (`spec.md` §2, §3, §5, §6 "Persisted state"). The
//! on-disk encoding is an external collaborator's concern (`spec.md` §1);
//! what belongs to the core is the atomic read-modify-write contract and
//! the shape of the persisted record. [`InMemoryDatabase`] is a reference
//! implementation suitable for tests and for a single-process deployment
//! that layers its own snapshotting on top.

use async_trait::async_trait;
use bitcoin::secp256k1::{ecdsa::Signature, PublicKey};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::DbError;
use crate::ids::{ChannelId, HtlcIdentifier};
use crate::msgs::LastCrossSignedStateMsg;

/// One of the local or remote `Error` messages ever seen on a channel,
/// kept for diagnostics and for replay after a restart (`spec.md` §3).
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct StoredError {
    pub channel_id: ChannelId,
    pub data: Vec<u8>,
    pub unknown_tlvs: Vec<u8>,
}

/// A client-proposed capacity increase awaiting the host's next LCSS
/// (`spec.md` §4.5).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct PendingResize {
    pub new_capacity_sat: u64,
    pub client_sig: Signature,
}

/// Persisted per-peer record (`spec.md` §3 `ChannelData`).
#[derive(Clone, PartialEq, Eq, Debug)]
#[derive(StrictEncode, StrictDecode)]
pub struct ChannelData {
    pub lcss: LastCrossSignedStateMsg,
    pub local_errors: Vec<StoredError>,
    pub remote_errors: Vec<StoredError>,
    pub pending_refund_script: Option<Vec<u8>>,
    pub pending_resize: Option<PendingResize>,
}

impl ChannelData {
    pub fn new(lcss: LastCrossSignedStateMsg) -> Self {
        ChannelData {
            lcss,
            local_errors: vec![],
            remote_errors: vec![],
            pending_refund_script: None,
            pending_resize: None,
        }
    }
}

/// A read-modify-write transformation applied to a single peer's channel
/// record. Boxed rather than generic so [`Database`] stays object-safe
/// and can be held as `Arc<dyn Database>` by [`crate::channel_master::ChannelMaster`].
pub type ChannelTransform = Box<dyn FnOnce(&mut ChannelData) + Send>;

/// The database owned by `ChannelMaster` (`spec.md` §5, "Shared
/// resources"). Writes to a channel record are serialized through
/// [`Database::update_channel`], which commits the transformation
/// atomically; this is the only way channel records are ever mutated.
#[async_trait]
pub trait Database: Send + Sync {
    /// Atomically applies `transform` to the record for `peer`, creating
    /// it first via `default` if absent, and returns the post-transform
    /// record.
    async fn update_channel(
        &self,
        peer: PublicKey,
        default: ChannelData,
        transform: ChannelTransform,
    ) -> Result<ChannelData, DbError>;

    async fn get_channel(&self, peer: &PublicKey) -> Result<Option<ChannelData>, DbError>;

    async fn all_channels(&self) -> Result<Vec<(PublicKey, ChannelData)>, DbError>;

    /// Only ever called by an explicit close command, never on error
    /// (`spec.md` §3, "Lifecycles").
    async fn remove_channel(&self, peer: &PublicKey) -> Result<(), DbError>;

    async fn store_preimage(&self, hash: amplify::Slice32, preimage: amplify::Slice32) -> Result<(), DbError>;

    async fn get_preimage(&self, hash: &amplify::Slice32) -> Result<Option<amplify::Slice32>, DbError>;

    /// Removed once the hash no longer appears in any channel's in-flight
    /// HTLC set (`spec.md` §3, "Preimage cache").
    async fn forget_preimage(&self, hash: &amplify::Slice32) -> Result<(), DbError>;

    /// Persisted *before* the outgoing `UpdateAddHtlc` is committed, so a
    /// crash between the two never loses the linkage (`spec.md` §5).
    async fn store_forward(&self, incoming: HtlcIdentifier, outgoing: HtlcIdentifier) -> Result<(), DbError>;

    async fn get_forward(&self, incoming: &HtlcIdentifier) -> Result<Option<HtlcIdentifier>, DbError>;

    async fn all_forwards(&self) -> Result<Vec<(HtlcIdentifier, HtlcIdentifier)>, DbError>;

    async fn remove_forward(&self, incoming: &HtlcIdentifier) -> Result<(), DbError>;
}

/// Reference [`Database`] implementation backing tests and single-process
/// deployments. Real deployments plug in a disk-backed implementation
/// (out of scope, `spec.md` §1) behind the same trait.
#[derive(Default)]
pub struct InMemoryDatabase {
    channels: Mutex<HashMap<PublicKey, ChannelData>>,
    preimages: Mutex<HashMap<amplify::Slice32, amplify::Slice32>>,
    forwards: Mutex<HashMap<HtlcIdentifier, HtlcIdentifier>>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn update_channel(
        &self,
        peer: PublicKey,
        default: ChannelData,
        transform: ChannelTransform,
    ) -> Result<ChannelData, DbError> {
        let mut channels = self.channels.lock().expect("in-memory db mutex poisoned");
        let entry = channels.entry(peer).or_insert(default);
        transform(entry);
        Ok(entry.clone())
    }

    async fn get_channel(&self, peer: &PublicKey) -> Result<Option<ChannelData>, DbError> {
        Ok(self.channels.lock().expect("in-memory db mutex poisoned").get(peer).cloned())
    }

    async fn all_channels(&self) -> Result<Vec<(PublicKey, ChannelData)>, DbError> {
        Ok(self
            .channels
            .lock()
            .expect("in-memory db mutex poisoned")
            .iter()
            .map(|(k, v)| (*k, v.clone()))
            .collect())
    }

    async fn remove_channel(&self, peer: &PublicKey) -> Result<(), DbError> {
        self.channels.lock().expect("in-memory db mutex poisoned").remove(peer);
        Ok(())
    }

    async fn store_preimage(&self, hash: amplify::Slice32, preimage: amplify::Slice32) -> Result<(), DbError> {
        self.preimages
            .lock()
            .expect("in-memory db mutex poisoned")
            .insert(hash, preimage);
        Ok(())
    }

    async fn get_preimage(&self, hash: &amplify::Slice32) -> Result<Option<amplify::Slice32>, DbError> {
        Ok(self.preimages.lock().expect("in-memory db mutex poisoned").get(hash).copied())
    }

    async fn forget_preimage(&self, hash: &amplify::Slice32) -> Result<(), DbError> {
        self.preimages.lock().expect("in-memory db mutex poisoned").remove(hash);
        Ok(())
    }

    async fn store_forward(&self, incoming: HtlcIdentifier, outgoing: HtlcIdentifier) -> Result<(), DbError> {
        self.forwards
            .lock()
            .expect("in-memory db mutex poisoned")
            .insert(incoming, outgoing);
        Ok(())
    }

    async fn get_forward(&self, incoming: &HtlcIdentifier) -> Result<Option<HtlcIdentifier>, DbError> {
        Ok(self.forwards.lock().expect("in-memory db mutex poisoned").get(incoming).copied())
    }

    async fn all_forwards(&self) -> Result<Vec<(HtlcIdentifier, HtlcIdentifier)>, DbError> {
        Ok(self
            .forwards
            .lock()
            .expect("in-memory db mutex poisoned")
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect())
    }

    async fn remove_forward(&self, incoming: &HtlcIdentifier) -> Result<(), DbError> {
        self.forwards.lock().expect("in-memory db mutex poisoned").remove(incoming);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::msgs::InitHostedChannel;

    fn dummy_lcss() -> LastCrossSignedStateMsg {
        use bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[5u8; 32]).unwrap();
        let sig = secp.sign_ecdsa(&Message::from_slice(&[1u8; 32]).unwrap(), &sk);
        LastCrossSignedStateMsg {
            is_host: true,
            refund_script_pubkey: vec![],
            params: InitHostedChannel {
                max_htlc_value_in_flight_msat: 1_000_000,
                htlc_minimum_msat: 1,
                max_accepted_htlcs: 30,
                channel_capacity_msat: 1_000_000,
                initial_client_balance_msat: 400_000,
                features: 0,
            },
            block_day: 1,
            local_balance_msat: 600_000,
            remote_balance_msat: 400_000,
            local_updates: 0,
            remote_updates: 0,
            incoming_htlcs: vec![],
            outgoing_htlcs: vec![],
            remote_sig_of_local: sig,
            local_sig_of_remote: sig,
        }
    }

    #[tokio::test]
    async fn update_channel_is_read_modify_write() {
        let db = InMemoryDatabase::new();
        let secp = bitcoin::secp256k1::Secp256k1::new();
        let sk = bitcoin::secp256k1::SecretKey::from_slice(&[9u8; 32]).unwrap();
        let peer = PublicKey::from_secret_key(&secp, &sk);

        let data = db
            .update_channel(
                peer,
                ChannelData::new(dummy_lcss()),
                Box::new(|data| data.lcss.local_updates += 1),
            )
            .await
            .unwrap();
        assert_eq!(data.lcss.local_updates, 1);

        let fetched = db.get_channel(&peer).await.unwrap().unwrap();
        assert_eq!(fetched.lcss.local_updates, 1);
    }

    #[tokio::test]
    async fn preimage_cache_forgets_on_request() {
        let db = InMemoryDatabase::new();
        let hash = amplify::Slice32::from_inner([1u8; 32]);
        let preimage = amplify::Slice32::from_inner([2u8; 32]);
        db.store_preimage(hash, preimage).await.unwrap();
        assert_eq!(db.get_preimage(&hash).await.unwrap(), Some(preimage));
        db.forget_preimage(&hash).await.unwrap();
        assert_eq!(db.get_preimage(&hash).await.unwrap(), None);
    }
}
