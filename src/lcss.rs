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

//! `LastCrossSignedState` (LCSS): the canonical hosted-channel state, and
//! the sole object both peers cross-sign (`spec.md` §3, §4.1).

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};

use crate::crypto;
use crate::error::ChannelError;
use crate::msgs::{InitHostedChannel, LastCrossSignedStateMsg, UpdateAddHtlc};

/// In-memory, invariant-checked form of `LastCrossSignedStateMsg`. Kept as
/// a distinct type from the wire message (`lnp-core`'s own
/// `channel/bolt/state.rs` similarly keeps `ChannelState` distinct from
/// the peer messages that populate it) so invariant checks cannot be
/// bypassed by constructing the wire struct directly.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct LastCrossSignedState {
    pub is_host: bool,
    pub refund_script_pubkey: Vec<u8>,
    pub params: InitHostedChannel,
    pub block_day: u32,
    pub local_balance_msat: u64,
    pub remote_balance_msat: u64,
    pub local_updates: u32,
    pub remote_updates: u32,
    pub incoming_htlcs: Vec<UpdateAddHtlc>,
    pub outgoing_htlcs: Vec<UpdateAddHtlc>,
    pub remote_sig_of_local: Signature,
    pub local_sig_of_remote: Signature,
}

impl LastCrossSignedState {
    /// Builds the initial LCSS for a freshly-opened channel: all balance
    /// sits with the client, no updates yet applied (`spec.md` §4.2).
    pub fn initial(is_host: bool, refund_script_pubkey: Vec<u8>, params: InitHostedChannel, block_day: u32) -> Self {
        let host_balance_msat = params.channel_capacity_msat.saturating_sub(params.initial_client_balance_msat);
        let (local_balance_msat, remote_balance_msat) = if is_host {
            (host_balance_msat, params.initial_client_balance_msat)
        } else {
            (params.initial_client_balance_msat, host_balance_msat)
        };
        LastCrossSignedState {
            is_host,
            refund_script_pubkey,
            params,
            block_day,
            local_balance_msat,
            remote_balance_msat,
            local_updates: 0,
            remote_updates: 0,
            incoming_htlcs: vec![],
            outgoing_htlcs: vec![],
            remote_sig_of_local: crypto::sign(&SecretKey::from_slice(&[1u8; 32]).expect("const"), &crypto::sha256(b"")),
            local_sig_of_remote: crypto::sign(&SecretKey::from_slice(&[1u8; 32]).expect("const"), &crypto::sha256(b"")),
        }
    }

    pub fn channel_capacity_msat(&self) -> u64 {
        self.params.channel_capacity_msat
    }

    /// Fixed, non-TLV sig material for `hostedSigHash` (`spec.md` §4.1):
    /// `refundScriptPubKey || LE64(capacity) || LE64(initialClientBalance)
    /// || LE32(blockDay) || LE64(localBalance) || LE64(remoteBalance)
    /// || LE32(localUpdates) || LE32(remoteUpdates)
    /// || concat(encode(UpdateAddHtlc) for each incoming)
    /// || concat(encode(UpdateAddHtlc) for each outgoing)
    /// || byte(isHost?1:0)`.
    pub fn sig_material(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.refund_script_pubkey);
        buf.extend_from_slice(&self.params.channel_capacity_msat.to_le_bytes());
        buf.extend_from_slice(&self.params.initial_client_balance_msat.to_le_bytes());
        buf.extend_from_slice(&self.block_day.to_le_bytes());
        buf.extend_from_slice(&self.local_balance_msat.to_le_bytes());
        buf.extend_from_slice(&self.remote_balance_msat.to_le_bytes());
        buf.extend_from_slice(&self.local_updates.to_le_bytes());
        buf.extend_from_slice(&self.remote_updates.to_le_bytes());
        for htlc in &self.incoming_htlcs {
            buf.extend_from_slice(&htlc.lightning_serialize_checked());
        }
        for htlc in &self.outgoing_htlcs {
            buf.extend_from_slice(&htlc.lightning_serialize_checked());
        }
        buf.push(self.is_host as u8);
        buf
    }

    pub fn hosted_sig_hash(&self) -> bitcoin::hashes::sha256::Hash {
        crypto::sha256(&self.sig_material())
    }

    /// The peer's own canonical view of the same channel: roles,
    /// balances, update counters, HTLC directions and signatures are all
    /// swapped (`spec.md` §3(f), §8 property 5: `reverse.reverse == self`).
    pub fn reverse(&self) -> Self {
        LastCrossSignedState {
            is_host: !self.is_host,
            refund_script_pubkey: self.refund_script_pubkey.clone(),
            params: self.params,
            block_day: self.block_day,
            local_balance_msat: self.remote_balance_msat,
            remote_balance_msat: self.local_balance_msat,
            local_updates: self.remote_updates,
            remote_updates: self.local_updates,
            incoming_htlcs: self.outgoing_htlcs.clone(),
            outgoing_htlcs: self.incoming_htlcs.clone(),
            remote_sig_of_local: self.local_sig_of_remote,
            local_sig_of_remote: self.remote_sig_of_local,
        }
    }

    /// Signs this state's reversed view (the peer's own canonical view)
    /// with the local identity key, populating `local_sig_of_remote`.
    pub fn sign_local(&mut self, local_secret_key: &SecretKey) {
        let hash = self.reverse().hosted_sig_hash();
        self.local_sig_of_remote = crypto::sign(local_secret_key, &hash);
    }

    /// Verifies both signatures: `local_sig_of_remote` against our own
    /// key over the reversed view, `remote_sig_of_local` against the
    /// peer's key over this view directly (`spec.md` §8 property 2).
    pub fn verify_signatures(&self, local_pubkey: &PublicKey, remote_pubkey: &PublicKey) -> bool {
        let self_hash = self.hosted_sig_hash();
        let reversed_hash = self.reverse().hosted_sig_hash();
        crypto::verify(remote_pubkey, &self_hash, &self.remote_sig_of_local)
            && crypto::verify(local_pubkey, &reversed_hash, &self.local_sig_of_remote)
    }

    /// Checks the structural invariants of `spec.md` §3(a)-(d).
    pub fn check_invariants(&self) -> Result<(), ChannelError> {
        let sum = self
            .local_balance_msat
            .checked_add(self.remote_balance_msat)
            .ok_or(ChannelError::BalanceMismatch {
                local: self.local_balance_msat,
                remote: self.remote_balance_msat,
                capacity: self.params.channel_capacity_msat,
            })?;
        if sum != self.params.channel_capacity_msat {
            return Err(ChannelError::BalanceMismatch {
                local: self.local_balance_msat,
                remote: self.remote_balance_msat,
                capacity: self.params.channel_capacity_msat,
            });
        }

        for htlc in self.incoming_htlcs.iter().chain(self.outgoing_htlcs.iter()) {
            if htlc.amount_msat < self.params.htlc_minimum_msat {
                return Err(ChannelError::HtlcBelowMinimum {
                    amount: htlc.amount_msat,
                    minimum: self.params.htlc_minimum_msat,
                });
            }
        }

        let count = self.incoming_htlcs.len() + self.outgoing_htlcs.len();
        if count > self.params.max_accepted_htlcs as usize {
            return Err(ChannelError::TooManyHtlcs {
                proposed: count as u16,
                allowed: self.params.max_accepted_htlcs,
            });
        }

        let in_flight: u64 = self
            .incoming_htlcs
            .iter()
            .chain(self.outgoing_htlcs.iter())
            .map(|h| h.amount_msat)
            .sum();
        if in_flight > self.params.max_htlc_value_in_flight_msat {
            return Err(ChannelError::HtlcValueInFlightExceeded {
                proposed: in_flight,
                allowed: self.params.max_htlc_value_in_flight_msat,
            });
        }

        Ok(())
    }

    pub fn to_wire(&self) -> LastCrossSignedStateMsg {
        LastCrossSignedStateMsg {
            is_host: self.is_host,
            refund_script_pubkey: self.refund_script_pubkey.clone(),
            params: self.params,
            block_day: self.block_day,
            local_balance_msat: self.local_balance_msat,
            remote_balance_msat: self.remote_balance_msat,
            local_updates: self.local_updates,
            remote_updates: self.remote_updates,
            incoming_htlcs: self.incoming_htlcs.clone(),
            outgoing_htlcs: self.outgoing_htlcs.clone(),
            remote_sig_of_local: self.remote_sig_of_local,
            local_sig_of_remote: self.local_sig_of_remote,
        }
    }

    pub fn from_wire(msg: LastCrossSignedStateMsg) -> Self {
        LastCrossSignedState {
            is_host: msg.is_host,
            refund_script_pubkey: msg.refund_script_pubkey,
            params: msg.params,
            block_day: msg.block_day,
            local_balance_msat: msg.local_balance_msat,
            remote_balance_msat: msg.remote_balance_msat,
            local_updates: msg.local_updates,
            remote_updates: msg.remote_updates,
            incoming_htlcs: msg.incoming_htlcs,
            outgoing_htlcs: msg.outgoing_htlcs,
            remote_sig_of_local: msg.remote_sig_of_local,
            local_sig_of_remote: msg.local_sig_of_remote,
        }
    }
}

/// Small helper trait so [`LastCrossSignedState::sig_material`] doesn't
/// need to import `LightningEncode` just to call `lightning_serialize`.
trait SerializeChecked {
    fn lightning_serialize_checked(&self) -> Vec<u8>;
}

impl SerializeChecked for UpdateAddHtlc {
    fn lightning_serialize_checked(&self) -> Vec<u8> {
        use lightning_encoding::LightningEncode;
        self.lightning_serialize()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ids::ChannelId;
    use crate::msgs::{OnionPacket, ONION_PACKET_SIZE};
    use amplify::Slice32;
    use bitcoin::secp256k1::Secp256k1;

    fn params(capacity: u64, initial_client: u64) -> InitHostedChannel {
        InitHostedChannel {
            max_htlc_value_in_flight_msat: capacity,
            htlc_minimum_msat: 1,
            max_accepted_htlcs: 30,
            channel_capacity_msat: capacity,
            initial_client_balance_msat: initial_client,
            features: 0,
        }
    }

    fn htlc(id: u64, amount_msat: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: ChannelId::default(),
            htlc_id: id,
            amount_msat,
            payment_hash: Slice32::from_inner([id as u8; 32]),
            cltv_expiry: 500_000,
            onion_routing_packet: OnionPacket::new(vec![0u8; ONION_PACKET_SIZE]),
        }
    }

    #[test]
    fn balances_sum_to_capacity() {
        let lcss = LastCrossSignedState::initial(true, vec![], params(1_000_000, 400_000), 100);
        lcss.check_invariants().unwrap();
        assert_eq!(lcss.local_balance_msat + lcss.remote_balance_msat, 1_000_000);
    }

    #[test]
    fn reverse_is_involution() {
        let lcss = LastCrossSignedState::initial(true, vec![1, 2, 3], params(1_000_000, 400_000), 100);
        assert_eq!(lcss, lcss.reverse().reverse());
    }

    #[test]
    fn reverse_swaps_role_and_balances() {
        let mut lcss = LastCrossSignedState::initial(true, vec![], params(1_000_000, 400_000), 100);
        lcss.outgoing_htlcs.push(htlc(0, 50_000));
        let rev = lcss.reverse();
        assert_eq!(rev.is_host, !lcss.is_host);
        assert_eq!(rev.local_balance_msat, lcss.remote_balance_msat);
        assert_eq!(rev.incoming_htlcs, lcss.outgoing_htlcs);
    }

    #[test]
    fn sign_and_verify_both_sides() {
        let secp = Secp256k1::new();
        let host_sk = bitcoin::secp256k1::SecretKey::from_slice(&[10u8; 32]).unwrap();
        let client_sk = bitcoin::secp256k1::SecretKey::from_slice(&[20u8; 32]).unwrap();
        let host_pk = PublicKey::from_secret_key(&secp, &host_sk);
        let client_pk = PublicKey::from_secret_key(&secp, &client_sk);

        let mut host_view = LastCrossSignedState::initial(true, vec![9, 9], params(1_000_000, 400_000), 10);
        host_view.sign_local(&host_sk);
        let mut client_view = host_view.reverse();
        client_view.sign_local(&client_sk);
        host_view.remote_sig_of_local = client_view.local_sig_of_remote;

        assert!(host_view.verify_signatures(&host_pk, &client_pk));
        assert!(client_view.verify_signatures(&client_pk, &host_pk));
    }

    #[test]
    fn htlc_below_minimum_is_rejected() {
        let mut lcss = LastCrossSignedState::initial(true, vec![], params(1_000_000, 400_000), 10);
        lcss.params.htlc_minimum_msat = 1_000;
        lcss.outgoing_htlcs.push(htlc(0, 500));
        assert!(matches!(
            lcss.check_invariants(),
            Err(ChannelError::HtlcBelowMinimum { .. })
        ));
    }
}
