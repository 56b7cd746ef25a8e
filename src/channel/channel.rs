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

//! The per-peer channel state machine (`spec.md` §4.2-§4.6).

use std::collections::HashMap;

use amplify::Slice32;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use tokio::sync::oneshot;

use crate::config::HostedChannelsConfig;
use crate::crypto;
use crate::error::ChannelError;
use crate::ids::{ChannelId, ShortChannelId};
use crate::lcss::LastCrossSignedState;
use crate::msgs::{
    InitHostedChannel, InitHostedChannelMsg, InvokeHostedChannel, LastCrossSignedStateMsg, OnionPacket, PeerMessage,
    ResizeChannel, StateOverride, StateUpdate, UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc,
    UpdateFulfillHtlc,
};

use super::state::Lifecycle;
use super::updates::{apply_update, Origin, PendingUpdate, UncommittedUpdate};

/// How an outgoing HTLC this channel added eventually resolves
/// (`spec.md` §4.4, §9 "Futures/callbacks").
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum HtlcOutcome {
    Fulfilled { preimage: Slice32 },
    Failed { reason: Vec<u8> },
    FailedMalformed { sha256_of_onion: Slice32, failure_code: u16 },
}

/// The awaitable handle returned by [`Channel::queue_add_htlc`]. Completes
/// once the HTLC commits to fulfilled or failed, or is dropped with a
/// failure if the channel suspends or disconnects first
/// (`spec.md` §5, "Cancellation").
pub struct HtlcResolutionHandle(oneshot::Receiver<HtlcOutcome>);

impl HtlcResolutionHandle {
    pub async fn resolve(self) -> HtlcOutcome {
        self.0.await.unwrap_or(HtlcOutcome::Failed {
            reason: b"channel dropped before resolution".to_vec(),
        })
    }

    pub fn try_resolve(&mut self) -> Option<HtlcOutcome> {
        self.0.try_recv().ok()
    }
}

/// Side effects a channel produces in response to a message or timer tick.
/// [`crate::channel_master::ChannelMaster`] is responsible for actually
/// carrying these out against [`crate::node::NodeInterface`]
/// (`spec.md` §9, "Cyclic references").
#[derive(Clone, PartialEq, Debug)]
pub enum ChannelAction {
    SendMessage(PeerMessage),

    /// A new HTLC the remote side added just committed to our
    /// `incoming_htlcs`; route it onward or settle it.
    NewIncomingHtlc(UpdateAddHtlc),

    /// An in-flight HTLC was discarded without resolution (channel
    /// suspension, disconnect, or state override); the owning forward's
    /// incoming leg must be failed upstream.
    HtlcDropped { htlc_id: u64, reason: Vec<u8> },

    Suspended { error: ChannelError },
}

/// Per-peer hosted channel state machine.
pub struct Channel {
    peer: PublicKey,
    local_pubkey: PublicKey,
    is_host: bool,
    chain_hash: Slice32,
    config: HostedChannelsConfig,

    status: Lifecycle,
    current_lcss: Option<LastCrossSignedState>,
    uncommitted: Vec<UncommittedUpdate>,
    pending_resize: Option<(u64, Signature)>,
    pending_initial: Option<LastCrossSignedState>,
    pending_override: Option<LastCrossSignedState>,

    /// `(block_day, local_updates, remote_updates)` of the last `StateUpdate`
    /// we ourselves proposed and haven't seen committed yet. Lets
    /// `finalize_candidate` tell "the peer is echoing a proposal we already
    /// made" apart from "the peer proposed first and we must reply in kind"
    /// without a separate flag per call site.
    self_proposed_for: Option<(u32, u32, u32)>,

    next_local_htlc_id: u64,
    resolutions: HashMap<u64, oneshot::Sender<HtlcOutcome>>,

    current_block_height: u32,
    current_block_day: u32,
    retry_count: u8,

    refund_script_pubkey: Vec<u8>,
}

impl Channel {
    pub fn new(
        peer: PublicKey,
        local_pubkey: PublicKey,
        is_host: bool,
        chain_hash: Slice32,
        config: HostedChannelsConfig,
    ) -> Self {
        Channel {
            peer,
            local_pubkey,
            is_host,
            chain_hash,
            config,
            status: Lifecycle::Offline,
            current_lcss: None,
            uncommitted: Vec::new(),
            pending_resize: None,
            pending_initial: None,
            pending_override: None,
            self_proposed_for: None,
            next_local_htlc_id: 0,
            resolutions: HashMap::new(),
            current_block_height: 0,
            current_block_day: 0,
            retry_count: 0,
            refund_script_pubkey: Vec::new(),
        }
    }

    /// Rehydrates a channel that already has a persisted, cross-signed
    /// LCSS (`spec.md` §3, "Lifecycles": a channel persists forever once
    /// cross-signed).
    pub fn from_stored(
        peer: PublicKey,
        local_pubkey: PublicKey,
        chain_hash: Slice32,
        config: HostedChannelsConfig,
        lcss: LastCrossSignedStateMsg,
    ) -> Self {
        let lcss = LastCrossSignedState::from_wire(lcss);
        let is_host = lcss.is_host;
        let refund_script_pubkey = lcss.refund_script_pubkey.clone();
        let block_day = lcss.block_day;
        Channel {
            peer,
            local_pubkey,
            is_host,
            chain_hash,
            config,
            status: Lifecycle::Offline,
            current_lcss: Some(lcss),
            uncommitted: Vec::new(),
            pending_resize: None,
            pending_initial: None,
            pending_override: None,
            self_proposed_for: None,
            next_local_htlc_id: 0,
            resolutions: HashMap::new(),
            current_block_height: block_day * 144,
            current_block_day: block_day,
            retry_count: 0,
            refund_script_pubkey,
        }
    }

    pub fn peer(&self) -> PublicKey {
        self.peer
    }

    pub fn is_host(&self) -> bool {
        self.is_host
    }

    pub fn status(&self) -> Lifecycle {
        self.status
    }

    pub fn current_lcss(&self) -> Option<&LastCrossSignedState> {
        self.current_lcss.as_ref()
    }

    pub fn channel_id(&self) -> ChannelId {
        let (host, client) = self.ordered_pubkeys();
        ChannelId::derive(&host, &client)
    }

    pub fn short_channel_id(&self) -> ShortChannelId {
        let (host, client) = self.ordered_pubkeys();
        ShortChannelId::derive(&host, &client)
    }

    fn ordered_pubkeys(&self) -> (PublicKey, PublicKey) {
        if self.is_host {
            (self.local_pubkey, self.peer)
        } else {
            (self.peer, self.local_pubkey)
        }
    }

    // ---- connection lifecycle --------------------------------------

    /// `spec.md` §4.2: a peer connection opens the handshake, or, for an
    /// already cross-signed channel, a resync.
    pub fn on_peer_connected(&mut self, invoke_refund_script_pubkey: Vec<u8>) -> Vec<ChannelAction> {
        self.status = Lifecycle::Opening;
        if self.is_host {
            // Host waits for InvokeHostedChannel / LastCrossSignedState.
            return vec![];
        }
        self.refund_script_pubkey = invoke_refund_script_pubkey;
        if let Some(lcss) = &self.current_lcss {
            vec![ChannelAction::SendMessage(PeerMessage::LastCrossSignedState(lcss.to_wire()))]
        } else {
            vec![ChannelAction::SendMessage(PeerMessage::InvokeHostedChannel(InvokeHostedChannel {
                chain_hash: self.chain_hash,
                refund_script_pubkey: self.refund_script_pubkey.clone(),
            }))]
        }
    }

    /// `spec.md` §5, "Shared resources": reconnect re-enters Offline, and
    /// all pending resolutions fail (`spec.md` §5, "Cancellation").
    pub fn on_peer_disconnected(&mut self) -> Vec<ChannelAction> {
        self.status = Lifecycle::Offline;
        self.uncommitted.clear();
        self.pending_initial = None;
        self.pending_override = None;
        let mut actions = Vec::new();
        for (htlc_id, sender) in self.resolutions.drain() {
            let _ = sender.send(HtlcOutcome::Failed {
                reason: b"peer disconnected before resolution".to_vec(),
            });
            actions.push(ChannelAction::HtlcDropped {
                htlc_id,
                reason: b"peer disconnected".to_vec(),
            });
        }
        actions
    }

    /// `spec.md` §4.7: ChannelMaster fans this out on its 1-minute timer.
    /// Recomputes `blockDay` and runs the CLTV timeout scan of §4.4.
    pub fn on_block_updated(&mut self, height: u32, safety_delta: Option<u32>) -> Vec<ChannelAction> {
        self.current_block_height = height;
        self.current_block_day = height / 144;

        if self.status != Lifecycle::Active {
            return vec![];
        }

        let safety_delta = safety_delta.unwrap_or(self.config.cltv_safety_delta);
        let stale: Vec<u64> = self
            .current_lcss
            .as_ref()
            .map(|lcss| {
                lcss.outgoing_htlcs
                    .iter()
                    .filter(|h| h.cltv_expiry <= height + safety_delta)
                    .map(|h| h.htlc_id)
                    .collect()
            })
            .unwrap_or_default();

        if stale.is_empty() {
            return vec![];
        }

        let error = ChannelError::StaleBlockDay;
        let mut actions = self.suspend(error.clone());
        for htlc_id in stale {
            actions.push(ChannelAction::HtlcDropped {
                htlc_id,
                reason: b"cltv expiry too close to current block".to_vec(),
            });
        }
        actions
    }

    fn suspend(&mut self, error: ChannelError) -> Vec<ChannelAction> {
        self.status = Lifecycle::Suspended;
        self.uncommitted.clear();
        let channel_id = self.channel_id();
        let mut actions = vec![ChannelAction::SendMessage(PeerMessage::Error(crate::msgs::Error::new(
            channel_id,
            error.to_string(),
        )))];
        for (_, sender) in self.resolutions.drain() {
            let _ = sender.send(HtlcOutcome::Failed {
                reason: error.to_string().into_bytes(),
            });
        }
        actions.push(ChannelAction::Suspended { error });
        actions
    }

    // ---- inbound message dispatch -----------------------------------

    pub fn handle_message(&mut self, msg: PeerMessage, local_secret_key: &SecretKey) -> Vec<ChannelAction> {
        if (self.is_host && msg.is_host_only()) || (!self.is_host && msg.is_client_only()) {
            let channel_id = self.channel_id();
            return vec![ChannelAction::SendMessage(PeerMessage::Error(crate::msgs::Error::new(
                channel_id,
                "message direction not permitted for this role",
            )))];
        }

        let result = match msg {
            PeerMessage::Error(e) => {
                self.status = Lifecycle::Suspended;
                self.uncommitted.clear();
                Ok(vec![ChannelAction::Suspended {
                    error: ChannelError::PeerReported(e.message()),
                }])
            }
            PeerMessage::InvokeHostedChannel(m) => self.handle_invoke(m),
            PeerMessage::InitHostedChannel(m) => self.handle_init(m, local_secret_key),
            PeerMessage::LastCrossSignedState(m) => self.handle_resync(m, local_secret_key),
            PeerMessage::StateUpdate(m) => self.handle_state_update(m, local_secret_key),
            PeerMessage::StateOverride(m) => self.handle_state_override(m, local_secret_key),
            PeerMessage::ResizeChannel(m) => self.handle_resize_proposal(m),
            PeerMessage::UpdateAddHtlc(h) => self.propose_remote_update(PendingUpdate::AddHtlc(h)),
            PeerMessage::UpdateFulfillHtlc(h) => self.propose_remote_update(PendingUpdate::FulfillHtlc(h)),
            PeerMessage::UpdateFailHtlc(h) => self.propose_remote_update(PendingUpdate::FailHtlc(h)),
            PeerMessage::UpdateFailMalformedHtlc(h) => self.propose_remote_update(PendingUpdate::FailMalformedHtlc(h)),
            // Gossip and cosmetic messages are out of scope for state
            // transitions (`spec.md` §9(c)); pass through untouched.
            other @ (PeerMessage::HostedChannelBranding(_)
            | PeerMessage::AnnouncementSignature(_)
            | PeerMessage::AskBrandingInfo(_)
            | PeerMessage::QueryPublicHostedChannels(_)
            | PeerMessage::ReplyPublicHostedChannels(_)
            | PeerMessage::QueryPreimages(_)
            | PeerMessage::ReplyPreimages(_)
            | PeerMessage::ChannelUpdate(_)
            | PeerMessage::ChannelAnnouncement(_)) => {
                let _ = other;
                Ok(vec![])
            }
        };

        match result {
            Ok(actions) => actions,
            Err(error) => self.suspend(error),
        }
    }

    fn handle_invoke(&mut self, msg: InvokeHostedChannel) -> Result<Vec<ChannelAction>, ChannelError> {
        if msg.chain_hash != self.chain_hash {
            return Err(ChannelError::PeerReported("unknown chain hash".into()));
        }
        self.refund_script_pubkey = msg.refund_script_pubkey;
        self.status = Lifecycle::Opening;
        let params = InitHostedChannel {
            max_htlc_value_in_flight_msat: self.config.default_max_htlc_value_in_flight_msat,
            htlc_minimum_msat: self.config.default_htlc_minimum_msat,
            max_accepted_htlcs: self.config.default_max_accepted_htlcs,
            channel_capacity_msat: self.config.default_channel_capacity_msat,
            initial_client_balance_msat: self.config.default_initial_client_balance_msat,
            features: 0,
        };
        self.pending_initial = Some(LastCrossSignedState::initial(
            true,
            self.refund_script_pubkey.clone(),
            params,
            self.current_block_day,
        ));
        Ok(vec![ChannelAction::SendMessage(PeerMessage::InitHostedChannel(InitHostedChannelMsg { params }))])
    }

    fn handle_init(
        &mut self,
        msg: InitHostedChannelMsg,
        local_secret_key: &SecretKey,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        let mut lcss = LastCrossSignedState::initial(
            false,
            self.refund_script_pubkey.clone(),
            msg.params,
            self.current_block_day,
        );
        lcss.sign_local(local_secret_key);
        let sig_of_remote_next_lcss = lcss.local_sig_of_remote;
        self.pending_initial = Some(lcss);
        self.self_proposed_for = Some((self.current_block_day, 0, 0));
        Ok(vec![ChannelAction::SendMessage(PeerMessage::StateUpdate(StateUpdate {
            block_day: self.current_block_day,
            local_updates: 0,
            remote_updates: 0,
            sig_of_remote_next_lcss,
        }))])
    }

    fn handle_resync(
        &mut self,
        msg: LastCrossSignedStateMsg,
        local_secret_key: &SecretKey,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        let theirs = LastCrossSignedState::from_wire(msg);
        match &self.current_lcss {
            Some(ours) if *ours == theirs.reverse() => {
                self.status = Lifecycle::Active;
                Ok(vec![ChannelAction::SendMessage(PeerMessage::LastCrossSignedState(ours.to_wire()))])
            }
            Some(ours) => Err(ChannelError::CounterMismatch {
                ours: ours.local_updates,
                theirs: theirs.remote_updates,
                retries: 0,
            }),
            None => {
                // We invoked but have no state yet; treat their LCSS as the
                // InitHostedChannel-equivalent starting point.
                let mut candidate = theirs.reverse();
                candidate.sign_local(local_secret_key);
                let sig_of_remote_next_lcss = candidate.local_sig_of_remote;
                self.pending_initial = Some(candidate);
                self.self_proposed_for = Some((self.current_block_day, 0, 0));
                Ok(vec![ChannelAction::SendMessage(PeerMessage::StateUpdate(StateUpdate {
                    block_day: self.current_block_day,
                    local_updates: 0,
                    remote_updates: 0,
                    sig_of_remote_next_lcss,
                }))])
            }
        }
    }

    fn handle_state_update(
        &mut self,
        msg: StateUpdate,
        local_secret_key: &SecretKey,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        if self.block_day_is_stale(msg.block_day) {
            return Err(ChannelError::StaleBlockDay);
        }

        // Opening handshake completion: we already hold a candidate built
        // from InitHostedChannel / the reconnect resync path.
        if let Some(candidate) = self.pending_initial.take() {
            return self.finalize_candidate(candidate, msg, local_secret_key);
        }

        if self.status == Lifecycle::Overriding {
            if let Some(candidate) = self.pending_override.take() {
                return self.finalize_candidate(candidate, msg, local_secret_key);
            }
        }

        let candidate = self.build_candidate()?;
        let our_local_updates = candidate.local_updates;
        let our_remote_updates = candidate.remote_updates;

        if msg.remote_updates != our_local_updates || msg.local_updates != our_remote_updates {
            self.retry_count += 1;
            if self.retry_count > self.config.counter_mismatch_retries {
                return Err(ChannelError::CounterMismatch {
                    ours: our_local_updates,
                    theirs: msg.local_updates,
                    retries: self.retry_count,
                });
            }
            let retry = self.propose_state_update_message(local_secret_key)?;
            self.self_proposed_for = Some((retry.block_day, retry.local_updates, retry.remote_updates));
            return Ok(vec![ChannelAction::SendMessage(PeerMessage::StateUpdate(retry))]);
        }

        self.finalize_candidate(candidate, msg, local_secret_key)
    }

    /// Common tail of `handle_state_update`: verify the peer's signature
    /// against `candidate`, sign our own side, commit, and surface the
    /// resolutions that just fired (`spec.md` §4.3 step 3). Echoes our own
    /// `StateUpdate` back only if the peer proposed first — if `candidate`
    /// matches what we ourselves last proposed via `self_proposed_for`, the
    /// peer's message is itself the reply and no further echo is sent.
    fn finalize_candidate(
        &mut self,
        mut candidate: LastCrossSignedState,
        msg: StateUpdate,
        local_secret_key: &SecretKey,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        candidate.block_day = msg.block_day;
        candidate.local_updates = msg.remote_updates;
        candidate.remote_updates = msg.local_updates;

        if !crypto::verify(&self.peer, &candidate.hosted_sig_hash(), &msg.sig_of_remote_next_lcss) {
            return Err(ChannelError::BadSignature);
        }
        candidate.remote_sig_of_local = msg.sig_of_remote_next_lcss;
        candidate.sign_local(local_secret_key);
        candidate.check_invariants()?;

        let echo_reply =
            self.self_proposed_for != Some((candidate.block_day, candidate.local_updates, candidate.remote_updates));
        self.self_proposed_for = None;

        let resolved = std::mem::take(&mut self.uncommitted);
        self.current_lcss = Some(candidate.clone());
        self.uncommitted.clear();
        self.pending_resize = None;
        self.retry_count = 0;
        self.status = Lifecycle::Active;

        let mut actions = Vec::new();
        if echo_reply {
            actions.push(ChannelAction::SendMessage(PeerMessage::StateUpdate(StateUpdate {
                block_day: candidate.block_day,
                local_updates: candidate.local_updates,
                remote_updates: candidate.remote_updates,
                sig_of_remote_next_lcss: candidate.local_sig_of_remote,
            })));
        }
        for pending in resolved {
            match pending.update {
                PendingUpdate::AddHtlc(htlc) if pending.origin == Origin::Remote => {
                    actions.push(ChannelAction::NewIncomingHtlc(htlc));
                }
                PendingUpdate::AddHtlc(_) => {}
                PendingUpdate::FulfillHtlc(f) => {
                    if let Some(sender) = self.resolutions.remove(&f.htlc_id) {
                        let _ = sender.send(HtlcOutcome::Fulfilled {
                            preimage: f.payment_preimage,
                        });
                    }
                }
                PendingUpdate::FailHtlc(f) => {
                    if let Some(sender) = self.resolutions.remove(&f.htlc_id) {
                        let _ = sender.send(HtlcOutcome::Failed { reason: f.reason });
                    }
                }
                PendingUpdate::FailMalformedHtlc(f) => {
                    if let Some(sender) = self.resolutions.remove(&f.htlc_id) {
                        let _ = sender.send(HtlcOutcome::FailedMalformed {
                            sha256_of_onion: f.sha256_of_onion,
                            failure_code: f.failure_code,
                        });
                    }
                }
            }
        }
        Ok(actions)
    }

    fn block_day_is_stale(&self, peer_block_day: u32) -> bool {
        let diff = (peer_block_day as i64 - self.current_block_day as i64).abs();
        diff > self.config.block_day_staleness_tolerance as i64
    }

    /// Builds the candidate next LCSS by applying `uncommitted` in the
    /// canonical order required by `spec.md` §4.3, "Ordering & tie-breaks":
    /// all local-origin updates in proposal order, then all remote-origin
    /// updates in proposal order. Also folds in any pending resize
    /// (`spec.md` §4.5).
    fn build_candidate(&self) -> Result<LastCrossSignedState, ChannelError> {
        let base = self
            .current_lcss
            .as_ref()
            .ok_or(ChannelError::NotActive("no committed LCSS yet"))?;
        let mut candidate = base.clone();

        for pending in self.uncommitted.iter().filter(|u| u.origin == Origin::Local) {
            apply_update(&mut candidate, pending)?;
        }
        for pending in self.uncommitted.iter().filter(|u| u.origin == Origin::Remote) {
            apply_update(&mut candidate, pending)?;
        }

        if let Some((new_capacity_sat, _)) = self.pending_resize {
            let new_capacity_msat = new_capacity_sat * 1000;
            let delta = new_capacity_msat.saturating_sub(candidate.params.channel_capacity_msat);
            candidate.params.channel_capacity_msat = new_capacity_msat;
            if self.is_host {
                candidate.local_balance_msat += delta;
            } else {
                candidate.remote_balance_msat += delta;
            }
        }

        let local_count = self.uncommitted.iter().filter(|u| u.origin == Origin::Local).count() as u32;
        let remote_count = self.uncommitted.iter().filter(|u| u.origin == Origin::Remote).count() as u32;
        candidate.local_updates = base.local_updates + local_count;
        candidate.remote_updates = base.remote_updates + remote_count;
        candidate.block_day = self.current_block_day;
        Ok(candidate)
    }

    fn propose_state_update_message(&self, local_secret_key: &SecretKey) -> Result<StateUpdate, ChannelError> {
        let mut candidate = self.build_candidate()?;
        candidate.sign_local(local_secret_key);
        Ok(StateUpdate {
            block_day: candidate.block_day,
            local_updates: candidate.local_updates,
            remote_updates: candidate.remote_updates,
            sig_of_remote_next_lcss: candidate.local_sig_of_remote,
        })
    }

    /// Called whenever local state wants to push its uncommitted updates
    /// to the peer (`spec.md` §4.3 steps 1-2). Returns `None` if there is
    /// nothing uncommitted and no pending resize.
    pub fn propose_state_update(&mut self, local_secret_key: &SecretKey) -> Result<Option<PeerMessage>, ChannelError> {
        if self.status != Lifecycle::Active {
            return Ok(None);
        }
        if self.uncommitted.is_empty() && self.pending_resize.is_none() {
            return Ok(None);
        }
        let msg = self.propose_state_update_message(local_secret_key)?;
        self.self_proposed_for = Some((msg.block_day, msg.local_updates, msg.remote_updates));
        Ok(Some(PeerMessage::StateUpdate(msg)))
    }

    fn propose_remote_update(&mut self, update: PendingUpdate) -> Result<Vec<ChannelAction>, ChannelError> {
        if !self.status.accepts_updates() {
            return Err(ChannelError::ChannelSuspended);
        }
        self.uncommitted.push(UncommittedUpdate {
            origin: Origin::Remote,
            update,
        });
        Ok(vec![])
    }

    // ---- HTLC lifecycle (`spec.md` §4.4) -----------------------------

    /// Proposes an outgoing HTLC as a local update. Returns its id, an
    /// awaitable resolution handle (`spec.md` §9, "Futures/callbacks"),
    /// and the `UpdateAddHtlc` the caller must send to the peer before
    /// the next `StateUpdate` commits it.
    pub fn queue_add_htlc(
        &mut self,
        amount_msat: u64,
        payment_hash: Slice32,
        cltv_expiry: u32,
        onion: OnionPacket,
    ) -> Result<(u64, HtlcResolutionHandle, PeerMessage), ChannelError> {
        if !self.status.accepts_updates() {
            return Err(ChannelError::ChannelSuspended);
        }

        let htlc_id = self.next_local_htlc_id;
        let htlc = UpdateAddHtlc {
            channel_id: self.channel_id(),
            htlc_id,
            amount_msat,
            payment_hash,
            cltv_expiry,
            onion_routing_packet: onion,
        };

        let mut candidate = self.build_candidate()?;
        super::updates::apply_update(
            &mut candidate,
            &UncommittedUpdate {
                origin: Origin::Local,
                update: PendingUpdate::AddHtlc(htlc.clone()),
            },
        )?;
        candidate.check_invariants()?;

        self.next_local_htlc_id += 1;
        self.uncommitted.push(UncommittedUpdate {
            origin: Origin::Local,
            update: PendingUpdate::AddHtlc(htlc.clone()),
        });

        let (tx, rx) = oneshot::channel();
        self.resolutions.insert(htlc_id, tx);
        Ok((htlc_id, HtlcResolutionHandle(rx), PeerMessage::UpdateAddHtlc(htlc)))
    }

    pub fn queue_fulfill_htlc(&mut self, htlc_id: u64, payment_preimage: Slice32) -> Result<PeerMessage, ChannelError> {
        if !self.status.accepts_updates() {
            return Err(ChannelError::ChannelSuspended);
        }
        let msg = UpdateFulfillHtlc {
            channel_id: self.channel_id(),
            htlc_id,
            payment_preimage,
        };
        self.uncommitted.push(UncommittedUpdate {
            origin: Origin::Local,
            update: PendingUpdate::FulfillHtlc(msg),
        });
        Ok(PeerMessage::UpdateFulfillHtlc(msg))
    }

    pub fn queue_fail_htlc(&mut self, htlc_id: u64, reason: Vec<u8>) -> Result<PeerMessage, ChannelError> {
        if !self.status.accepts_updates() {
            return Err(ChannelError::ChannelSuspended);
        }
        let msg = UpdateFailHtlc {
            channel_id: self.channel_id(),
            htlc_id,
            reason,
        };
        self.uncommitted.push(UncommittedUpdate {
            origin: Origin::Local,
            update: PendingUpdate::FailHtlc(msg.clone()),
        });
        Ok(PeerMessage::UpdateFailHtlc(msg))
    }

    pub fn queue_fail_malformed_htlc(
        &mut self,
        htlc_id: u64,
        sha256_of_onion: Slice32,
        failure_code: u16,
    ) -> Result<PeerMessage, ChannelError> {
        if !self.status.accepts_updates() {
            return Err(ChannelError::ChannelSuspended);
        }
        let msg = UpdateFailMalformedHtlc {
            channel_id: self.channel_id(),
            htlc_id,
            sha256_of_onion,
            failure_code,
        };
        self.uncommitted.push(UncommittedUpdate {
            origin: Origin::Local,
            update: PendingUpdate::FailMalformedHtlc(msg),
        });
        Ok(PeerMessage::UpdateFailMalformedHtlc(msg))
    }

    // ---- resize (`spec.md` §4.5) -------------------------------------

    /// Client side: proposes a capacity increase.
    pub fn propose_resize(&mut self, new_capacity_sat: u64, local_secret_key: &SecretKey) -> Result<PeerMessage, ChannelError> {
        if self.is_host {
            return Err(ChannelError::NotActive("only the client proposes a resize"));
        }
        let current = self
            .current_lcss
            .as_ref()
            .ok_or(ChannelError::NotActive("no committed LCSS yet"))?
            .params
            .channel_capacity_msat;
        if new_capacity_sat * 1000 <= current {
            return Err(ChannelError::ResizeNotGrowth {
                proposed: new_capacity_sat,
                current: current / 1000,
            });
        }
        let sig = crypto::sign(local_secret_key, &crypto::sha256(&new_capacity_sat.to_le_bytes()));
        self.pending_resize = Some((new_capacity_sat, sig));
        Ok(PeerMessage::ResizeChannel(ResizeChannel {
            new_capacity_sat,
            client_sig: sig,
        }))
    }

    fn handle_resize_proposal(&mut self, msg: ResizeChannel) -> Result<Vec<ChannelAction>, ChannelError> {
        if !self.status.accepts_updates() {
            return Err(ChannelError::ChannelSuspended);
        }
        let current = self
            .current_lcss
            .as_ref()
            .ok_or(ChannelError::NotActive("no committed LCSS yet"))?
            .params
            .channel_capacity_msat;
        if msg.new_capacity_sat * 1000 <= current {
            return Err(ChannelError::ResizeNotGrowth {
                proposed: msg.new_capacity_sat,
                current: current / 1000,
            });
        }
        if !crypto::verify(
            &self.peer,
            &crypto::sha256(&msg.new_capacity_sat.to_le_bytes()),
            &msg.client_sig,
        ) {
            return Err(ChannelError::BadSignature);
        }
        self.pending_resize = Some((msg.new_capacity_sat, msg.client_sig));
        Ok(vec![])
    }

    // ---- state override (`spec.md` §4.6) -----------------------------

    /// Host side: forces a fresh, HTLC-free state on a suspended channel.
    /// Any HTLC still in flight on this channel is dropped by the override
    /// (`spec.md` §4.6, §8 "S6"); the returned actions let the caller fail
    /// each one upstream the same way a disconnect or suspension would.
    pub fn issue_override(
        &mut self,
        new_local_balance_msat: u64,
        local_secret_key: &SecretKey,
    ) -> Result<(PeerMessage, Vec<ChannelAction>), ChannelError> {
        if !self.is_host {
            return Err(ChannelError::NotActive("only the host issues a state override"));
        }
        if self.status != Lifecycle::Suspended {
            return Err(ChannelError::NotActive(self.status.name()));
        }
        let base = self
            .current_lcss
            .as_ref()
            .ok_or(ChannelError::NotActive("no committed LCSS yet"))?;
        let capacity = base.params.channel_capacity_msat;
        if new_local_balance_msat > capacity {
            return Err(ChannelError::BalanceMismatch {
                local: new_local_balance_msat,
                remote: 0,
                capacity,
            });
        }

        let dropped: Vec<u64> = base
            .incoming_htlcs
            .iter()
            .chain(base.outgoing_htlcs.iter())
            .map(|h| h.htlc_id)
            .collect();

        let mut candidate = base.clone();
        candidate.block_day = self.current_block_day;
        candidate.local_balance_msat = new_local_balance_msat;
        candidate.remote_balance_msat = capacity - new_local_balance_msat;
        candidate.local_updates = base.local_updates.wrapping_add(1);
        candidate.remote_updates = base.remote_updates;
        candidate.incoming_htlcs.clear();
        candidate.outgoing_htlcs.clear();
        candidate.sign_local(local_secret_key);
        let sig = candidate.local_sig_of_remote;

        self.status = Lifecycle::Overriding;
        self.pending_override = Some(candidate);
        let msg = PeerMessage::StateOverride(StateOverride {
            block_day: self.current_block_day,
            local_balance_msat: new_local_balance_msat,
            local_updates: base.local_updates.wrapping_add(1),
            remote_updates: base.remote_updates,
            sig,
        });
        let actions = dropped
            .into_iter()
            .map(|htlc_id| ChannelAction::HtlcDropped {
                htlc_id,
                reason: b"channel overridden".to_vec(),
            })
            .collect();
        Ok((msg, actions))
    }

    /// Client side: evaluates a host's forced override. Does not commit by
    /// itself — acceptance is an explicit, out-of-band decision
    /// (`spec.md` §4.6, "if it accepts manually"); on acceptance, call
    /// [`Channel::accept_override`].
    pub fn handle_state_override(
        &mut self,
        msg: StateOverride,
        _local_secret_key: &SecretKey,
    ) -> Result<Vec<ChannelAction>, ChannelError> {
        let base = self
            .current_lcss
            .as_ref()
            .ok_or(ChannelError::NotActive("no committed LCSS yet"))?
            .clone();
        let capacity = base.params.channel_capacity_msat;

        let mut candidate = base.clone();
        candidate.block_day = msg.block_day;
        candidate.local_balance_msat = capacity.saturating_sub(msg.local_balance_msat);
        candidate.remote_balance_msat = msg.local_balance_msat;
        candidate.local_updates = msg.remote_updates;
        candidate.remote_updates = msg.local_updates;
        candidate.incoming_htlcs.clear();
        candidate.outgoing_htlcs.clear();

        if !crypto::verify(&self.peer, &candidate.hosted_sig_hash(), &msg.sig) {
            return Err(ChannelError::BadSignature);
        }
        candidate.remote_sig_of_local = msg.sig;

        let dropped: Vec<u64> = base
            .incoming_htlcs
            .iter()
            .chain(base.outgoing_htlcs.iter())
            .map(|h| h.htlc_id)
            .collect();

        self.pending_override = Some(candidate);
        self.status = Lifecycle::Overriding;

        let mut actions: Vec<ChannelAction> = dropped
            .into_iter()
            .map(|htlc_id| ChannelAction::HtlcDropped {
                htlc_id,
                reason: b"channel overridden".to_vec(),
            })
            .collect();
        actions.push(ChannelAction::Suspended {
            error: ChannelError::NotActive("awaiting manual override acceptance"),
        });
        Ok(actions)
    }

    /// Client side: the operator accepted the pending override; countersign,
    /// commit locally (the host's signature was already verified in
    /// [`Channel::handle_state_override`]) and send the confirming
    /// `StateUpdate` for the host to countersign in turn.
    pub fn accept_override(&mut self, local_secret_key: &SecretKey) -> Result<PeerMessage, ChannelError> {
        let mut candidate = self
            .pending_override
            .take()
            .ok_or(ChannelError::NotActive("no pending override"))?;
        candidate.sign_local(local_secret_key);
        let msg = StateUpdate {
            block_day: candidate.block_day,
            local_updates: candidate.local_updates,
            remote_updates: candidate.remote_updates,
            sig_of_remote_next_lcss: candidate.local_sig_of_remote,
        };
        self.current_lcss = Some(candidate);
        self.uncommitted.clear();
        self.retry_count = 0;
        self.status = Lifecycle::Active;
        Ok(PeerMessage::StateUpdate(msg))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::msgs::ONION_PACKET_SIZE;
    use bitcoin::secp256k1::Secp256k1;

    fn keypair(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    fn open_pair() -> (Channel, Channel, SecretKey, SecretKey) {
        let (host_sk, host_pk) = keypair(10);
        let (client_sk, client_pk) = keypair(20);
        let chain_hash = Slice32::from_inner([0u8; 32]);
        let mut config = HostedChannelsConfig::default();
        config.default_channel_capacity_msat = 1_000_000;
        config.default_max_htlc_value_in_flight_msat = 1_000_000;
        config.default_htlc_minimum_msat = 1;
        config.default_max_accepted_htlcs = 30;
        config.default_initial_client_balance_msat = 400_000;

        let mut host = Channel::new(client_pk, host_pk, true, chain_hash, config);
        let mut client = Channel::new(host_pk, client_pk, false, chain_hash, config);

        let client_actions = client.on_peer_connected(vec![9, 9]);
        let invoke = match &client_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            _ => panic!("expected invoke"),
        };
        host.on_peer_connected(vec![]);
        let host_actions = host.handle_message(invoke, &host_sk);
        let init = match &host_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            _ => panic!("expected init"),
        };

        let client_actions = client.handle_message(init, &client_sk);
        let state_update_1 = match &client_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            _ => panic!("expected state_update"),
        };

        let host_actions = host.handle_message(state_update_1, &host_sk);
        let state_update_2 = match &host_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            _ => panic!("expected state_update echo"),
        };
        assert_eq!(host.status(), Lifecycle::Active);

        let client_actions = client.handle_message(state_update_2, &client_sk);
        assert!(client_actions.is_empty());
        assert_eq!(client.status(), Lifecycle::Active);

        (host, client, host_sk, client_sk)
    }

    #[test]
    fn s1_open_handshake_reaches_active_with_zero_counters() {
        let (host, client, _host_sk, _client_sk) = open_pair();
        let host_lcss = host.current_lcss().unwrap();
        let client_lcss = client.current_lcss().unwrap();
        assert_eq!(host_lcss.local_updates, 0);
        assert_eq!(host_lcss.remote_updates, 0);
        assert_eq!(client_lcss.local_updates, 0);
        assert_eq!(client_lcss.remote_updates, 0);
        assert_eq!(*host_lcss, client_lcss.reverse());
    }

    #[test]
    fn s2_add_then_fulfill_moves_balance_by_htlc_amount() {
        let (mut host, mut client, host_sk, client_sk) = open_pair();

        let payment_hash = crypto::sha256(&[0x77; 32]);
        let (htlc_id, _handle, add_msg) = client
            .queue_add_htlc(
                50_000,
                Slice32::from_inner(payment_hash.into_inner()),
                500_000,
                OnionPacket::new(vec![0u8; ONION_PACKET_SIZE]),
            )
            .unwrap();
        assert!(host.handle_message(add_msg, &host_sk).is_empty());

        let propose = client.propose_state_update(&client_sk).unwrap().unwrap();
        let host_actions = host.handle_message(propose, &host_sk);
        let echo = match &host_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            other => panic!("expected echo state_update, got {:?}", other),
        };
        assert!(host_actions
            .iter()
            .any(|a| matches!(a, ChannelAction::NewIncomingHtlc(h) if h.htlc_id == htlc_id)));

        let client_actions = client.handle_message(echo, &client_sk);
        assert!(client_actions.is_empty());

        let client_lcss = client.current_lcss().unwrap();
        assert_eq!(client_lcss.outgoing_htlcs.len(), 1);
        assert_eq!(client_lcss.local_balance_msat, 400_000);

        let fulfill_msg = host.queue_fulfill_htlc(htlc_id, Slice32::from_inner([0x77; 32])).unwrap();
        assert!(client.handle_message(fulfill_msg, &client_sk).is_empty());
        let propose = host.propose_state_update(&host_sk).unwrap().unwrap();
        let client_actions = client.handle_message(propose, &client_sk);
        let echo = match &client_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            other => panic!("expected echo state_update, got {:?}", other),
        };
        host.handle_message(echo, &host_sk);

        let client_lcss = client.current_lcss().unwrap();
        let host_lcss = host.current_lcss().unwrap();
        assert_eq!(client_lcss.local_balance_msat, 350_000);
        assert_eq!(client_lcss.remote_balance_msat, 650_000);
        assert_eq!(host_lcss.local_balance_msat, 650_000);
        assert_eq!(host_lcss.remote_balance_msat, 350_000);
        assert!(client_lcss.outgoing_htlcs.is_empty());
        assert!(host_lcss.incoming_htlcs.is_empty());
        assert_eq!(client_lcss.local_updates, 1);
        assert_eq!(client_lcss.remote_updates, 1);
    }

    #[test]
    fn s3_stale_block_day_suspends_channel() {
        let (mut host, _client, host_sk, _client_sk) = open_pair();
        host.current_block_day = 1000;
        let stale = StateUpdate {
            block_day: 998,
            local_updates: 0,
            remote_updates: 0,
            sig_of_remote_next_lcss: crypto::sign(&host_sk, &crypto::sha256(b"garbage")),
        };
        let actions = host.handle_message(PeerMessage::StateUpdate(stale), &host_sk);
        assert_eq!(host.status(), Lifecycle::Suspended);
        assert!(actions
            .iter()
            .any(|a| matches!(a, ChannelAction::Suspended { error: ChannelError::StaleBlockDay })));
    }

    #[test]
    fn s4_resize_credits_entire_delta_to_host() {
        let (mut host, mut client, host_sk, client_sk) = open_pair();
        let starting_capacity = host.current_lcss().unwrap().params.channel_capacity_msat;

        let resize_msg = client.propose_resize(2_000, &client_sk).unwrap();
        assert!(host.handle_message(resize_msg, &host_sk).is_empty());

        let propose = client.propose_state_update(&client_sk).unwrap().unwrap();
        let host_actions = host.handle_message(propose, &host_sk);
        let echo = match &host_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            other => panic!("expected echo state_update, got {:?}", other),
        };
        assert!(client.handle_message(echo, &client_sk).is_empty());

        let host_lcss = host.current_lcss().unwrap();
        let client_lcss = client.current_lcss().unwrap();
        assert_eq!(host_lcss.params.channel_capacity_msat, 2_000_000);
        assert_eq!(client_lcss.params.channel_capacity_msat, 2_000_000);

        let delta = 2_000_000 - starting_capacity;
        assert_eq!(host_lcss.local_balance_msat, 600_000 + delta);
        assert_eq!(client_lcss.remote_balance_msat, 600_000 + delta);
        assert_eq!(host_lcss.remote_balance_msat, 400_000);
        assert_eq!(client_lcss.local_balance_msat, 400_000);
        assert_eq!(*host_lcss, client_lcss.reverse());
    }

    #[test]
    fn s6_override_fails_in_flight_htlcs_upstream() {
        let (mut host, mut client, host_sk, client_sk) = open_pair();

        let payment_hash = crypto::sha256(&[0x77; 32]);
        let (htlc_id, _handle, add_msg) = client
            .queue_add_htlc(
                50_000,
                Slice32::from_inner(payment_hash.into_inner()),
                500_000,
                OnionPacket::new(vec![0u8; ONION_PACKET_SIZE]),
            )
            .unwrap();
        assert!(host.handle_message(add_msg, &host_sk).is_empty());
        let propose = client.propose_state_update(&client_sk).unwrap().unwrap();
        let host_actions = host.handle_message(propose, &host_sk);
        let echo = match &host_actions[0] {
            ChannelAction::SendMessage(m) => m.clone(),
            other => panic!("expected echo state_update, got {:?}", other),
        };
        client.handle_message(echo, &client_sk);
        assert_eq!(host.current_lcss().unwrap().incoming_htlcs.len(), 1);

        host.status = Lifecycle::Suspended;
        let (override_msg, dropped) = host.issue_override(700_000, &host_sk).unwrap();
        assert!(dropped
            .iter()
            .any(|a| matches!(a, ChannelAction::HtlcDropped { htlc_id: id, .. } if *id == htlc_id)));
        assert_eq!(host.status(), Lifecycle::Overriding);

        let override_msg = match override_msg {
            PeerMessage::StateOverride(m) => m,
            other => panic!("expected state_override, got {:?}", other),
        };
        let client_actions = client.handle_state_override(override_msg, &client_sk).unwrap();
        assert!(client_actions
            .iter()
            .any(|a| matches!(a, ChannelAction::HtlcDropped { htlc_id: id, .. } if *id == htlc_id)));
        assert_eq!(client.status(), Lifecycle::Overriding);

        let confirm = client.accept_override(&client_sk).unwrap();
        assert_eq!(client.status(), Lifecycle::Active);
        assert!(client.current_lcss().unwrap().incoming_htlcs.is_empty());
        assert!(client.current_lcss().unwrap().outgoing_htlcs.is_empty());
        assert!(matches!(confirm, PeerMessage::StateUpdate(_)));
    }

    #[test]
    fn disconnect_fails_pending_htlc_resolution() {
        let (_host, mut client, _host_sk, _client_sk) = open_pair();
        let (_id, mut handle, _msg) = client
            .queue_add_htlc(
                10_000,
                Slice32::from_inner([1u8; 32]),
                500_000,
                OnionPacket::new(vec![0u8; ONION_PACKET_SIZE]),
            )
            .unwrap();
        client.on_peer_disconnected();
        assert!(matches!(handle.try_resolve(), Some(HtlcOutcome::Failed { .. })));
    }
}
