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

//! Process-wide channel registry, cross-channel HTLC forwarding, chain-tip
//! fan-out and startup replay (`spec.md` §4.7). `ChannelMaster` is the
//! owner half of the owner-plus-index pattern described in `spec.md` §9:
//! it holds every [`Channel`] keyed by peer node id and is the only thing
//! a `Channel` ever reaches back into, indirectly, via the
//! [`ChannelAction`]s its own methods return.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use amplify::Slice32;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use serde_crate::Serialize;

use crate::channel::{Channel, ChannelAction, HtlcOutcome, HtlcResolutionHandle};
use crate::config::HostedChannelsConfig;
use crate::crypto;
use crate::db::{ChannelData, Database, StoredError};
use crate::error::MasterError;
use crate::ids::{HtlcIdentifier, ShortChannelId};
use crate::msgs::{OnionPacket, PeerMessage};
use crate::node::{HtlcResolution, NodeEvent, NodeInterface, OnionDecryption};
use crate::preimage_catcher::BlockchainPreimageCatcher;

/// A resolution still in flight on the outgoing leg of a forward, kept
/// in memory only: `spec.md` §5 persists the `HtlcIdentifier` mapping,
/// not the awaitable handle itself, so this table is rebuilt on restart
/// by [`ChannelMaster::start`] rather than by deserializing it.
struct PendingForward {
    incoming: HtlcIdentifier,
    handle: HtlcResolutionHandle,
}

/// JSON projection of a single channel for the control API (`spec.md`
/// §4.7, "`channelJSON` projection").
#[derive(Clone, Serialize, Debug)]
#[serde(crate = "serde_crate")]
pub struct ChannelJson {
    pub peer: String,
    pub channel_id: String,
    pub is_host: bool,
    pub status: String,
    pub local_balance_msat: Option<u64>,
    pub remote_balance_msat: Option<u64>,
    pub capacity_msat: Option<u64>,
    pub incoming_htlcs: usize,
    pub outgoing_htlcs: usize,
}

/// Owns every [`Channel`] for this node, the database, and the node
/// driver. `spec.md` §9, "Global mutable state": all of it is confined
/// here, there are no ambient singletons.
pub struct ChannelMaster {
    node: Arc<dyn NodeInterface>,
    db: Arc<dyn Database>,
    config: HostedChannelsConfig,
    local_pubkey: PublicKey,
    chain_hash: Slice32,
    channels: Mutex<HashMap<PublicKey, Channel>>,
    forwards: Mutex<HashMap<HtlcIdentifier, PendingForward>>,
    preimage_catcher: BlockchainPreimageCatcher,
    last_scanned_height: AtomicU32,
}

impl ChannelMaster {
    pub fn new(node: Arc<dyn NodeInterface>, db: Arc<dyn Database>, config: HostedChannelsConfig, chain_hash: Slice32) -> Self {
        let local_pubkey = node.public_key();
        let preimage_catcher = BlockchainPreimageCatcher::new(node.clone());
        ChannelMaster {
            node,
            db,
            config,
            local_pubkey,
            chain_hash,
            channels: Mutex::new(HashMap::new()),
            forwards: Mutex::new(HashMap::new()),
            preimage_catcher,
            last_scanned_height: AtomicU32::new(0),
        }
    }

    /// Rehydrates every persisted channel and replays in-flight forwards
    /// (`spec.md` §4.7, §8 "S5: Crash recovery"). Must run once before the
    /// event loop starts.
    pub async fn start(&self) -> Result<(), MasterError> {
        let records = self.db.all_channels().await?;
        {
            let mut channels = self.channels.lock().expect("channel registry mutex poisoned");
            for (peer, data) in records {
                let channel =
                    Channel::from_stored(peer, self.local_pubkey, self.chain_hash, self.config, data.lcss);
                info!("loaded hosted channel with {} (status={})", peer, channel.status());
                channels.insert(peer, channel);
            }
        }

        let all_forwards = self.db.all_forwards().await?;
        for (incoming, outgoing) in all_forwards {
            self.replay_forward(incoming, outgoing).await?;
        }
        Ok(())
    }

    /// A forward whose incoming leg is already committed survives a
    /// restart as a persisted `(incoming, outgoing)` pair with no live
    /// resolution handle. If the outgoing channel hasn't yet recorded the
    /// htlc in its own `outgoingHtlcs`, the add never made it past the
    /// crash; the next `StateUpdate` round re-derives it from
    /// `uncommittedUpdates` on reconnect, so nothing further is needed
    /// here beyond logging the recovery for operators.
    async fn replay_forward(&self, incoming: HtlcIdentifier, outgoing: HtlcIdentifier) -> Result<(), MasterError> {
        let outgoing_peer = self.peer_for_scid(outgoing.scid);
        let Some(outgoing_peer) = outgoing_peer else {
            warn!("forward {} -> {} points at an unknown channel, dropping", incoming, outgoing);
            self.db.remove_forward(&incoming).await?;
            return Ok(());
        };

        let already_in_flight = self
            .with_channel(&outgoing_peer, |c| {
                c.current_lcss()
                    .map(|l| l.outgoing_htlcs.iter().any(|h| h.htlc_id == outgoing.htlc_id))
                    .unwrap_or(false)
            })
            .unwrap_or(false);

        if already_in_flight {
            info!("replaying in-flight forward {} -> {} (already committed)", incoming, outgoing);
        } else {
            warn!(
                "forward {} -> {} was persisted but never committed before the crash; its resolution will surface on the next StateUpdate round",
                incoming, outgoing
            );
        }
        Ok(())
    }

    fn peer_for_scid(&self, scid: ShortChannelId) -> Option<PublicKey> {
        let channels = self.channels.lock().expect("channel registry mutex poisoned");
        channels
            .iter()
            .find(|(_, c)| c.short_channel_id() == scid)
            .map(|(peer, _)| *peer)
    }

    fn with_channel<R>(&self, peer: &PublicKey, f: impl FnOnce(&mut Channel) -> R) -> Option<R> {
        let mut channels = self.channels.lock().expect("channel registry mutex poisoned");
        channels.get_mut(peer).map(f)
    }

    fn local_secret_key(&self) -> SecretKey {
        self.node.private_key()
    }

    // ---- event dispatch ------------------------------------------------

    /// Processes a single [`NodeEvent`] to completion (`spec.md` §5:
    /// suspension points are the awaited node-RPC calls within, everything
    /// else runs synchronously).
    pub async fn run_once(&self, event: NodeEvent) -> Result<(), MasterError> {
        match event {
            NodeEvent::PeerMessage { peer, message } => self.on_peer_message(peer, message).await,
            NodeEvent::PeerConnected { peer } => self.on_peer_connected(peer).await,
            NodeEvent::PeerDisconnected { peer } => self.on_peer_disconnected(peer).await,
            NodeEvent::InterceptedHtlc {
                incoming_short_channel_id,
                incoming_htlc_id,
                amount_msat,
                payment_hash,
                cltv_expiry,
                onion,
            } => {
                self.on_intercepted_htlc(
                    incoming_short_channel_id,
                    incoming_htlc_id,
                    amount_msat,
                    payment_hash,
                    cltv_expiry,
                    onion,
                )
                .await
            }
            NodeEvent::ChainTip { height } => self.on_chain_tip(height).await,
        }
    }

    /// Drains `events` until the channel closes, refreshing the chain tip
    /// on `config.block_poll_interval_secs` in between (`spec.md` §4.7).
    pub async fn run_forever(&self, mut events: tokio::sync::mpsc::Receiver<NodeEvent>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.config.block_poll_interval_secs));
        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(event) => {
                            if let Err(e) = self.run_once(event).await {
                                error!("unhandled error processing node event: {}", e);
                            }
                        }
                        None => return,
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh_block().await {
                        warn!("block refresh failed: {}", e);
                    }
                }
            }
        }
    }

    async fn refresh_block(&self) -> Result<(), MasterError> {
        let height = self
            .node
            .get_current_block()
            .await
            .map_err(|e| MasterError::Node(e.to_string()))?;
        self.on_chain_tip(height).await
    }

    async fn on_peer_message(&self, peer: PublicKey, message: PeerMessage) -> Result<(), MasterError> {
        let local_sk = self.local_secret_key();
        let actions = self.with_channel(&peer, |c| c.handle_message(message.clone(), &local_sk));
        match actions {
            Some(actions) => self.apply_actions(peer, actions).await,
            None => {
                debug!("message from unknown peer {}, creating host-side channel", peer);
                let mut channel = Channel::new(peer, self.local_pubkey, true, self.chain_hash, self.config);
                let actions = channel.handle_message(message, &local_sk);
                self.channels.lock().expect("channel registry mutex poisoned").insert(peer, channel);
                self.apply_actions(peer, actions).await
            }
        }
    }

    async fn on_peer_connected(&self, peer: PublicKey) -> Result<(), MasterError> {
        let refund_script_pubkey = self
            .db
            .get_channel(&peer)
            .await?
            .and_then(|d| d.pending_refund_script)
            .unwrap_or_default();
        let actions = self.with_channel(&peer, |c| c.on_peer_connected(refund_script_pubkey));
        match actions {
            Some(actions) => self.apply_actions(peer, actions).await,
            None => Ok(()),
        }
    }

    async fn on_peer_disconnected(&self, peer: PublicKey) -> Result<(), MasterError> {
        let actions = self.with_channel(&peer, |c| c.on_peer_disconnected());
        match actions {
            Some(actions) => self.apply_actions(peer, actions).await,
            None => Ok(()),
        }
    }

    async fn on_chain_tip(&self, height: u32) -> Result<(), MasterError> {
        let peers: Vec<PublicKey> = self.channels.lock().expect("channel registry mutex poisoned").keys().copied().collect();
        for peer in peers {
            let actions = self.with_channel(&peer, |c| c.on_block_updated(height, None));
            if let Some(actions) = actions {
                self.apply_actions(peer, actions).await?;
            }
        }

        // `spec.md` §4.7 fans the block tick out to every channel *and* the
        // preimage catcher; §4.8 relies on this to notice chain-observed
        // preimages for stuck outgoing HTLCs without waiting on the peer.
        let from_height = self.last_scanned_height.load(Ordering::SeqCst);
        self.preimage_catcher.scan_block(from_height, self).await?;
        self.last_scanned_height.store(height, Ordering::SeqCst);
        Ok(())
    }

    /// `spec.md` §4.4: an intercepted incoming HTLC is decrypted and
    /// either forwarded onto another hosted channel or failed back.
    async fn on_intercepted_htlc(
        &self,
        incoming_scid: ShortChannelId,
        incoming_htlc_id: u64,
        _amount_msat: u64,
        payment_hash: Slice32,
        _cltv_expiry: u32,
        onion: OnionPacket,
    ) -> Result<(), MasterError> {
        let incoming = HtlcIdentifier::new(incoming_scid, incoming_htlc_id);
        let decryption = self
            .node
            .decrypt_onion(onion, payment_hash)
            .await
            .map_err(|e| MasterError::Node(e.to_string()))?;

        let (next_scid, forward_amount, forward_cltv, next_onion) = match decryption {
            OnionDecryption::Forward {
                next_short_channel_id,
                amount_msat,
                cltv_expiry,
                next_onion,
            } => (next_short_channel_id, amount_msat, cltv_expiry, next_onion),
            OnionDecryption::Failure { reason } => {
                self.node
                    .resolve_htlc(incoming_scid, incoming_htlc_id, HtlcResolution::Fail { reason })
                    .await
                    .map_err(|e| MasterError::Node(e.to_string()))?;
                return Ok(());
            }
        };

        let Some(outgoing_peer) = self.peer_for_scid(next_scid) else {
            warn!("onion asked to forward to unknown short channel id {}", next_scid);
            self.node
                .resolve_htlc(
                    incoming_scid,
                    incoming_htlc_id,
                    HtlcResolution::Fail {
                        reason: b"unknown next channel".to_vec(),
                    },
                )
                .await
                .map_err(|e| MasterError::Node(e.to_string()))?;
            return Ok(());
        };

        let local_sk = self.local_secret_key();
        let queued = self
            .with_channel(&outgoing_peer, |c| c.queue_add_htlc(forward_amount, payment_hash, forward_cltv, next_onion))
            .ok_or_else(|| MasterError::Node("forward target channel vanished".into()))?
            .map_err(MasterError::from)?;
        let (outgoing_htlc_id, handle, add_msg) = queued;
        let outgoing = HtlcIdentifier::new(next_scid, outgoing_htlc_id);

        // Persist the forward mapping *before* the add is committed, so a
        // crash between the two never loses the linkage (`spec.md` §5).
        self.db.store_forward(incoming, outgoing).await?;
        self.forwards
            .lock()
            .expect("forward table mutex poisoned")
            .insert(outgoing, PendingForward { incoming, handle });

        self.send(outgoing_peer, add_msg).await;
        let propose = self
            .with_channel(&outgoing_peer, |c| c.propose_state_update(&local_sk))
            .transpose()
            .map_err(MasterError::from)?
            .flatten();
        if let Some(msg) = propose {
            self.send(outgoing_peer, msg).await;
        }
        self.persist_channel(outgoing_peer).await?;
        Ok(())
    }

    /// Polls every in-flight forward's resolution handle and settles the
    /// incoming leg once the outgoing leg resolves. Called after every
    /// event is processed since there is no single future to `.await` on
    /// an unbounded, dynamically-changing set of handles without pulling
    /// in a combinator crate the rest of this family doesn't use.
    pub async fn poll_forwards(&self) -> Result<(), MasterError> {
        let ready: Vec<(HtlcIdentifier, HtlcIdentifier, HtlcOutcome)> = {
            let mut forwards = self.forwards.lock().expect("forward table mutex poisoned");
            let keys: Vec<HtlcIdentifier> = forwards.keys().copied().collect();
            let mut ready = Vec::new();
            for outgoing in keys {
                let resolved = forwards.get_mut(&outgoing).and_then(|p| p.handle.try_resolve());
                if let Some(outcome) = resolved {
                    let incoming = forwards.remove(&outgoing).expect("just looked up").incoming;
                    ready.push((outgoing, incoming, outcome));
                }
            }
            ready
        };

        for (outgoing, incoming, outcome) in ready {
            self.db.remove_forward(&incoming).await?;
            if let HtlcOutcome::Fulfilled { preimage } = outcome {
                // Cached before the incoming leg is resolved, per `spec.md`
                // §4.4: a crash between learning the preimage here and
                // notifying upstream must still leave it claimable.
                let hash = Slice32::from_inner(crypto::sha256(&preimage.into_inner()).into_inner());
                self.db.store_preimage(hash, preimage).await?;
            }
            let resolution = match outcome {
                HtlcOutcome::Fulfilled { preimage } => HtlcResolution::Fulfill { preimage },
                HtlcOutcome::Failed { reason } => HtlcResolution::Fail { reason },
                HtlcOutcome::FailedMalformed { sha256_of_onion, failure_code } => {
                    HtlcResolution::FailMalformed { sha256_of_onion, failure_code }
                }
            };
            self.node
                .resolve_htlc(incoming.scid, incoming.htlc_id, resolution)
                .await
                .map_err(|e| MasterError::Node(e.to_string()))?;
            debug!("settled forward {} -> {}", incoming, outgoing);
        }
        Ok(())
    }

    // ---- action execution ----------------------------------------------

    async fn apply_actions(&self, peer: PublicKey, actions: Vec<ChannelAction>) -> Result<(), MasterError> {
        for action in actions {
            match action {
                ChannelAction::SendMessage(msg) => self.send(peer, msg).await,
                ChannelAction::NewIncomingHtlc(htlc) => {
                    info!("new incoming htlc {} on channel with {}, decrypting onion", htlc.htlc_id, peer);
                    let scid = self.with_channel(&peer, |c| c.short_channel_id()).unwrap_or_default();
                    self.on_intercepted_htlc(
                        scid,
                        htlc.htlc_id,
                        htlc.amount_msat,
                        htlc.payment_hash,
                        htlc.cltv_expiry,
                        htlc.onion_routing_packet,
                    )
                    .await?
                }
                ChannelAction::HtlcDropped { htlc_id, reason } => self.fail_upstream(peer, htlc_id, reason).await?,
                ChannelAction::Suspended { error } => {
                    error!("channel with {} suspended: {}", peer, error);
                    self.record_local_error(peer, error).await?;
                }
            }
        }
        self.persist_channel(peer).await?;
        self.poll_forwards().await
    }

    async fn send(&self, peer: PublicKey, msg: PeerMessage) {
        if let Err(e) = self.node.send_custom_message(peer, msg).await {
            warn!("send to {} failed (best-effort): {}", peer, e);
        }
    }

    /// The outgoing leg of a forward was dropped without resolving
    /// (suspension, disconnect, CLTV timeout, override); fail the
    /// incoming leg upstream (`spec.md` §4.4, §4.6).
    async fn fail_upstream(&self, peer: PublicKey, htlc_id: u64, reason: Vec<u8>) -> Result<(), MasterError> {
        let scid = self.with_channel(&peer, |c| c.short_channel_id()).unwrap_or_default();
        let outgoing = HtlcIdentifier::new(scid, htlc_id);
        let in_memory = self.forwards.lock().expect("forward table mutex poisoned").remove(&outgoing).map(|p| p.incoming);
        let incoming = match in_memory {
            Some(incoming) => Some(incoming),
            None => self
                .db
                .all_forwards()
                .await?
                .into_iter()
                .find(|(_, stored_outgoing)| *stored_outgoing == outgoing)
                .map(|(incoming, _)| incoming),
        };
        if let Some(incoming) = incoming {
            self.db.remove_forward(&incoming).await?;
            let _ = self.node.resolve_htlc(incoming.scid, incoming.htlc_id, HtlcResolution::Fail { reason }).await;
        }
        Ok(())
    }

    async fn record_local_error(&self, peer: PublicKey, error: crate::error::ChannelError) -> Result<(), MasterError> {
        let channel_id = match self.with_channel(&peer, |c| c.channel_id()) {
            Some(id) => id,
            None => return Ok(()),
        };
        let stored = StoredError {
            channel_id,
            data: error.to_string().into_bytes(),
            unknown_tlvs: Vec::new(),
        };
        let existing = self.db.get_channel(&peer).await?;
        if let Some(data) = existing {
            self.db
                .update_channel(peer, data, Box::new(move |data| data.local_errors.push(stored)))
                .await?;
        }
        Ok(())
    }

    async fn persist_channel(&self, peer: PublicKey) -> Result<(), MasterError> {
        let wire = self.with_channel(&peer, |c| c.current_lcss().map(|l| l.to_wire())).flatten();
        if let Some(wire) = wire {
            self.db
                .update_channel(peer, ChannelData::new(wire.clone()), Box::new(move |data| data.lcss = wire))
                .await?;
        }
        Ok(())
    }

    // ---- control-API surface (`spec.md` §6) -----------------------------

    pub fn list_channels(&self) -> Vec<ChannelJson> {
        self.channels
            .lock()
            .expect("channel registry mutex poisoned")
            .iter()
            .map(|(peer, c)| Self::project(*peer, c))
            .collect()
    }

    pub fn channel_info(&self, peer: &PublicKey) -> Option<ChannelJson> {
        self.channels
            .lock()
            .expect("channel registry mutex poisoned")
            .get(peer)
            .map(|c| Self::project(*peer, c))
    }

    fn project(peer: PublicKey, c: &Channel) -> ChannelJson {
        let lcss = c.current_lcss();
        ChannelJson {
            peer: peer.to_string(),
            channel_id: c.channel_id().to_string(),
            is_host: c.is_host(),
            status: c.status().to_string(),
            local_balance_msat: lcss.map(|l| l.local_balance_msat),
            remote_balance_msat: lcss.map(|l| l.remote_balance_msat),
            capacity_msat: lcss.map(|l| l.params.channel_capacity_msat),
            incoming_htlcs: lcss.map(|l| l.incoming_htlcs.len()).unwrap_or(0),
            outgoing_htlcs: lcss.map(|l| l.outgoing_htlcs.len()).unwrap_or(0),
        }
    }

    /// `hc-override`: host issues a forced reset on a suspended channel.
    /// Any HTLC the override drops is failed upstream the same way a
    /// suspension would (`spec.md` §8 "S6").
    pub async fn override_channel(&self, peer: PublicKey, new_local_balance_msat: u64) -> Result<(), MasterError> {
        let local_sk = self.local_secret_key();
        let (msg, dropped) = self
            .with_channel(&peer, |c| c.issue_override(new_local_balance_msat, &local_sk))
            .ok_or_else(|| MasterError::Node("unknown peer".into()))?
            .map_err(MasterError::from)?;
        self.send(peer, msg).await;
        for action in dropped {
            if let ChannelAction::HtlcDropped { htlc_id, reason } = action {
                self.fail_upstream(peer, htlc_id, reason).await?;
            }
        }
        self.persist_channel(peer).await
    }

    /// `hc-resize`: client proposes a capacity increase.
    pub async fn resize_channel(&self, peer: PublicKey, new_capacity_sat: u64) -> Result<(), MasterError> {
        let local_sk = self.local_secret_key();
        let msg = self
            .with_channel(&peer, |c| c.propose_resize(new_capacity_sat, &local_sk))
            .ok_or_else(|| MasterError::Node("unknown peer".into()))?
            .map_err(MasterError::from)?;
        self.send(peer, msg).await;
        Ok(())
    }

    /// `hc-close`: explicit removal (`spec.md` §3, "only through an
    /// explicit close command, not an error").
    pub async fn close_channel(&self, peer: PublicKey) -> Result<(), MasterError> {
        self.channels.lock().expect("channel registry mutex poisoned").remove(&peer);
        self.db.remove_channel(&peer).await?;
        Ok(())
    }

    pub fn local_pubkey(&self) -> PublicKey {
        self.local_pubkey
    }

    // ---- BlockchainPreimageCatcher support (`spec.md` §4.8) -------------

    /// Every payment hash this node is currently owed on an outgoing
    /// hosted-channel leg, across all channels.
    pub fn tracked_outgoing_payment_hashes(&self) -> Vec<Slice32> {
        self.channels
            .lock()
            .expect("channel registry mutex poisoned")
            .values()
            .filter_map(|c| c.current_lcss())
            .flat_map(|l| l.outgoing_htlcs.iter().map(|h| h.payment_hash))
            .collect()
    }

    /// Injects a chain-observed preimage as a synthetic fulfill on
    /// whichever channel's outgoing leg is waiting on it
    /// (`spec.md` §4.8). A no-op if no channel is currently tracking
    /// `hash`, which makes repeated delivery of the same preimage
    /// idempotent.
    pub async fn settle_outgoing_htlc_by_hash(&self, hash: Slice32, preimage: Slice32) -> Result<(), MasterError> {
        let target = {
            let channels = self.channels.lock().expect("channel registry mutex poisoned");
            channels.iter().find_map(|(peer, c)| {
                c.current_lcss()
                    .and_then(|l| l.outgoing_htlcs.iter().find(|h| h.payment_hash == hash))
                    .map(|h| (*peer, h.htlc_id))
            })
        };
        let Some((peer, htlc_id)) = target else {
            return Ok(());
        };

        // Cached before the fulfill is even queued, per `spec.md` §4.4:
        // an unexpected crash between observing the preimage and
        // committing the fulfill must still leave us able to claim
        // upstream.
        self.db.store_preimage(hash, preimage).await?;

        let local_sk = self.local_secret_key();
        let msg = self
            .with_channel(&peer, |c| c.queue_fulfill_htlc(htlc_id, preimage))
            .ok_or_else(|| MasterError::Node("channel vanished while settling a chain-observed preimage".into()))?
            .map_err(MasterError::from)?;
        self.send(peer, msg).await;
        let propose = self
            .with_channel(&peer, |c| c.propose_state_update(&local_sk))
            .transpose()
            .map_err(MasterError::from)?
            .flatten();
        if let Some(msg) = propose {
            self.send(peer, msg).await;
        }
        self.persist_channel(peer).await
    }

    /// Registers a new client-initiated channel before any wire traffic
    /// has been exchanged. Not one of `spec.md`'s named control methods,
    /// but required to originate the first `InvokeHostedChannel` locally
    /// rather than only reacting to a peer's.
    pub fn open_as_client(&self, peer: PublicKey) {
        let channel = Channel::new(peer, self.local_pubkey, false, self.chain_hash, self.config);
        self.channels.lock().expect("channel registry mutex poisoned").insert(peer, channel);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::Lifecycle;
    use crate::db::InMemoryDatabase;
    use crate::msgs::{InitHostedChannel, LastCrossSignedStateMsg, OnionPacket, UpdateAddHtlc, ONION_PACKET_SIZE};
    use bitcoin::secp256k1::{Message, Secp256k1};
    use std::sync::Mutex as StdMutex;

    fn keypair(byte: u8) -> (SecretKey, PublicKey) {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[byte; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        (sk, pk)
    }

    /// Node driver stub that records every `resolve_htlc` call it
    /// receives, so tests can assert on what a forward failure actually
    /// notified the node of.
    struct RecordingNode {
        secret_key: SecretKey,
        public_key: PublicKey,
        resolutions: StdMutex<Vec<(ShortChannelId, u64, HtlcResolution)>>,
    }

    impl RecordingNode {
        fn new() -> Self {
            let (secret_key, public_key) = keypair(1);
            RecordingNode {
                secret_key,
                public_key,
                resolutions: StdMutex::new(Vec::new()),
            }
        }
    }

    #[async_trait::async_trait]
    impl NodeInterface for RecordingNode {
        async fn send_custom_message(&self, _peer: PublicKey, _message: PeerMessage) -> Result<(), crate::node::NodeError> {
            Ok(())
        }

        async fn get_current_block(&self) -> Result<u32, crate::node::NodeError> {
            Ok(0)
        }

        async fn get_chain_hash(&self) -> Result<Slice32, crate::node::NodeError> {
            Ok(Slice32::from_inner([0u8; 32]))
        }

        async fn decrypt_onion(&self, _onion: OnionPacket, _payment_hash: Slice32) -> Result<OnionDecryption, crate::node::NodeError> {
            Ok(OnionDecryption::Failure { reason: b"unused in these tests".to_vec() })
        }

        async fn resolve_htlc(
            &self,
            incoming_short_channel_id: ShortChannelId,
            incoming_htlc_id: u64,
            resolution: HtlcResolution,
        ) -> Result<(), crate::node::NodeError> {
            self.resolutions
                .lock()
                .expect("resolutions mutex poisoned")
                .push((incoming_short_channel_id, incoming_htlc_id, resolution));
            Ok(())
        }

        async fn scan_for_preimages(&self, _from_height: u32, _tracked_hashes: &[Slice32]) -> Result<Vec<(Slice32, Slice32)>, crate::node::NodeError> {
            Ok(Vec::new())
        }

        fn private_key(&self) -> SecretKey {
            self.secret_key
        }

        fn public_key(&self) -> PublicKey {
            self.public_key
        }
    }

    fn stored_lcss(is_host: bool, capacity: u64, local: u64, remote: u64, outgoing_htlcs: Vec<UpdateAddHtlc>) -> LastCrossSignedStateMsg {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[8u8; 32]).unwrap();
        let sig = secp.sign_ecdsa(&Message::from_slice(&[3u8; 32]).unwrap(), &sk);
        LastCrossSignedStateMsg {
            is_host,
            refund_script_pubkey: vec![],
            params: InitHostedChannel {
                max_htlc_value_in_flight_msat: capacity,
                htlc_minimum_msat: 1,
                max_accepted_htlcs: 30,
                channel_capacity_msat: capacity,
                initial_client_balance_msat: remote,
                features: 0,
            },
            block_day: 10,
            local_balance_msat: local,
            remote_balance_msat: remote,
            local_updates: 1,
            remote_updates: 1,
            incoming_htlcs: vec![],
            outgoing_htlcs,
            remote_sig_of_local: sig,
            local_sig_of_remote: sig,
        }
    }

    fn outgoing_htlc(htlc_id: u64, amount_msat: u64) -> UpdateAddHtlc {
        UpdateAddHtlc {
            channel_id: crate::ids::ChannelId::default(),
            htlc_id,
            amount_msat,
            payment_hash: Slice32::from_inner([9u8; 32]),
            cltv_expiry: 500_000,
            onion_routing_packet: OnionPacket::new(vec![0u8; ONION_PACKET_SIZE]),
        }
    }

    #[tokio::test]
    async fn s5_start_replays_persisted_forward_without_losing_it() {
        let node = Arc::new(RecordingNode::new());
        let db = Arc::new(InMemoryDatabase::new());
        let (_, peer_a) = keypair(20);
        let (_, peer_b) = keypair(30);
        let scid_a = ShortChannelId::derive(&node.public_key(), &peer_a);
        let scid_b = ShortChannelId::derive(&node.public_key(), &peer_b);

        db.update_channel(peer_a, ChannelData::new(stored_lcss(true, 1_000_000, 600_000, 400_000, vec![])), Box::new(|_| {}))
            .await
            .unwrap();
        db.update_channel(
            peer_b,
            ChannelData::new(stored_lcss(true, 1_000_000, 550_000, 450_000, vec![outgoing_htlc(7, 50_000)])),
            Box::new(|_| {}),
        )
        .await
        .unwrap();

        let incoming = HtlcIdentifier::new(scid_a, 3);
        let outgoing = HtlcIdentifier::new(scid_b, 7);
        db.store_forward(incoming, outgoing).await.unwrap();

        let master = ChannelMaster::new(node, db.clone(), HostedChannelsConfig::default(), Slice32::from_inner([0u8; 32]));
        master.start().await.unwrap();

        assert_eq!(master.channels.lock().unwrap().len(), 2);
        // Already committed on the outgoing leg: replay just logs it, the
        // mapping itself stays untouched for `poll_forwards`/`fail_upstream`
        // to pick back up once the outgoing leg actually resolves.
        assert_eq!(db.get_forward(&incoming).await.unwrap(), Some(outgoing));
    }

    #[tokio::test]
    async fn s5_start_drops_forward_pointing_at_unknown_channel() {
        let node = Arc::new(RecordingNode::new());
        let db = Arc::new(InMemoryDatabase::new());
        let (_, peer_a) = keypair(20);
        let scid_a = ShortChannelId::derive(&node.public_key(), &peer_a);
        let scid_ghost = ShortChannelId::derive(&node.public_key(), &keypair(99).1);

        db.update_channel(peer_a, ChannelData::new(stored_lcss(true, 1_000_000, 600_000, 400_000, vec![])), Box::new(|_| {}))
            .await
            .unwrap();
        let incoming = HtlcIdentifier::new(scid_a, 3);
        let outgoing = HtlcIdentifier::new(scid_ghost, 1);
        db.store_forward(incoming, outgoing).await.unwrap();

        let master = ChannelMaster::new(node, db.clone(), HostedChannelsConfig::default(), Slice32::from_inner([0u8; 32]));
        master.start().await.unwrap();

        assert_eq!(db.get_forward(&incoming).await.unwrap(), None);
    }

    #[tokio::test]
    async fn s6_override_fails_persisted_forward_upstream() {
        let node = Arc::new(RecordingNode::new());
        let db = Arc::new(InMemoryDatabase::new());
        let (_, peer_a) = keypair(20);
        let (_, peer_b) = keypair(30);
        let scid_a = ShortChannelId::derive(&node.public_key(), &peer_a);
        let scid_b = ShortChannelId::derive(&node.public_key(), &peer_b);

        db.update_channel(peer_a, ChannelData::new(stored_lcss(true, 1_000_000, 600_000, 400_000, vec![])), Box::new(|_| {}))
            .await
            .unwrap();
        db.update_channel(
            peer_b,
            ChannelData::new(stored_lcss(true, 1_000_000, 550_000, 450_000, vec![outgoing_htlc(7, 50_000)])),
            Box::new(|_| {}),
        )
        .await
        .unwrap();

        let incoming = HtlcIdentifier::new(scid_a, 3);
        let outgoing = HtlcIdentifier::new(scid_b, 7);
        db.store_forward(incoming, outgoing).await.unwrap();

        let master = ChannelMaster::new(node.clone(), db.clone(), HostedChannelsConfig::default(), Slice32::from_inner([0u8; 32]));
        master.start().await.unwrap();

        // Suspend channel b before issuing the override, as `issue_override`
        // requires; no live `PendingForward` handle exists for this forward
        // (only the db-persisted mapping survived "restart"), exactly the
        // path that exercises `fail_upstream`'s fallback scan. A wildly
        // stale `StateUpdate` is the public-API way to drive a loaded
        // channel into `Suspended` without reaching into its private state.
        let local_sk = master.local_secret_key();
        master.with_channel(&peer_b, |c| {
            c.handle_message(
                PeerMessage::StateUpdate(crate::msgs::StateUpdate {
                    block_day: 9_999,
                    local_updates: 0,
                    remote_updates: 0,
                    sig_of_remote_next_lcss: crypto::sign(&local_sk, &crypto::sha256(b"garbage")),
                }),
                &local_sk,
            )
        });
        assert_eq!(master.with_channel(&peer_b, |c| c.status()), Some(Lifecycle::Suspended));

        master.override_channel(peer_b, 500_000).await.unwrap();

        let resolutions = node.resolutions.lock().unwrap();
        assert_eq!(resolutions.len(), 1);
        let (resolved_scid, resolved_htlc_id, resolution) = &resolutions[0];
        assert_eq!(*resolved_scid, scid_a);
        assert_eq!(*resolved_htlc_id, 3);
        assert!(matches!(resolution, HtlcResolution::Fail { .. }));
        assert_eq!(db.get_forward(&incoming).await.unwrap(), None);
    }
}
