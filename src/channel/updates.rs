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

//! The `uncommittedUpdates` queue and candidate-LCSS application
//! (`spec.md` §3, §4.3).

use crate::error::ChannelError;
use crate::lcss::LastCrossSignedState;
use crate::msgs::{UpdateAddHtlc, UpdateFailHtlc, UpdateFailMalformedHtlc, UpdateFulfillHtlc};

/// Which side proposed an update, for counter bookkeeping (`spec.md` §4.3,
/// "Ordering & tie-breaks").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Origin {
    Local,
    Remote,
}

/// One of the four update kinds a side may propose while active
/// (`spec.md` §4.3).
#[derive(Clone, PartialEq, Debug)]
pub enum PendingUpdate {
    AddHtlc(UpdateAddHtlc),
    FulfillHtlc(UpdateFulfillHtlc),
    FailHtlc(UpdateFailHtlc),
    FailMalformedHtlc(UpdateFailMalformedHtlc),
}

impl PendingUpdate {
    pub fn htlc_id(&self) -> u64 {
        match self {
            PendingUpdate::AddHtlc(h) => h.htlc_id,
            PendingUpdate::FulfillHtlc(h) => h.htlc_id,
            PendingUpdate::FailHtlc(h) => h.htlc_id,
            PendingUpdate::FailMalformedHtlc(h) => h.htlc_id,
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct UncommittedUpdate {
    pub origin: Origin,
    pub update: PendingUpdate,
}

/// Applies a single update to a candidate LCSS in place (`spec.md` §4.3
/// step 1). `incomingHtlcs`/`outgoingHtlcs` are always from the local
/// point of view regardless of which side proposed the update: an `Add`
/// proposed by the remote side is, by definition, something the remote
/// is sending to us, so it lands in `incoming_htlcs`.
pub fn apply_update(candidate: &mut LastCrossSignedState, pending: &UncommittedUpdate) -> Result<(), ChannelError> {
    match &pending.update {
        PendingUpdate::AddHtlc(htlc) => match pending.origin {
            Origin::Local => candidate.outgoing_htlcs.push(htlc.clone()),
            Origin::Remote => candidate.incoming_htlcs.push(htlc.clone()),
        },
        PendingUpdate::FulfillHtlc(f) => settle_htlc(candidate, f.htlc_id)?,
        PendingUpdate::FailHtlc(f) => drop_htlc(candidate, f.htlc_id)?,
        PendingUpdate::FailMalformedHtlc(f) => drop_htlc(candidate, f.htlc_id)?,
    }
    Ok(())
}

/// Removes a resolved HTLC and moves its amount in the direction implied
/// by whichever list holds it: an incoming HTLC being fulfilled means we
/// were paid (`local += amount`), an outgoing one means we paid
/// (`local -= amount`).
fn settle_htlc(candidate: &mut LastCrossSignedState, htlc_id: u64) -> Result<(), ChannelError> {
    if let Some(pos) = candidate.incoming_htlcs.iter().position(|h| h.htlc_id == htlc_id) {
        let amount = candidate.incoming_htlcs.remove(pos).amount_msat;
        candidate.local_balance_msat += amount;
        candidate.remote_balance_msat -= amount;
        return Ok(());
    }
    if let Some(pos) = candidate.outgoing_htlcs.iter().position(|h| h.htlc_id == htlc_id) {
        let amount = candidate.outgoing_htlcs.remove(pos).amount_msat;
        candidate.local_balance_msat -= amount;
        candidate.remote_balance_msat += amount;
        return Ok(());
    }
    Err(ChannelError::UnknownHtlc(htlc_id))
}

/// Removes a failed or malformed HTLC without moving any balance: the
/// escrowed amount simply returns to whoever already held it.
fn drop_htlc(candidate: &mut LastCrossSignedState, htlc_id: u64) -> Result<(), ChannelError> {
    if let Some(pos) = candidate.incoming_htlcs.iter().position(|h| h.htlc_id == htlc_id) {
        candidate.incoming_htlcs.remove(pos);
        return Ok(());
    }
    if let Some(pos) = candidate.outgoing_htlcs.iter().position(|h| h.htlc_id == htlc_id) {
        candidate.outgoing_htlcs.remove(pos);
        return Ok(());
    }
    Err(ChannelError::UnknownHtlc(htlc_id))
}
