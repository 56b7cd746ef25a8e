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

//! Scans mined chain data for preimages that settle stuck outgoing HTLCs,
//! independently of peer responsiveness (`spec.md` §4.8).

use std::sync::Arc;

use crate::channel_master::ChannelMaster;
use crate::error::MasterError;
use crate::node::NodeInterface;

/// Maintains no state of its own beyond its collaborators: the set of
/// in-flight outgoing payment hashes lives on [`ChannelMaster`]'s
/// channels, and already-seen preimages live in the database, so this
/// type is cheap to construct and safe to run from any tick of
/// `ChannelMaster`'s block timer.
pub struct BlockchainPreimageCatcher {
    node: Arc<dyn NodeInterface>,
}

impl BlockchainPreimageCatcher {
    pub fn new(node: Arc<dyn NodeInterface>) -> Self {
        BlockchainPreimageCatcher { node }
    }

    /// Scans blocks at or after `from_height` for any of `master`'s
    /// currently tracked outgoing payment hashes and injects a synthetic
    /// fulfill for each newly observed one. Returns the number of HTLCs
    /// settled this way.
    pub async fn scan_block(&self, from_height: u32, master: &ChannelMaster) -> Result<usize, MasterError> {
        let tracked = master.tracked_outgoing_payment_hashes();
        if tracked.is_empty() {
            return Ok(0);
        }

        let found = self
            .node
            .scan_for_preimages(from_height, &tracked)
            .await
            .map_err(|e| MasterError::Node(e.to_string()))?;

        let mut settled = 0;
        for (hash, preimage) in found {
            master.settle_outgoing_htlc_by_hash(hash, preimage).await?;
            settled += 1;
        }
        debug!("preimage catcher settled {} outgoing htlc(s) from chain data", settled);
        Ok(settled)
    }
}
