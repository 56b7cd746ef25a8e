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

//! Operator-tunable parameters (`SPEC_FULL.md` §2, "Configuration").
//! `spec.md` §9 leaves the counter-mismatch retry bound and the CLTV
//! safety delta as open questions with suggested defaults; this struct
//! is where an operator overrides them.

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(crate = "serde_crate"))]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HostedChannelsConfig {
    /// Blocks between a tracked HTLC's `cltv_expiry` and the current
    /// height at which the channel suspends rather than risk losing the
    /// race on-chain (`spec.md` §4.4). Default 72, per §9(b).
    pub cltv_safety_delta: u32,

    /// Bounded retries on a `StateUpdate` counter mismatch before the
    /// channel suspends (`spec.md` §4.3, §9(a)). Default 3.
    pub counter_mismatch_retries: u8,

    /// A received `StateUpdate` whose `blockDay` differs from ours by
    /// more than this is rejected as stale (`spec.md` §4.2). The BOLT
    /// text fixes this at 1; exposed here only so tests can shrink it.
    pub block_day_staleness_tolerance: u32,

    /// How often `ChannelMaster` refreshes `currentBlock` from the node
    /// and fans out `onBlockUpdated` (`spec.md` §4.7). Default 60s.
    pub block_poll_interval_secs: u64,

    /// Default policy offered to a client opening a new channel, used
    /// whenever `InitHostedChannel` isn't otherwise overridden per-peer.
    pub default_channel_capacity_msat: u64,
    pub default_max_htlc_value_in_flight_msat: u64,
    pub default_htlc_minimum_msat: u64,
    pub default_max_accepted_htlcs: u16,

    /// Balance the host credits the client with in the initial LCSS
    /// (`spec.md` §4.2, "all balance to client"). Default 0, per the §8
    /// "S1" scenario.
    pub default_initial_client_balance_msat: u64,
}

impl Default for HostedChannelsConfig {
    fn default() -> Self {
        HostedChannelsConfig {
            cltv_safety_delta: 72,
            counter_mismatch_retries: 3,
            block_day_staleness_tolerance: 1,
            block_poll_interval_secs: 60,
            default_channel_capacity_msat: 100_000_000,
            default_max_htlc_value_in_flight_msat: 100_000_000,
            default_htlc_minimum_msat: 1_000,
            default_max_accepted_htlcs: 30,
            default_initial_client_balance_msat: 0,
        }
    }
}
