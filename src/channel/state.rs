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

//! Channel lifecycle states (`spec.md` §3, §4.2).

/// Runtime status of a single peer's hosted channel.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Display)]
pub enum Lifecycle {
    /// Peer disconnected; no message exchange happens in this state.
    #[display("offline")]
    Offline,

    /// `InvokeHostedChannel` sent or received, awaiting the init/state-update
    /// handshake that establishes the first LCSS.
    #[display("opening")]
    Opening,

    /// LCSS established; normal `StateUpdate` reconciliation runs.
    #[display("active")]
    Active,

    /// A local or remote error was recorded; all new updates are refused
    /// until a `StateOverride` is accepted.
    #[display("suspended")]
    Suspended,

    /// Host has sent a `StateOverride` and is awaiting the client's
    /// countersigned `StateUpdate`.
    #[display("overriding")]
    Overriding,
}

impl Lifecycle {
    pub fn accepts_updates(&self) -> bool {
        matches!(self, Lifecycle::Active)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Lifecycle::Offline => "offline",
            Lifecycle::Opening => "opening",
            Lifecycle::Active => "active",
            Lifecycle::Suspended => "suspended",
            Lifecycle::Overriding => "overriding",
        }
    }
}
