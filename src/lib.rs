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

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    dead_code
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate amplify_derive;
#[macro_use]
extern crate strict_encoding;
#[macro_use]
extern crate lightning_encoding;
#[macro_use]
extern crate log;

#[cfg(feature = "serde")]
extern crate serde_crate as serde;

macro_rules! dumb_pubkey {
    () => {
        ::secp256k1::PublicKey::from_secret_key(
            &::secp256k1::Secp256k1::new(),
            &::secp256k1::SecretKey::from_slice(&[1u8; 32]).expect("hardcoded key"),
        )
    };
}

pub mod config;
pub mod control;
pub mod crypto;
pub mod db;
pub mod error;
pub mod ids;
pub mod lcss;
pub mod msgs;
pub mod node;

pub mod channel;
pub mod channel_master;
pub mod preimage_catcher;

pub use channel::Channel;
pub use channel_master::ChannelMaster;
pub use config::HostedChannelsConfig;
pub use error::{ChannelError, ControlError, DbError, MasterError};
pub use lcss::LastCrossSignedState;
pub use node::NodeInterface;
pub use preimage_catcher::BlockchainPreimageCatcher;
