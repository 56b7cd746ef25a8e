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

//! secp256k1 sign/verify and SHA256 primitives used by the LCSS
//! cross-signing protocol (`spec.md` §4.1). Key derivation beyond the
//! node's static identity keypair is out of scope (§1): hosted channels
//! have no funding output and so need no per-channel basepoints.

use bitcoin::hashes::{sha256, Hash, HashEngine};
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

/// Computes SHA256 over an arbitrary byte buffer, used both for
/// `hostedSigHash` and for payment-hash/preimage matching.
pub fn sha256(data: &[u8]) -> sha256::Hash {
    let mut engine = sha256::HashEngine::default();
    engine.input(data);
    sha256::Hash::from_engine(engine)
}

/// The hash over which the two peers of a channel sign their ordered
/// identity so that [`crate::ids::ChannelId::derive`] and
/// [`crate::ids::ShortChannelId::derive`] produce identical results
/// regardless of which side computes them: the host's pubkey always
/// comes first.
pub fn sha256_of_ordered_pubkeys(host_pubkey: &PublicKey, client_pubkey: &PublicKey) -> sha256::Hash {
    let mut buf = Vec::with_capacity(66);
    buf.extend_from_slice(&host_pubkey.serialize());
    buf.extend_from_slice(&client_pubkey.serialize());
    sha256(&buf)
}

/// Signs a 32-byte digest (a `hostedSigHash` or a `ResizeChannel` sig
/// material hash) with the local node's identity secret key.
pub fn sign(secret_key: &SecretKey, digest: &sha256::Hash) -> Signature {
    let secp = Secp256k1::signing_only();
    let message = Message::from_slice(digest.as_inner()).expect("sha256 digest is 32 bytes");
    secp.sign_ecdsa(&message, secret_key)
}

/// Verifies a signature produced by [`sign`] against the peer's known
/// public key.
pub fn verify(public_key: &PublicKey, digest: &sha256::Hash, sig: &Signature) -> bool {
    let secp = Secp256k1::verification_only();
    let message = match Message::from_slice(digest.as_inner()) {
        Ok(m) => m,
        Err(_) => return false,
    };
    secp.verify_ecdsa(&message, sig, public_key).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let digest = sha256(b"hello hosted channel");
        let sig = sign(&sk, &digest);
        assert!(verify(&pk, &digest, &sig));

        let other_digest = sha256(b"tampered");
        assert!(!verify(&pk, &other_digest, &sig));
    }

    #[test]
    fn ordered_pubkey_hash_is_symmetric_in_argument_order_of_callers() {
        let secp = Secp256k1::new();
        let sk_a = SecretKey::from_slice(&[1u8; 32]).unwrap();
        let sk_b = SecretKey::from_slice(&[2u8; 32]).unwrap();
        let pk_a = PublicKey::from_secret_key(&secp, &sk_a);
        let pk_b = PublicKey::from_secret_key(&secp, &sk_b);

        // Both host and client must derive the *same* scid: both call with
        // (host, client) order, never swapped.
        let h1 = sha256_of_ordered_pubkeys(&pk_a, &pk_b);
        let h2 = sha256_of_ordered_pubkeys(&pk_a, &pk_b);
        assert_eq!(h1, h2);
        assert_ne!(h1, sha256_of_ordered_pubkeys(&pk_b, &pk_a));
    }
}
