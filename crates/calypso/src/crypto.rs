//! Session key derivation and session MAC
//!
//! Used by the emulated card and SAM. Both sides derive the same session key
//! from the card key and the two challenges, then MAC every byte exchanged in
//! the session. The first half of the MAC is the card signature, the second
//! half the SAM signature.

use std::fmt;

use cbc_mac::{CbcMac, Mac};
use cipher::{BlockEncryptMut, KeyIvInit, generic_array::GenericArray};
use des::TdesEde2;

use crate::constants::{CHALLENGE_LENGTH, HALF_SIGNATURE_LENGTH};

/// Double length DES key
pub type DesKey = [u8; 16];

/// Full session MAC
pub type SessionMac = [u8; 2 * HALF_SIGNATURE_LENGTH];

/// Encrypt two blocks with 2-key 3DES in CBC mode and a zero IV
fn encrypt_two_blocks(key: &DesKey, first: [u8; 8], second: [u8; 8]) -> DesKey {
    let mut blocks = [GenericArray::from(first), GenericArray::from(second)];
    let mut encryptor =
        cbc::Encryptor::<TdesEde2>::new(GenericArray::from_slice(key), &Default::default());
    encryptor.encrypt_blocks_mut(&mut blocks);

    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&blocks[0]);
    out[8..].copy_from_slice(&blocks[1]);
    out
}

/// Diversify a master key with a card or SAM serial number
pub fn diversify_key(master: &DesKey, serial_number: &[u8; 8]) -> DesKey {
    let mut inverted = *serial_number;
    inverted.iter_mut().for_each(|b| *b ^= 0xFF);
    encrypt_two_blocks(master, *serial_number, inverted)
}

/// Derive the session key from the card key and both challenges
pub fn session_key(
    card_key: &DesKey,
    card_challenge: &[u8; CHALLENGE_LENGTH],
    sam_challenge: &[u8; CHALLENGE_LENGTH],
) -> DesKey {
    let mut first = [0u8; 8];
    first[..4].copy_from_slice(card_challenge);
    first[4..].copy_from_slice(sam_challenge);
    let mut second = [0u8; 8];
    second[..4].copy_from_slice(sam_challenge);
    second[4..].copy_from_slice(card_challenge);
    encrypt_two_blocks(card_key, first, second)
}

/// Running MAC over the exchanges of one session
#[derive(Clone)]
pub struct SessionDigest {
    mac: CbcMac<TdesEde2>,
}

impl fmt::Debug for SessionDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDigest").finish_non_exhaustive()
    }
}

impl SessionDigest {
    /// Start a digest with the session key and the open response
    pub fn new(session_key: &DesKey, open_data: &[u8]) -> Self {
        let mut mac = <CbcMac<TdesEde2> as Mac>::new(GenericArray::from_slice(session_key));
        mac.update(open_data);
        Self { mac }
    }

    /// Add a command or response
    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
    }

    /// Pad and compute the session MAC
    pub fn finalize(mut self) -> SessionMac {
        // ISO/IEC 9797-1 padding method 2; the MAC zero-fills the last block
        self.mac.update(&[0x80]);
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.mac.finalize().into_bytes());
        out
    }
}

/// Card half of a session MAC
pub fn card_half(mac: &SessionMac) -> [u8; HALF_SIGNATURE_LENGTH] {
    let mut half = [0u8; HALF_SIGNATURE_LENGTH];
    half.copy_from_slice(&mac[..HALF_SIGNATURE_LENGTH]);
    half
}

/// SAM half of a session MAC
pub fn sam_half(mac: &SessionMac) -> [u8; HALF_SIGNATURE_LENGTH] {
    let mut half = [0u8; HALF_SIGNATURE_LENGTH];
    half.copy_from_slice(&mac[HALF_SIGNATURE_LENGTH..]);
    half
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    const MASTER: DesKey = hex!("404142434445464748494A4B4C4D4E4F");

    #[test]
    fn test_diversification_depends_on_serial() {
        let a = diversify_key(&MASTER, &hex!("0000000011223344"));
        let b = diversify_key(&MASTER, &hex!("0000000011223345"));
        assert_ne!(a, b);
        assert_eq!(a, diversify_key(&MASTER, &hex!("0000000011223344")));
        assert_ne!(a, MASTER);
    }

    #[test]
    fn test_session_key_depends_on_both_challenges() {
        let key = session_key(&MASTER, &hex!("00002A11"), &hex!("C1C2C3C4"));
        assert_ne!(key, session_key(&MASTER, &hex!("00002A12"), &hex!("C1C2C3C4")));
        assert_ne!(key, session_key(&MASTER, &hex!("00002A11"), &hex!("C1C2C3C5")));
    }

    #[test]
    fn test_digest_agreement() {
        let key = session_key(&MASTER, &hex!("00002A11"), &hex!("C1C2C3C4"));

        let mut card = SessionDigest::new(&key, &hex!("00002A11003079 00"));
        let mut sam = SessionDigest::new(&key, &hex!("00002A11003079 00"));
        for data in [&hex!("00B2013C00")[..], &hex!("0102039000")[..]] {
            card.update(data);
            sam.update(data);
        }
        let card_mac = card.finalize();
        assert_eq!(card_mac, sam.clone().finalize());

        // Any extra byte changes the signature
        sam.update(&hex!("00"));
        let tampered = sam.finalize();
        assert_ne!(card_half(&card_mac), card_half(&tampered));
        assert_ne!(sam_half(&card_mac), sam_half(&tampered));
    }
}
