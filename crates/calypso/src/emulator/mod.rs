//! Emulated Calypso card and SAM
//!
//! Both implement [`StubSmartCard`](calypso_reader::stub::StubSmartCard) so
//! they can be inserted in stub readers. They run the real session MAC
//! arithmetic, which makes open/close round trips, signature mismatches and
//! aborts reproducible without hardware.

mod card;
mod sam;

use std::fmt;

use bytes::Bytes;
use calypso_apdu_core::{Response, StatusWord};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::constants::{DEFAULT_KVC, kif};
use crate::crypto::{DesKey, diversify_key};

pub use card::{VirtualCalypsoCard, VirtualCalypsoCardBuilder};
pub use sam::VirtualSam;

#[derive(Clone, Zeroize, ZeroizeOnDrop)]
struct KeyEntry {
    kif: u8,
    kvc: u8,
    key: DesKey,
}

/// Keys held by an emulated card or SAM, looked up by `(kif, kvc)`
#[derive(Clone, Default)]
pub struct KeySet {
    entries: Vec<KeyEntry>,
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.entries
                    .iter()
                    .map(|e| format!("kif={:#04x} kvc={:#04x}", e.kif, e.kvc)),
            )
            .finish()
    }
}

impl KeySet {
    /// Empty key set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key `(kif, kvc)`
    pub fn with_key(mut self, kif: u8, kvc: u8, key: DesKey) -> Self {
        self.entries.retain(|e| (e.kif, e.kvc) != (kif, kvc));
        self.entries.push(KeyEntry { kif, kvc, key });
        self
    }

    /// Key `(kif, kvc)`
    pub fn find(&self, kif: u8, kvc: u8) -> Option<&DesKey> {
        self.entries
            .iter()
            .find(|e| e.kif == kif && e.kvc == kvc)
            .map(|e| &e.key)
    }

    /// First key with identifier `kif`, with its version
    pub fn find_by_kif(&self, kif: u8) -> Option<(u8, &DesKey)> {
        self.entries
            .iter()
            .find(|e| e.kif == kif)
            .map(|e| (e.kvc, &e.key))
    }

    /// The same keys diversified with a card serial number
    pub fn diversified(&self, serial_number: &[u8; 8]) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .map(|e| KeyEntry {
                    kif: e.kif,
                    kvc: e.kvc,
                    key: diversify_key(&e.key, serial_number),
                })
                .collect(),
        }
    }

    /// Well known personalization, reload and debit master keys, version `0x79`
    pub fn test_keys() -> Self {
        Self::new()
            .with_key(kif::PERSO, DEFAULT_KVC, *b"PERSO-MASTER-KEY")
            .with_key(kif::LOAD, DEFAULT_KVC, *b"LOAD--MASTER-KEY")
            .with_key(kif::DEBIT, DEFAULT_KVC, *b"DEBIT-MASTER-KEY")
    }
}

/// Encode a response with its status word
fn respond(payload: &[u8], status: StatusWord) -> Bytes {
    let payload = (!payload.is_empty()).then(|| Bytes::copy_from_slice(payload));
    Response::new(payload, status).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_lookup() {
        let keys = KeySet::test_keys().with_key(kif::DEBIT, 0x7A, [0x11; 16]);
        assert_eq!(keys.find(kif::DEBIT, 0x7A), Some(&[0x11; 16]));
        assert_eq!(keys.find(kif::DEBIT, DEFAULT_KVC), Some(b"DEBIT-MASTER-KEY"));
        assert_eq!(keys.find_by_kif(kif::LOAD).map(|(kvc, _)| kvc), Some(DEFAULT_KVC));
        assert!(keys.find(0x42, DEFAULT_KVC).is_none());

        let diversified = keys.diversified(&[0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44]);
        assert_ne!(
            diversified.find(kif::PERSO, DEFAULT_KVC),
            keys.find(kif::PERSO, DEFAULT_KVC)
        );

        // Key material never shows up in debug output
        assert!(!format!("{keys:?}").contains("MASTER"));
    }
}
