//! Reader and card protocol identifiers
//!
//! Protocol names travel as strings through configuration and the command
//! line. Parsing is exhaustive: an unrecognized name is an error, never a
//! silently chosen default.

use std::str::FromStr;

use derive_more::Display;

use crate::error::ReaderError;

/// Low-level protocol a reader can be asked to detect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum ReaderProtocol {
    /// ISO 14443-4 contactless
    #[display("ISO_14443_4")]
    Iso14443_4,
    /// ISO 7816-3 contact, T=0
    #[display("ISO_7816_3_T0")]
    Iso7816_3_T0,
    /// ISO 7816-3 contact, T=1
    #[display("ISO_7816_3_T1")]
    Iso7816_3_T1,
    /// Innovatron B Prime contactless
    #[display("INNOVATRON_B_PRIME_CARD")]
    InnovatronBPrime,
}

impl ReaderProtocol {
    /// Every protocol a reader may support
    pub const ALL: [Self; 4] = [
        Self::Iso14443_4,
        Self::Iso7816_3_T0,
        Self::Iso7816_3_T1,
        Self::InnovatronBPrime,
    ];

    /// Whether this is a contactless protocol
    pub const fn is_contactless(&self) -> bool {
        matches!(self, Self::Iso14443_4 | Self::InnovatronBPrime)
    }
}

impl FromStr for ReaderProtocol {
    type Err = ReaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ISO_14443_4" => Ok(Self::Iso14443_4),
            "ISO_7816_3_T0" => Ok(Self::Iso7816_3_T0),
            "ISO_7816_3_T1" => Ok(Self::Iso7816_3_T1),
            "INNOVATRON_B_PRIME_CARD" => Ok(Self::InnovatronBPrime),
            other => Err(ReaderError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Logical card protocol used as a selection filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CardProtocol {
    /// NFC-A cards (ISO 14443-3 type A)
    #[display("NFC_A_ISO_14443_3A")]
    NfcA,
    /// NFC-B cards (ISO 14443-3 type B)
    #[display("NFC_B_ISO_14443_3B")]
    NfcB,
    /// Contact cards speaking T=0
    #[display("ISO_7816_3_T0")]
    Iso7816T0,
    /// Contact cards speaking T=1
    #[display("ISO_7816_3_T1")]
    Iso7816T1,
}

impl CardProtocol {
    /// The reader protocol that has to be activated to detect this card protocol
    pub const fn reader_protocol(&self) -> ReaderProtocol {
        match self {
            Self::NfcA | Self::NfcB => ReaderProtocol::Iso14443_4,
            Self::Iso7816T0 => ReaderProtocol::Iso7816_3_T0,
            Self::Iso7816T1 => ReaderProtocol::Iso7816_3_T1,
        }
    }

    /// Whether the card is reached through the contactless interface
    pub const fn is_contactless(&self) -> bool {
        matches!(self, Self::NfcA | Self::NfcB)
    }

    /// ISO transmission protocol the reader should use for this card
    pub const fn iso_protocol(&self) -> IsoProtocol {
        if self.is_contactless() {
            IsoProtocol::T1
        } else {
            IsoProtocol::T0
        }
    }
}

impl FromStr for CardProtocol {
    type Err = ReaderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NFC_A_ISO_14443_3A" => Ok(Self::NfcA),
            "NFC_B_ISO_14443_3B" => Ok(Self::NfcB),
            // "TO" is a legacy spelling still emitted by some test plans
            "ISO_7816_3_T0" | "ISO_7816_3_TO" => Ok(Self::Iso7816T0),
            "ISO_7816_3_T1" => Ok(Self::Iso7816T1),
            other => Err(ReaderError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// ISO 7816 transmission protocol of a contact-configurable reader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum IsoProtocol {
    /// Character-oriented T=0
    T0,
    /// Block-oriented T=1
    T1,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_protocol_round_trip_names() {
        for protocol in ReaderProtocol::ALL {
            assert_eq!(protocol.to_string().parse::<ReaderProtocol>().unwrap(), protocol);
        }
        assert!(matches!(
            "ISO_7816_3".parse::<ReaderProtocol>(),
            Err(ReaderError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn test_card_protocol_mapping() {
        let nfc_a: CardProtocol = "NFC_A_ISO_14443_3A".parse().unwrap();
        assert_eq!(nfc_a.reader_protocol(), ReaderProtocol::Iso14443_4);
        assert_eq!(nfc_a.iso_protocol(), IsoProtocol::T1);

        let t0: CardProtocol = "ISO_7816_3_TO".parse().unwrap();
        assert_eq!(t0, CardProtocol::Iso7816T0);
        assert_eq!(t0.reader_protocol(), ReaderProtocol::Iso7816_3_T0);
        assert!(!t0.is_contactless());

        assert!("MIFARE_CLASSIC".parse::<CardProtocol>().is_err());
    }
}
