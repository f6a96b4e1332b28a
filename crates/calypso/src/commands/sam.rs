//! SAM commands used to compute and check session signatures

use bytes::{BufMut, Bytes, BytesMut};
use calypso_apdu_core::Command;

use super::forward_apdu_command;
use crate::constants::{CHALLENGE_LENGTH, HALF_SIGNATURE_LENGTH, ins};

/// SELECT DIVERSIFIER: sets the card serial number keys are diversified with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectDiversifierCommand {
    command: Command,
}

impl SelectDiversifierCommand {
    /// Diversify with the given card serial number
    pub fn new(class: u8, serial_number: &[u8]) -> Self {
        Self {
            command: Command::new_with_data(
                class,
                ins::SELECT_DIVERSIFIER,
                0x00,
                0x00,
                Bytes::copy_from_slice(serial_number),
            ),
        }
    }
}

forward_apdu_command!(SelectDiversifierCommand);

/// GET CHALLENGE: 4-byte random for the session opening
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetChallengeCommand {
    command: Command,
}

impl GetChallengeCommand {
    /// Request a challenge
    pub const fn new(class: u8) -> Self {
        Self {
            command: Command::new_with_le(
                class,
                ins::GET_CHALLENGE,
                0x00,
                0x00,
                CHALLENGE_LENGTH as u8,
            ),
        }
    }
}

forward_apdu_command!(GetChallengeCommand);

/// DIGEST INIT: starts the session digest with the open response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestInitCommand {
    command: Command,
}

impl DigestInitCommand {
    /// Start a digest with the card key `(kif, kvc)` and the open response payload
    pub fn new(class: u8, kif: u8, kvc: u8, open_response: &[u8]) -> Self {
        let mut data = BytesMut::with_capacity(2 + open_response.len());
        data.put_u8(kif);
        data.put_u8(kvc);
        data.put_slice(open_response);
        Self {
            command: Command::new_with_data(class, ins::DIGEST_INIT, 0x00, 0xFF, data.freeze()),
        }
    }
}

forward_apdu_command!(DigestInitCommand);

/// DIGEST UPDATE: adds one card command or response to the digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestUpdateCommand {
    command: Command,
}

impl DigestUpdateCommand {
    /// Digest the given bytes
    pub fn new(class: u8, data: &[u8]) -> Self {
        Self {
            command: Command::new_with_data(
                class,
                ins::DIGEST_UPDATE,
                0x00,
                0x00,
                Bytes::copy_from_slice(data),
            ),
        }
    }
}

forward_apdu_command!(DigestUpdateCommand);

/// DIGEST CLOSE: returns the SAM half signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestCloseCommand {
    command: Command,
}

impl DigestCloseCommand {
    /// Close the digest
    pub const fn new(class: u8) -> Self {
        Self {
            command: Command::new_with_le(
                class,
                ins::DIGEST_CLOSE,
                0x00,
                0x00,
                HALF_SIGNATURE_LENGTH as u8,
            ),
        }
    }
}

forward_apdu_command!(DigestCloseCommand);

/// DIGEST AUTHENTICATE: checks the card half signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestAuthenticateCommand {
    command: Command,
}

impl DigestAuthenticateCommand {
    /// Check the card half signature
    pub fn new(class: u8, card_half_signature: &[u8; HALF_SIGNATURE_LENGTH]) -> Self {
        Self {
            command: Command::new_with_data(
                class,
                ins::DIGEST_AUTHENTICATE,
                0x00,
                0x00,
                Bytes::copy_from_slice(card_half_signature),
            ),
        }
    }
}

forward_apdu_command!(DigestAuthenticateCommand);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::cla;
    use calypso_apdu_core::ApduCommand;
    use hex_literal::hex;

    #[test]
    fn test_sam_commands() {
        assert_eq!(
            SelectDiversifierCommand::new(cla::SAM_S1, &hex!("0000000011223344"))
                .to_bytes()
                .as_ref(),
            &hex!("94140000080000000011223344")
        );
        assert_eq!(
            GetChallengeCommand::new(cla::SAM_C1).to_bytes().as_ref(),
            &hex!("8084000004")
        );
        assert_eq!(
            DigestInitCommand::new(cla::SAM_S1, 0x30, 0x79, &hex!("00002A5C00307900"))
                .to_bytes()
                .as_ref(),
            &hex!("948A00FF0A307900002A5C00307900")
        );
        assert_eq!(
            DigestCloseCommand::new(cla::SAM_S1).to_bytes().as_ref(),
            &hex!("948E000004")
        );
        assert_eq!(
            DigestAuthenticateCommand::new(cla::SAM_S1, &hex!("A1A2A3A4"))
                .to_bytes()
                .as_ref(),
            &hex!("9482000004A1A2A3A4")
        );
    }
}
