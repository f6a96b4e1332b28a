//! OPEN and CLOSE SECURE SESSION commands (revision 3 layout)

use bytes::Bytes;
use calypso_apdu_core::Command;
use calypso_apdu_core::response::error::ResponseError;

use super::forward_apdu_command;
use crate::constants::{CHALLENGE_LENGTH, HALF_SIGNATURE_LENGTH, cla, ins, limits};

/// OPEN SECURE SESSION
///
/// Optionally reads one record in the same exchange: the record content comes
/// back in the open response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSessionCommand {
    command: Command,
}

impl OpenSessionCommand {
    /// Open a session with the key of `key_index` and the SAM challenge
    ///
    /// `read` designates the record to read along, as `(sfi, record_number)`.
    /// Records outside [`limits::OPEN_READ_RECORD`] cannot be designated and
    /// open without a read.
    pub fn new(
        key_index: u8,
        sam_challenge: [u8; CHALLENGE_LENGTH],
        read: Option<(u8, u8)>,
    ) -> Self {
        let (sfi, record_number) = read
            .filter(|(_, record_number)| limits::OPEN_READ_RECORD.contains(record_number))
            .unwrap_or((0, 0));
        let p1 = (record_number << 3) | key_index;
        let p2 = (sfi << 3) | 0x01;
        Self {
            command: Command::new_with_data_and_le(
                cla::ISO,
                ins::OPEN_SECURE_SESSION,
                p1,
                p2,
                Bytes::copy_from_slice(&sam_challenge),
                0x00,
            ),
        }
    }
}

forward_apdu_command!(OpenSessionCommand);

/// Parsed OPEN SECURE SESSION response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenSessionResponse {
    /// Card challenge: transaction counter (3 bytes) and random byte
    pub card_challenge: [u8; CHALLENGE_LENGTH],
    /// Whether the previous session was ratified
    pub previous_session_ratified: bool,
    /// Key identifier used by the card
    pub kif: u8,
    /// Key version used by the card
    pub kvc: u8,
    /// Content of the record read along, empty if none
    pub record_data: Bytes,
    /// Whole response payload, fed to the SAM digest
    pub raw: Bytes,
}

impl OpenSessionResponse {
    /// Parse the response payload (status word excluded)
    pub fn parse(payload: &[u8]) -> Result<Self, ResponseError> {
        if payload.len() < 8 {
            return Err(ResponseError::Length {
                expected: 8,
                actual: payload.len(),
            });
        }

        let data_length = payload[7] as usize;
        if payload.len() != 8 + data_length {
            return Err(ResponseError::Length {
                expected: 8 + data_length,
                actual: payload.len(),
            });
        }

        let mut card_challenge = [0u8; CHALLENGE_LENGTH];
        card_challenge.copy_from_slice(&payload[..CHALLENGE_LENGTH]);

        Ok(Self {
            card_challenge,
            previous_session_ratified: payload[4] == 0x00,
            kif: payload[5],
            kvc: payload[6],
            record_data: Bytes::copy_from_slice(&payload[8..]),
            raw: Bytes::copy_from_slice(payload),
        })
    }

    /// Transaction counter carried by the challenge
    pub fn transaction_counter(&self) -> u32 {
        u32::from_be_bytes([
            0,
            self.card_challenge[0],
            self.card_challenge[1],
            self.card_challenge[2],
        ])
    }
}

/// CLOSE SECURE SESSION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseSessionCommand {
    command: Command,
}

impl CloseSessionCommand {
    /// Commit the session with the SAM half signature
    pub fn new(sam_half_signature: [u8; HALF_SIGNATURE_LENGTH], ratification_asked: bool) -> Self {
        let p1 = if ratification_asked { 0x00 } else { 0x80 };
        Self {
            command: Command::new_with_data_and_le(
                cla::ISO,
                ins::CLOSE_SECURE_SESSION,
                p1,
                0x00,
                Bytes::copy_from_slice(&sam_half_signature),
                0x00,
            ),
        }
    }

    /// Abort the session: the card discards every modification made in it
    pub const fn abort() -> Self {
        Self {
            command: Command::new_with_le(cla::ISO, ins::CLOSE_SECURE_SESSION, 0x00, 0x00, 0x00),
        }
    }

    /// Whether this is an abort
    pub const fn is_abort(&self) -> bool {
        self.command.data.is_none()
    }
}

forward_apdu_command!(CloseSessionCommand);

/// Parsed CLOSE SECURE SESSION response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CloseSessionResponse {
    /// Card half signature, checked by the SAM
    pub card_half_signature: [u8; HALF_SIGNATURE_LENGTH],
}

impl CloseSessionResponse {
    /// Parse the response payload (status word excluded)
    ///
    /// Postponed data may precede the signature; only the signature is kept.
    pub fn parse(payload: &[u8]) -> Result<Self, ResponseError> {
        if payload.len() < HALF_SIGNATURE_LENGTH {
            return Err(ResponseError::Length {
                expected: HALF_SIGNATURE_LENGTH,
                actual: payload.len(),
            });
        }
        let mut card_half_signature = [0u8; HALF_SIGNATURE_LENGTH];
        card_half_signature.copy_from_slice(&payload[payload.len() - HALF_SIGNATURE_LENGTH..]);
        Ok(Self {
            card_half_signature,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calypso_apdu_core::ApduCommand;
    use hex_literal::hex;

    #[test]
    fn test_open_session_command() {
        // Debit key, read SFI 07 record 1 along
        let cmd = OpenSessionCommand::new(3, hex!("C1C2C3C4"), Some((0x07, 1)));
        assert_eq!(cmd.to_bytes().as_ref(), &hex!("008A0B3904C1C2C3C400"));

        let cmd = OpenSessionCommand::new(1, hex!("00000000"), None);
        assert_eq!(cmd.p1(), 0x01);
        assert_eq!(cmd.p2(), 0x01);

        // Record 33 does not fit in P1
        let cmd = OpenSessionCommand::new(3, hex!("C1C2C3C4"), Some((0x07, 33)));
        assert_eq!(cmd.p1(), 0x03);
        assert_eq!(cmd.p2(), 0x01);
        let cmd = OpenSessionCommand::new(3, hex!("C1C2C3C4"), Some((0x07, 31)));
        assert_eq!(cmd.p1(), 0xFB);
    }

    #[test]
    fn test_open_session_response() {
        let payload = hex!("0000 2A 5C 00 30 79 03 AABBCC");
        let resp = OpenSessionResponse::parse(&payload).unwrap();
        assert_eq!(resp.card_challenge, hex!("00002A5C"));
        assert_eq!(resp.transaction_counter(), 0x2A);
        assert!(resp.previous_session_ratified);
        assert_eq!(resp.kif, 0x30);
        assert_eq!(resp.kvc, 0x79);
        assert_eq!(resp.record_data.as_ref(), &hex!("AABBCC"));
        assert_eq!(resp.raw.as_ref(), &payload);

        // Data length disagrees with the payload
        assert!(OpenSessionResponse::parse(&hex!("00002A5C00307905AABB")).is_err());
        assert!(OpenSessionResponse::parse(&hex!("00002A")).is_err());
    }

    #[test]
    fn test_close_session() {
        let cmd = CloseSessionCommand::new(hex!("11223344"), false);
        assert_eq!(cmd.to_bytes().as_ref(), &hex!("008E8000041122334400"));
        assert!(!cmd.is_abort());

        let abort = CloseSessionCommand::abort();
        assert_eq!(abort.to_bytes().as_ref(), &hex!("008E000000"));
        assert!(abort.is_abort());

        let resp = CloseSessionResponse::parse(&hex!("0102 A1A2A3A4")).unwrap();
        assert_eq!(resp.card_half_signature, hex!("A1A2A3A4"));
        assert!(CloseSessionResponse::parse(&hex!("A1A2")).is_err());
    }
}
