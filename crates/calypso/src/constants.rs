//! Constants for Calypso card and SAM commands

/// Class bytes
pub mod cla {
    /// ISO class used by revision 3 cards
    pub const ISO: u8 = 0x00;
    /// SAM C1 class
    pub const SAM_C1: u8 = 0x80;
    /// SAM S1D / S1E class
    pub const SAM_S1: u8 = 0x94;
}

/// Instruction codes
pub mod ins {
    /// SELECT APPLICATION
    pub const SELECT: u8 = 0xA4;
    /// READ RECORD(S)
    pub const READ_RECORD: u8 = 0xB2;
    /// UPDATE RECORD
    pub const UPDATE_RECORD: u8 = 0xDC;
    /// WRITE RECORD
    pub const WRITE_RECORD: u8 = 0xD2;
    /// APPEND RECORD
    pub const APPEND_RECORD: u8 = 0xE2;
    /// OPEN SECURE SESSION
    pub const OPEN_SECURE_SESSION: u8 = 0x8A;
    /// CLOSE SECURE SESSION
    pub const CLOSE_SECURE_SESSION: u8 = 0x8E;

    /// SAM SELECT DIVERSIFIER
    pub const SELECT_DIVERSIFIER: u8 = 0x14;
    /// SAM GET CHALLENGE
    pub const GET_CHALLENGE: u8 = 0x84;
    /// SAM DIGEST INIT
    pub const DIGEST_INIT: u8 = 0x8A;
    /// SAM DIGEST UPDATE
    pub const DIGEST_UPDATE: u8 = 0x8C;
    /// SAM DIGEST CLOSE
    pub const DIGEST_CLOSE: u8 = 0x8E;
    /// SAM DIGEST AUTHENTICATE
    pub const DIGEST_AUTHENTICATE: u8 = 0x82;
}

/// BER-TLV tags of the SELECT APPLICATION response
pub mod tags {
    /// FCI template
    pub const FCI_TEMPLATE: &[u8] = &[0x6F];
    /// DF name
    pub const DF_NAME: &[u8] = &[0x84];
    /// FCI proprietary template
    pub const PROPRIETARY_TEMPLATE: &[u8] = &[0xA5];
    /// FCI issuer discretionary data
    pub const ISSUER_DISCRETIONARY: &[u8] = &[0xBF, 0x0C];
    /// Application serial number
    pub const APPLICATION_SERIAL_NUMBER: &[u8] = &[0xC7];
    /// Discretionary data (startup information)
    pub const DISCRETIONARY_DATA: &[u8] = &[0x53];
}

/// Key identifiers per session access level
pub mod kif {
    /// Personalization key
    pub const PERSO: u8 = 0x21;
    /// Reload key
    pub const LOAD: u8 = 0x27;
    /// Debit key
    pub const DEBIT: u8 = 0x30;
    /// Returned by cards that do not report a KIF
    pub const UNDEFINED: u8 = 0xFF;
}

/// Default key version
pub const DEFAULT_KVC: u8 = 0x79;

/// Addressing limits
pub mod limits {
    use std::ops::RangeInclusive;

    /// Valid short file identifiers
    pub const SFI: RangeInclusive<u8> = 1..=30;
    /// Valid record numbers
    pub const RECORD_NUMBER: RangeInclusive<u8> = 1..=250;
    /// Records OPEN SECURE SESSION can read along (five bits of P1)
    pub const OPEN_READ_RECORD: RangeInclusive<u8> = 1..=31;
    /// Valid record payload lengths
    pub const PAYLOAD_LENGTH: RangeInclusive<usize> = 1..=250;
}

/// Length of the challenges exchanged when opening a session
pub const CHALLENGE_LENGTH: usize = 4;

/// Length of a half session signature
pub const HALF_SIGNATURE_LENGTH: usize = 4;

/// Fixed overhead charged to the session buffer for each modifying command
pub const MODIFICATION_OVERHEAD: usize = 6;
