//! Record file commands
//!
//! Records are addressed by short file identifier (SFI) and record number.
//! Bounds are checked when building [`CommandDescriptor`](crate::CommandDescriptor)s,
//! not here.

use bytes::Bytes;
use calypso_apdu_core::Command;

use super::forward_apdu_command;
use crate::constants::{cla, ins};

/// P2 for commands addressing one record of the file designated by `sfi`
const fn record_p2(sfi: u8) -> u8 {
    (sfi << 3) | 0x04
}

/// READ RECORD, single record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRecordCommand {
    command: Command,
}

impl ReadRecordCommand {
    /// Read one record
    pub const fn new(sfi: u8, record_number: u8) -> Self {
        Self {
            command: Command::new_with_le(
                cla::ISO,
                ins::READ_RECORD,
                record_number,
                record_p2(sfi),
                0x00,
            ),
        }
    }
}

forward_apdu_command!(ReadRecordCommand);

/// UPDATE RECORD: replaces the record content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecordCommand {
    command: Command,
}

impl UpdateRecordCommand {
    /// Replace one record
    pub fn new(sfi: u8, record_number: u8, data: impl Into<Bytes>) -> Self {
        Self {
            command: Command::new_with_data(
                cla::ISO,
                ins::UPDATE_RECORD,
                record_number,
                record_p2(sfi),
                data,
            ),
        }
    }
}

forward_apdu_command!(UpdateRecordCommand);

/// WRITE RECORD: ORs the data into the record content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecordCommand {
    command: Command,
}

impl WriteRecordCommand {
    /// Write into one record
    pub fn new(sfi: u8, record_number: u8, data: impl Into<Bytes>) -> Self {
        Self {
            command: Command::new_with_data(
                cla::ISO,
                ins::WRITE_RECORD,
                record_number,
                record_p2(sfi),
                data,
            ),
        }
    }
}

forward_apdu_command!(WriteRecordCommand);

/// APPEND RECORD: pushes a new first record into a cyclic file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendRecordCommand {
    command: Command,
}

impl AppendRecordCommand {
    /// Append a record
    pub fn new(sfi: u8, data: impl Into<Bytes>) -> Self {
        Self {
            command: Command::new_with_data(cla::ISO, ins::APPEND_RECORD, 0x00, sfi << 3, data),
        }
    }
}

forward_apdu_command!(AppendRecordCommand);

#[cfg(test)]
mod tests {
    use super::*;
    use calypso_apdu_core::ApduCommand;
    use hex_literal::hex;

    #[test]
    fn test_record_commands() {
        assert_eq!(ReadRecordCommand::new(0x07, 1).to_bytes().as_ref(), &hex!("00B2013C00"));
        assert_eq!(
            UpdateRecordCommand::new(0x08, 2, Bytes::from_static(&hex!("0102")))
                .to_bytes()
                .as_ref(),
            &hex!("00DC0244020102")
        );
        assert_eq!(
            WriteRecordCommand::new(0x08, 1, Bytes::from_static(&hex!("FF")))
                .to_bytes()
                .as_ref(),
            &hex!("00D2014401FF")
        );
        assert_eq!(
            AppendRecordCommand::new(0x19, Bytes::from_static(&hex!("AABB")))
                .to_bytes()
                .as_ref(),
            &hex!("00E200C802AABB")
        );
    }
}
