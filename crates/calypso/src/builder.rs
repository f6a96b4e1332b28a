//! Record command descriptors and batches

use bytes::Bytes;
use calypso_apdu_core::{ApduCommand, Command};
use derive_more::Display;

use crate::commands::{
    AppendRecordCommand, ReadRecordCommand, UpdateRecordCommand, WriteRecordCommand,
};
use crate::constants::{MODIFICATION_OVERHEAD, limits};
use crate::error::{CommandError, TransactionError};
use crate::transaction::CardTransaction;

/// Kind of record command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum CommandKind {
    /// READ RECORD
    #[display("READ RECORD")]
    ReadRecord,
    /// UPDATE RECORD
    #[display("UPDATE RECORD")]
    UpdateRecord,
    /// WRITE RECORD
    #[display("WRITE RECORD")]
    WriteRecord,
    /// APPEND RECORD
    #[display("APPEND RECORD")]
    AppendRecord,
}

/// A validated record command, executed once its transaction runs it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    kind: CommandKind,
    sfi: u8,
    record_number: u8,
    payload: Bytes,
}

impl CommandDescriptor {
    /// Read one record
    pub fn read_record(sfi: u8, record_number: u8) -> Result<Self, CommandError> {
        check_address(sfi, record_number)?;
        Ok(Self {
            kind: CommandKind::ReadRecord,
            sfi,
            record_number,
            payload: Bytes::new(),
        })
    }

    /// Replace a record
    pub fn update_record(
        sfi: u8,
        record_number: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, CommandError> {
        check_address(sfi, record_number)?;
        Ok(Self {
            kind: CommandKind::UpdateRecord,
            sfi,
            record_number,
            payload: check_payload(payload.into())?,
        })
    }

    /// OR data into a record
    pub fn write_record(
        sfi: u8,
        record_number: u8,
        payload: impl Into<Bytes>,
    ) -> Result<Self, CommandError> {
        check_address(sfi, record_number)?;
        Ok(Self {
            kind: CommandKind::WriteRecord,
            sfi,
            record_number,
            payload: check_payload(payload.into())?,
        })
    }

    /// Add a record at the head of a cyclic file
    ///
    /// The appended record becomes record 1.
    pub fn append_record(sfi: u8, payload: impl Into<Bytes>) -> Result<Self, CommandError> {
        check_address(sfi, 1)?;
        Ok(Self {
            kind: CommandKind::AppendRecord,
            sfi,
            record_number: 1,
            payload: check_payload(payload.into())?,
        })
    }

    /// Command kind
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Short file identifier
    pub const fn sfi(&self) -> u8 {
        self.sfi
    }

    /// Record number
    pub const fn record_number(&self) -> u8 {
        self.record_number
    }

    /// Data written, empty for reads
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Whether the command modifies the card
    pub const fn is_modifying(&self) -> bool {
        !matches!(self.kind, CommandKind::ReadRecord)
    }

    /// Session buffer bytes the command consumes
    pub const fn modification_cost(&self) -> usize {
        if self.is_modifying() {
            self.payload.len() + MODIFICATION_OVERHEAD
        } else {
            0
        }
    }

    /// APDU of the command
    pub fn to_command(&self) -> Command {
        match self.kind {
            CommandKind::ReadRecord => {
                ReadRecordCommand::new(self.sfi, self.record_number).to_command()
            }
            CommandKind::UpdateRecord => {
                UpdateRecordCommand::new(self.sfi, self.record_number, self.payload.clone())
                    .to_command()
            }
            CommandKind::WriteRecord => {
                WriteRecordCommand::new(self.sfi, self.record_number, self.payload.clone())
                    .to_command()
            }
            CommandKind::AppendRecord => {
                AppendRecordCommand::new(self.sfi, self.payload.clone()).to_command()
            }
        }
    }
}

fn check_address(sfi: u8, record_number: u8) -> Result<(), CommandError> {
    if !limits::SFI.contains(&sfi) {
        return Err(CommandError::InvalidAddress(format!(
            "SFI {sfi:#04x} outside {:?}",
            limits::SFI
        )));
    }
    if !limits::RECORD_NUMBER.contains(&record_number) {
        return Err(CommandError::InvalidAddress(format!(
            "record number {record_number} outside {:?}",
            limits::RECORD_NUMBER
        )));
    }
    Ok(())
}

fn check_payload(payload: Bytes) -> Result<Bytes, CommandError> {
    if !limits::PAYLOAD_LENGTH.contains(&payload.len()) {
        return Err(CommandError::InvalidPayload(format!(
            "{} bytes outside {:?}",
            payload.len(),
            limits::PAYLOAD_LENGTH
        )));
    }
    Ok(payload)
}

/// Ordered descriptors handed to a transaction in one go
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandBatch {
    descriptors: Vec<CommandDescriptor>,
}

impl CommandBatch {
    /// Empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a read
    pub fn read_record(&mut self, sfi: u8, record_number: u8) -> Result<&mut Self, CommandError> {
        self.descriptors
            .push(CommandDescriptor::read_record(sfi, record_number)?);
        Ok(self)
    }

    /// Append an update
    pub fn update_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        payload: impl Into<Bytes>,
    ) -> Result<&mut Self, CommandError> {
        self.descriptors
            .push(CommandDescriptor::update_record(sfi, record_number, payload)?);
        Ok(self)
    }

    /// Append a write
    pub fn write_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        payload: impl Into<Bytes>,
    ) -> Result<&mut Self, CommandError> {
        self.descriptors
            .push(CommandDescriptor::write_record(sfi, record_number, payload)?);
        Ok(self)
    }

    /// Append an append
    pub fn append_record(
        &mut self,
        sfi: u8,
        payload: impl Into<Bytes>,
    ) -> Result<&mut Self, CommandError> {
        self.descriptors
            .push(CommandDescriptor::append_record(sfi, payload)?);
        Ok(self)
    }

    /// Append an already built descriptor
    pub fn push(&mut self, descriptor: CommandDescriptor) -> &mut Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Descriptors in execution order
    pub fn descriptors(&self) -> &[CommandDescriptor] {
        &self.descriptors
    }

    /// Number of descriptors
    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Queue every descriptor into a transaction that has not opened its session yet
    pub fn queue_into(self, transaction: &mut CardTransaction) -> Result<(), TransactionError> {
        for descriptor in self.descriptors {
            transaction.queue_command(descriptor)?;
        }
        Ok(())
    }
}

impl IntoIterator for CommandBatch {
    type Item = CommandDescriptor;
    type IntoIter = std::vec::IntoIter<CommandDescriptor>;

    fn into_iter(self) -> Self::IntoIter {
        self.descriptors.into_iter()
    }
}

impl FromIterator<CommandDescriptor> for CommandBatch {
    fn from_iter<I: IntoIterator<Item = CommandDescriptor>>(iter: I) -> Self {
        Self {
            descriptors: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_address_bounds() {
        assert!(CommandDescriptor::read_record(1, 1).is_ok());
        assert!(CommandDescriptor::read_record(30, 250).is_ok());

        for (sfi, record) in [(0, 1), (31, 1), (1, 0), (1, 251), (0xFF, 0xFF)] {
            assert!(matches!(
                CommandDescriptor::read_record(sfi, record),
                Err(CommandError::InvalidAddress(_))
            ));
        }
        assert!(matches!(
            CommandDescriptor::append_record(31, &hex!("01")[..]),
            Err(CommandError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_payload_bounds() {
        assert!(matches!(
            CommandDescriptor::write_record(7, 1, Bytes::new()),
            Err(CommandError::InvalidPayload(_))
        ));
        assert!(matches!(
            CommandDescriptor::update_record(7, 1, vec![0u8; 251]),
            Err(CommandError::InvalidPayload(_))
        ));
        assert!(CommandDescriptor::update_record(7, 1, vec![0u8; 250]).is_ok());
    }

    #[test]
    fn test_descriptor_commands() {
        let read = CommandDescriptor::read_record(0x07, 1).unwrap();
        assert!(!read.is_modifying());
        assert_eq!(read.modification_cost(), 0);
        assert_eq!(read.to_command().to_bytes().as_ref(), &hex!("00B2013C00"));
        assert_eq!(read.kind().to_string(), "READ RECORD");

        let write = CommandDescriptor::write_record(0x08, 2, Bytes::from_static(&hex!("0102"))).unwrap();
        assert!(write.is_modifying());
        assert_eq!(write.modification_cost(), 8);
        assert_eq!(write.to_command().to_bytes().as_ref(), &hex!("00D20244020102"));

        let append = CommandDescriptor::append_record(0x19, Bytes::from_static(&hex!("AABB"))).unwrap();
        assert_eq!(append.to_command().to_bytes().as_ref(), &hex!("00E200C802AABB"));
    }

    #[test]
    fn test_batch_order() {
        let mut batch = CommandBatch::new();
        batch
            .read_record(0x07, 1)
            .unwrap()
            .update_record(0x08, 1, &hex!("01")[..])
            .unwrap()
            .append_record(0x19, &hex!("02")[..])
            .unwrap();
        assert!(batch.read_record(0, 1).is_err());

        let kinds: Vec<_> = batch.into_iter().map(|d| d.kind()).collect();
        assert_eq!(
            kinds,
            [
                CommandKind::ReadRecord,
                CommandKind::UpdateRecord,
                CommandKind::AppendRecord
            ]
        );
    }
}
