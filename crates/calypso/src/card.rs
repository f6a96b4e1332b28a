//! Smart card models produced by the selection service

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Bytes, BytesMut};
use calypso_reader::SharedReader;

use crate::commands::SelectApplicationResponse;
use crate::error::SelectionError;
use crate::security::SamRevision;

/// A card matched by the selection service
pub trait SmartCard: fmt::Debug + Send {
    /// Serial number the selector's serial regex is checked against
    fn serial_number(&self) -> &[u8];

    /// Answer to reset
    fn atr(&self) -> &[u8];

    /// Full name of the selected application, when one was selected
    fn df_name(&self) -> Option<&[u8]> {
        None
    }
}

/// Session buffer sizes in bytes, indexed by the startup information indicator
const BUFFER_SIZES: [usize; 56] = [
    0, 0, 0, 0, 0, 0, 215, 256, 304, 362, 430, 512, 608, 724, 861, 1024, 1217, 1448, 1722, 2048,
    2435, 2896, 3444, 4096, 4870, 5792, 6888, 8192, 9741, 11585, 13777, 16384, 19483, 23170,
    27554, 32768, 38967, 46340, 55108, 65536, 77935, 92681, 110217, 131072, 155871, 185363,
    220435, 262144, 311743, 370727, 440871, 524288, 623487, 741455, 881743, 1048576,
];

/// Startup information returned in the FCI discretionary data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupInfo {
    raw: [u8; 7],
}

impl StartupInfo {
    /// Parse the 7 startup bytes
    pub fn parse(data: &[u8]) -> Result<Self, SelectionError> {
        let raw: [u8; 7] = data
            .get(..7)
            .and_then(|d| d.try_into().ok())
            .ok_or_else(|| SelectionError::Response("startup information too short".into()))?;
        if raw[0] as usize >= BUFFER_SIZES.len() {
            return Err(SelectionError::Response(format!(
                "unknown session buffer size indicator {:#04x}",
                raw[0]
            )));
        }
        Ok(Self { raw })
    }

    /// Bytes the card accepts for modifications within one session
    pub const fn session_buffer_size(&self) -> usize {
        BUFFER_SIZES[self.raw[0] as usize]
    }

    /// Platform byte
    pub const fn platform(&self) -> u8 {
        self.raw[1]
    }

    /// Application type byte
    pub const fn application_type(&self) -> u8 {
        self.raw[2]
    }

    /// Application subtype byte
    pub const fn application_subtype(&self) -> u8 {
        self.raw[3]
    }

    /// Software issuer byte
    pub const fn software_issuer(&self) -> u8 {
        self.raw[4]
    }

    /// Software version byte
    pub const fn software_version(&self) -> u8 {
        self.raw[5]
    }

    /// Software revision byte
    pub const fn software_revision(&self) -> u8 {
        self.raw[6]
    }

    /// Whether the application has a PIN
    pub const fn has_pin(&self) -> bool {
        self.application_type() & 0x01 != 0
    }

    /// Whether the application has a stored value purse
    pub const fn has_stored_value(&self) -> bool {
        self.application_type() & 0x02 != 0
    }

    /// Whether ratification happens on deselection
    pub const fn is_ratification_on_deselect(&self) -> bool {
        self.application_type() & 0x04 == 0
    }
}

/// Image of the card file system, built from the records read or committed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileData {
    files: BTreeMap<u8, BTreeMap<u8, Bytes>>,
}

impl FileData {
    /// Known content of a record
    pub fn record(&self, sfi: u8, record_number: u8) -> Option<&Bytes> {
        self.files.get(&sfi)?.get(&record_number)
    }

    /// Known records of a file
    pub fn records(&self, sfi: u8) -> impl Iterator<Item = (u8, &Bytes)> {
        self.files
            .get(&sfi)
            .into_iter()
            .flat_map(|records| records.iter().map(|(number, data)| (*number, data)))
    }

    /// Replace a record
    pub fn set_record(&mut self, sfi: u8, record_number: u8, data: Bytes) {
        self.files.entry(sfi).or_default().insert(record_number, data);
    }

    /// OR data into a record, as WRITE RECORD does
    pub fn fill_record(&mut self, sfi: u8, record_number: u8, data: &[u8]) {
        let records = self.files.entry(sfi).or_default();
        let current = records.get(&record_number).map_or(&[][..], |r| r.as_ref());
        let mut merged = BytesMut::from(current);
        if merged.len() < data.len() {
            merged.resize(data.len(), 0);
        }
        for (target, byte) in merged.iter_mut().zip(data) {
            *target |= byte;
        }
        records.insert(record_number, merged.freeze());
    }

    /// Insert a record at the head of a cyclic file
    pub fn append_record(&mut self, sfi: u8, data: Bytes) {
        let records = self.files.entry(sfi).or_default();
        let shifted: BTreeMap<u8, Bytes> = std::mem::take(records)
            .into_iter()
            .filter_map(|(number, record)| number.checked_add(1).map(|n| (n, record)))
            .collect();
        *records = shifted;
        records.insert(1, data);
    }

    /// Whether nothing is known about the file system
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// A selected Calypso card (portable object)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalypsoCard {
    atr: Bytes,
    df_name: Bytes,
    serial_number: [u8; 8],
    startup_info: StartupInfo,
    invalidated: bool,
    files: FileData,
}

impl CalypsoCard {
    /// Build the card model from its ATR and SELECT APPLICATION response
    pub fn from_fci(
        atr: Bytes,
        fci: &SelectApplicationResponse,
        invalidated: bool,
    ) -> Result<Self, SelectionError> {
        Ok(Self {
            atr,
            df_name: fci.df_name.clone(),
            serial_number: fci.serial_number,
            startup_info: StartupInfo::parse(&fci.startup_info)?,
            invalidated,
            files: FileData::default(),
        })
    }

    /// Full DF name of the selected application
    pub fn df_name_bytes(&self) -> &[u8] {
        &self.df_name
    }

    /// Application serial number
    pub const fn application_serial_number(&self) -> &[u8; 8] {
        &self.serial_number
    }

    /// Startup information
    pub const fn startup_info(&self) -> &StartupInfo {
        &self.startup_info
    }

    /// Whether the application answered the selection as invalidated
    pub const fn is_invalidated(&self) -> bool {
        self.invalidated
    }

    /// File system image
    pub const fn file_data(&self) -> &FileData {
        &self.files
    }

    pub(crate) const fn file_data_mut(&mut self) -> &mut FileData {
        &mut self.files
    }
}

impl SmartCard for CalypsoCard {
    fn serial_number(&self) -> &[u8] {
        &self.serial_number
    }

    fn atr(&self) -> &[u8] {
        &self.atr
    }

    fn df_name(&self) -> Option<&[u8]> {
        Some(&self.df_name)
    }
}

/// A selected Calypso SAM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalypsoSam {
    atr: Bytes,
    revision: SamRevision,
    serial_number: [u8; 4],
}

impl CalypsoSam {
    /// Create a SAM model
    pub const fn new(atr: Bytes, revision: SamRevision, serial_number: [u8; 4]) -> Self {
        Self {
            atr,
            revision,
            serial_number,
        }
    }

    /// Resolved revision
    pub const fn revision(&self) -> SamRevision {
        self.revision
    }
}

impl SmartCard for CalypsoSam {
    fn serial_number(&self) -> &[u8] {
        &self.serial_number
    }

    fn atr(&self) -> &[u8] {
        &self.atr
    }
}

/// A selected card bound to the reader it was selected in
#[derive(Debug, Clone)]
pub struct CardResource<C> {
    pub(crate) reader: SharedReader,
    pub(crate) card: C,
}

impl<C: SmartCard> CardResource<C> {
    /// Bind a card to its reader
    pub const fn new(reader: SharedReader, card: C) -> Self {
        Self { reader, card }
    }

    /// Reader holding the card
    pub const fn reader(&self) -> &SharedReader {
        &self.reader
    }

    /// Card model
    pub const fn card(&self) -> &C {
        &self.card
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_startup_info() {
        let info = StartupInfo::parse(&hex!("0A3C1332141001")).unwrap();
        assert_eq!(info.session_buffer_size(), 430);
        assert_eq!(info.platform(), 0x3C);
        assert!(info.has_pin());
        assert!(info.has_stored_value());
        assert!(info.is_ratification_on_deselect());
        assert_eq!(info.software_revision(), 0x01);

        assert!(StartupInfo::parse(&hex!("0A3C13")).is_err());
        assert!(StartupInfo::parse(&hex!("403C1332141001")).is_err());
    }

    #[test]
    fn test_file_data_write_and_append() {
        let mut files = FileData::default();
        assert!(files.is_empty());

        files.set_record(0x07, 1, Bytes::from_static(&hex!("0F00")));
        files.fill_record(0x07, 1, &hex!("F0F0FF"));
        assert_eq!(files.record(0x07, 1).unwrap().as_ref(), &hex!("FFF0FF"));

        files.append_record(0x08, Bytes::from_static(&hex!("01")));
        files.append_record(0x08, Bytes::from_static(&hex!("02")));
        assert_eq!(files.record(0x08, 1).unwrap().as_ref(), &hex!("02"));
        assert_eq!(files.record(0x08, 2).unwrap().as_ref(), &hex!("01"));
        assert_eq!(files.records(0x08).count(), 2);
        assert!(files.record(0x09, 1).is_none());
    }
}
