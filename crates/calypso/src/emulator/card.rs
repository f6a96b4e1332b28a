use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use calypso_apdu_core::response::status::common as sw;
use calypso_apdu_core::{Command, TransportError};
use calypso_reader::ReaderProtocol;
use calypso_reader::stub::StubSmartCard;
use iso7816_tlv::ber::{Tag, Tlv, Value};
use parking_lot::Mutex;
use rand::RngCore;
use tracing::trace;

use super::{KeySet, respond};
use crate::card::FileData;
use crate::constants::{CHALLENGE_LENGTH, HALF_SIGNATURE_LENGTH, ins, kif, tags};
use crate::crypto::{SessionDigest, card_half, sam_half, session_key};

struct CardSession {
    digest: SessionDigest,
    files: FileData,
}

struct CardState {
    atr: Bytes,
    protocol: ReaderProtocol,
    df_name: Bytes,
    serial_number: [u8; 8],
    startup_info: [u8; 7],
    files: FileData,
    keys: KeySet,
    invalidated: bool,
    corrupt_signature: bool,
    counter: u32,
    ratified: bool,
    session: Option<CardSession>,
}

/// Emulated Calypso card
///
/// Clones share the same card, so a test keeps a handle on the card it
/// inserted in a stub reader and inspects the committed records.
#[derive(Clone)]
pub struct VirtualCalypsoCard {
    state: Arc<Mutex<CardState>>,
}

impl fmt::Debug for VirtualCalypsoCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VirtualCalypsoCard")
            .field("df_name", &hex::encode_upper(&state.df_name))
            .field("serial_number", &hex::encode_upper(state.serial_number))
            .field("session_open", &state.session.is_some())
            .finish_non_exhaustive()
    }
}

/// Builder for [`VirtualCalypsoCard`]
#[derive(Debug, Clone)]
pub struct VirtualCalypsoCardBuilder {
    atr: Bytes,
    protocol: ReaderProtocol,
    df_name: Bytes,
    serial_number: [u8; 8],
    startup_info: [u8; 7],
    files: FileData,
    master_keys: KeySet,
    invalidated: bool,
    corrupt_signature: bool,
}

impl Default for VirtualCalypsoCardBuilder {
    fn default() -> Self {
        Self {
            atr: Bytes::from_static(&[
                0x3B, 0x8F, 0x80, 0x01, 0x80, 0x5A, 0x0A, 0x01, 0x03, 0x20, 0x03, 0x11, 0x22,
                0x33, 0x44, 0x82, 0x90, 0x00, 0x1A,
            ]),
            protocol: ReaderProtocol::Iso7816_3_T1,
            df_name: Bytes::from_static(&[0xA0, 0x00, 0x00, 0x02, 0x91, 0x01, 0x01]),
            serial_number: [0x00, 0x00, 0x00, 0x00, 0x11, 0x22, 0x33, 0x44],
            startup_info: [0x0A, 0x3C, 0x11, 0x32, 0x14, 0x10, 0x01],
            files: FileData::default(),
            master_keys: KeySet::test_keys(),
            invalidated: false,
            corrupt_signature: false,
        }
    }
}

impl VirtualCalypsoCardBuilder {
    /// Answer to reset
    pub fn atr(mut self, atr: &[u8]) -> Self {
        self.atr = Bytes::copy_from_slice(atr);
        self
    }

    /// Protocol the card is detected with
    pub const fn protocol(mut self, protocol: ReaderProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    /// Full DF name of the application
    pub fn df_name(mut self, df_name: &[u8]) -> Self {
        self.df_name = Bytes::copy_from_slice(df_name);
        self
    }

    /// Application serial number
    pub const fn serial_number(mut self, serial_number: [u8; 8]) -> Self {
        self.serial_number = serial_number;
        self
    }

    /// Startup information
    pub const fn startup_info(mut self, startup_info: [u8; 7]) -> Self {
        self.startup_info = startup_info;
        self
    }

    /// Initial record content
    pub fn record(mut self, sfi: u8, record_number: u8, data: &[u8]) -> Self {
        self.files
            .set_record(sfi, record_number, Bytes::copy_from_slice(data));
        self
    }

    /// Master keys, diversified with the serial number at build time
    pub fn master_keys(mut self, keys: KeySet) -> Self {
        self.master_keys = keys;
        self
    }

    /// Answer the selection with `6283`
    pub const fn invalidated(mut self, invalidated: bool) -> Self {
        self.invalidated = invalidated;
        self
    }

    /// Return a wrong card signature at close
    pub const fn corrupt_signature(mut self, corrupt: bool) -> Self {
        self.corrupt_signature = corrupt;
        self
    }

    /// Build the card
    pub fn build(self) -> VirtualCalypsoCard {
        VirtualCalypsoCard {
            state: Arc::new(Mutex::new(CardState {
                keys: self.master_keys.diversified(&self.serial_number),
                atr: self.atr,
                protocol: self.protocol,
                df_name: self.df_name,
                serial_number: self.serial_number,
                startup_info: self.startup_info,
                files: self.files,
                invalidated: self.invalidated,
                corrupt_signature: self.corrupt_signature,
                counter: 0x00_01_00,
                ratified: true,
                session: None,
            })),
        }
    }
}

impl VirtualCalypsoCard {
    /// Start building a card
    pub fn builder() -> VirtualCalypsoCardBuilder {
        VirtualCalypsoCardBuilder::default()
    }

    /// Committed content of a record
    pub fn record(&self, sfi: u8, record_number: u8) -> Option<Bytes> {
        self.state.lock().files.record(sfi, record_number).cloned()
    }

    /// Current transaction counter
    pub fn transaction_counter(&self) -> u32 {
        self.state.lock().counter
    }

    /// Whether a session is open
    pub fn is_session_open(&self) -> bool {
        self.state.lock().session.is_some()
    }
}

impl StubSmartCard for VirtualCalypsoCard {
    fn atr(&self) -> Bytes {
        self.state.lock().atr.clone()
    }

    fn protocol(&self) -> ReaderProtocol {
        self.state.lock().protocol
    }

    fn process_apdu(&mut self, apdu: &[u8]) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock();
        let Ok(command) = Command::from_bytes(apdu) else {
            return Ok(respond(&[], sw::WRONG_LENGTH));
        };

        let response = match command.ins {
            ins::SELECT => state.select(&command),
            ins::OPEN_SECURE_SESSION => state.open_session(&command),
            ins::CLOSE_SECURE_SESSION => state.close_session(&command),
            ins::READ_RECORD | ins::UPDATE_RECORD | ins::WRITE_RECORD | ins::APPEND_RECORD => {
                let response = state.record_command(&command);
                if let Some(session) = state.session.as_mut() {
                    session.digest.update(apdu);
                    session.digest.update(&response);
                }
                response
            }
            _ => respond(&[], sw::INVALID_INSTRUCTION),
        };
        trace!(
            command = %hex::encode_upper(apdu),
            response = %hex::encode_upper(&response),
            "Card APDU"
        );
        Ok(response)
    }

    fn reset(&mut self) {
        self.state.lock().session = None;
    }
}

impl CardState {
    fn fci(&self) -> Option<Vec<u8>> {
        let tlv = |tag: &[u8], value: Value| Tlv::new(
            Tag::try_from(tag.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))).ok()?,
            value,
        ).ok();
        let discretionary = tlv(
            tags::ISSUER_DISCRETIONARY,
            Value::Constructed(vec![
                tlv(
                    tags::APPLICATION_SERIAL_NUMBER,
                    Value::Primitive(self.serial_number.to_vec()),
                )?,
                tlv(
                    tags::DISCRETIONARY_DATA,
                    Value::Primitive(self.startup_info.to_vec()),
                )?,
            ]),
        )?;
        let fci = tlv(
            tags::FCI_TEMPLATE,
            Value::Constructed(vec![
                tlv(tags::DF_NAME, Value::Primitive(self.df_name.to_vec()))?,
                tlv(
                    tags::PROPRIETARY_TEMPLATE,
                    Value::Constructed(vec![discretionary]),
                )?,
            ]),
        )?;
        Some(fci.to_vec())
    }

    fn select(&mut self, command: &Command) -> Bytes {
        let aid = command.data.as_deref().unwrap_or_default();
        if command.p1 != 0x04 || !self.df_name.starts_with(aid) {
            return respond(&[], sw::FILE_NOT_FOUND);
        }
        self.session = None;
        let status = if self.invalidated {
            sw::FILE_INVALIDATED
        } else {
            sw::SUCCESS
        };
        match self.fci() {
            Some(fci) => respond(&fci, status),
            None => respond(&[], sw::INCORRECT_DATA),
        }
    }

    fn working_files(&mut self) -> &mut FileData {
        match self.session.as_mut() {
            Some(session) => &mut session.files,
            None => &mut self.files,
        }
    }

    fn record_command(&mut self, command: &Command) -> Bytes {
        let sfi = command.p2 >> 3;
        let record_number = command.p1;
        let data = command.data.clone().unwrap_or_default();
        let files = self.working_files();

        match command.ins {
            ins::READ_RECORD => {
                if command.p2 & 0x07 != 0x04 {
                    return respond(&[], sw::INCORRECT_P1P2);
                }
                match files.record(sfi, record_number) {
                    Some(record) => respond(record, sw::SUCCESS),
                    None if files.records(sfi).next().is_some() => {
                        respond(&[], sw::RECORD_NOT_FOUND)
                    }
                    None => respond(&[], sw::FILE_NOT_FOUND),
                }
            }
            ins::UPDATE_RECORD => {
                files.set_record(sfi, record_number, data);
                respond(&[], sw::SUCCESS)
            }
            ins::WRITE_RECORD => {
                files.fill_record(sfi, record_number, &data);
                respond(&[], sw::SUCCESS)
            }
            _ => {
                files.append_record(sfi, data);
                respond(&[], sw::SUCCESS)
            }
        }
    }

    fn open_session(&mut self, command: &Command) -> Bytes {
        let sam_challenge: [u8; CHALLENGE_LENGTH] =
            match command.data.as_deref().map(TryInto::try_into) {
                Some(Ok(challenge)) => challenge,
                _ => return respond(&[], sw::WRONG_LENGTH),
            };
        let key_kif = match command.p1 & 0x07 {
            1 => kif::PERSO,
            2 => kif::LOAD,
            3 => kif::DEBIT,
            _ => return respond(&[], sw::INCORRECT_P1P2),
        };
        let Some((kvc, key)) = self.keys.find_by_kif(key_kif) else {
            return respond(&[], sw::SECURITY_CONDITION_NOT_SATISFIED);
        };
        let Some(counter) = self.counter.checked_sub(1) else {
            return respond(&[], sw::COMMAND_NOT_ALLOWED);
        };

        let mut card_challenge = [0u8; CHALLENGE_LENGTH];
        card_challenge[..3].copy_from_slice(&counter.to_be_bytes()[1..]);
        rand::rng().fill_bytes(&mut card_challenge[3..]);
        let session_key = session_key(key, &card_challenge, &sam_challenge);

        let files = self.files.clone();
        let sfi = command.p2 >> 3;
        let record_number = command.p1 >> 3;
        let record = if sfi != 0 && record_number != 0 {
            files.record(sfi, record_number).cloned().unwrap_or_default()
        } else {
            Bytes::new()
        };

        let mut payload = BytesMut::with_capacity(8 + record.len());
        payload.put_slice(&card_challenge);
        payload.put_u8(if self.ratified { 0x00 } else { 0x01 });
        payload.put_u8(key_kif);
        payload.put_u8(kvc);
        payload.put_u8(record.len() as u8);
        payload.put_slice(&record);

        self.counter = counter;
        self.session = Some(CardSession {
            digest: SessionDigest::new(&session_key, &payload),
            files,
        });
        respond(&payload, sw::SUCCESS)
    }

    fn close_session(&mut self, command: &Command) -> Bytes {
        let Some(data) = command.data.as_deref() else {
            // Abort
            self.session = None;
            return respond(&[], sw::SUCCESS);
        };
        let Some(session) = self.session.take() else {
            return respond(&[], sw::CONDITIONS_NOT_SATISFIED);
        };
        if data.len() != HALF_SIGNATURE_LENGTH {
            return respond(&[], sw::WRONG_LENGTH);
        }

        let mac = session.digest.finalize();
        if sam_half(&mac) != data {
            return respond(&[], sw::INCORRECT_SIGNATURE);
        }

        self.files = session.files;
        self.ratified = command.p1 == 0x80;
        let mut signature = card_half(&mac);
        if self.corrupt_signature {
            signature[0] ^= 0x01;
        }
        respond(&signature, sw::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::SelectApplicationResponse;
    use hex_literal::hex;

    #[test]
    fn test_select_and_read_outside_session() {
        let mut card = VirtualCalypsoCard::builder()
            .record(0x07, 1, &hex!("0102"))
            .build();

        let response = card.process_apdu(&hex!("00A4040005A00000029100")).unwrap();
        assert_eq!(&response[response.len() - 2..], &hex!("9000"));
        let fci = SelectApplicationResponse::parse(&response[..response.len() - 2]).unwrap();
        assert_eq!(fci.df_name.as_ref(), &hex!("A0000002910101"));

        assert_eq!(
            card.process_apdu(&hex!("00A4040005A00000000100")).unwrap().as_ref(),
            &hex!("6A82")
        );
        assert_eq!(
            card.process_apdu(&hex!("00B2013C00")).unwrap().as_ref(),
            &hex!("01029000")
        );
        assert_eq!(
            card.process_apdu(&hex!("00B2023C00")).unwrap().as_ref(),
            &hex!("6A83")
        );
        assert_eq!(
            card.process_apdu(&hex!("00B2014400")).unwrap().as_ref(),
            &hex!("6A82")
        );
    }

    #[test]
    fn test_session_changes_are_discarded_on_abort() {
        let mut card = VirtualCalypsoCard::builder()
            .record(0x07, 1, &hex!("0102"))
            .build();
        let counter = card.transaction_counter();

        let response = card.process_apdu(&hex!("008A0B3904C1C2C3C400")).unwrap();
        assert_eq!(&response[response.len() - 2..], &hex!("9000"));
        // Record 1 of SFI 07 read along
        assert_eq!(&response[7..response.len() - 2], &hex!("02 0102"));
        assert!(card.is_session_open());
        assert_eq!(card.transaction_counter(), counter - 1);

        card.process_apdu(&hex!("00DC013C02AAAA")).unwrap();
        assert_eq!(card.record(0x07, 1).unwrap().as_ref(), &hex!("0102"));

        assert_eq!(
            card.process_apdu(&hex!("008E000000")).unwrap().as_ref(),
            &hex!("9000")
        );
        assert!(!card.is_session_open());
        assert_eq!(card.record(0x07, 1).unwrap().as_ref(), &hex!("0102"));
    }

    #[test]
    fn test_close_with_wrong_signature() {
        let mut card = VirtualCalypsoCard::builder().build();
        card.process_apdu(&hex!("008A030104C1C2C3C400")).unwrap();
        assert_eq!(
            card.process_apdu(&hex!("008E80000400000000 00")).unwrap().as_ref(),
            &hex!("6988")
        );
        assert!(!card.is_session_open());
    }
}
