use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use calypso_apdu_core::response::status::common as sw;
use calypso_apdu_core::{Command, TransportError};
use calypso_reader::ReaderProtocol;
use calypso_reader::stub::StubSmartCard;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::trace;

use super::{KeySet, respond};
use crate::constants::{CHALLENGE_LENGTH, HALF_SIGNATURE_LENGTH, ins};
use crate::crypto::{SessionDigest, card_half, diversify_key, sam_half, session_key};
use crate::security::SamRevision;

struct SamState {
    atr: Bytes,
    class: u8,
    master_keys: KeySet,
    diversifier: Option<[u8; 8]>,
    challenge: Option<[u8; CHALLENGE_LENGTH]>,
    digest: Option<SessionDigest>,
    expected_card_half: Option<[u8; HALF_SIGNATURE_LENGTH]>,
}

/// Emulated Calypso SAM holding master keys
///
/// Clones share the same SAM.
#[derive(Clone)]
pub struct VirtualSam {
    state: Arc<Mutex<SamState>>,
}

impl fmt::Debug for VirtualSam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VirtualSam")
            .field("atr", &hex::encode_upper(&state.atr))
            .field("keys", &state.master_keys)
            .finish_non_exhaustive()
    }
}

impl VirtualSam {
    /// SAM of the given revision and serial number
    ///
    /// An `Auto` revision emulates an S1D SAM.
    pub fn new(revision: SamRevision, serial_number: [u8; 4], master_keys: KeySet) -> Self {
        let subtype = match revision {
            SamRevision::C1 => 0xC1,
            SamRevision::Auto | SamRevision::S1D => 0xD0,
            SamRevision::S1E => 0xE1,
        };
        let mut atr = vec![
            0x3B, 0x3F, 0x96, 0x00, 0x80, 0x5A, 0x00, 0x80, subtype, 0x20, 0x00, 0x00,
        ];
        atr.extend_from_slice(&serial_number);
        atr.extend_from_slice(&[0x82, 0x90, 0x00]);

        Self {
            state: Arc::new(Mutex::new(SamState {
                atr: Bytes::from(atr),
                class: revision.class_byte(),
                master_keys,
                diversifier: None,
                challenge: None,
                digest: None,
                expected_card_half: None,
            })),
        }
    }
}

impl StubSmartCard for VirtualSam {
    fn atr(&self) -> Bytes {
        self.state.lock().atr.clone()
    }

    fn protocol(&self) -> ReaderProtocol {
        ReaderProtocol::Iso7816_3_T0
    }

    fn process_apdu(&mut self, apdu: &[u8]) -> Result<Bytes, TransportError> {
        let mut state = self.state.lock();
        let Ok(command) = Command::from_bytes(apdu) else {
            return Ok(respond(&[], sw::WRONG_LENGTH));
        };
        if command.cla != state.class {
            return Ok(respond(&[], sw::CLASS_NOT_SUPPORTED));
        }

        let data = command.data.as_deref().unwrap_or_default();
        let response = match command.ins {
            ins::SELECT_DIVERSIFIER => state.select_diversifier(data),
            ins::GET_CHALLENGE => state.get_challenge(),
            ins::DIGEST_INIT => state.digest_init(data),
            ins::DIGEST_UPDATE => match state.digest.as_mut() {
                Some(digest) => {
                    digest.update(data);
                    respond(&[], sw::SUCCESS)
                }
                None => respond(&[], sw::CONDITIONS_NOT_SATISFIED),
            },
            ins::DIGEST_CLOSE => match state.digest.take() {
                Some(digest) => {
                    let mac = digest.finalize();
                    state.expected_card_half = Some(card_half(&mac));
                    respond(&sam_half(&mac), sw::SUCCESS)
                }
                None => respond(&[], sw::CONDITIONS_NOT_SATISFIED),
            },
            ins::DIGEST_AUTHENTICATE => match state.expected_card_half.take() {
                Some(expected) if expected == data => respond(&[], sw::SUCCESS),
                Some(_) => respond(&[], sw::INCORRECT_SIGNATURE),
                None => respond(&[], sw::CONDITIONS_NOT_SATISFIED),
            },
            _ => respond(&[], sw::INVALID_INSTRUCTION),
        };
        trace!(
            command = %hex::encode_upper(apdu),
            response = %hex::encode_upper(&response),
            "SAM APDU"
        );
        Ok(response)
    }
}

impl SamState {
    fn select_diversifier(&mut self, data: &[u8]) -> Bytes {
        match data.try_into() {
            Ok(serial_number) => {
                self.diversifier = Some(serial_number);
                respond(&[], sw::SUCCESS)
            }
            Err(_) => respond(&[], sw::WRONG_LENGTH),
        }
    }

    fn get_challenge(&mut self) -> Bytes {
        let mut challenge = [0u8; CHALLENGE_LENGTH];
        rand::rng().fill_bytes(&mut challenge);
        self.challenge = Some(challenge);
        respond(&challenge, sw::SUCCESS)
    }

    fn digest_init(&mut self, data: &[u8]) -> Bytes {
        let [kif, kvc, open_data @ ..] = data else {
            return respond(&[], sw::WRONG_LENGTH);
        };
        let Some(card_challenge) = open_data
            .get(..CHALLENGE_LENGTH)
            .and_then(|c| <[u8; CHALLENGE_LENGTH]>::try_from(c).ok())
        else {
            return respond(&[], sw::WRONG_LENGTH);
        };
        let (Some(serial_number), Some(sam_challenge)) = (self.diversifier, self.challenge.take())
        else {
            return respond(&[], sw::CONDITIONS_NOT_SATISFIED);
        };
        let Some(master) = self.master_keys.find(*kif, *kvc) else {
            return respond(&[], sw::REFERENCED_DATA_NOT_FOUND);
        };

        let card_key = diversify_key(master, &serial_number);
        let session_key = session_key(&card_key, &card_challenge, &sam_challenge);
        self.digest = Some(SessionDigest::new(&session_key, open_data));
        self.expected_card_half = None;
        respond(&[], sw::SUCCESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::card::SmartCard;
    use crate::selection::{CardSelection, SamSelection, SelectionData};
    use hex_literal::hex;

    #[test]
    fn test_atr_matches_selection() {
        let sam = VirtualSam::new(SamRevision::S1D, hex!("A1B2C3D4"), KeySet::test_keys());
        let selection = SamSelection::new(SamRevision::Auto, None).unwrap();
        let parsed = selection
            .parse(&SelectionData {
                atr: sam.atr(),
                fci: None,
            })
            .unwrap();
        assert_eq!(parsed.revision(), SamRevision::S1D);
        assert_eq!(parsed.serial_number(), &hex!("A1B2C3D4"));
    }

    #[test]
    fn test_class_and_state_checks() {
        let mut sam = VirtualSam::new(SamRevision::C1, hex!("00000001"), KeySet::test_keys());
        assert_eq!(sam.process_apdu(&hex!("9484000004")).unwrap().as_ref(), &hex!("6E00"));

        let challenge = sam.process_apdu(&hex!("8084000004")).unwrap();
        assert_eq!(challenge.len(), 6);
        assert_eq!(&challenge[4..], &hex!("9000"));

        // No diversifier selected yet
        assert_eq!(
            sam.process_apdu(&hex!("808A00FF0A307900000A1C00307900"))
                .unwrap()
                .as_ref(),
            &hex!("6985")
        );
        assert_eq!(sam.process_apdu(&hex!("808E000004")).unwrap().as_ref(), &hex!("6985"));
        assert_eq!(
            sam.process_apdu(&hex!("808200000400000000")).unwrap().as_ref(),
            &hex!("6985")
        );
    }
}
