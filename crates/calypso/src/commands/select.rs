//! SELECT APPLICATION command

use bytes::Bytes;
use calypso_apdu_core::Command;
use calypso_apdu_core::response::error::ResponseError;
use iso7816_tlv::ber::{Tlv, Value};

use super::forward_apdu_command;
use crate::constants::{cla, ins, tags};

/// SELECT APPLICATION by AID, first occurrence, FCI requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectApplicationCommand {
    command: Command,
}

impl SelectApplicationCommand {
    /// Select the first application whose DF name starts with `aid`
    pub fn with_aid(aid: impl Into<Bytes>) -> Self {
        Self {
            command: Command::new_with_data_and_le(cla::ISO, ins::SELECT, 0x04, 0x00, aid, 0x00),
        }
    }

    /// AID being selected
    pub fn aid(&self) -> &[u8] {
        self.command.data.as_deref().unwrap_or_default()
    }
}

forward_apdu_command!(SelectApplicationCommand);

/// File control information returned by SELECT APPLICATION
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectApplicationResponse {
    /// Full DF name of the selected application
    pub df_name: Bytes,
    /// Application serial number
    pub serial_number: [u8; 8],
    /// Startup information (discretionary data)
    pub startup_info: Bytes,
}

impl SelectApplicationResponse {
    /// Parse the FCI template
    ///
    /// ```text
    /// 6F { 84 <DF name>, A5 { BF0C { C7 <serial>, 53 <startup info> } } }
    /// ```
    pub fn parse(payload: &[u8]) -> Result<Self, ResponseError> {
        let (fci, _) = Tlv::parse(payload);
        let fci = fci.map_err(|_| ResponseError::parse("malformed FCI"))?;
        let fci = expect_constructed(&fci, tags::FCI_TEMPLATE)?;

        let df_name = find_primitive(fci, tags::DF_NAME)
            .ok_or(ResponseError::parse("DF name missing"))?;
        let proprietary = find(fci, tags::PROPRIETARY_TEMPLATE)
            .ok_or(ResponseError::parse("proprietary template missing"))?;
        let discretionary = find(
            expect_constructed(proprietary, tags::PROPRIETARY_TEMPLATE)?,
            tags::ISSUER_DISCRETIONARY,
        )
        .ok_or(ResponseError::parse("issuer discretionary data missing"))?;
        let discretionary = expect_constructed(discretionary, tags::ISSUER_DISCRETIONARY)?;

        let serial = find_primitive(discretionary, tags::APPLICATION_SERIAL_NUMBER)
            .ok_or(ResponseError::parse("application serial number missing"))?;
        let serial_number: [u8; 8] = serial.try_into().map_err(|_| ResponseError::Length {
            expected: 8,
            actual: serial.len(),
        })?;
        let startup_info = find_primitive(discretionary, tags::DISCRETIONARY_DATA)
            .ok_or(ResponseError::parse("startup information missing"))?;

        Ok(Self {
            df_name: Bytes::copy_from_slice(df_name),
            serial_number,
            startup_info: Bytes::copy_from_slice(startup_info),
        })
    }
}

fn expect_constructed<'a>(tlv: &'a Tlv, tag: &[u8]) -> Result<&'a [Tlv], ResponseError> {
    if tlv.tag().to_bytes() != tag {
        return Err(ResponseError::parse("unexpected tag"));
    }
    match tlv.value() {
        Value::Constructed(children) => Ok(children),
        Value::Primitive(_) => Err(ResponseError::parse("expected a constructed TLV")),
    }
}

fn find<'a>(tlvs: &'a [Tlv], tag: &[u8]) -> Option<&'a Tlv> {
    tlvs.iter().find(|tlv| tlv.tag().to_bytes() == tag)
}

fn find_primitive<'a>(tlvs: &'a [Tlv], tag: &[u8]) -> Option<&'a [u8]> {
    match find(tlvs, tag)?.value() {
        Value::Primitive(bytes) => Some(bytes.as_slice()),
        Value::Constructed(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calypso_apdu_core::ApduCommand;
    use hex_literal::hex;

    #[test]
    fn test_select_application() {
        let cmd = SelectApplicationCommand::with_aid(Bytes::from_static(&hex!("A000000291")));
        assert_eq!(cmd.to_bytes().as_ref(), &hex!("00A4040005A00000029100"));
        assert_eq!(cmd.aid(), &hex!("A000000291"));
    }

    #[test]
    fn test_parse_fci() {
        let fci = hex!(
            "6F 21"
            "84 07 A0000002910101"
            "A5 16 BF0C 13"
            "C7 08 0000000011223344"
            "53 07 0A3C1132141001"
        );
        let resp = SelectApplicationResponse::parse(&fci).unwrap();
        assert_eq!(resp.df_name.as_ref(), &hex!("A0000002910101"));
        assert_eq!(resp.serial_number, hex!("0000000011223344"));
        assert_eq!(resp.startup_info.as_ref(), &hex!("0A3C1132141001"));
    }

    #[test]
    fn test_parse_fci_missing_serial() {
        let fci = hex!("6F 0E 84 07 A0000002910101 A5 03 BF0C 00");
        assert!(SelectApplicationResponse::parse(&fci).is_err());
        assert!(SelectApplicationResponse::parse(&hex!("9000")).is_err());
    }
}
