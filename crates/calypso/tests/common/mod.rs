//! Shared fixture: a stub plugin with an emulated card in `stub1` and an
//! emulated SAM in `sam1`

#![allow(dead_code)]

use calypso_reader::stub::{StubPluginFactory, StubReaderConfig, StubReaderHandle};
use calypso_reader::{SharedReader, SmartCardContext};
use calypso_transaction::emulator::{KeySet, VirtualCalypsoCard, VirtualSam};
use calypso_transaction::{
    CalypsoCard, CardResource, CardSelectionsService, CardSelector, CardTransaction, PoSelection,
    SamRevision, SecurityContext,
};
use hex_literal::hex;

pub const PO_READER: &str = "stub1";
pub const SAM_READER: &str = "sam1";
pub const PROTOCOL: &str = "ISO_7816_3_T1";
pub const AID: &str = "A000000291";

pub const ENVIRONMENT_SFI: u8 = 0x07;
pub const CONTRACTS_SFI: u8 = 0x08;
pub const EVENTS_SFI: u8 = 0x19;

pub struct Fixture {
    pub context: SmartCardContext,
    pub po: StubReaderHandle,
    pub sam: StubReaderHandle,
    pub card: VirtualCalypsoCard,
}

pub fn default_card() -> VirtualCalypsoCard {
    VirtualCalypsoCard::builder()
        .record(ENVIRONMENT_SFI, 1, &hex!("0102030405"))
        .record(CONTRACTS_SFI, 1, &hex!("1111111111"))
        .record(EVENTS_SFI, 1, &hex!("E1E1"))
        .build()
}

pub fn fixture() -> Fixture {
    fixture_with(default_card(), KeySet::test_keys())
}

pub fn fixture_with(card: VirtualCalypsoCard, sam_keys: KeySet) -> Fixture {
    let mut factory = StubPluginFactory::new("stub");
    let po = factory.plug_reader(PO_READER, StubReaderConfig::default());
    let sam = factory.plug_reader(SAM_READER, StubReaderConfig::default());
    po.insert_card(card.clone());
    sam.insert_card(VirtualSam::new(SamRevision::C1, hex!("00000001"), sam_keys));

    let mut context = SmartCardContext::new();
    context.register_plugin(&factory).unwrap();
    Fixture {
        context,
        po,
        sam,
        card,
    }
}

impl Fixture {
    pub fn po_reader(&self) -> SharedReader {
        self.context.reader(PO_READER).unwrap()
    }

    pub fn security(&self) -> SecurityContext {
        SecurityContext::establish(
            &self.context.reader(SAM_READER).unwrap(),
            SamRevision::Auto,
            None,
        )
        .unwrap()
    }

    pub fn select(&self) -> CalypsoCard {
        let reader = self.po_reader();
        reader.lock().activate_protocol(PROTOCOL, PROTOCOL).unwrap();

        let mut selections = CardSelectionsService::new();
        selections.prepare_selection(
            PoSelection::new(
                CardSelector::builder()
                    .aid(AID)
                    .card_protocol(PROTOCOL)
                    .build()
                    .unwrap(),
            )
            .unwrap(),
        );
        selections.process_explicit_selections(&reader).unwrap().card
    }

    /// Transaction on the selected card, without a security context
    pub fn bare_transaction(&self) -> CardTransaction {
        CardTransaction::new(CardResource::new(self.po_reader(), self.select()))
    }

    /// Transaction on the selected card with the SAM bound; exchanges are cleared
    pub fn transaction(&self) -> CardTransaction {
        let transaction = self.bare_transaction().with_security_context(self.security());
        self.po.clear_exchanges();
        self.sam.clear_exchanges();
        transaction
    }
}
