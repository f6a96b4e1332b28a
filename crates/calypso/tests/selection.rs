//! Reader, selection and security context scenarios on stub readers

mod common;

use calypso_reader::stub::{ApduTableCard, StubPluginFactory, StubReaderConfig};
use calypso_reader::{
    ChannelState, ReaderError, ReaderProtocol, SmartCardContext, plugin_factory,
};
use calypso_transaction::emulator::{KeySet, VirtualCalypsoCard, VirtualSam};
use calypso_transaction::{
    CardSelectionsService, CardSelector, ChannelControl, InvalidatedPolicy, PoSelection,
    SamRevision, SecurityContext, SecurityError, SelectionError, SmartCard, resolve_sam_revision,
};
use common::{AID, PO_READER, PROTOCOL, SAM_READER, fixture};
use hex_literal::hex;

fn po_selection(aid: &str) -> PoSelection {
    PoSelection::new(CardSelector::builder().aid(aid).build().unwrap()).unwrap()
}

#[test]
fn test_select_stub1_t1_calypso_aid() {
    let fixture = fixture();
    let reader = fixture.context.reader(PO_READER).unwrap();
    reader.lock().activate_protocol(PROTOCOL, PROTOCOL).unwrap();

    let mut selections = CardSelectionsService::new();
    let index = selections.prepare_selection(
        PoSelection::new(
            CardSelector::builder()
                .aid(AID)
                .card_protocol(PROTOCOL)
                .build()
                .unwrap(),
        )
        .unwrap(),
    );
    assert_eq!(index, 0);

    let selected = selections.process_explicit_selections(&reader).unwrap();
    assert_eq!(selected.index, 0);
    assert!(selected.card.df_name_bytes().starts_with(&hex!("A000000291")));
    assert_eq!(
        selected.card.application_serial_number(),
        &hex!("0000000011223344")
    );
    assert_eq!(selected.card.startup_info().session_buffer_size(), 430);
    assert!(!selected.card.is_invalidated());
    assert_eq!(reader.lock().channel_state(), ChannelState::Open);
}

#[test]
fn test_first_matching_case_wins() {
    let fixture = fixture();
    let reader = fixture.po_reader();
    reader.lock().activate_protocol(PROTOCOL, PROTOCOL).unwrap();

    let mut selections = CardSelectionsService::new();
    // Wrong protocol, unknown AID, serial filter mismatch, then a match
    selections.prepare_selection(
        PoSelection::new(
            CardSelector::builder()
                .aid(AID)
                .card_protocol("NFC_A_ISO_14443_3A")
                .build()
                .unwrap(),
        )
        .unwrap(),
    );
    selections.prepare_selection(po_selection("A000000404"));
    selections.prepare_selection(
        PoSelection::new(
            CardSelector::builder()
                .aid(AID)
                .serial_number_regex("00000000FF.*")
                .build()
                .unwrap(),
        )
        .unwrap(),
    );
    selections.prepare_selection(
        PoSelection::new(
            CardSelector::builder()
                .aid(AID)
                .serial_number_regex("0000000011.*")
                .atr_regex("3B8F.*")
                .build()
                .unwrap(),
        )
        .unwrap(),
    );
    assert_eq!(selections.len(), 4);

    let selected = selections.process_explicit_selections(&reader).unwrap();
    assert_eq!(selected.index, 3);
}

#[test]
fn test_no_match_and_no_card() {
    let fixture = fixture();
    let reader = fixture.po_reader();

    let mut selections = CardSelectionsService::new();
    selections.prepare_selection(po_selection("A000000404"));
    assert!(matches!(
        selections.process_explicit_selections(&reader),
        Err(SelectionError::SelectionMismatch(_))
    ));
    assert_eq!(reader.lock().channel_state(), ChannelState::Closed);

    fixture.po.remove_card();
    let err = selections.process_explicit_selections(&reader).unwrap_err();
    assert!(matches!(err, SelectionError::NoCard(_)));
    assert!(err.is_retryable());
}

#[test]
fn test_unparsable_answer_moves_to_next_case() {
    let mut factory = StubPluginFactory::new("stub");
    let handle = factory.plug_reader(PO_READER, StubReaderConfig::default());
    handle.insert_card(
        ApduTableCard::new(&hex!("3B8880010000000000718100F9"), ReaderProtocol::Iso7816_3_T1)
            // Another application answers, but not with a Calypso FCI
            .with_response(&hex!("00A4040005A000000404"), &hex!("01029000"))
            .with_response(
                &hex!("00A4040005A000000291"),
                &hex!(
                    "6F 21"
                    "84 07 A0000002910101"
                    "A5 16 BF0C 13"
                    "C7 08 0000000011223344"
                    "53 07 0A3C1132141001"
                    "9000"
                ),
            ),
    );
    let mut context = SmartCardContext::new();
    context.register_plugin(&factory).unwrap();
    let reader = context.reader(PO_READER).unwrap();

    let mut selections = CardSelectionsService::new();
    selections.prepare_selection(po_selection("A000000404"));
    selections.prepare_selection(po_selection(AID));

    let selected = selections.process_explicit_selections(&reader).unwrap();
    assert_eq!(selected.index, 1);
    assert_eq!(
        selected.card.application_serial_number(),
        &hex!("0000000011223344")
    );
    assert_eq!(handle.exchanges().len(), 2);

    // Alone, the unparsable case is a plain mismatch
    let mut only_unparsable = CardSelectionsService::new();
    only_unparsable.prepare_selection(po_selection("A000000404"));
    assert!(matches!(
        only_unparsable.process_explicit_selections(&reader),
        Err(SelectionError::SelectionMismatch(_))
    ));
}

#[test]
fn test_invalidated_application_policy() {
    let mut factory = StubPluginFactory::new("stub");
    let handle = factory.plug_reader(PO_READER, StubReaderConfig::default());
    handle.insert_card(VirtualCalypsoCard::builder().invalidated(true).build());
    let mut context = SmartCardContext::new();
    context.register_plugin(&factory).unwrap();
    let reader = context.reader(PO_READER).unwrap();

    let mut rejecting = CardSelectionsService::new();
    rejecting.prepare_selection(po_selection(AID));
    assert!(matches!(
        rejecting.process_explicit_selections(&reader),
        Err(SelectionError::SelectionMismatch(_))
    ));

    let mut accepting =
        CardSelectionsService::new().with_channel_control(ChannelControl::CloseAfter);
    accepting.prepare_selection(
        PoSelection::new(
            CardSelector::builder()
                .aid(AID)
                .invalidated_policy(InvalidatedPolicy::Accept)
                .build()
                .unwrap(),
        )
        .unwrap(),
    );
    let selected = accepting.process_explicit_selections(&reader).unwrap();
    assert!(selected.card.is_invalidated());
    assert_eq!(reader.lock().channel_state(), ChannelState::Closed);
}

#[test]
fn test_invalid_selectors() {
    for aid in ["", "A0000002", "A0000002912", "ZZ00000291"] {
        assert!(matches!(
            CardSelector::builder().aid(aid).build(),
            Err(SelectionError::InvalidSelector(_))
        ));
    }
    assert!(matches!(
        CardSelector::builder().atr_regex("3B(").build(),
        Err(SelectionError::InvalidSelector(_))
    ));
    assert!(matches!(
        PoSelection::new(CardSelector::builder().build().unwrap()),
        Err(SelectionError::InvalidSelector(_))
    ));
}

#[test]
fn test_timeout_closes_the_channel() {
    let fixture = fixture();
    let reader = fixture.po_reader();
    let mut reader = reader.lock();
    reader.activate_protocol(PROTOCOL, PROTOCOL).unwrap();
    reader.open_channel().unwrap();

    fixture.po.set_unresponsive(true);
    assert!(matches!(
        reader.transmit(&hex!("00B2013C00")),
        Err(ReaderError::Timeout(_))
    ));
    assert_eq!(reader.channel_state(), ChannelState::Closed);

    // No automatic recovery
    fixture.po.set_unresponsive(false);
    assert!(matches!(
        reader.transmit(&hex!("00B2013C00")),
        Err(ReaderError::Channel { .. })
    ));
    reader.open_channel().unwrap();
    assert!(reader.transmit(&hex!("00B2013C00")).is_ok());
}

#[test]
fn test_unsupported_protocol() {
    let mut factory = StubPluginFactory::new("stub");
    factory.plug_reader(
        PO_READER,
        StubReaderConfig::default().with_protocols(&[ReaderProtocol::Iso14443_4]),
    );
    let mut context = SmartCardContext::new();
    context.register_plugin(&factory).unwrap();
    let reader = context.reader(PO_READER).unwrap();

    for name in ["ISO_7816_3_T1", "ISO_7816_3_T2", ""] {
        assert!(matches!(
            reader.lock().activate_protocol(name, name),
            Err(ReaderError::UnsupportedProtocol(_))
        ));
    }
    reader
        .lock()
        .activate_protocol("ISO_14443_4", "NFC_A_ISO_14443_3A")
        .unwrap();
}

#[test]
fn test_unknown_plugin_is_an_error() {
    assert!(matches!(
        plugin_factory("acme"),
        Err(ReaderError::UnknownPlugin(_))
    ));
    let factory = plugin_factory("stub").unwrap();
    let mut context = SmartCardContext::new();
    context.register_plugin(factory.as_ref()).unwrap();
    assert!(matches!(
        context.register_plugin(factory.as_ref()),
        Err(ReaderError::PluginAlreadyRegistered(_))
    ));
    assert!(matches!(
        context.reader("stub1"),
        Err(ReaderError::ReaderNotFound(_))
    ));
}

#[test]
fn test_revision_parsing_is_total() {
    for (token, revision) in [
        ("AUTO", SamRevision::Auto),
        ("C1", SamRevision::C1),
        ("S1D", SamRevision::S1D),
        ("S1E", SamRevision::S1E),
    ] {
        assert_eq!(resolve_sam_revision(token).unwrap(), revision);
        assert_eq!(revision.to_string(), token);
    }
    for token in ["", "auto", "S1", "C2", "S1D ", "S1E2"] {
        assert!(matches!(
            resolve_sam_revision(token),
            Err(SecurityError::InvalidRevision(_))
        ));
    }
}

#[test]
fn test_establish_security_context() {
    let fixture = fixture();
    let security = fixture.security();
    assert_eq!(security.sam().card().revision(), SamRevision::C1);
    assert_eq!(security.sam().card().serial_number(), &hex!("00000001"));

    let sam_reader = fixture.context.reader(SAM_READER).unwrap();
    for revision in [SamRevision::S1D, SamRevision::S1E] {
        assert!(matches!(
            SecurityContext::establish(&sam_reader, revision, None),
            Err(SecurityError::SamAuthentication(_))
        ));
    }
    assert!(matches!(
        SecurityContext::establish(&sam_reader, SamRevision::C1, Some("FFFFFFFF")),
        Err(SecurityError::SamAuthentication(_))
    ));
    SecurityContext::establish(&sam_reader, SamRevision::C1, Some("0000000.")).unwrap();
}

#[test]
fn test_establish_without_sam() {
    let mut factory = StubPluginFactory::new("stub");
    factory.plug_reader(SAM_READER, StubReaderConfig::default());
    let mut context = SmartCardContext::new();
    context.register_plugin(&factory).unwrap();

    assert!(matches!(
        SecurityContext::establish(&context.reader(SAM_READER).unwrap(), SamRevision::Auto, None),
        Err(SecurityError::SamAuthentication(_))
    ));
}

#[test]
fn test_s1e_sam_selected_in_auto_mode() {
    let mut factory = StubPluginFactory::new("stub");
    factory
        .plug_reader(SAM_READER, StubReaderConfig::default())
        .insert_card(VirtualSam::new(SamRevision::S1E, hex!("0A0B0C0D"), KeySet::test_keys()));
    let mut context = SmartCardContext::new();
    context.register_plugin(&factory).unwrap();

    let security =
        SecurityContext::establish(&context.reader(SAM_READER).unwrap(), SamRevision::Auto, None)
            .unwrap();
    assert_eq!(security.sam().card().revision(), SamRevision::S1E);
    assert_eq!(security.sam().class(), 0x94);
}
