//! Calypso secure session transactions
//!
//! This crate drives a Calypso card through an authenticated session with the
//! help of a SAM, on top of the readers of [`calypso_reader`]:
//!
//! 1. a [`CardSelectionsService`] selects the card (and the SAM) in a reader
//! 2. a [`SecurityContext`] binds the selected SAM to the session settings
//! 3. a [`CardTransaction`] queues [`CommandDescriptor`]s, opens the session,
//!    runs the commands and closes the session once both sides have verified
//!    the signatures
//!
//! The [`emulator`] module provides a virtual card and SAM that run the real
//! session MAC so the whole flow can be exercised on stub readers.
//!
//! # Examples
//!
//! ```
//! use calypso_reader::stub::{StubPluginFactory, StubReaderConfig};
//! use calypso_reader::SmartCardContext;
//! use calypso_transaction::emulator::{KeySet, VirtualCalypsoCard, VirtualSam};
//! use calypso_transaction::{
//!     CardResource, CardSelectionsService, CardSelector, CardTransaction, PoSelection,
//!     SamRevision, SecurityContext, SessionAccessLevel,
//! };
//!
//! let mut factory = StubPluginFactory::new("stub");
//! let po = factory.plug_reader("stub1", StubReaderConfig::default());
//! let sam = factory.plug_reader("sam1", StubReaderConfig::default());
//! po.insert_card(VirtualCalypsoCard::builder().record(0x07, 1, &[0x01, 0x02]).build());
//! sam.insert_card(VirtualSam::new(SamRevision::C1, [0, 0, 0, 1], KeySet::test_keys()));
//!
//! let mut context = SmartCardContext::new();
//! context.register_plugin(&factory)?;
//! let po_reader = context.reader("stub1")?;
//! po_reader.lock().activate_protocol("ISO_7816_3_T1", "ISO_7816_3_T1")?;
//!
//! let security = SecurityContext::establish(&context.reader("sam1")?, SamRevision::Auto, None)?;
//!
//! let mut selections = CardSelectionsService::new();
//! selections.prepare_selection(PoSelection::new(
//!     CardSelector::builder().aid("A000000291").build()?,
//! )?);
//! let selected = selections.process_explicit_selections(&po_reader)?;
//!
//! let mut transaction = CardTransaction::new(CardResource::new(po_reader, selected.card))
//!     .with_security_context(security);
//! transaction.prepare_read_record(0x07, 1)?;
//! transaction.open_session(SessionAccessLevel::Debit)?;
//! transaction.close_session()?;
//! assert_eq!(transaction.card().file_data().record(0x07, 1).unwrap().as_ref(), &[0x01, 0x02]);
//! # Ok::<(), calypso_transaction::Error>(())
//! ```
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod builder;
pub mod card;
pub mod commands;
pub mod constants;
pub mod crypto;
pub mod emulator;
pub mod error;
pub mod security;
pub mod selection;
pub mod transaction;

pub use builder::{CommandBatch, CommandDescriptor, CommandKind};
pub use card::{CalypsoCard, CalypsoSam, CardResource, FileData, SmartCard, StartupInfo};
pub use error::{
    CommandError, Error, Result, SecurityError, SelectionError, TransactionError,
};
pub use security::{
    RatificationMode, SamResource, SamRevision, SecurityContext, SessionAccessLevel,
    SessionSecuritySettings, resolve_sam_revision,
};
pub use selection::{
    CardSelection, CardSelectionsService, CardSelector, CardSelectorBuilder, ChannelControl,
    InvalidatedPolicy, PoSelection, SamSelection, SelectionData, SelectionResult,
};
pub use transaction::{CardTransaction, ExecutedCommand, SessionState};
