//! Secure session transaction
//!
//! A [`CardTransaction`] drives one selected Calypso card through a secure
//! session:
//!
//! ```text
//! Created -> CommandsQueued -> SessionOpen -> SessionClosing -> Closed
//!                                   \                \
//!                                    +----------------+--> Aborted
//! ```
//!
//! Commands are only authentic once the close has been validated by both the
//! card and the SAM. Any failure after the session opened ends in an abort
//! close, never in a bare disconnect.

use std::collections::VecDeque;

use bytes::Bytes;
use calypso_apdu_core::{ApduCommand, ApduResponse, Response};
use calypso_reader::{ChannelState, ReaderError};
use derive_more::Display;
use tracing::{debug, instrument, trace, warn};

use crate::builder::{CommandDescriptor, CommandKind};
use crate::card::{CalypsoCard, CardResource, FileData, SmartCard};
use crate::commands::{
    CloseSessionCommand, CloseSessionResponse, OpenSessionCommand, OpenSessionResponse,
};
use crate::constants::{kif, limits};
use crate::error::{SecurityError, TransactionError};
use crate::security::{RatificationMode, SecurityContext, SessionAccessLevel};

/// State of a [`CardTransaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum SessionState {
    /// Nothing queued yet
    #[display("CREATED")]
    Created,
    /// Commands wait for the session to open
    #[display("COMMANDS_QUEUED")]
    CommandsQueued,
    /// A secure session is open on the card
    #[display("SESSION_OPEN")]
    SessionOpen,
    /// The session is being closed; `abort` when it has to be cancelled
    #[display("SESSION_CLOSING(abort={abort})")]
    SessionClosing {
        /// Whether the close has to be an abort
        abort: bool,
    },
    /// The session was committed and validated
    #[display("CLOSED")]
    Closed,
    /// The session was cancelled or failed
    #[display("ABORTED")]
    Aborted,
}

/// A command run by the transaction and the card response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedCommand {
    /// Command
    pub descriptor: CommandDescriptor,
    /// Card response
    pub response: Response,
}

#[derive(Debug)]
struct OpenSession {
    level: SessionAccessLevel,
    kif: u8,
    kvc: u8,
    buffer_remaining: usize,
    backup: FileData,
}

/// A secure session transaction on a selected card
#[derive(Debug)]
pub struct CardTransaction {
    card: CardResource<CalypsoCard>,
    security: Option<SecurityContext>,
    state: SessionState,
    queue: VecDeque<CommandDescriptor>,
    executed: Vec<ExecutedCommand>,
    session: Option<OpenSession>,
    release_channel: bool,
    // OPEN was sent but never answered
    open_unconfirmed: bool,
}

impl CardTransaction {
    /// Start a transaction on a selected card
    pub const fn new(card: CardResource<CalypsoCard>) -> Self {
        Self {
            card,
            security: None,
            state: SessionState::Created,
            queue: VecDeque::new(),
            executed: Vec::new(),
            session: None,
            release_channel: false,
            open_unconfirmed: false,
        }
    }

    /// Attach the security context sessions are opened with
    pub fn with_security_context(mut self, security: SecurityContext) -> Self {
        self.security = Some(security);
        self
    }

    /// Current state
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Card model, with the file system image built so far
    pub const fn card(&self) -> &CalypsoCard {
        &self.card.card
    }

    /// DF name of the selected application
    pub fn active_card_identity(&self) -> &[u8] {
        self.card.card.df_name_bytes()
    }

    /// Commands waiting for the session to open
    pub fn pending_commands(&self) -> impl Iterator<Item = &CommandDescriptor> {
        self.queue.iter()
    }

    /// Commands run so far, in execution order
    pub fn executed_commands(&self) -> &[ExecutedCommand] {
        &self.executed
    }

    /// Access level of the open session
    pub fn session_access_level(&self) -> Option<SessionAccessLevel> {
        self.session.as_ref().map(|s| s.level)
    }

    /// Key `(kif, kvc)` the open session runs with
    pub fn session_key(&self) -> Option<(u8, u8)> {
        self.session.as_ref().map(|s| (s.kif, s.kvc))
    }

    /// Session buffer bytes left for modifications
    pub fn session_buffer_remaining(&self) -> Option<usize> {
        self.session.as_ref().map(|s| s.buffer_remaining)
    }

    /// Give the security context back once the transaction is over
    pub fn into_security_context(self) -> Option<SecurityContext> {
        self.security
    }

    /// Queue a command for the session
    pub fn queue_command(&mut self, descriptor: CommandDescriptor) -> Result<(), TransactionError> {
        self.ensure_state("queue_command", |state| {
            matches!(state, SessionState::Created | SessionState::CommandsQueued)
        })?;
        trace!(
            kind = %descriptor.kind(),
            sfi = descriptor.sfi(),
            record = descriptor.record_number(),
            "Command queued"
        );
        self.queue.push_back(descriptor);
        self.state = SessionState::CommandsQueued;
        Ok(())
    }

    /// Queue a READ RECORD
    pub fn prepare_read_record(
        &mut self,
        sfi: u8,
        record_number: u8,
    ) -> Result<&mut Self, TransactionError> {
        self.queue_command(CommandDescriptor::read_record(sfi, record_number)?)?;
        Ok(self)
    }

    /// Queue an UPDATE RECORD
    pub fn prepare_update_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        payload: impl Into<Bytes>,
    ) -> Result<&mut Self, TransactionError> {
        self.queue_command(CommandDescriptor::update_record(sfi, record_number, payload)?)?;
        Ok(self)
    }

    /// Queue a WRITE RECORD
    pub fn prepare_write_record(
        &mut self,
        sfi: u8,
        record_number: u8,
        payload: impl Into<Bytes>,
    ) -> Result<&mut Self, TransactionError> {
        self.queue_command(CommandDescriptor::write_record(sfi, record_number, payload)?)?;
        Ok(self)
    }

    /// Queue an APPEND RECORD
    pub fn prepare_append_record(
        &mut self,
        sfi: u8,
        payload: impl Into<Bytes>,
    ) -> Result<&mut Self, TransactionError> {
        self.queue_command(CommandDescriptor::append_record(sfi, payload)?)?;
        Ok(self)
    }

    /// Release the card channel once the session is closed or aborted
    ///
    /// Calling it again has no further effect.
    pub fn prepare_release_channel(&mut self) -> &mut Self {
        self.release_channel = true;
        if matches!(self.state, SessionState::Closed | SessionState::Aborted) {
            self.apply_release();
        }
        self
    }

    /// Open a secure session and run the queued commands
    ///
    /// The first queued command is read along with the open when it is a
    /// read of a record OPEN can designate. When the card or the SAM refuses
    /// the opening, the state and the queue are left untouched and the call
    /// may be retried.
    ///
    /// When the OPEN exchange itself fails the card may still hold a session;
    /// the next call sends an abort close first, reopening the channel if
    /// needed.
    #[instrument(skip(self))]
    pub fn open_session(&mut self, level: SessionAccessLevel) -> Result<(), TransactionError> {
        self.ensure_state("open_session", |state| {
            matches!(state, SessionState::Created | SessionState::CommandsQueued)
        })?;

        let Some(security) = self.security.as_ref() else {
            warn!("Session opening attempted without a security context");
            self.state = SessionState::Aborted;
            self.queue.clear();
            return Err(TransactionError::SecurityContextMissing);
        };
        let sam = security.sam();
        let settings = security.settings();

        if self.open_unconfirmed {
            let acknowledged = self.send_abort();
            debug!(acknowledged, "Cancelled unconfirmed session before reopening");
            self.open_unconfirmed = false;
        }

        sam.select_diversifier(self.card.card.serial_number())
            .map_err(opening_error)?;
        let sam_challenge = sam.get_challenge().map_err(opening_error)?;

        let read_along = self
            .queue
            .front()
            .filter(|d| {
                d.kind() == CommandKind::ReadRecord
                    && limits::OPEN_READ_RECORD.contains(&d.record_number())
            })
            .map(|d| (d.sfi(), d.record_number()));

        let open = OpenSessionCommand::new(level.key_index(), sam_challenge, read_along);
        let sent = self.card.reader.lock().transmit_command(&open);
        let response = match sent {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "OPEN SECURE SESSION unanswered, the card may hold a session");
                self.open_unconfirmed = true;
                return Err(e.into());
            }
        };
        if !response.is_success() {
            return Err(TransactionError::SessionOpen(format!(
                "card refused OPEN SECURE SESSION with status {} ({})",
                response.status(),
                response.status().description()
            )));
        }

        let opened = match OpenSessionResponse::parse(response.data()) {
            Ok(opened) => opened,
            Err(e) => {
                return Err(self.abandon_opening(TransactionError::SecurityViolation(format!(
                    "malformed open response: {e}"
                ))));
            }
        };

        let kif = if opened.kif == kif::UNDEFINED {
            settings.kif(level)
        } else {
            opened.kif
        };
        let kvc = if opened.kvc == kif::UNDEFINED {
            settings.default_kvc()
        } else {
            opened.kvc
        };
        if !settings.is_kvc_authorized(kvc) {
            return Err(self.abandon_opening(TransactionError::SecurityViolation(format!(
                "key version {kvc:#04x} is not authorized"
            ))));
        }

        if let Err(e) = sam.digest_init(kif, kvc, &opened.raw) {
            let error = match e {
                SecurityError::SamCommand { .. } | SecurityError::InvalidResponse(_) => {
                    TransactionError::SecurityViolation(format!("SAM refused the open data: {e}"))
                }
                SecurityError::Reader(e) => TransactionError::Reader(e),
                other => TransactionError::Sam(other),
            };
            return Err(self.abandon_opening(error));
        }

        self.session = Some(OpenSession {
            level,
            kif,
            kvc,
            buffer_remaining: self.card.card.startup_info().session_buffer_size(),
            backup: self.card.card.file_data().clone(),
        });
        self.state = SessionState::SessionOpen;
        debug!(
            %level,
            kif,
            kvc,
            counter = opened.transaction_counter(),
            ratified = opened.previous_session_ratified,
            "Session open"
        );

        if let Some((sfi, record_number)) = read_along {
            if let Some(descriptor) = self.queue.pop_front() {
                if !opened.record_data.is_empty() {
                    self.card.card.file_data_mut().set_record(
                        sfi,
                        record_number,
                        opened.record_data.clone(),
                    );
                }
                self.executed.push(ExecutedCommand {
                    descriptor,
                    response: Response::success(
                        (!opened.record_data.is_empty()).then(|| opened.record_data.clone()),
                    ),
                });
            }
        }

        let queued: Vec<_> = self.queue.drain(..).collect();
        self.execute_in_session(queued)
    }

    /// Run more commands in the open session
    pub fn process_in_session(
        &mut self,
        descriptors: impl IntoIterator<Item = CommandDescriptor>,
    ) -> Result<(), TransactionError> {
        self.ensure_state("process_in_session", |state| {
            state == SessionState::SessionOpen
        })?;
        self.execute_in_session(descriptors)
    }

    /// Close the session
    ///
    /// From an open session the close is signed by the SAM, checked by the
    /// card and the card signature checked by the SAM. When a command failed
    /// during the session the close is an abort, reported as
    /// [`TransactionError::SessionAborted`]. A close the card does not accept
    /// is followed by an abort close.
    #[instrument(skip(self), fields(state = %self.state))]
    pub fn close_session(&mut self) -> Result<(), TransactionError> {
        match self.state {
            SessionState::SessionOpen => {}
            SessionState::SessionClosing { abort: true } => {
                let acknowledged = self.abort();
                return Err(TransactionError::SessionAborted { acknowledged });
            }
            state => {
                return Err(TransactionError::InvalidState {
                    operation: "close_session",
                    state,
                });
            }
        }

        self.state = SessionState::SessionClosing { abort: false };
        let result = self.commit();
        match &result {
            Ok(()) => {
                self.session = None;
                self.state = SessionState::Closed;
                debug!("Session closed");
            }
            Err(e) => {
                warn!(error = %e, "Session close failed, writes are unconfirmed");
                self.restore_backup();
                self.state = SessionState::Aborted;
            }
        }
        self.apply_release();
        result
    }

    /// Cancel the open session
    ///
    /// Returns whether the card acknowledged the abort.
    pub fn abort_session(&mut self) -> Result<bool, TransactionError> {
        self.ensure_state("abort_session", |state| {
            matches!(
                state,
                SessionState::SessionOpen | SessionState::SessionClosing { .. }
            )
        })?;
        Ok(self.abort())
    }

    fn ensure_state(
        &self,
        operation: &'static str,
        allowed: impl FnOnce(SessionState) -> bool,
    ) -> Result<(), TransactionError> {
        if allowed(self.state) {
            Ok(())
        } else {
            Err(TransactionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn execute_in_session(
        &mut self,
        descriptors: impl IntoIterator<Item = CommandDescriptor>,
    ) -> Result<(), TransactionError> {
        for descriptor in descriptors {
            if let Err(e) = self.execute(descriptor) {
                warn!(error = %e, "Command failed in session, the session has to be aborted");
                self.state = SessionState::SessionClosing { abort: true };
                self.queue.clear();
                return Err(e);
            }
        }
        Ok(())
    }

    fn execute(&mut self, descriptor: CommandDescriptor) -> Result<(), TransactionError> {
        let (Some(security), Some(session)) = (self.security.as_ref(), self.session.as_mut())
        else {
            return Err(TransactionError::InvalidState {
                operation: "execute",
                state: self.state,
            });
        };

        let cost = descriptor.modification_cost();
        if cost > session.buffer_remaining {
            return Err(TransactionError::SessionBufferOverflow {
                required: cost,
                available: session.buffer_remaining,
            });
        }

        let apdu = descriptor.to_command().to_bytes();
        let raw = self.card.reader.lock().transmit(&apdu)?;
        let response = Response::from_bytes(&raw).map_err(ReaderError::from)?;

        let sam = security.sam();
        sam.digest_update(&apdu)?;
        sam.digest_update(&raw)?;

        if !response.is_success() {
            return Err(TransactionError::CommandFailed {
                command: descriptor.kind().to_string(),
                status: response.status(),
            });
        }

        session.buffer_remaining -= cost;
        let files = self.card.card.file_data_mut();
        let (sfi, record_number) = (descriptor.sfi(), descriptor.record_number());
        match descriptor.kind() {
            CommandKind::ReadRecord => {
                files.set_record(sfi, record_number, Bytes::copy_from_slice(response.data()));
            }
            CommandKind::UpdateRecord => {
                files.set_record(sfi, record_number, descriptor.payload().clone());
            }
            CommandKind::WriteRecord => files.fill_record(sfi, record_number, descriptor.payload()),
            CommandKind::AppendRecord => files.append_record(sfi, descriptor.payload().clone()),
        }
        trace!(
            kind = %descriptor.kind(),
            sfi,
            record_number,
            sw = %response.status(),
            "Command executed"
        );

        self.executed.push(ExecutedCommand {
            descriptor,
            response,
        });
        Ok(())
    }

    /// Sign and send the close, then check the card signature
    ///
    /// Until the card accepts the close, every failure cancels the session on
    /// the card with an abort close.
    fn commit(&self) -> Result<(), TransactionError> {
        let security = self
            .security
            .as_ref()
            .ok_or(TransactionError::SecurityContextMissing)?;
        let sam = security.sam();

        let sam_half = sam
            .digest_close()
            .map_err(|e| self.cancel_close(e.into()))?;
        let ratification_asked =
            security.settings().ratification_mode() == RatificationMode::CloseNotRatified;
        let close = CloseSessionCommand::new(sam_half, ratification_asked);
        let sent = self.card.reader.lock().transmit_command(&close);
        let response = sent.map_err(|e| self.cancel_close(e.into()))?;

        let status = response.status();
        if status.is_incorrect_signature() {
            return Err(self.cancel_close(TransactionError::Integrity(
                "card rejected the SAM signature".into(),
            )));
        }
        if !status.is_success() {
            return Err(self.cancel_close(TransactionError::CommandFailed {
                command: "CLOSE SECURE SESSION".into(),
                status,
            }));
        }

        // Committed on the card from here on
        let closed = CloseSessionResponse::parse(response.data())
            .map_err(|e| TransactionError::Integrity(format!("malformed close response: {e}")))?;
        if !sam.digest_authenticate(&closed.card_half_signature)? {
            return Err(TransactionError::Integrity(
                "SAM rejected the card signature".into(),
            ));
        }
        Ok(())
    }

    /// Send the abort close, reopening the channel if a failure closed it
    fn send_abort(&self) -> bool {
        let mut reader = self.card.reader.lock();
        if reader.channel_state() == ChannelState::Closed {
            if let Err(e) = reader.open_channel() {
                warn!(error = %e, "Cannot reopen the channel to abort the session");
                return false;
            }
        }
        match reader.transmit_command(&CloseSessionCommand::abort()) {
            Ok(response) => {
                let acknowledged = response.is_success();
                if !acknowledged {
                    warn!(sw = %response.status(), "Card refused the abort");
                }
                acknowledged
            }
            Err(e) => {
                warn!(error = %e, "Abort close failed");
                false
            }
        }
    }

    fn cancel_close(&self, error: TransactionError) -> TransactionError {
        warn!(error = %error, "Close not accepted by the card, cancelling the session");
        let acknowledged = self.send_abort();
        debug!(acknowledged, "Abort close sent");
        error
    }

    fn abort(&mut self) -> bool {
        let acknowledged = self.send_abort();
        warn!(acknowledged, "Session aborted");
        self.restore_backup();
        self.queue.clear();
        self.state = SessionState::Aborted;
        self.apply_release();
        acknowledged
    }

    /// Give up an opening the card accepted but that cannot be trusted
    fn abandon_opening(&mut self, error: TransactionError) -> TransactionError {
        warn!(error = %error, "Session opening abandoned");
        self.send_abort();
        self.queue.clear();
        self.state = SessionState::Aborted;
        self.apply_release();
        error
    }

    fn restore_backup(&mut self) {
        if let Some(session) = self.session.take() {
            *self.card.card.file_data_mut() = session.backup;
        }
    }

    fn apply_release(&self) {
        if self.release_channel {
            self.card.reader.lock().release_channel();
        }
    }
}

/// Map a SAM failure during opening: transport stays transport, refusals are retryable
fn opening_error(error: SecurityError) -> TransactionError {
    match error {
        SecurityError::Reader(e) => TransactionError::Reader(e),
        other => TransactionError::SessionOpen(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::SelectApplicationResponse;
    use calypso_reader::stub::{StubReaderConfig, StubReaderSpi};
    use calypso_reader::Reader;
    use hex_literal::hex;

    fn transaction() -> CardTransaction {
        let (spi, _handle) = StubReaderSpi::new("po", StubReaderConfig::default());
        let fci = SelectApplicationResponse {
            df_name: Bytes::from_static(&hex!("A0000002910101")),
            serial_number: hex!("0000000011223344"),
            startup_info: Bytes::from_static(&hex!("0A3C1132141001")),
        };
        let card = CalypsoCard::from_fci(Bytes::new(), &fci, false).unwrap();
        CardTransaction::new(CardResource::new(
            Reader::new(Box::new(spi)).into_shared(),
            card,
        ))
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::CommandsQueued.to_string(), "COMMANDS_QUEUED");
        assert_eq!(
            SessionState::SessionClosing { abort: true }.to_string(),
            "SESSION_CLOSING(abort=true)"
        );
    }

    #[test]
    fn test_queue_without_io() {
        let mut tx = transaction();
        assert_eq!(tx.state(), SessionState::Created);
        tx.prepare_read_record(0x07, 1)
            .unwrap()
            .prepare_update_record(0x08, 1, Bytes::from_static(&hex!("01")))
            .unwrap();
        assert_eq!(tx.state(), SessionState::CommandsQueued);
        assert_eq!(tx.pending_commands().count(), 2);
        assert!(tx.executed_commands().is_empty());
        assert_eq!(tx.active_card_identity(), &hex!("A0000002910101"));
        assert_eq!(tx.card().file_data(), &FileData::default());

        assert!(matches!(
            tx.prepare_read_record(31, 1),
            Err(TransactionError::Command(_))
        ));
    }

    #[test]
    fn test_open_without_security_context() {
        let mut tx = transaction();
        tx.prepare_read_record(0x07, 1).unwrap();
        assert!(matches!(
            tx.open_session(SessionAccessLevel::Debit),
            Err(TransactionError::SecurityContextMissing)
        ));
        assert_eq!(tx.state(), SessionState::Aborted);
        assert!(tx.session_access_level().is_none());

        // Nothing can be queued on an aborted transaction
        assert!(matches!(
            tx.prepare_read_record(0x07, 1),
            Err(TransactionError::InvalidState {
                operation: "queue_command",
                state: SessionState::Aborted
            })
        ));
    }

    #[test]
    fn test_close_requires_session() {
        let mut tx = transaction();
        assert!(matches!(
            tx.close_session(),
            Err(TransactionError::InvalidState {
                operation: "close_session",
                ..
            })
        ));
        assert!(tx.abort_session().is_err());
        assert!(tx.process_in_session([]).is_err());
        assert_eq!(tx.state(), SessionState::Created);
    }
}
