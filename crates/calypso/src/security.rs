//! SAM security context
//!
//! The [`SecurityContext`] binds the SAM selected in its reader to the
//! [`SessionSecuritySettings`] a transaction opens its sessions with. The SAM
//! computes and checks every session signature; this module only drives it.

use std::fmt;
use std::str::FromStr;

use calypso_apdu_core::{ApduCommand, ApduResponse, Response};
use calypso_reader::SharedReader;
use derive_more::Display;
use tracing::{debug, instrument, trace};

use crate::card::{CalypsoSam, CardResource, SmartCard};
use crate::commands::{
    DigestAuthenticateCommand, DigestCloseCommand, DigestInitCommand, DigestUpdateCommand,
    GetChallengeCommand, SelectDiversifierCommand,
};
use crate::constants::{CHALLENGE_LENGTH, DEFAULT_KVC, HALF_SIGNATURE_LENGTH, cla, kif};
use crate::error::{SecurityError, SelectionError};
use crate::selection::{CardSelectionsService, SamSelection};

/// SAM revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SamRevision {
    /// Any revision, resolved from the ATR at selection
    #[display("AUTO")]
    Auto,
    /// C1
    #[display("C1")]
    C1,
    /// S1D
    #[display("S1D")]
    S1D,
    /// S1E
    #[display("S1E")]
    S1E,
}

impl SamRevision {
    /// Class byte of the SAM commands
    pub const fn class_byte(&self) -> u8 {
        match self {
            Self::C1 => cla::SAM_C1,
            Self::Auto | Self::S1D | Self::S1E => cla::SAM_S1,
        }
    }

    /// Regex fragment matching the application subtype byte of the ATR
    pub const fn atr_subtype_pattern(&self) -> &'static str {
        match self {
            Self::Auto => "..",
            Self::C1 => "C1",
            Self::S1D => "D[012]",
            Self::S1E => "E1",
        }
    }

    /// Revision announced by an ATR application subtype byte
    pub const fn from_subtype(subtype: u8) -> Option<Self> {
        match subtype {
            0xC1 => Some(Self::C1),
            0xD0..=0xD2 => Some(Self::S1D),
            0xE1 => Some(Self::S1E),
            _ => None,
        }
    }
}

impl FromStr for SamRevision {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AUTO" => Ok(Self::Auto),
            "C1" => Ok(Self::C1),
            "S1D" => Ok(Self::S1D),
            "S1E" => Ok(Self::S1E),
            other => Err(SecurityError::InvalidRevision(other.to_string())),
        }
    }
}

/// Resolve a textual SAM revision token
pub fn resolve_sam_revision(token: &str) -> Result<SamRevision, SecurityError> {
    token.parse()
}

/// Session access level, selecting the key the session is opened with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum SessionAccessLevel {
    /// Personalization
    #[display("PERSO")]
    Perso,
    /// Reload
    #[display("LOAD")]
    Load,
    /// Debit
    #[display("DEBIT")]
    Debit,
}

impl SessionAccessLevel {
    /// Key index sent in OPEN SECURE SESSION
    pub const fn key_index(&self) -> u8 {
        match self {
            Self::Perso => 1,
            Self::Load => 2,
            Self::Debit => 3,
        }
    }

    /// Default key identifier of the level
    pub const fn default_kif(&self) -> u8 {
        match self {
            Self::Perso => kif::PERSO,
            Self::Load => kif::LOAD,
            Self::Debit => kif::DEBIT,
        }
    }
}

impl FromStr for SessionAccessLevel {
    type Err = SecurityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PERSO" | "SESSION_LVL_PERSO" => Ok(Self::Perso),
            "LOAD" | "SESSION_LVL_LOAD" => Ok(Self::Load),
            "DEBIT" | "SESSION_LVL_DEBIT" => Ok(Self::Debit),
            other => Err(SecurityError::InvalidAccessLevel(other.to_string())),
        }
    }
}

/// Ratification behavior requested when closing a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display)]
pub enum RatificationMode {
    /// The session is ratified by the close itself
    #[default]
    #[display("CLOSE_RATIFIED")]
    CloseRatified,
    /// The card waits for a ratification command after the close
    #[display("CLOSE_NOT_RATIFIED")]
    CloseNotRatified,
}

/// Keys and checks applied to the sessions of a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSecuritySettings {
    perso_kif: u8,
    load_kif: u8,
    debit_kif: u8,
    default_kvc: u8,
    authorized_kvcs: Vec<u8>,
    ratification_mode: RatificationMode,
}

impl Default for SessionSecuritySettings {
    fn default() -> Self {
        Self {
            perso_kif: kif::PERSO,
            load_kif: kif::LOAD,
            debit_kif: kif::DEBIT,
            default_kvc: DEFAULT_KVC,
            authorized_kvcs: Vec::new(),
            ratification_mode: RatificationMode::default(),
        }
    }
}

impl SessionSecuritySettings {
    /// Settings with the default key identifiers and version
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a specific key identifier for an access level
    pub const fn with_kif(mut self, level: SessionAccessLevel, kif: u8) -> Self {
        match level {
            SessionAccessLevel::Perso => self.perso_kif = kif,
            SessionAccessLevel::Load => self.load_kif = kif,
            SessionAccessLevel::Debit => self.debit_kif = kif,
        }
        self
    }

    /// Key version assumed when the card does not report one
    pub const fn with_default_kvc(mut self, kvc: u8) -> Self {
        self.default_kvc = kvc;
        self
    }

    /// Restrict the key versions a card may open a session with
    ///
    /// An empty list authorizes every version.
    pub fn with_authorized_kvcs(mut self, kvcs: impl IntoIterator<Item = u8>) -> Self {
        self.authorized_kvcs = kvcs.into_iter().collect();
        self
    }

    /// Ratification requested at close
    pub const fn with_ratification_mode(mut self, mode: RatificationMode) -> Self {
        self.ratification_mode = mode;
        self
    }

    /// Key identifier of an access level
    pub const fn kif(&self, level: SessionAccessLevel) -> u8 {
        match level {
            SessionAccessLevel::Perso => self.perso_kif,
            SessionAccessLevel::Load => self.load_kif,
            SessionAccessLevel::Debit => self.debit_kif,
        }
    }

    /// Default key version
    pub const fn default_kvc(&self) -> u8 {
        self.default_kvc
    }

    /// Whether the card may use key version `kvc`
    pub fn is_kvc_authorized(&self, kvc: u8) -> bool {
        self.authorized_kvcs.is_empty() || self.authorized_kvcs.contains(&kvc)
    }

    /// Ratification mode
    pub const fn ratification_mode(&self) -> RatificationMode {
        self.ratification_mode
    }
}

/// The selected SAM and its reader
pub type SamResource = CardResource<CalypsoSam>;

impl CardResource<CalypsoSam> {
    /// Class byte the SAM is addressed with
    pub const fn class(&self) -> u8 {
        self.card.revision().class_byte()
    }

    fn exchange<C: ApduCommand>(
        &self,
        name: &'static str,
        command: &C,
    ) -> Result<Response, SecurityError> {
        let response = self.reader.lock().transmit_command(command)?;
        trace!(command = name, sw = %response.status(), "SAM exchange");
        Ok(response)
    }

    fn exchange_checked<C: ApduCommand>(
        &self,
        name: &'static str,
        command: &C,
    ) -> Result<Response, SecurityError> {
        let response = self.exchange(name, command)?;
        if !response.is_success() {
            return Err(SecurityError::SamCommand {
                command: name,
                status: response.status(),
            });
        }
        Ok(response)
    }

    /// Diversify the SAM keys with a card serial number
    pub fn select_diversifier(&self, serial_number: &[u8]) -> Result<(), SecurityError> {
        self.exchange_checked(
            "SELECT DIVERSIFIER",
            &SelectDiversifierCommand::new(self.class(), serial_number),
        )?;
        Ok(())
    }

    /// Fetch the challenge sent in OPEN SECURE SESSION
    pub fn get_challenge(&self) -> Result<[u8; CHALLENGE_LENGTH], SecurityError> {
        let response =
            self.exchange_checked("GET CHALLENGE", &GetChallengeCommand::new(self.class()))?;
        response
            .data()
            .try_into()
            .map_err(|_| SecurityError::InvalidResponse("GET CHALLENGE"))
    }

    /// Start the session digest with the open response
    pub fn digest_init(&self, kif: u8, kvc: u8, open_data: &[u8]) -> Result<(), SecurityError> {
        self.exchange_checked(
            "DIGEST INIT",
            &DigestInitCommand::new(self.class(), kif, kvc, open_data),
        )?;
        Ok(())
    }

    /// Add a card command or response to the digest
    pub fn digest_update(&self, data: &[u8]) -> Result<(), SecurityError> {
        self.exchange_checked(
            "DIGEST UPDATE",
            &DigestUpdateCommand::new(self.class(), data),
        )?;
        Ok(())
    }

    /// Close the digest and return the SAM half signature
    pub fn digest_close(&self) -> Result<[u8; HALF_SIGNATURE_LENGTH], SecurityError> {
        let response =
            self.exchange_checked("DIGEST CLOSE", &DigestCloseCommand::new(self.class()))?;
        response
            .data()
            .try_into()
            .map_err(|_| SecurityError::InvalidResponse("DIGEST CLOSE"))
    }

    /// Check the card half signature
    ///
    /// Returns `false` when the SAM rejects the signature.
    pub fn digest_authenticate(
        &self,
        card_half_signature: &[u8; HALF_SIGNATURE_LENGTH],
    ) -> Result<bool, SecurityError> {
        let response = self.exchange(
            "DIGEST AUTHENTICATE",
            &DigestAuthenticateCommand::new(self.class(), card_half_signature),
        )?;
        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status.is_incorrect_signature() {
            Ok(false)
        } else {
            Err(SecurityError::SamCommand {
                command: "DIGEST AUTHENTICATE",
                status,
            })
        }
    }
}

/// An authenticated SAM and the settings sessions are opened with
pub struct SecurityContext {
    sam: SamResource,
    settings: SessionSecuritySettings,
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("sam", &self.sam.card)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl SecurityContext {
    /// Bind an already selected SAM
    pub const fn new(sam: SamResource, settings: SessionSecuritySettings) -> Self {
        Self { sam, settings }
    }

    /// Select a SAM of the given revision in `reader` and bind it
    ///
    /// `serial_pattern` is a regex on the upper case hex SAM serial number.
    #[instrument(skip(reader))]
    pub fn establish(
        reader: &SharedReader,
        revision: SamRevision,
        serial_pattern: Option<&str>,
    ) -> Result<Self, SecurityError> {
        let selection = SamSelection::new(revision, serial_pattern)
            .map_err(|e| SecurityError::SamAuthentication(e.to_string()))?;
        let mut service = CardSelectionsService::new();
        service.prepare_selection(selection);

        let selected = match service.process_explicit_selections(reader) {
            Ok(result) => result.card,
            Err(SelectionError::Reader(e)) => return Err(SecurityError::Reader(e)),
            Err(e) => return Err(SecurityError::SamAuthentication(e.to_string())),
        };

        debug!(
            revision = %selected.revision(),
            serial = %hex::encode_upper(selected.serial_number()),
            "SAM authenticated"
        );
        Ok(Self::new(
            CardResource::new(reader.clone(), selected),
            SessionSecuritySettings::default(),
        ))
    }

    /// Replace the session settings
    pub fn with_settings(mut self, settings: SessionSecuritySettings) -> Self {
        self.settings = settings;
        self
    }

    /// SAM resource
    pub const fn sam(&self) -> &SamResource {
        &self.sam
    }

    /// Session settings
    pub const fn settings(&self) -> &SessionSecuritySettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_sam_revision() {
        assert_eq!(resolve_sam_revision("AUTO").unwrap(), SamRevision::Auto);
        assert_eq!(resolve_sam_revision("C1").unwrap(), SamRevision::C1);
        assert_eq!(resolve_sam_revision("S1D").unwrap(), SamRevision::S1D);
        assert_eq!(resolve_sam_revision("S1E").unwrap(), SamRevision::S1E);

        for token in ["X9", "", "s1d", "AUTO ", "C2"] {
            assert!(matches!(
                resolve_sam_revision(token),
                Err(SecurityError::InvalidRevision(t)) if t == token
            ));
        }

        for revision in [SamRevision::Auto, SamRevision::C1, SamRevision::S1D, SamRevision::S1E] {
            assert_eq!(resolve_sam_revision(&revision.to_string()).unwrap(), revision);
        }
    }

    #[test]
    fn test_revision_bytes() {
        assert_eq!(SamRevision::C1.class_byte(), 0x80);
        assert_eq!(SamRevision::S1D.class_byte(), 0x94);
        assert_eq!(SamRevision::from_subtype(0xD1), Some(SamRevision::S1D));
        assert_eq!(SamRevision::from_subtype(0xE1), Some(SamRevision::S1E));
        assert_eq!(SamRevision::from_subtype(0x42), None);
    }

    #[test]
    fn test_access_level() {
        assert_eq!(
            "DEBIT".parse::<SessionAccessLevel>().unwrap(),
            SessionAccessLevel::Debit
        );
        assert_eq!(
            "SESSION_LVL_LOAD".parse::<SessionAccessLevel>().unwrap(),
            SessionAccessLevel::Load
        );
        assert!(matches!(
            "CREDIT".parse::<SessionAccessLevel>(),
            Err(SecurityError::InvalidAccessLevel(_))
        ));
        assert_eq!(SessionAccessLevel::Perso.key_index(), 1);
        assert_eq!(SessionAccessLevel::Debit.key_index(), 3);
    }

    #[test]
    fn test_settings() {
        let settings = SessionSecuritySettings::new();
        assert_eq!(settings.kif(SessionAccessLevel::Debit), 0x30);
        assert_eq!(settings.default_kvc(), 0x79);
        assert!(settings.is_kvc_authorized(0x12));

        let settings = settings
            .with_kif(SessionAccessLevel::Load, 0x2A)
            .with_authorized_kvcs([0x79, 0x7A])
            .with_ratification_mode(RatificationMode::CloseNotRatified);
        assert_eq!(settings.kif(SessionAccessLevel::Load), 0x2A);
        assert!(settings.is_kvc_authorized(0x7A));
        assert!(!settings.is_kvc_authorized(0x12));
        assert_eq!(
            settings.ratification_mode(),
            RatificationMode::CloseNotRatified
        );
    }
}
