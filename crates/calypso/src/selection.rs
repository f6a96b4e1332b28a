//! Card selection
//!
//! A [`CardSelectionsService`] holds an ordered list of selection cases and
//! runs them against the card inserted in a reader. The first case whose
//! selector matches yields the selected [`SmartCard`].

use std::fmt;

use bytes::Bytes;
use calypso_apdu_core::{ApduResponse, Response};
use calypso_reader::{Reader, SharedReader};
use regex::Regex;
use tracing::{debug, instrument, trace};

use crate::card::{CalypsoCard, CalypsoSam, SmartCard};
use crate::commands::{SelectApplicationCommand, SelectApplicationResponse};
use crate::error::SelectionError;
use crate::security::SamRevision;

/// Shortest and longest AID accepted by a selector
const AID_LENGTH: std::ops::RangeInclusive<usize> = 5..=16;

/// What to do with applications answering the selection as invalidated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InvalidatedPolicy {
    /// Invalidated applications do not match
    #[default]
    Reject,
    /// Invalidated applications are selected like any other
    Accept,
}

/// State of the physical channel once the selection is processed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelControl {
    /// Leave the channel open for the transaction that follows
    #[default]
    KeepOpen,
    /// Release the channel
    CloseAfter,
}

/// Criteria a card has to meet to be selected
#[derive(Debug, Clone)]
pub struct CardSelector {
    aid: Option<Bytes>,
    serial_number_regex: Option<Regex>,
    atr_regex: Option<Regex>,
    card_protocol: Option<String>,
    invalidated_policy: InvalidatedPolicy,
}

impl CardSelector {
    /// Start building a selector
    pub fn builder() -> CardSelectorBuilder {
        CardSelectorBuilder::default()
    }

    /// AID selected by the case, matched as a DF name prefix
    pub const fn aid(&self) -> Option<&Bytes> {
        self.aid.as_ref()
    }

    /// Logical card protocol the card must speak
    pub fn card_protocol(&self) -> Option<&str> {
        self.card_protocol.as_deref()
    }

    /// Invalidated application policy
    pub const fn invalidated_policy(&self) -> InvalidatedPolicy {
        self.invalidated_policy
    }

    /// Whether the card protocol reported by the reader passes the filter
    pub fn matches_protocol(&self, current: Option<&str>) -> bool {
        match &self.card_protocol {
            Some(expected) => current == Some(expected.as_str()),
            None => true,
        }
    }

    /// Whether the ATR passes the filter
    pub fn matches_atr(&self, atr: &[u8]) -> bool {
        self.atr_regex
            .as_ref()
            .is_none_or(|regex| regex.is_match(&hex::encode_upper(atr)))
    }

    /// Whether the serial number passes the filter
    pub fn matches_serial_number(&self, serial_number: &[u8]) -> bool {
        self.serial_number_regex
            .as_ref()
            .is_none_or(|regex| regex.is_match(&hex::encode_upper(serial_number)))
    }
}

/// Builder for [`CardSelector`]
///
/// Regexes are matched against the whole upper case hex string.
#[derive(Debug, Clone, Default)]
pub struct CardSelectorBuilder {
    aid: Option<String>,
    serial_number_regex: Option<String>,
    atr_regex: Option<String>,
    card_protocol: Option<String>,
    invalidated_policy: InvalidatedPolicy,
}

impl CardSelectorBuilder {
    /// Select the application by AID (hex)
    pub fn aid(mut self, aid: &str) -> Self {
        self.aid = Some(aid.to_string());
        self
    }

    /// Filter on the serial number
    pub fn serial_number_regex(mut self, regex: &str) -> Self {
        self.serial_number_regex = Some(regex.to_string());
        self
    }

    /// Filter on the ATR
    pub fn atr_regex(mut self, regex: &str) -> Self {
        self.atr_regex = Some(regex.to_string());
        self
    }

    /// Filter on the logical card protocol the reader detected
    pub fn card_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.card_protocol = Some(protocol.into());
        self
    }

    /// Invalidated application policy
    pub const fn invalidated_policy(mut self, policy: InvalidatedPolicy) -> Self {
        self.invalidated_policy = policy;
        self
    }

    /// Validate and build the selector
    pub fn build(self) -> Result<CardSelector, SelectionError> {
        let aid = self
            .aid
            .map(|aid| {
                let bytes = hex::decode(&aid)
                    .map_err(|e| SelectionError::InvalidSelector(format!("AID {aid}: {e}")))?;
                if !AID_LENGTH.contains(&bytes.len()) {
                    return Err(SelectionError::InvalidSelector(format!(
                        "AID {aid}: length {} outside {AID_LENGTH:?}",
                        bytes.len()
                    )));
                }
                Ok(Bytes::from(bytes))
            })
            .transpose()?;

        Ok(CardSelector {
            aid,
            serial_number_regex: self
                .serial_number_regex
                .as_deref()
                .map(full_match)
                .transpose()?,
            atr_regex: self.atr_regex.as_deref().map(full_match).transpose()?,
            card_protocol: self.card_protocol,
            invalidated_policy: self.invalidated_policy,
        })
    }
}

fn full_match(pattern: &str) -> Result<Regex, SelectionError> {
    Regex::new(&format!("^(?:{pattern})$"))
        .map_err(|e| SelectionError::InvalidSelector(format!("regex {pattern}: {e}")))
}

/// What the reader returned for one selection case
#[derive(Debug, Clone)]
pub struct SelectionData {
    /// Answer to reset
    pub atr: Bytes,
    /// SELECT APPLICATION response, when the case selects by AID
    pub fci: Option<Response>,
}

/// A selection case: criteria plus the parser of the matched card
pub trait CardSelection: fmt::Debug {
    /// Card model produced on match
    type Card: SmartCard;

    /// Selection criteria
    fn selector(&self) -> &CardSelector;

    /// Build the card model from the selection data
    fn parse(&self, data: &SelectionData) -> Result<Self::Card, SelectionError>;
}

/// Selection of a Calypso card application
#[derive(Debug, Clone)]
pub struct PoSelection {
    selector: CardSelector,
}

impl PoSelection {
    /// Select with the given criteria
    ///
    /// The selector must carry an AID.
    pub fn new(selector: CardSelector) -> Result<Self, SelectionError> {
        if selector.aid().is_none() {
            return Err(SelectionError::InvalidSelector(
                "a Calypso card selection needs an AID".into(),
            ));
        }
        Ok(Self { selector })
    }
}

impl CardSelection for PoSelection {
    type Card = CalypsoCard;

    fn selector(&self) -> &CardSelector {
        &self.selector
    }

    fn parse(&self, data: &SelectionData) -> Result<CalypsoCard, SelectionError> {
        let fci = data
            .fci
            .as_ref()
            .ok_or_else(|| SelectionError::Response("no FCI".into()))?;
        let parsed = SelectApplicationResponse::parse(fci.data())
            .map_err(|e| SelectionError::Response(e.to_string()))?;
        CalypsoCard::from_fci(data.atr.clone(), &parsed, fci.status().is_invalidated())
    }
}

/// Selection of a Calypso SAM by its ATR
#[derive(Debug, Clone)]
pub struct SamSelection {
    selector: CardSelector,
    revision: SamRevision,
    atr_fields: Regex,
}

impl SamSelection {
    /// Select a SAM of `revision` whose serial number matches `serial_pattern`
    pub fn new(revision: SamRevision, serial_pattern: Option<&str>) -> Result<Self, SelectionError> {
        let pattern = format!(
            "3B(?:.{{6}}|.{{10}})805A..80(?P<subtype>{})20.{{4}}(?P<serial>.{{8}})829000",
            revision.atr_subtype_pattern()
        );
        let mut builder = CardSelector::builder().atr_regex(&pattern);
        if let Some(serial) = serial_pattern {
            builder = builder.serial_number_regex(serial);
        }
        Ok(Self {
            selector: builder.build()?,
            revision,
            atr_fields: full_match(&pattern)?,
        })
    }
}

impl CardSelection for SamSelection {
    type Card = CalypsoSam;

    fn selector(&self) -> &CardSelector {
        &self.selector
    }

    fn parse(&self, data: &SelectionData) -> Result<CalypsoSam, SelectionError> {
        let atr = hex::encode_upper(&data.atr);
        let captures = self
            .atr_fields
            .captures(&atr)
            .ok_or_else(|| SelectionError::Response(format!("unexpected SAM ATR {atr}")))?;
        let decode = |name: &str| {
            captures
                .name(name)
                .and_then(|m| hex::decode(m.as_str()).ok())
                .ok_or_else(|| SelectionError::Response(format!("SAM ATR {atr}: bad {name}")))
        };

        let subtype = decode("subtype")?;
        let revision = match self.revision {
            SamRevision::Auto => subtype
                .first()
                .and_then(|b| SamRevision::from_subtype(*b))
                .ok_or_else(|| {
                    SelectionError::Response(format!("SAM ATR {atr}: unknown revision"))
                })?,
            revision => revision,
        };
        let serial_number: [u8; 4] = decode("serial")?
            .try_into()
            .map_err(|_| SelectionError::Response(format!("SAM ATR {atr}: bad serial")))?;

        Ok(CalypsoSam::new(data.atr.clone(), revision, serial_number))
    }
}

/// The card matched by a selection run
#[derive(Debug, Clone)]
pub struct SelectionResult<C> {
    /// Index of the matching case
    pub index: usize,
    /// Selected card
    pub card: C,
}

/// Ordered selection cases run against one reader poll
#[derive(Debug)]
pub struct CardSelectionsService<S> {
    selections: Vec<S>,
    channel_control: ChannelControl,
}

impl<S> Default for CardSelectionsService<S> {
    fn default() -> Self {
        Self {
            selections: Vec::new(),
            channel_control: ChannelControl::default(),
        }
    }
}

impl<S: CardSelection> CardSelectionsService<S> {
    /// Empty service keeping the channel open after selection
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the channel state wanted after selection
    pub fn with_channel_control(mut self, channel_control: ChannelControl) -> Self {
        self.channel_control = channel_control;
        self
    }

    /// Append a selection case and return its index
    pub fn prepare_selection(&mut self, selection: S) -> usize {
        self.selections.push(selection);
        self.selections.len() - 1
    }

    /// Number of prepared cases
    pub fn len(&self) -> usize {
        self.selections.len()
    }

    /// Whether no case is prepared
    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    /// Run the prepared cases in order against the card in `reader`
    ///
    /// The first matching case wins.
    #[instrument(skip_all, fields(cases = self.selections.len()))]
    pub fn process_explicit_selections(
        &self,
        reader: &SharedReader,
    ) -> Result<SelectionResult<S::Card>, SelectionError> {
        let mut reader = reader.lock();
        if !reader.is_card_present()? {
            return Err(SelectionError::NoCard(reader.name().to_string()));
        }
        reader.open_channel()?;
        let atr = reader.atr().unwrap_or_default();
        trace!(reader = reader.name(), atr = %hex::encode_upper(&atr), "Card detected");

        let result = self.select_first(&mut reader, &atr);
        if result.is_err() || self.channel_control == ChannelControl::CloseAfter {
            reader.release_channel();
        }
        result
    }

    fn select_first(
        &self,
        reader: &mut Reader,
        atr: &Bytes,
    ) -> Result<SelectionResult<S::Card>, SelectionError> {
        for (index, selection) in self.selections.iter().enumerate() {
            let selector = selection.selector();

            if !selector.matches_protocol(reader.current_card_protocol()) {
                trace!(index, "Card protocol filtered out");
                continue;
            }
            if !selector.matches_atr(atr) {
                trace!(index, "ATR filtered out");
                continue;
            }

            let fci = match selector.aid() {
                Some(aid) => {
                    let response =
                        reader.transmit_command(&SelectApplicationCommand::with_aid(aid.clone()))?;
                    let status = response.status();
                    let accepted = status.is_success()
                        || (status.is_invalidated()
                            && selector.invalidated_policy() == InvalidatedPolicy::Accept);
                    if !accepted {
                        debug!(index, sw = %status, "Application not selected");
                        continue;
                    }
                    Some(response)
                }
                None => None,
            };

            let data = SelectionData {
                atr: atr.clone(),
                fci,
            };
            let card = match selection.parse(&data) {
                Ok(card) => card,
                Err(e) => {
                    debug!(index, error = %e, "Selection answer not understood");
                    continue;
                }
            };

            if let (Some(aid), Some(df_name)) = (selector.aid(), card.df_name()) {
                if !df_name.starts_with(aid) {
                    debug!(
                        index,
                        df_name = %hex::encode_upper(df_name),
                        "DF name does not match AID"
                    );
                    continue;
                }
            }
            if !selector.matches_serial_number(card.serial_number()) {
                trace!(index, "Serial number filtered out");
                continue;
            }

            debug!(reader = reader.name(), index, "Card selected");
            return Ok(SelectionResult { index, card });
        }

        Err(SelectionError::SelectionMismatch(reader.name().to_string()))
    }
}
