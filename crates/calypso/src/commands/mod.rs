//! Calypso card and SAM command definitions
//!
//! Each command is a plain struct implementing [`ApduCommand`]; responses
//! that carry structured data have a matching parser.
//!
//! [`ApduCommand`]: calypso_apdu_core::ApduCommand

pub mod record;
pub mod sam;
pub mod select;
pub mod session;

pub use record::{AppendRecordCommand, ReadRecordCommand, UpdateRecordCommand, WriteRecordCommand};
pub use sam::{
    DigestAuthenticateCommand, DigestCloseCommand, DigestInitCommand, DigestUpdateCommand,
    GetChallengeCommand, SelectDiversifierCommand,
};
pub use select::{SelectApplicationCommand, SelectApplicationResponse};
pub use session::{
    CloseSessionCommand, CloseSessionResponse, OpenSessionCommand, OpenSessionResponse,
};

/// Forward [`ApduCommand`](calypso_apdu_core::ApduCommand) to the wrapped `command` field
macro_rules! forward_apdu_command {
    ($ty:ty) => {
        impl calypso_apdu_core::ApduCommand for $ty {
            fn class(&self) -> u8 {
                self.command.cla
            }

            fn instruction(&self) -> u8 {
                self.command.ins
            }

            fn p1(&self) -> u8 {
                self.command.p1
            }

            fn p2(&self) -> u8 {
                self.command.p2
            }

            fn data(&self) -> Option<&[u8]> {
                self.command.data.as_deref()
            }

            fn expected_length(&self) -> Option<calypso_apdu_core::ExpectedLength> {
                self.command.le
            }
        }
    };
}

pub(crate) use forward_apdu_command;
