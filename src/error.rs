//! Error taxonomy.

use crate::consts::tokens;
use crate::response::R1Response;

/// Everything a storage operation can fail with.
///
/// Bus-level failures fold into [`Error::Transport`] and
/// [`Error::Select`] so the enum stays `Copy`; the protocol variants
/// mirror the R1 bits, the read error tokens and the write data
/// response tokens.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Card-detect line reported no card at the start of the operation.
    NoCard,
    /// The SPI peripheral failed.
    Transport,
    /// The chip-select switch failed.
    Select,
    /// A wait deadline expired (R1 poll, data token, busy window or
    /// power-up loop).
    Timeout,
    /// R1 reported error bits other than CRC and addressing.
    CmdError,
    /// R1 reported a command CRC error.
    CrcCmd,
    /// CRC-16 mismatch on a received data block, or the card rejected a
    /// written block citing CRC.
    CrcData,
    /// Address or parameter out of the card's range.
    OutOfRange,
    /// Card controller error token on read.
    CardController,
    /// General/unknown error token on read.
    General,
    /// The card rejected a written block for a non-CRC reason.
    WriteReject,
    /// Unexpected byte where a data start token was required.
    DataToken,
}

impl Error {
    /// Map R1 error bits to the taxonomy.
    pub(crate) fn from_r1(r1: R1Response) -> Error {
        if r1.command_crc_error() {
            Error::CrcCmd
        } else if r1.parameter_error() || r1.address_error() {
            Error::OutOfRange
        } else {
            Error::CmdError
        }
    }

    /// Map a read error token to the taxonomy. ECC failure counts as
    /// data corruption and lands in `CrcData` with the other retryable
    /// integrity errors.
    pub(crate) fn from_read_token(token: u8) -> Error {
        if token & tokens::ERROR_TOKEN_MASK != 0 {
            return Error::DataToken;
        }
        if token & tokens::ERR_OUT_OF_RANGE != 0 {
            Error::OutOfRange
        } else if token & tokens::ERR_ECC_FAILED != 0 {
            Error::CrcData
        } else if token & tokens::ERR_CARD_CONTROLLER != 0 {
            Error::CardController
        } else {
            Error::General
        }
    }

    /// Errors worth a bounded retry on the single-block read path.
    pub(crate) fn is_transient(self) -> bool {
        matches!(self, Error::Timeout | Error::CrcData | Error::DataToken)
    }
}
