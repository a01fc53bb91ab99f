//! Response decoding.
//!
//! Every command answers with an R1 status byte; R3 (READ_OCR) and R7
//! (SEND_IF_COND) append a four-byte tail. R1b is R1 followed by a busy
//! window handled by the engine's ready polling.

use bitfield::bitfield;

bitfield! {
    /// R1 status byte. A clear top bit marks the byte as a valid
    /// response; any bit other than `in_idle_state` reports an error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct R1Response(u8);
    pub in_idle_state, _: 0;
    pub erase_reset, _: 1;
    pub illegal_command, _: 2;
    pub command_crc_error, _: 3;
    pub erase_sequence_error, _: 4;
    pub address_error, _: 5;
    pub parameter_error, _: 6;
}

impl R1Response {
    /// Card left the idle state; the normal post-init success response.
    pub const READY: R1Response = R1Response(0x00);
    /// In idle state; the expected response throughout initialization.
    pub const IDLE: R1Response = R1Response(0x01);

    const START_BIT: u8 = 0x80;
    const ERROR_MASK: u8 = 0xFE;

    /// A response byte has its top bit clear; 0xFF means still waiting.
    pub fn is_valid(self) -> bool {
        self.0 & Self::START_BIT == 0
    }

    /// Any bit other than idle signals a hard command error.
    pub fn has_error(self) -> bool {
        self.0 & Self::ERROR_MASK != 0
    }

    pub fn raw(self) -> u8 {
        self.0
    }
}

/// Four-byte OCR tail of an R3 response.
pub type R3OcrPayload = [u8; 4];

/// Four-byte voltage/echo tail of an R7 response.
pub type R7IfCondPayload = [u8; 4];
