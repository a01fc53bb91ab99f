//! SD protocol constants for SPI mode.

/// Transfer unit above the bus layer. Every read/write entry point moves
/// whole 512-byte sectors; init pins the card to this via SET_BLOCKLEN.
pub const BLOCK_SIZE: usize = 512;
pub const BLOCK_SIZE_U64: u64 = BLOCK_SIZE as u64;

/// Ncr: a valid R1 must arrive within this many filler bytes.
pub const R1_POLL_LIMIT: usize = 8;

/// Filler bytes clocked with chip select high to give the card its
/// required >= 74 synchronization clocks (10 bytes = 80 clocks).
pub const INIT_CLOCK_BYTES: usize = 10;

pub mod commands {
    /// CMD base value (start bit 0, transmission bit 1).
    pub const CMD_BASE: u8 = 0x40;
    /// Marker bit for application-specific commands; stripped before
    /// transmission, triggers the APP_CMD prefix.
    pub const ACMD_FLAG: u8 = 0x80;
    /// GO_IDLE_STATE - reset the card into SPI mode while CS is low.
    pub const CMD0: u8 = CMD_BASE;
    /// SEND_IF_COND - voltage check, doubles as the SDv2 probe.
    pub const CMD8: u8 = CMD_BASE + 8;
    /// SEND_CSD - read the Card Specific Data register.
    pub const CMD9: u8 = CMD_BASE + 9;
    /// STOP_TRANSMISSION - end a multiple block read sequence.
    pub const CMD12: u8 = CMD_BASE + 12;
    /// SET_BLOCKLEN - fix the block length (ignored by SDHC/SDXC).
    pub const CMD16: u8 = CMD_BASE + 16;
    /// READ_SINGLE_BLOCK.
    pub const CMD17: u8 = CMD_BASE + 17;
    /// READ_MULTIPLE_BLOCK.
    pub const CMD18: u8 = CMD_BASE + 18;
    /// WRITE_BLOCK.
    pub const CMD24: u8 = CMD_BASE + 24;
    /// WRITE_MULTIPLE_BLOCK - write blocks until the stop token.
    pub const CMD25: u8 = CMD_BASE + 25;
    /// APP_CMD - escape prefix for application specific commands.
    pub const CMD55: u8 = CMD_BASE + 55;
    /// READ_OCR - read the Operation Conditions Register.
    pub const CMD58: u8 = CMD_BASE + 58;
    /// CRC_ON_OFF - enable or disable CRC checking on the card side.
    pub const CMD59: u8 = CMD_BASE + 59;
    /// SET_WR_BLK_ERASE_COUNT - pre-erase hint before a multi-block write.
    pub const ACMD23: u8 = CMD_BASE + ACMD_FLAG + 23;
    /// SD_SEND_OP_COND - start initialization, report power-up status.
    pub const ACMD41: u8 = CMD_BASE + ACMD_FLAG + 41;

    /// Hardcoded CRC byte for GO_IDLE_STATE(0) when CRC is compiled out.
    /// The card validates this command even in CRC-off mode.
    pub const CMD0_CRC: u8 = 0x95;
    /// Hardcoded CRC byte for SEND_IF_COND(0x1AA), same reason.
    pub const CMD8_CRC: u8 = 0x87;
}

pub mod tokens {
    /// Idle line level; also the filler byte for receive-only transfers.
    pub const AVAILABLE: u8 = 0xFF;
    /// Start token for single-block read/write, each multi-read block,
    /// and the CSD register transfer.
    pub const DATA_START_BLOCK: u8 = 0xFE;
    /// Start token for each block of a multi-block write.
    pub const WRITE_MULTIPLE: u8 = 0xFC;
    /// Stop token terminating a multi-block write.
    pub const STOP_TRAN: u8 = 0xFD;

    /// Mask for the data response token after a written block.
    pub const DATA_RES_MASK: u8 = 0x1F;
    /// Data accepted (0b00101).
    pub const DATA_RES_ACCEPTED: u8 = 0x05;
    /// Data rejected, CRC error (0b01011).
    pub const DATA_RES_CRC_ERROR: u8 = 0x0B;
    /// Data rejected, write error (0b01101).
    pub const DATA_RES_WRITE_ERROR: u8 = 0x0D;

    /// Error tokens replace a start token on read failure. Their top
    /// nibble is zero; the low nibble carries the cause bits.
    pub const ERROR_TOKEN_MASK: u8 = 0xF0;
    pub const ERR_GENERAL: u8 = 0x01;
    pub const ERR_CARD_CONTROLLER: u8 = 0x02;
    pub const ERR_ECC_FAILED: u8 = 0x04;
    pub const ERR_OUT_OF_RANGE: u8 = 0x08;
}

pub mod init {
    /// SEND_IF_COND argument: VHS = 0x01 (2.7-3.6 V), check pattern 0xAA.
    pub const IF_COND_ARG: u32 = 0x0000_01AA;
    /// Check pattern the card must echo in the R7 tail.
    pub const IF_COND_CHECK_PATTERN: u8 = 0xAA;
    /// Accepted-voltage nibble expected in the R7 tail.
    pub const IF_COND_VOLTAGE_OK: u8 = 0x01;
    /// HCS bit in the SD_SEND_OP_COND argument: host supports SDHC/SDXC.
    pub const HCS_BIT: u32 = 1 << 30;
    /// 3.2-3.3 V and 3.3-3.4 V window bits in OCR byte 1.
    pub const OCR_VOLTAGE_WINDOW: u8 = 0x30;
    /// CCS bit in OCR byte 0: set means block-addressed (SDHC/SDXC).
    pub const OCR_CCS: u8 = 0x40;
}
