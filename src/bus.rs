//! Bus driver.
//!
//! Owns the physical SPI bus plus the chip-select and card-detect
//! lines, and exposes byte-level full-duplex transfer. Knows nothing
//! about the SD protocol; the caller provides the baud rate and framing.

use embedded_hal::blocking::spi::Transfer;
use switch_hal::{InputSwitch, OutputSwitch};

use crate::error::Error;

/// Filler byte clocked for receive-only transfers.
pub const FILL: u8 = 0xFF;

/// Runtime SPI clock control.
///
/// `embedded-hal` 0.2 has no trait for changing the bus clock after
/// construction, so platforms implement this next to [`Transfer`]. The
/// driver switches from the init rate (<= 400 kHz) to the operational
/// rate through this seam once the card is up.
pub trait BaudControl {
    fn set_baud(&mut self, baud_hz: u32);
}

/// The shared serial bus: SPI peripheral, chip-select switch and
/// card-detect input. The detect switch is active when a card sits in
/// the slot (the platform wraps the line's active-low polarity).
pub struct Bus<Spi, Cs, Cd> {
    spi: Spi,
    cs: Cs,
    detect: Cd,
}

impl<Spi, Cs, Cd> Bus<Spi, Cs, Cd>
where
    Spi: Transfer<u8> + BaudControl,
    Cs: OutputSwitch,
    Cd: InputSwitch,
{
    pub fn new(spi: Spi, cs: Cs, detect: Cd) -> Self {
        Bus { spi, cs, detect }
    }

    pub fn set_baud(&mut self, baud_hz: u32) {
        self.spi.set_baud(baud_hz);
    }

    /// Assert chip select (drive it to the active level).
    pub fn select(&mut self) -> Result<(), Error> {
        self.cs.on().map_err(|_| Error::Select)
    }

    /// Deassert chip select.
    pub fn deselect(&mut self) -> Result<(), Error> {
        self.cs.off().map_err(|_| Error::Select)
    }

    /// Sample the card-detect line. A failed read counts as no card.
    pub fn card_present(&self) -> bool {
        self.detect.is_active().unwrap_or(false)
    }

    /// Clock one byte out while capturing one byte in.
    pub fn transfer_byte(&mut self, tx: u8) -> Result<u8, Error> {
        self.spi
            .transfer(&mut [tx])
            .map(|rx| rx[0])
            .map_err(|_| Error::Transport)
    }

    /// Send one byte, discarding the byte clocked in.
    pub fn send(&mut self, byte: u8) -> Result<(), Error> {
        self.transfer_byte(byte).map(|_| ())
    }

    /// Receive one byte by clocking out a filler.
    pub fn receive(&mut self) -> Result<u8, Error> {
        self.transfer_byte(FILL)
    }

    pub fn send_slice(&mut self, data: &[u8]) -> Result<(), Error> {
        for &byte in data {
            self.send(byte)?;
        }
        Ok(())
    }

    pub fn receive_slice(&mut self, data: &mut [u8]) -> Result<(), Error> {
        for byte in data.iter_mut() {
            *byte = self.receive()?;
        }
        Ok(())
    }

    /// Clock one filler byte; the inter-command gap and the stuff byte
    /// are both this.
    pub fn skip_byte(&mut self) -> Result<(), Error> {
        self.receive().map(|_| ())
    }
}
