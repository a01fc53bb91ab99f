//! SD protocol engine.
//!
//! Implements SPI-mode command framing, the initialization state
//! machine, single- and multi-block transfers and CSD capacity
//! derivation on top of the [`Bus`] layer, and exposes the result as a
//! [`DiskioDevice`].
//!
//! Chip select is asserted once at the end of init and held for the
//! lifetime of the mount: toggling it inside a multi-block read
//! terminates the transfer early on some cards. The stuff byte after
//! STOP_TRANSMISSION and the gap byte after every response preserve the
//! required inter-command spacing instead.

use core::cell::{Cell, RefCell};
use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::{InputSwitch, OutputSwitch};

use crate::bus::{BaudControl, Bus, FILL};
use crate::config::SdSpiConfig;
use crate::consts::{commands, init, tokens, BLOCK_SIZE, INIT_CLOCK_BYTES, R1_POLL_LIMIT};
use crate::crc::{crc16, crc7};
use crate::csd::{CapacityProvider, Csd, CsdData};
use crate::diskio::{DiskioDevice, DiskioError, IoctlCmd, Lba, Status};
use crate::error::Error;
use crate::response::{R1Response, R3OcrPayload, R7IfCondPayload};

/// Card generation, fixed at init.
#[cfg_attr(feature = "defmt-log", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CardType {
    /// SDSC answering only the v1 command set.
    SD1,
    /// SDSC speaking the v2 command set (answers SEND_IF_COND).
    SD2,
    /// SDHC or SDXC.
    SDHC,
}

impl CardType {
    /// SDHC/SDXC take sector indices on the wire; older cards take
    /// byte offsets.
    pub fn block_addressed(self) -> bool {
        matches!(self, CardType::SDHC)
    }
}

/// SD card driver over a shared SPI bus.
///
/// `Spi` - SPI peripheral with runtime clock control.
/// `Cs` - chip select switch.
/// `Cd` - card detect input (active when a card is present).
/// `D` - microsecond delay source.
/// `C` - compile-time tuning, see [`SdSpiConfig`].
pub struct SdCardSpi<Spi, Cs, Cd, D, C> {
    bus: RefCell<Bus<Spi, Cs, Cd>>,
    delay: D,
    status: Status,
    card_type: CardType,
    sectors: Cell<Option<u32>>,
    last_error: Cell<Option<Error>>,
    _config: PhantomData<C>,
}

impl<Spi, Cs, Cd, D, C> SdCardSpi<Spi, Cs, Cd, D, C>
where
    Spi: Transfer<u8> + BaudControl,
    Cs: OutputSwitch,
    Cd: InputSwitch,
    D: DelayUs<u16>,
    C: SdSpiConfig,
{
    pub fn new(spi: Spi, cs: Cs, detect: Cd, delay: D) -> Self {
        SdCardSpi {
            bus: RefCell::new(Bus::new(spi, cs, detect)),
            delay,
            status: Status::NOT_INITIALIZED,
            card_type: CardType::SD1,
            sectors: Cell::new(None),
            last_error: Cell::new(None),
            _config: PhantomData,
        }
    }

    /// Sample the card-detect line.
    pub fn card_present(&self) -> bool {
        self.bus.borrow().card_present()
    }

    /// Card generation; meaningful after a successful `init`.
    pub fn card_type(&self) -> CardType {
        self.card_type
    }

    /// Whether the card is block-addressed (SDHC/SDXC).
    pub fn is_sdhc(&self) -> bool {
        self.card_type == CardType::SDHC
    }

    pub fn is_initialized(&self) -> bool {
        !self.status.contains(Status::NOT_INITIALIZED)
    }

    /// Most recent error, kept for shell diagnostics after the result
    /// has been folded into the filesystem's coarse ok/error.
    pub fn last_error(&self) -> Option<Error> {
        self.last_error.get()
    }

    fn track_err(&self, err: Error) -> Error {
        self.last_error.set(Some(err));
        err
    }

    fn track<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        result.map_err(|err| self.track_err(err))
    }

    // ------------------------------------------------------------------
    // Command framing
    // ------------------------------------------------------------------

    /// Frame and send one command, then poll for its R1 within the Ncr
    /// window. Leaves any response tail and the inter-command gap byte
    /// to the caller.
    fn send_command_raw(
        bus: &mut Bus<Spi, Cs, Cd>,
        cmd: u8,
        arg: u32,
    ) -> Result<R1Response, Error> {
        let mut packet = [
            cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            0,
        ];
        packet[5] = if cfg!(feature = "crc") {
            (crc7(&packet[..5]) << 1) | 0x01
        } else {
            // The card checks these two even in CRC-off mode.
            match cmd {
                commands::CMD0 => commands::CMD0_CRC,
                commands::CMD8 => commands::CMD8_CRC,
                _ => 0xFF,
            }
        };

        bus.send_slice(&packet)?;

        // STOP_TRANSMISSION needs one stuff byte before its R1.
        if cmd == commands::CMD12 {
            bus.skip_byte()?;
        }

        for _ in 0..R1_POLL_LIMIT {
            let r1 = R1Response(bus.receive()?);
            if r1.is_valid() {
                return Ok(r1);
            }
        }
        Err(Error::Timeout)
    }

    /// Send a command, expanding application commands into the APP_CMD
    /// prefix pair.
    fn send_command(bus: &mut Bus<Spi, Cs, Cd>, cmd: u8, arg: u32) -> Result<R1Response, Error> {
        if cmd & commands::ACMD_FLAG != 0 {
            let r1 = Self::send_command_raw(bus, commands::CMD55, 0)?;
            bus.skip_byte()?;
            if r1.has_error() {
                return Err(Error::from_r1(r1));
            }
            return Self::send_command_raw(bus, cmd & !commands::ACMD_FLAG, arg);
        }
        Self::send_command_raw(bus, cmd, arg)
    }

    /// Poll until the card releases the data line (not busy).
    fn wait_ready(bus: &mut Bus<Spi, Cs, Cd>, attempts: u32) -> Result<(), Error> {
        for _ in 0..attempts {
            if bus.receive()? == tokens::AVAILABLE {
                return Ok(());
            }
        }
        Err(Error::Timeout)
    }

    /// Poll for a data start token; decode error tokens on the way.
    fn wait_for_data_token(bus: &mut Bus<Spi, Cs, Cd>) -> Result<(), Error> {
        for _ in 0..C::READ_TOKEN_ATTEMPTS {
            let token = bus.receive()?;
            if token == tokens::DATA_START_BLOCK {
                return Ok(());
            }
            if token != tokens::AVAILABLE {
                return Err(Error::from_read_token(token));
            }
        }
        Err(Error::Timeout)
    }

    /// Receive a data payload and its trailing CRC, verifying when CRC
    /// checking is compiled in. The start token must already have been
    /// consumed.
    fn receive_data(bus: &mut Bus<Spi, Cs, Cd>, buf: &mut [u8]) -> Result<(), Error> {
        bus.receive_slice(buf)?;

        let mut crc = [0u8; 2];
        bus.receive_slice(&mut crc)?;
        if cfg!(feature = "crc") && u16::from_be_bytes(crc) != crc16(buf) {
            return Err(Error::CrcData);
        }
        Ok(())
    }

    /// Token wait plus payload for one block of a multi-read stream.
    fn read_chunk(bus: &mut Bus<Spi, Cs, Cd>, buf: &mut [u8]) -> Result<(), Error> {
        Self::wait_for_data_token(bus)?;
        Self::receive_data(bus, buf)
    }

    /// Clock out one data block: gap byte, start token, payload, CRC.
    /// Returns the masked data response token.
    fn send_block(bus: &mut Bus<Spi, Cs, Cd>, token: u8, data: &[u8]) -> Result<u8, Error> {
        bus.skip_byte()?;
        bus.send(token)?;
        bus.send_slice(data)?;

        let crc_bytes = if cfg!(feature = "crc") {
            crc16(data).to_be_bytes()
        } else {
            [0xFF, 0xFF]
        };
        bus.send_slice(&crc_bytes)?;

        Ok(bus.receive()? & tokens::DATA_RES_MASK)
    }

    fn check_write_response(resp: u8) -> Result<(), Error> {
        match resp {
            tokens::DATA_RES_ACCEPTED => Ok(()),
            tokens::DATA_RES_CRC_ERROR => Err(Error::CrcData),
            // DATA_RES_WRITE_ERROR and anything malformed.
            _ => Err(Error::WriteReject),
        }
    }

    // ------------------------------------------------------------------
    // Initialization
    // ------------------------------------------------------------------

    /// Bring the card out of power-on into SPI transfer mode.
    ///
    /// Idempotent: an already-initialized card returns `Ok` without
    /// touching the bus. After removal, [`DiskioDevice::reset`] arms
    /// the full sequence again.
    pub fn init(&mut self) -> Result<(), Error> {
        if self.is_initialized() {
            return Ok(());
        }

        let result = self.init_sequence();
        match result {
            Ok(()) => {
                self.status = Status::empty();
                info!("sd: card initialized");
            }
            Err(err) => {
                self.status = Status::NOT_INITIALIZED | Status::ERROR;
                self.last_error.set(Some(err));
                error!("sd: init failed: {:?}", err);
            }
        }
        result
    }

    fn init_sequence(&mut self) -> Result<(), Error> {
        let bus = self.bus.get_mut();
        let delay = &mut self.delay;

        if !bus.card_present() {
            return Err(Error::NoCard);
        }

        // Init-rate clock, chip select high, power-up settle.
        bus.set_baud(C::INIT_BAUD_HZ);
        bus.deselect()?;
        delay.delay_us(C::POWER_UP_DELAY_US);

        // >= 74 clocks with chip select high so the card syncs to the bus.
        for _ in 0..INIT_CLOCK_BYTES {
            bus.send(FILL)?;
        }

        // Assert chip select; it stays asserted for the whole session.
        bus.select()?;

        // GO_IDLE_STATE until the card reports idle.
        let mut r1 = R1Response(0xFF);
        for attempt in 0..C::RESET_RETRIES {
            match Self::send_command_raw(bus, commands::CMD0, 0) {
                Ok(r) => r1 = r,
                Err(Error::Timeout) => r1 = R1Response(0xFF),
                Err(err) => return Err(err),
            }
            bus.skip_byte()?;
            if r1 == R1Response::IDLE {
                break;
            }
            trace!("sd: reset attempt {} answered {}", attempt, r1.raw());
            delay.delay_us(C::RESET_BACKOFF_US);
        }
        if r1 != R1Response::IDLE {
            return Err(Error::Timeout);
        }

        // SEND_IF_COND probes for a v2 card; v1 cards reject it as an
        // illegal command.
        let mut is_v2 = false;
        match Self::send_command_raw(bus, commands::CMD8, init::IF_COND_ARG) {
            Ok(r1) if r1 == R1Response::IDLE => {
                let mut tail: R7IfCondPayload = [0; 4];
                bus.receive_slice(&mut tail)?;
                bus.skip_byte()?;
                if tail[2] & 0x0F == init::IF_COND_VOLTAGE_OK
                    && tail[3] == init::IF_COND_CHECK_PATTERN
                {
                    is_v2 = true;
                }
            }
            Ok(_) | Err(Error::Timeout) => {
                bus.skip_byte()?;
            }
            Err(err) => return Err(err),
        }

        // Ask the card to check command CRCs too. Not every card
        // supports CRC_ON_OFF; failure doesn't abort init.
        if cfg!(feature = "crc") {
            match Self::send_command_raw(bus, commands::CMD59, 1) {
                Ok(r1) if r1.has_error() => warn!("sd: card refused CRC_ON_OFF"),
                Ok(_) => {}
                Err(Error::Timeout) => warn!("sd: no answer to CRC_ON_OFF"),
                Err(err) => return Err(err),
            }
            bus.skip_byte()?;
        }

        // READ_OCR: the card must support the 3.2-3.4 V window.
        let r1 = Self::send_command_raw(bus, commands::CMD58, 0)?;
        let mut ocr: R3OcrPayload = [0; 4];
        bus.receive_slice(&mut ocr)?;
        bus.skip_byte()?;
        if r1.has_error() {
            return Err(Error::from_r1(r1));
        }
        if ocr[1] & init::OCR_VOLTAGE_WINDOW == 0 {
            return Err(Error::CmdError);
        }

        // SD_SEND_OP_COND with HCS until the idle bit clears.
        let hcs = if is_v2 { init::HCS_BIT } else { 0 };
        let mut powered_up = false;
        for _ in 0..C::POWER_UP_ATTEMPTS {
            match Self::send_command(bus, commands::ACMD41, hcs) {
                Ok(r1) => {
                    bus.skip_byte()?;
                    if r1 == R1Response::READY {
                        powered_up = true;
                        break;
                    }
                }
                Err(Error::Timeout) => bus.skip_byte()?,
                Err(err) => return Err(err),
            }
            delay.delay_us(C::POWER_UP_POLL_US);
        }
        if !powered_up {
            return Err(Error::Timeout);
        }

        // Re-read the OCR for the CCS bit to classify capacity.
        let r1 = Self::send_command_raw(bus, commands::CMD58, 0)?;
        bus.receive_slice(&mut ocr)?;
        bus.skip_byte()?;
        if r1.has_error() {
            return Err(Error::from_r1(r1));
        }
        self.card_type = if ocr[0] & init::OCR_CCS != 0 {
            CardType::SDHC
        } else if is_v2 {
            CardType::SD2
        } else {
            CardType::SD1
        };

        // SET_BLOCKLEN(512): SDHC ignores it, keeping the path uniform.
        let r1 = Self::send_command_raw(bus, commands::CMD16, BLOCK_SIZE as u32)?;
        bus.skip_byte()?;
        if r1.has_error() {
            return Err(Error::from_r1(r1));
        }

        bus.set_baud(C::FAST_BAUD_HZ);
        debug!("sd: init done, v2: {}", is_v2);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Block I/O
    // ------------------------------------------------------------------

    /// Translate a logical sector index into the card's address space:
    /// unchanged for block-addressed cards, byte offset otherwise.
    fn convert_lba(&self, lba: Lba) -> Result<u32, Error> {
        if self.card_type.block_addressed() {
            Ok(lba)
        } else {
            lba.checked_mul(BLOCK_SIZE as u32).ok_or(Error::OutOfRange)
        }
    }

    fn block_count(len: usize) -> Result<usize, Error> {
        if len == 0 || len % BLOCK_SIZE != 0 {
            return Err(Error::OutOfRange);
        }
        Ok(len / BLOCK_SIZE)
    }

    /// Read `buf.len() / 512` sectors starting at `start`.
    ///
    /// Single-sector reads retry transient failures (CRC, bad token,
    /// timeout) a bounded number of times; multi-sector reads surface
    /// the first error and let the caller decide.
    pub fn read_blocks(&self, start: Lba, buf: &mut [u8]) -> Result<(), Error> {
        let result = self.read_blocks_impl(start, buf);
        self.track(result)
    }

    fn read_blocks_impl(&self, start: Lba, buf: &mut [u8]) -> Result<(), Error> {
        let count = Self::block_count(buf.len())?;
        let mut bus = self.bus.borrow_mut();

        if !bus.card_present() {
            return Err(Error::NoCard);
        }
        let arg = self.convert_lba(start)?;

        if count == 1 {
            let mut attempt = 0;
            loop {
                match Self::read_single(&mut bus, arg, buf) {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_transient() && attempt < C::READ_RETRIES => {
                        attempt += 1;
                        debug!("sd: transient read error {:?}, retry {}", err, attempt);
                    }
                    Err(err) => return Err(err),
                }
            }
        } else {
            Self::read_multi(&mut bus, arg, buf)
        }
    }

    fn read_single(bus: &mut Bus<Spi, Cs, Cd>, arg: u32, buf: &mut [u8]) -> Result<(), Error> {
        let r1 = Self::send_command_raw(bus, commands::CMD17, arg)?;
        if r1.has_error() {
            bus.skip_byte()?;
            return Err(Error::from_r1(r1));
        }

        if let Err(err) = Self::wait_for_data_token(bus) {
            bus.skip_byte()?;
            return Err(err);
        }
        Self::receive_data(bus, buf)
    }

    fn read_multi(bus: &mut Bus<Spi, Cs, Cd>, arg: u32, buf: &mut [u8]) -> Result<(), Error> {
        let r1 = Self::send_command_raw(bus, commands::CMD18, arg)?;
        if r1.has_error() {
            bus.skip_byte()?;
            return Err(Error::from_r1(r1));
        }

        let mut stream: Result<(), Error> = Ok(());
        for chunk in buf.chunks_mut(BLOCK_SIZE) {
            stream = Self::read_chunk(bus, chunk);
            if stream.is_err() {
                break;
            }
        }

        // STOP_TRANSMISSION goes out even when the stream aborted; the
        // card stays in multi-read mode otherwise.
        let stop = Self::send_command_raw(bus, commands::CMD12, 0);
        let ready = Self::wait_ready(bus, C::READ_TOKEN_ATTEMPTS);
        bus.skip_byte()?;

        // A stream error is never masked by a clean stop.
        stream?;
        let r1 = stop?;
        if r1.has_error() {
            return Err(Error::from_r1(r1));
        }
        ready
    }

    /// Write `buf.len() / 512` sectors starting at `start`. Returns
    /// once the card has finished programming.
    pub fn write_blocks(&self, start: Lba, buf: &[u8]) -> Result<(), Error> {
        let result = self.write_blocks_impl(start, buf);
        self.track(result)
    }

    fn write_blocks_impl(&self, start: Lba, buf: &[u8]) -> Result<(), Error> {
        let count = Self::block_count(buf.len())?;
        let mut bus = self.bus.borrow_mut();

        if !bus.card_present() {
            return Err(Error::NoCard);
        }
        let arg = self.convert_lba(start)?;

        if count == 1 {
            Self::write_single(&mut bus, arg, buf)
        } else {
            Self::write_multi(&mut bus, arg, count as u32, buf)
        }
    }

    fn write_single(bus: &mut Bus<Spi, Cs, Cd>, arg: u32, buf: &[u8]) -> Result<(), Error> {
        let r1 = Self::send_command_raw(bus, commands::CMD24, arg)?;
        if r1.has_error() {
            bus.skip_byte()?;
            return Err(Error::from_r1(r1));
        }

        let resp = Self::send_block(bus, tokens::DATA_START_BLOCK, buf)?;
        bus.skip_byte()?;
        Self::check_write_response(resp)?;
        Self::wait_ready(bus, C::BUSY_WAIT_ATTEMPTS)
    }

    fn write_multi(
        bus: &mut Bus<Spi, Cs, Cd>,
        arg: u32,
        count: u32,
        buf: &[u8],
    ) -> Result<(), Error> {
        // Pre-erase hint; advisory, cards may not support it.
        match Self::send_command(bus, commands::ACMD23, count) {
            Ok(_) => bus.skip_byte()?,
            Err(err @ (Error::Transport | Error::Select)) => return Err(err),
            Err(_) => {
                warn!("sd: pre-erase hint rejected");
                bus.skip_byte()?;
            }
        }

        let r1 = Self::send_command_raw(bus, commands::CMD25, arg)?;
        if r1.has_error() {
            bus.skip_byte()?;
            return Err(Error::from_r1(r1));
        }

        let mut stream: Result<(), Error> = Ok(());
        for chunk in buf.chunks(BLOCK_SIZE) {
            stream = Self::write_chunk(bus, chunk);
            if stream.is_err() {
                break;
            }
        }

        // The stop token goes out on every exit so the card returns to
        // transfer-idle, then the final busy window runs out.
        let stop = Self::stop_write(bus);
        stream?;
        stop
    }

    fn write_chunk(bus: &mut Bus<Spi, Cs, Cd>, chunk: &[u8]) -> Result<(), Error> {
        let resp = Self::send_block(bus, tokens::WRITE_MULTIPLE, chunk)?;
        Self::check_write_response(resp)?;
        Self::wait_ready(bus, C::BUSY_WAIT_ATTEMPTS)
    }

    fn stop_write(bus: &mut Bus<Spi, Cs, Cd>) -> Result<(), Error> {
        bus.send(tokens::STOP_TRAN)?;
        bus.skip_byte()?;
        Self::wait_ready(bus, C::BUSY_WAIT_ATTEMPTS)
    }

    // ------------------------------------------------------------------
    // Capacity
    // ------------------------------------------------------------------

    /// Read the CSD register. It arrives framed like a data block:
    /// start token, 16 bytes, CRC.
    pub fn read_csd(&self) -> Result<Csd, Error> {
        let mut bus = self.bus.borrow_mut();

        let r1 = Self::send_command_raw(&mut bus, commands::CMD9, 0)?;
        if r1.has_error() {
            bus.skip_byte()?;
            return Err(self.track_err(Error::from_r1(r1)));
        }
        if let Err(err) = Self::wait_for_data_token(&mut bus) {
            bus.skip_byte()?;
            return Err(self.track_err(err));
        }

        let mut raw: CsdData = [0; 16];
        if let Err(err) = Self::receive_data(&mut bus, &mut raw) {
            return Err(self.track_err(err));
        }
        Ok(Csd::from_raw(raw))
    }

    /// Total 512-byte sectors on the card, derived from the CSD on the
    /// first call after init and cached for the rest of the mount.
    pub fn sector_count(&self) -> Result<u32, Error> {
        if let Some(sectors) = self.sectors.get() {
            return Ok(sectors);
        }
        let sectors = self.read_csd()?.card_capacity_blocks() as u32;
        self.sectors.set(Some(sectors));
        Ok(sectors)
    }

    // ------------------------------------------------------------------
    // Diskio plumbing
    // ------------------------------------------------------------------

    fn validate_buffer(len: usize) -> Result<(), DiskioError<Error>> {
        if len == 0 || len % BLOCK_SIZE != 0 {
            error!("sd: invalid buffer length {}", len);
            return Err(DiskioError::InvalidArgument);
        }
        Ok(())
    }

    fn validate_initialized(&self) -> Result<(), DiskioError<Error>> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(DiskioError::NotInitialized)
        }
    }
}

impl<Spi, Cs, Cd, D, C> DiskioDevice for SdCardSpi<Spi, Cs, Cd, D, C>
where
    Spi: Transfer<u8> + BaudControl,
    Cs: OutputSwitch,
    Cd: InputSwitch,
    D: DelayUs<u16>,
    C: SdSpiConfig,
{
    type HardwareError = Error;

    fn status(&self) -> Status {
        let mut status = self.status;
        if !self.card_present() {
            status |= Status::NO_DISK;
        }
        status
    }

    fn reset(&mut self) {
        debug!("sd: reset, card identity dropped");
        self.status = Status::NOT_INITIALIZED;
        self.card_type = CardType::SD1;
        self.sectors.set(None);
        self.last_error.set(None);
    }

    fn initialize(&mut self) -> Result<(), DiskioError<Error>> {
        self.init().map_err(DiskioError::Hardware)
    }

    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Error>> {
        Self::validate_buffer(buf.len())?;
        self.validate_initialized()?;
        self.read_blocks(lba, buf).map_err(DiskioError::Hardware)
    }

    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Error>> {
        Self::validate_buffer(buf.len())?;
        self.validate_initialized()?;
        self.write_blocks(lba, buf).map_err(DiskioError::Hardware)
    }

    fn ioctl(&self, cmd: IoctlCmd<'_>) -> Result<(), DiskioError<Error>> {
        match cmd {
            IoctlCmd::Sync => Ok(()),
            IoctlCmd::SectorSize(out) => {
                *out = BLOCK_SIZE as u16;
                Ok(())
            }
            IoctlCmd::BlockSize(out) => {
                *out = 1;
                Ok(())
            }
            IoctlCmd::SectorCount(out) => {
                self.validate_initialized()?;
                *out = self.sector_count().map_err(DiskioError::Hardware)?;
                Ok(())
            }
        }
    }
}
