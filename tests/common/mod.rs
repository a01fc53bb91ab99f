//! Test doubles: a byte-level simulated SD card behind mock HAL pins.
//!
//! The simulator answers the SPI-mode protocol one full-duplex byte at
//! a time: command packets in, R1/R3/R7 responses, data tokens and busy
//! windows out. Fault injection covers unanswered commands, corrupted
//! read blocks, rejected writes and mid-transfer card removal, and the
//! wire counters let tests assert exactly which commands and tokens
//! crossed the bus.

#![allow(dead_code)] // each test binary uses a subset of the harness

use std::cell::RefCell;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayUs;
use embedded_hal::blocking::spi::Transfer;
use switch_hal::{InputSwitch, OutputSwitch};

use sdspi_storage::{BaudControl, SdCardSpi, SdSpiConfig};

pub const SECTOR: usize = 512;

// ---------------------------------------------------------------------
// Reference CRCs, kept deliberately distinct from the crate's
// implementations (bitwise vs table) so the two validate each other.
// ---------------------------------------------------------------------

pub fn crc7_ref(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for mut byte in data.iter().cloned() {
        for _ in 0..8 {
            crc <<= 1;
            if ((byte & 0x80) ^ (crc & 0x80)) != 0 {
                crc ^= 0x09;
            }
            byte <<= 1;
        }
    }
    crc & 0x7F
}

pub fn crc16_ref(data: &[u8]) -> u16 {
    let mut crc = 0u16;
    for &byte in data {
        crc = ((crc >> 8) & 0xFF) | (crc << 8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0xFF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0xFF) << 5;
    }
    crc
}

// ---------------------------------------------------------------------
// CSD register builders
// ---------------------------------------------------------------------

pub fn csd_v1_raw(c_size: u128, c_size_mult: u128, read_bl_len: u128) -> [u8; 16] {
    ((read_bl_len << 80) | (c_size << 62) | (c_size_mult << 47)).to_be_bytes()
}

pub fn csd_v2_raw(c_size: u128) -> [u8; 16] {
    ((1u128 << 126) | (c_size << 48)).to_be_bytes()
}

// ---------------------------------------------------------------------
// Simulated card
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    /// SDSC that rejects SEND_IF_COND.
    V1,
    /// SDSC that answers SEND_IF_COND (CCS stays clear).
    V2Sc,
    /// Block-addressed SDHC/SDXC.
    Sdhc,
}

enum Phase {
    /// Watching the line for command packets.
    Command,
    /// Streaming read blocks until STOP_TRANSMISSION.
    MultiRead { next: u32 },
    /// Waiting for a write data token (or the stop token).
    AwaitWriteData { multi: bool, addr: u32, index: u32 },
    /// Accumulating a 512-byte payload plus its CRC.
    ReceiveWriteData {
        multi: bool,
        addr: u32,
        index: u32,
        bytes: Vec<u8>,
    },
}

pub struct SimCard {
    kind: SimKind,
    csd: [u8; 16],
    capacity_sectors: u32,

    // fault injection
    pub present: bool,
    pub cmd0_ignore: u32,
    pub acmd41_until_ready: u32,
    pub mute: bool,
    pub voltage_ok: bool,
    pub corrupt_stream_indices: Vec<u32>,
    pub reject_write_at: Option<u32>,
    pub remove_after_write_blocks: Option<u32>,
    pub next_read_error_token: Option<u8>,
    pub busy_bytes: u32,
    pub read_latency: u32,

    // card state
    cs_low: bool,
    crc_mode: bool,
    powered_up: bool,
    in_idle: bool,
    acmd: bool,
    acmd41_polls: u32,
    stuck_busy: bool,
    phase: Phase,
    collecting: Vec<u8>,
    out: VecDeque<u8>,
    storage: HashMap<u32, [u8; SECTOR]>,

    // wire counters
    cmd_log: Vec<(bool, u8)>,
    pub last_acmd41_arg: Option<u32>,
    pub last_pre_erase_count: Option<u32>,
    pub data_tokens_single: u32,
    pub data_tokens_multi: u32,
    pub stop_tran_tokens: u32,
    pub blocks_streamed: u32,
    pub bauds: Vec<u32>,
    pub cs_selects: u32,
}

impl SimCard {
    fn new(kind: SimKind, csd: [u8; 16], capacity_sectors: u32) -> Self {
        SimCard {
            kind,
            csd,
            capacity_sectors,
            present: true,
            cmd0_ignore: 0,
            acmd41_until_ready: 2,
            mute: false,
            voltage_ok: true,
            corrupt_stream_indices: Vec::new(),
            reject_write_at: None,
            remove_after_write_blocks: None,
            next_read_error_token: None,
            busy_bytes: 2,
            read_latency: 2,
            cs_low: false,
            crc_mode: false,
            powered_up: false,
            in_idle: false,
            acmd: false,
            acmd41_polls: 0,
            stuck_busy: false,
            phase: Phase::Command,
            collecting: Vec::new(),
            out: VecDeque::new(),
            storage: HashMap::new(),
            cmd_log: Vec::new(),
            last_acmd41_arg: None,
            last_pre_erase_count: None,
            data_tokens_single: 0,
            data_tokens_multi: 0,
            stop_tran_tokens: 0,
            blocks_streamed: 0,
            bauds: Vec::new(),
            cs_selects: 0,
        }
    }

    /// Block-addressed card holding `(c_size + 1) * 1024` sectors.
    pub fn sdhc(c_size: u32) -> Self {
        Self::new(
            SimKind::Sdhc,
            csd_v2_raw(c_size as u128),
            (c_size + 1) * 1024,
        )
    }

    /// Byte-addressed v1 card described by the given CSD fields.
    pub fn sd_v1(c_size: u32, c_size_mult: u8, read_bl_len: u8) -> Self {
        let sectors = (c_size + 1) << (c_size_mult + read_bl_len - 7);
        Self::new(
            SimKind::V1,
            csd_v1_raw(c_size as u128, c_size_mult as u128, read_bl_len as u128),
            sectors,
        )
    }

    /// Byte-addressed card that answers SEND_IF_COND but reports CCS=0.
    pub fn sd_v2sc(c_size: u32, c_size_mult: u8, read_bl_len: u8) -> Self {
        let sectors = (c_size + 1) << (c_size_mult + read_bl_len - 7);
        Self::new(
            SimKind::V2Sc,
            csd_v1_raw(c_size as u128, c_size_mult as u128, read_bl_len as u128),
            sectors,
        )
    }

    pub fn capacity_sectors(&self) -> u32 {
        self.capacity_sectors
    }

    pub fn sector(&self, index: u32) -> [u8; SECTOR] {
        self.storage.get(&index).copied().unwrap_or([0u8; SECTOR])
    }

    pub fn set_sector(&mut self, index: u32, data: [u8; SECTOR]) {
        self.storage.insert(index, data);
    }

    pub fn count_cmd(&self, cmd: u8) -> usize {
        self.cmd_log.iter().filter(|&&(a, c)| !a && c == cmd).count()
    }

    pub fn count_acmd(&self, cmd: u8) -> usize {
        self.cmd_log.iter().filter(|&&(a, c)| a && c == cmd).count()
    }

    // -----------------------------------------------------------------
    // Byte exchange
    // -----------------------------------------------------------------

    pub fn exchange(&mut self, mosi: u8) -> u8 {
        if !self.cs_low || self.mute {
            return 0xFF;
        }

        if self.out.is_empty() {
            if self.stuck_busy {
                // Removed mid-programming: once the queued response has
                // drained, the line stays busy forever.
                return 0x00;
            }
            if let Phase::MultiRead { next } = self.phase {
                if self.present {
                    self.enqueue_read_block(next);
                    self.phase = Phase::MultiRead { next: next + 1 };
                }
            }
        }
        let out = self.out.pop_front().unwrap_or(0xFF);
        if self.present && !self.stuck_busy {
            self.feed(mosi);
        }
        out
    }

    fn feed(&mut self, mosi: u8) {
        match &mut self.phase {
            Phase::AwaitWriteData { multi, addr, index } => {
                let (multi, addr, index) = (*multi, *addr, *index);
                match mosi {
                    0xFF => {}
                    0xFE if !multi => {
                        self.data_tokens_single += 1;
                        self.phase = Phase::ReceiveWriteData {
                            multi,
                            addr,
                            index,
                            bytes: Vec::with_capacity(SECTOR + 2),
                        };
                    }
                    0xFC if multi => {
                        self.data_tokens_multi += 1;
                        self.phase = Phase::ReceiveWriteData {
                            multi,
                            addr,
                            index,
                            bytes: Vec::with_capacity(SECTOR + 2),
                        };
                    }
                    0xFD if multi => {
                        self.stop_tran_tokens += 1;
                        for _ in 0..self.busy_bytes {
                            self.out.push_back(0x00);
                        }
                        self.phase = Phase::Command;
                    }
                    _ => {}
                }
            }
            Phase::ReceiveWriteData { bytes, .. } => {
                bytes.push(mosi);
                if bytes.len() == SECTOR + 2 {
                    self.finish_write_block();
                }
            }
            _ => self.collect_command(mosi),
        }
    }

    fn collect_command(&mut self, mosi: u8) {
        if self.collecting.is_empty() && mosi & 0xC0 != 0x40 {
            return;
        }
        self.collecting.push(mosi);
        if self.collecting.len() == 6 {
            let packet: [u8; 6] = self.collecting[..].try_into().unwrap();
            self.collecting.clear();
            self.handle_command(packet);
        }
    }

    // -----------------------------------------------------------------
    // Command handling
    // -----------------------------------------------------------------

    fn respond(&mut self, r1: u8) {
        // One Ncr filler before the response byte.
        self.out.push_back(0xFF);
        self.out.push_back(r1);
    }

    fn respond_with_tail(&mut self, r1: u8, tail: [u8; 4]) {
        self.respond(r1);
        self.out.extend(tail);
    }

    fn idle_bit(&self) -> u8 {
        if self.in_idle {
            0x01
        } else {
            0x00
        }
    }

    fn to_sector(&self, arg: u32) -> u32 {
        if self.kind == SimKind::Sdhc {
            arg
        } else {
            assert_eq!(arg % 512, 0, "byte-addressed card got unaligned address");
            arg / 512
        }
    }

    fn handle_command(&mut self, packet: [u8; 6]) {
        let cmd = packet[0] & 0x3F;
        let arg = u32::from_be_bytes([packet[1], packet[2], packet[3], packet[4]]);
        let acmd = std::mem::replace(&mut self.acmd, false);
        self.cmd_log.push((acmd, cmd));

        // The card checks CMD0/CMD8 CRCs always, the rest once CRC_ON_OFF
        // enabled them.
        if self.crc_mode || cmd == 0 || cmd == 8 {
            let expect = (crc7_ref(&packet[..5]) << 1) | 0x01;
            if packet[5] != expect {
                self.respond(self.idle_bit() | 0x08);
                return;
            }
        }

        let idle = self.idle_bit();
        match (acmd, cmd) {
            (false, 0) => {
                if self.cmd0_ignore > 0 {
                    self.cmd0_ignore -= 1;
                    return; // no response; host sees Ncr run out
                }
                self.in_idle = true;
                self.powered_up = false;
                self.acmd41_polls = 0;
                self.respond(0x01);
            }
            (false, 8) => {
                if self.kind == SimKind::V1 {
                    self.respond(idle | 0x04);
                } else {
                    self.respond_with_tail(idle, [0x00, 0x00, 0x01, 0xAA]);
                }
            }
            (false, 59) => {
                self.crc_mode = arg & 1 == 1;
                self.respond(idle);
            }
            (false, 58) => {
                let mut ocr0 = 0u8;
                if self.powered_up {
                    ocr0 |= 0x80;
                    if self.kind == SimKind::Sdhc {
                        ocr0 |= 0x40;
                    }
                }
                let ocr1 = if self.voltage_ok { 0x30 } else { 0x00 };
                self.respond_with_tail(idle, [ocr0, ocr1, 0x00, 0x00]);
            }
            (false, 55) => {
                self.acmd = true;
                self.respond(idle);
            }
            (true, 41) => {
                self.last_acmd41_arg = Some(arg);
                self.acmd41_polls += 1;
                if self.acmd41_polls >= self.acmd41_until_ready {
                    self.powered_up = true;
                    self.in_idle = false;
                    self.respond(0x00);
                } else {
                    self.respond(0x01);
                }
            }
            (true, 23) => {
                self.last_pre_erase_count = Some(arg);
                self.respond(idle);
            }
            (false, 16) => {
                assert_eq!(arg, 512, "only 512-byte blocks are modeled");
                self.respond(idle);
            }
            (false, 9) => {
                self.respond(0x00);
                for _ in 0..self.read_latency {
                    self.out.push_back(0xFF);
                }
                self.out.push_back(0xFE);
                let csd = self.csd;
                self.out.extend(csd);
                self.out.extend(crc16_ref(&csd).to_be_bytes());
            }
            (false, 17) => {
                let sector = self.to_sector(arg);
                if sector >= self.capacity_sectors {
                    self.respond(0x40);
                } else if let Some(token) = self.next_read_error_token.take() {
                    self.respond(0x00);
                    self.out.push_back(token);
                } else {
                    self.respond(0x00);
                    self.enqueue_read_block(sector);
                }
            }
            (false, 18) => {
                let sector = self.to_sector(arg);
                if sector >= self.capacity_sectors {
                    self.respond(0x40);
                } else {
                    self.respond(0x00);
                    self.phase = Phase::MultiRead { next: sector };
                }
            }
            (false, 12) => {
                self.phase = Phase::Command;
                self.out.clear();
                self.respond(0x00);
                for _ in 0..self.busy_bytes {
                    self.out.push_back(0x00);
                }
            }
            (false, 24) => {
                let sector = self.to_sector(arg);
                if sector >= self.capacity_sectors {
                    self.respond(0x40);
                } else {
                    self.respond(0x00);
                    self.phase = Phase::AwaitWriteData {
                        multi: false,
                        addr: sector,
                        index: 0,
                    };
                }
            }
            (false, 25) => {
                let sector = self.to_sector(arg);
                if sector >= self.capacity_sectors {
                    self.respond(0x40);
                } else {
                    self.respond(0x00);
                    self.phase = Phase::AwaitWriteData {
                        multi: true,
                        addr: sector,
                        index: 0,
                    };
                }
            }
            _ => self.respond(idle | 0x04),
        }
    }

    // -----------------------------------------------------------------
    // Data phases
    // -----------------------------------------------------------------

    fn enqueue_read_block(&mut self, sector: u32) {
        for _ in 0..self.read_latency {
            self.out.push_back(0xFF);
        }
        self.out.push_back(0xFE);

        let mut data = self.sector(sector);
        let crc = crc16_ref(&data);
        if self
            .corrupt_stream_indices
            .contains(&self.blocks_streamed)
        {
            // Flip one bit after computing the CRC of the clean data.
            data[7] ^= 0x10;
        }
        self.blocks_streamed += 1;
        self.out.extend(data);
        self.out.extend(crc.to_be_bytes());
    }

    fn finish_write_block(&mut self) {
        let (multi, addr, index, bytes) = match std::mem::replace(&mut self.phase, Phase::Command)
        {
            Phase::ReceiveWriteData {
                multi,
                addr,
                index,
                bytes,
            } => (multi, addr, index, bytes),
            _ => unreachable!(),
        };

        let data: [u8; SECTOR] = bytes[..SECTOR].try_into().unwrap();
        let crc = u16::from_be_bytes([bytes[SECTOR], bytes[SECTOR + 1]]);

        let resp = if self.reject_write_at == Some(index) {
            0x0D
        } else if self.crc_mode && crc != crc16_ref(&data) {
            0x0B
        } else {
            self.storage.insert(addr, data);
            0x05
        };
        self.out.push_back(resp);
        for _ in 0..self.busy_bytes {
            self.out.push_back(0x00);
        }

        if multi {
            self.phase = Phase::AwaitWriteData {
                multi: true,
                addr: addr + 1,
                index: index + 1,
            };
            if resp == 0x05 && self.remove_after_write_blocks == Some(index + 1) {
                self.present = false;
                self.stuck_busy = true;
            }
        }
    }
}

// ---------------------------------------------------------------------
// HAL doubles
// ---------------------------------------------------------------------

pub type SharedSim = Rc<RefCell<SimCard>>;

pub fn shared(sim: SimCard) -> SharedSim {
    Rc::new(RefCell::new(sim))
}

pub struct MockSpi(pub SharedSim);

impl Transfer<u8> for MockSpi {
    type Error = Infallible;

    fn transfer<'w>(&mut self, words: &'w mut [u8]) -> Result<&'w [u8], Infallible> {
        let mut sim = self.0.borrow_mut();
        for byte in words.iter_mut() {
            *byte = sim.exchange(*byte);
        }
        Ok(words)
    }
}

impl BaudControl for MockSpi {
    fn set_baud(&mut self, baud_hz: u32) {
        self.0.borrow_mut().bauds.push(baud_hz);
    }
}

pub struct MockCs(pub SharedSim);

impl OutputSwitch for MockCs {
    type Error = Infallible;

    fn on(&mut self) -> Result<(), Infallible> {
        let mut sim = self.0.borrow_mut();
        if !sim.cs_low {
            sim.cs_selects += 1;
        }
        sim.cs_low = true;
        Ok(())
    }

    fn off(&mut self) -> Result<(), Infallible> {
        self.0.borrow_mut().cs_low = false;
        Ok(())
    }
}

pub struct MockDetect(pub SharedSim);

impl InputSwitch for MockDetect {
    type Error = Infallible;

    fn is_active(&self) -> Result<bool, Infallible> {
        Ok(self.0.borrow().present)
    }
}

pub struct MockDelay;

impl DelayUs<u16> for MockDelay {
    fn delay_us(&mut self, _us: u16) {}
}

/// Small wait budgets so timeout paths run in microseconds on host.
pub struct TestConfig;

impl SdSpiConfig for TestConfig {
    const POWER_UP_DELAY_US: u16 = 1;
    const RESET_BACKOFF_US: u16 = 1;
    const POWER_UP_ATTEMPTS: u32 = 16;
    const POWER_UP_POLL_US: u16 = 1;
    const READ_TOKEN_ATTEMPTS: u32 = 64;
    const BUSY_WAIT_ATTEMPTS: u32 = 64;
}

pub type TestCard = SdCardSpi<MockSpi, MockCs, MockDetect, MockDelay, TestConfig>;

pub fn new_card(sim: &SharedSim) -> TestCard {
    SdCardSpi::new(
        MockSpi(sim.clone()),
        MockCs(sim.clone()),
        MockDetect(sim.clone()),
        MockDelay,
    )
}

/// A freshly initialized 64 MiB-class SDHC card and its driver.
pub fn initialized_sdhc() -> (SharedSim, TestCard) {
    let sim = shared(SimCard::sdhc(127));
    let mut card = new_card(&sim);
    card.init().expect("init");
    (sim, card)
}

pub fn pattern_sector(seed: usize) -> [u8; SECTOR] {
    let mut data = [0u8; SECTOR];
    for (i, byte) in data.iter_mut().enumerate() {
        *byte = ((seed * SECTOR + i) % 256) as u8;
    }
    data
}
