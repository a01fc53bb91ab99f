//! SD card storage stack over SPI.
//!
//! Everything between a FAT library and the pins: a byte-level bus
//! layer, the SD SPI-mode protocol engine (init, block I/O, CRC, CSD),
//! the block-device adapter a filesystem port consumes, and a mount
//! manager that follows card insertion and removal.
//!
//! The driver is `no_std`, allocation-free and built on `embedded-hal`
//! and `switch-hal` seams, so it runs against any platform that can
//! provide a blocking SPI transfer, two switched pins and a microsecond
//! delay.

#![cfg_attr(not(test), no_std)]

mod fmt;

mod bus;
mod card;
mod config;
pub mod consts;
mod crc;
mod csd;
mod diskio;
mod error;
mod mount;
mod response;

pub use crate::bus::{BaudControl, Bus, FILL};
pub use crate::card::{CardType, SdCardSpi};
pub use crate::config::{DefaultSdSpiConfig, SdSpiConfig};
pub use crate::consts::BLOCK_SIZE;
pub use crate::csd::{CapacityProvider, Csd, CsdData, CsdV1, CsdV2};
pub use crate::diskio::{DiskioDevice, DiskioError, DriveTable, IoctlCmd, Lba, Status};
pub use crate::error::Error;
pub use crate::mount::{MountManager, VolumeHost, DETECT_POLL_MS};
pub use crate::response::{R1Response, R3OcrPayload, R7IfCondPayload};
