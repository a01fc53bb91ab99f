//! Block device interface consumed by the filesystem layer.
//!
//! The shape mirrors the five entry points a FAT port drives:
//! initialize, status, read, write and ioctl, with sector-granular
//! buffers and a small status flag set.

use bitflags::bitflags;

/// Logical index of a 512-byte sector.
pub type Lba = u32;

bitflags! {
    /// Media status flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u8 {
        /// Device has not completed initialization.
        const NOT_INITIALIZED = 1 << 0;
        /// No medium in the slot.
        const NO_DISK = 1 << 1;
        /// Initialization failed; cleared by the next successful one.
        const ERROR = 1 << 2;
    }
}

/// Errors surfaced to the filesystem layer. The hardware variant wraps
/// the driver's rich error; a FAT port folds all of this into its
/// coarse ok/error result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskioError<E> {
    /// Buffer shape or drive number is invalid.
    InvalidArgument,
    /// The operation needs a completed `initialize`.
    NotInitialized,
    /// The underlying driver failed.
    Hardware(E),
}

/// Control operations issued through `ioctl`.
pub enum IoctlCmd<'a> {
    /// Flush pending writes. Writes here complete before returning, so
    /// this is answered without touching the card.
    Sync,
    /// Sector size in bytes.
    SectorSize(&'a mut u16),
    /// Erase block size in sectors.
    BlockSize(&'a mut u32),
    /// Total number of sectors on the medium.
    SectorCount(&'a mut Lba),
}

/// A mountable block device moving whole 512-byte sectors.
pub trait DiskioDevice {
    type HardwareError;

    /// Current media status; `NO_DISK` reflects the detect line live.
    fn status(&self) -> Status;

    /// Drop any cached card identity; the next `initialize` starts
    /// from scratch. Called when the medium is removed.
    fn reset(&mut self);

    /// Bring the medium up. Idempotent on an initialized device.
    fn initialize(&mut self) -> Result<(), DiskioError<Self::HardwareError>>;

    /// Read `buf.len() / 512` sectors starting at `lba`.
    fn read(&self, buf: &mut [u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>>;

    /// Write `buf.len() / 512` sectors starting at `lba`.
    fn write(&self, buf: &[u8], lba: Lba) -> Result<(), DiskioError<Self::HardwareError>>;

    fn ioctl(&self, cmd: IoctlCmd<'_>) -> Result<(), DiskioError<Self::HardwareError>>;
}

/// Numbered-drive facade over the single physical device, matching the
/// drive-indexed entry points a FAT port expects. Only drive 0 exists;
/// any other number is a parameter error.
pub struct DriveTable<D> {
    dev: D,
}

impl<D: DiskioDevice> DriveTable<D> {
    pub fn new(dev: D) -> Self {
        DriveTable { dev }
    }

    pub fn device(&self) -> &D {
        &self.dev
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.dev
    }

    fn select(drive: u8) -> Result<(), DiskioError<D::HardwareError>> {
        if drive == 0 {
            Ok(())
        } else {
            Err(DiskioError::InvalidArgument)
        }
    }

    pub fn initialize(&mut self, drive: u8) -> Result<(), DiskioError<D::HardwareError>> {
        if drive != 0 {
            return Err(DiskioError::NotInitialized);
        }
        self.dev.initialize()
    }

    pub fn status(&self, drive: u8) -> Status {
        if drive != 0 {
            return Status::NOT_INITIALIZED;
        }
        self.dev.status()
    }

    pub fn read(
        &self,
        drive: u8,
        buf: &mut [u8],
        lba: Lba,
    ) -> Result<(), DiskioError<D::HardwareError>> {
        Self::select(drive)?;
        self.dev.read(buf, lba)
    }

    pub fn write(
        &self,
        drive: u8,
        buf: &[u8],
        lba: Lba,
    ) -> Result<(), DiskioError<D::HardwareError>> {
        Self::select(drive)?;
        self.dev.write(buf, lba)
    }

    pub fn ioctl(
        &self,
        drive: u8,
        cmd: IoctlCmd<'_>,
    ) -> Result<(), DiskioError<D::HardwareError>> {
        Self::select(drive)?;
        self.dev.ioctl(cmd)
    }
}
