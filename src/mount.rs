//! Mount manager.
//!
//! Watches the card slot and keeps the filesystem's mount state in step
//! with it: mount on insertion, unmount and discard card identity on
//! removal. Runs from a periodic tick and from the `ready` probe; both
//! perform the same reconciliation.

use crate::diskio::{DiskioDevice, Status};

/// Recommended interval for the hot-plug poll, in milliseconds.
pub const DETECT_POLL_MS: u32 = 500;

/// Filesystem hooks run on card insertion and removal.
///
/// `mount` is expected to bring the volume up through the block device;
/// a FAT mount calls `initialize` and then reads the volume structures,
/// so a card never mounts without completing init first.
pub trait VolumeHost<D: DiskioDevice> {
    type Error;

    fn mount(&mut self, dev: &mut D) -> Result<(), Self::Error>;

    fn unmount(&mut self, dev: &mut D);
}

/// Tracks whether the volume behind the card slot is mounted.
#[derive(Default)]
pub struct MountManager {
    mounted: bool,
}

impl MountManager {
    pub const fn new() -> Self {
        MountManager { mounted: false }
    }

    /// Last reconciled state, without touching the hardware.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Reconcile mount state with card presence and report it. This is
    /// the single predicate callers consult before issuing I/O.
    ///
    /// A failed mount leaves the state unmounted; the next tick retries.
    pub fn ready<D, V>(&mut self, dev: &mut D, host: &mut V) -> bool
    where
        D: DiskioDevice,
        V: VolumeHost<D>,
    {
        let present = !dev.status().contains(Status::NO_DISK);

        if present && !self.mounted {
            if host.mount(dev).is_ok() {
                self.mounted = true;
                info!("sd: volume mounted");
            } else {
                debug!("sd: mount attempt failed, will retry");
            }
        } else if !present && self.mounted {
            host.unmount(dev);
            dev.reset();
            self.mounted = false;
            info!("sd: card removed, volume unmounted");
        }

        self.mounted
    }

    /// Periodic hot-plug poll body; run it every [`DETECT_POLL_MS`].
    pub fn tick<D, V>(&mut self, dev: &mut D, host: &mut V)
    where
        D: DiskioDevice,
        V: VolumeHost<D>,
    {
        let _ = self.ready(dev, host);
    }
}
