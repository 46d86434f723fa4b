use bitflags::bitflags;

use crate::error::SyncError;

bitflags! {
    /// Requested or recorded access mode for a shared buffer.
    ///
    /// `DEVICE` is a modifier on `READ`/`WRITE`: a DMA engine reading is
    /// `DEVICE_READ`, a DMA engine writing is `DEVICE_WRITE`. Only plain
    /// CPU reads are compatible with each other; any write or device
    /// access is exclusive.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AccessType: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const DEVICE = 1 << 2;

        const DEVICE_READ = Self::DEVICE.bits() | Self::READ.bits();
        const DEVICE_WRITE = Self::DEVICE.bits() | Self::WRITE.bits();
    }
}

/// Cache-maintenance direction handed to the coherency callouts.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CpuDirection {
    Read,
    Write,
    Bidirectional,
}

impl AccessType {
    /// Checks a caller-supplied mask and normalizes it.
    ///
    /// An empty mask or a bare `DEVICE` bit is malformed. `READ | WRITE`
    /// collapses to `WRITE`: a write grant is already exclusive, so the
    /// read half adds nothing.
    pub fn validate(self) -> Result<AccessType, SyncError> {
        if self.is_empty() || !self.intersects(Self::READ | Self::WRITE) {
            return Err(SyncError::InvalidAccess);
        }
        if self.contains(Self::READ | Self::WRITE) {
            return Ok(self - Self::READ);
        }
        Ok(self)
    }

    /// CPU read with no writer and no device involvement; the only mode
    /// that may share a buffer with concurrent holders.
    pub fn is_read_only(self) -> bool {
        self.contains(Self::READ) && !self.intersects(Self::WRITE | Self::DEVICE)
    }

    pub fn has_device(self) -> bool {
        self.contains(Self::DEVICE)
    }

    pub(crate) fn cpu_direction(self) -> CpuDirection {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, false) => CpuDirection::Read,
            (false, true) => CpuDirection::Write,
            _ => CpuDirection::Bidirectional,
        }
    }
}
