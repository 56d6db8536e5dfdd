use std::fmt;
use std::path::PathBuf;

/// Whether a [`Device`] is a whole disk or a partition on one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceKind {
    Disk,
    Partition,
}

/// Represents a block device or partition discovered on the system.
///
/// Populated by the platform-specific discovery functions in the
/// [`crate::platform`] module; the pipeline itself only ever sees a
/// [`DeviceHandle`].
#[derive(Clone, Debug)]
pub struct Device {
    /// The system path to the device (e.g., `/dev/sda1`).
    pub path: PathBuf,
    /// The kernel-provided name of the device (e.g., "sda1").
    pub name: String,
    pub kind: DeviceKind,
    /// The total size of the device in bytes.
    pub size_bytes: u64,
    /// Model string reported by the kernel, if any.
    pub model: String,
    /// Filesystem type, when it could be determined.
    pub fstype: String,
    /// The primary mount point of the device, if any.
    pub mount_point: String,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mount_info = if !self.mount_point.is_empty() {
            format!("[Mounted at {}]", self.mount_point)
        } else {
            "[Not mounted]".to_string()
        };
        let detail = match self.kind {
            DeviceKind::Disk => &self.model,
            DeviceKind::Partition => &self.fstype,
        };

        write!(
            f,
            "{:<15} {:>9} {:<20} {}",
            self.path.display(),
            format_size(self.size_bytes),
            detail,
            mount_info
        )
    }
}

/// Whether a [`DeviceHandle`] refers to a raw block device or a regular file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    BlockDevice,
    RegularFile,
}

/// An opened reference to the source or destination of a pipeline, with its
/// length in bytes. Obtained through [`crate::rawio::probe`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceHandle {
    pub path: PathBuf,
    pub len: u64,
    pub kind: HandleKind,
}

impl DeviceHandle {
    pub fn is_block_device(&self) -> bool {
        self.kind == HandleKind::BlockDevice
    }
}

/// Formats a byte count the way `lsblk` users expect to read it.
pub fn format_size(bytes: u64) -> String {
    const KIB: u64 = 1 << 10;
    const MIB: u64 = 1 << 20;
    const GIB: u64 = 1 << 30;
    const TIB: u64 = 1 << 40;

    if bytes >= TIB {
        format!("{:.1} TB", bytes as f64 / TIB as f64)
    } else if bytes >= GIB {
        format!("{:.1} GB", bytes as f64 / GIB as f64)
    } else if bytes >= MIB {
        format!("{} MB", bytes / MIB)
    } else {
        format!("{} KB", bytes / KIB)
    }
}
