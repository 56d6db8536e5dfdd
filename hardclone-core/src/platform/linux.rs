use crate::device::{Device, DeviceKind};
use crate::error::Result;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use sysinfo::Disks;

const SYS_BLOCK: &str = "/sys/block";
const SECTOR: u64 = 512;

/// Helper to read a file below /sys/block, trimmed.
fn read_sys_file(relative: &Path) -> io::Result<String> {
    fs::read_to_string(Path::new(SYS_BLOCK).join(relative)).map(|s| s.trim().to_string())
}

fn size_bytes(relative: &Path) -> u64 {
    read_sys_file(&relative.join("size"))
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(0)
        * SECTOR
}

fn kernel_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Mount point and filesystem type of `name`, as far as `sysinfo` knows.
fn mount_info(disks: &Disks, name: &str) -> (String, String) {
    disks
        .iter()
        .find(|d| kernel_name(Path::new(d.name())) == name)
        .map(|d| {
            (
                d.mount_point().to_string_lossy().into_owned(),
                d.file_system().to_string_lossy().into_owned(),
            )
        })
        .unwrap_or_default()
}

/// Lists whole disks, like `lsblk -d`.
///
/// Loop, RAM and zram devices are skipped, as are devices reporting a size of
/// zero (typically empty card readers).
pub fn list_disks() -> Result<Vec<Device>> {
    let disks = Disks::new_with_refreshed_list();
    let mut devices = Vec::new();

    for entry in fs::read_dir(SYS_BLOCK)?.filter_map(std::result::Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if ["loop", "ram", "zram"].iter().any(|p| name.starts_with(p)) {
            continue;
        }

        let size = size_bytes(Path::new(&name));
        if size == 0 {
            continue;
        }

        let model = read_sys_file(&Path::new(&name).join("device/model")).unwrap_or_default();
        let (mount_point, fstype) = mount_info(&disks, &name);
        devices.push(Device {
            path: PathBuf::from("/dev").join(&name),
            name,
            kind: DeviceKind::Disk,
            size_bytes: size,
            model,
            fstype,
            mount_point,
        });
    }

    devices.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(devices)
}

/// Lists the partitions of a disk such as `/dev/sda`.
pub fn list_partitions(disk: &Path) -> Result<Vec<Device>> {
    let disks = Disks::new_with_refreshed_list();
    let disk_name = kernel_name(disk);
    let mut partitions = Vec::new();

    for entry in fs::read_dir(Path::new(SYS_BLOCK).join(&disk_name))?.filter_map(std::result::Result::ok) {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().join("partition").exists() {
            continue;
        }
        let (mount_point, fstype) = mount_info(&disks, &name);
        partitions.push(Device {
            path: PathBuf::from("/dev").join(&name),
            size_bytes: size_bytes(&Path::new(&disk_name).join(&name)),
            name,
            kind: DeviceKind::Partition,
            model: String::new(),
            fstype,
            mount_point,
        });
    }

    partitions.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(partitions)
}

/// Returns where `device`, or any partition on it, is mounted.
///
/// Paths that are not block devices known to the kernel are never mounted.
pub fn mount_point_of(device: &Path) -> Result<Option<PathBuf>> {
    let resolved = fs::canonicalize(device).unwrap_or_else(|_| device.to_path_buf());
    if !resolved.starts_with("/dev") {
        return Ok(None);
    }
    let target = kernel_name(&resolved);
    let disks = Disks::new_with_refreshed_list();

    for disk in disks.iter() {
        let mounted = kernel_name(Path::new(disk.name()));
        let on_target = mounted == target
            || (mounted.starts_with(&target)
                && Path::new(SYS_BLOCK).join(&target).join(&mounted).exists());
        if on_target {
            return Ok(Some(disk.mount_point().to_path_buf()));
        }
    }
    Ok(None)
}

/// Whether the process has the privileges raw device access usually needs.
pub fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn regular_files_are_never_mounted() {
        let file = NamedTempFile::new().unwrap();
        assert_eq!(mount_point_of(file.path()).unwrap(), None);
    }

    #[test]
    fn kernel_name_takes_last_component() {
        assert_eq!(kernel_name(Path::new("/dev/nvme0n1p2")), "nvme0n1p2");
        assert_eq!(kernel_name(Path::new("sda1")), "sda1");
    }
}
