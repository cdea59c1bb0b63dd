//! Device Hot-plug (spec §4.8, component C10) plus the interface/block
//! statistics supplements from SPEC_FULL §F. Device-name derivation is a
//! direct transcription of `qemudDeviceDriveName`-equivalent rules from
//! the original driver; the attach/detach helpers are thin wrappers over
//! `monitor::MonitorClient` commands.

use domain::{Bus, DeviceKind, DomainDefinition};
use monitor::MonitorClient;

use crate::error::{Error, InternalError, Result, UserError};

/// Derives the monitor-visible device name for a disk slot (spec §4.8).
pub fn monitor_device_name(
    bus: Bus,
    kind: DeviceKind,
    bus_index: u32,
    dev_index: u32,
    target: &str,
    has_drive: bool,
) -> std::result::Result<String, String> {
    if has_drive {
        match (bus, kind) {
            (Bus::Ide, DeviceKind::Disk) => Ok(format!("ide{}-hd{}", bus_index, dev_index)),
            (Bus::Ide, DeviceKind::Cdrom) => Ok(format!("ide{}-cd{}", bus_index, dev_index)),
            (Bus::Scsi, DeviceKind::Disk) => Ok(format!("scsi{}-hd{}", bus_index, dev_index)),
            (Bus::Scsi, DeviceKind::Cdrom) => Ok(format!("scsi{}-cd{}", bus_index, dev_index)),
            (Bus::Fdc, _) => Ok(format!("floppy{}", dev_index)),
            (Bus::Virtio, _) => Ok(format!("virtio{}", dev_index)),
            _ => Err("not supported".to_string()),
        }
    } else {
        match kind {
            DeviceKind::Floppy => Ok(target.to_string()),
            DeviceKind::Cdrom if target == "hdc" => Ok("cdrom".to_string()),
            _ => Err("not supported".to_string()),
        }
    }
}

fn bus_arg(bus: Bus) -> &'static str {
    match bus {
        Bus::Ide => "ide",
        Bus::Scsi => "scsi",
        Bus::Fdc => "floppy",
        Bus::Virtio => "virtio",
        Bus::Usb => "usb",
    }
}

/// `pci_add 0 storage file=<path>,if=<bus>`; returns the slot the monitor
/// assigned.
pub fn attach_disk(monitor: &mut MonitorClient, source_path: &str, bus: Bus) -> Result<u32> {
    let cmd = format!(
        "pci_add 0 storage file={},if={}",
        monitor::monitor_escape(source_path),
        bus_arg(bus)
    );
    let reply = monitor.command(&cmd)?;
    monitor::parse_pci_add_slot(&reply)
        .ok_or_else(|| Error::User(UserError::OperationFailed(reply)))
}

/// `pci_del 0 <slot>`; the slot must have come from a prior `attach_disk`.
pub fn detach_disk(monitor: &mut MonitorClient, slot: u32) -> Result<()> {
    let reply = monitor.command(&format!("pci_del 0 {}", slot))?;
    monitor::command_ok(&reply).map_err(|e| Error::User(UserError::OperationFailed(e)))
}

pub fn change_media(monitor: &mut MonitorClient, device: &str, path: &str) -> Result<()> {
    let cmd = format!("change {} \"{}\"", device, monitor::monitor_escape(path));
    let reply = monitor.command(&cmd)?;
    if reply.starts_with("device ") {
        return Err(Error::User(UserError::OperationFailed(reply)));
    }
    Ok(())
}

pub fn eject_media(monitor: &mut MonitorClient, device: &str) -> Result<()> {
    let reply = monitor.command(&format!("eject {}", device))?;
    if reply.starts_with("device ") {
        return Err(Error::User(UserError::OperationFailed(reply)));
    }
    Ok(())
}

pub fn block_stats(monitor: &mut MonitorClient, device: &str) -> Result<monitor::BlockStats> {
    let reply = monitor.command("info blockstats")?;
    if reply.starts_with("info ") {
        return Err(Error::User(UserError::NoSupport("info blockstats".to_string())));
    }
    monitor::parse_block_stats(&reply, device)
        .ok_or_else(|| Error::User(UserError::InvalidArg(format!("no such block device: {}", device))))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub rx_drop: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
    pub tx_drop: u64,
}

/// Network interface statistics (SPEC_FULL §F.1), read from the host-side
/// tap's `/sys/class/net/<tap>/statistics/*` counters. The original driver
/// set its `ret` found-flag and return code through the same variable;
/// here `found` is an explicit `bool` so there is no such ambiguity
/// (spec §9 open question).
pub fn interface_stats(def: &DomainDefinition, device: &str) -> Result<InterfaceStats> {
    let mut found = false;
    let mut tap = None;
    for net in &def.net_interfaces {
        if net.tap_name.as_deref() == Some(device) {
            found = true;
            tap = net.tap_name.clone();
            break;
        }
    }
    if !found {
        return Err(Error::User(UserError::InvalidArg(format!(
            "no such interface: {}",
            device
        ))));
    }
    let tap = tap.unwrap();
    let base = format!("/sys/class/net/{}/statistics", tap);
    let read = |stat: &str| -> Result<u64> {
        let raw = std::fs::read_to_string(format!("{}/{}", base, stat))
            .map_err(InternalError::Io)?;
        raw.trim()
            .parse()
            .map_err(|_| Error::Internal(InternalError::System(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("malformed counter in {}", stat),
            ))))
    };
    Ok(InterfaceStats {
        rx_bytes: read("rx_bytes")?,
        rx_packets: read("rx_packets")?,
        rx_errs: read("rx_errors")?,
        rx_drop: read("rx_dropped")?,
        tx_bytes: read("tx_bytes")?,
        tx_packets: read("tx_packets")?,
        tx_errs: read("tx_errors")?,
        tx_drop: read("tx_dropped")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_device_name_ide_disk() {
        assert_eq!(
            monitor_device_name(Bus::Ide, DeviceKind::Disk, 0, 0, "hda", true).unwrap(),
            "ide0-hd0"
        );
    }

    #[test]
    fn test_monitor_device_name_legacy_floppy() {
        assert_eq!(
            monitor_device_name(Bus::Fdc, DeviceKind::Floppy, 0, 0, "fda", false).unwrap(),
            "fda"
        );
    }

    #[test]
    fn test_monitor_device_name_legacy_cdrom_hdc() {
        assert_eq!(
            monitor_device_name(Bus::Ide, DeviceKind::Cdrom, 0, 0, "hdc", false).unwrap(),
            "cdrom"
        );
    }

    #[test]
    fn test_monitor_device_name_legacy_unsupported() {
        assert!(monitor_device_name(Bus::Scsi, DeviceKind::Disk, 0, 0, "sda", false).is_err());
    }

    #[test]
    fn test_interface_stats_unknown_device() {
        let def = DomainDefinition {
            name: "alpha".into(),
            uuid: "00000000-0000-0000-0000-000000000001".into(),
            emulator_path: "/usr/bin/qemu-kvm".into(),
            virt_type: domain::VirtType::Accelerated,
            memory_max_kib: 1024,
            memory_current_kib: 1024,
            vcpu_count: 1,
            cpu_affinity: None,
            graphics: None,
            disks: vec![],
            net_interfaces: vec![],
            serials: vec![],
            parallels: vec![],
            host_devices: vec![],
        };
        assert!(matches!(
            interface_stats(&def, "vnet0"),
            Err(Error::User(UserError::InvalidArg(_)))
        ));
    }
}
