//! The Domain Definition value type (spec §3) and its sub-structures.
//! Grounded on the teacher's `data_model` crate: plain, `Clone`-able
//! configuration structs with a validating constructor and a dedicated
//! `*Error` enum per concern, rather than one monolithic error type.

use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum VirtType {
    Plain,
    Accelerated,
    AcceleratedAlt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Bus {
    Ide,
    Scsi,
    Fdc,
    Virtio,
    Usb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum DeviceKind {
    Disk,
    Cdrom,
    Floppy,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiskDefinition {
    pub bus: Bus,
    pub device: DeviceKind,
    /// Unique within the domain, e.g. "hda".
    pub target: String,
    /// Absent for an empty removable drive.
    pub source_path: Option<String>,
    /// Filled in on hot-plug (spec §4.5 "Disk hot-plug").
    pub pci_slot: Option<u32>,
}

impl DiskDefinition {
    pub fn is_removable(&self) -> bool {
        matches!(self.device, DeviceKind::Cdrom | DeviceKind::Floppy)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct NetworkInterfaceDefinition {
    pub mac_address: String,
    pub bridge: Option<String>,
    pub tap_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum CharDeviceType {
    Pty,
    File,
    Null,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CharDeviceDefinition {
    pub kind: CharDeviceType,
    /// Filled in from the emulator's boot-time announcement when `kind ==
    /// Pty` (spec §4.3). `None` until the VM has booted at least once.
    pub path: Option<String>,
}

impl CharDeviceDefinition {
    pub fn pty() -> Self {
        CharDeviceDefinition {
            kind: CharDeviceType::Pty,
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct GraphicsConfig {
    pub auto_port: bool,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct HostDeviceDefinition {
    pub vendor_id: u16,
    pub product_id: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DomainDefinition {
    pub name: String,
    pub uuid: String,
    pub emulator_path: String,
    pub virt_type: VirtType,
    pub memory_max_kib: u64,
    pub memory_current_kib: u64,
    pub vcpu_count: u32,
    pub cpu_affinity: Option<u64>,
    pub graphics: Option<GraphicsConfig>,
    pub disks: Vec<DiskDefinition>,
    pub net_interfaces: Vec<NetworkInterfaceDefinition>,
    pub serials: Vec<CharDeviceDefinition>,
    pub parallels: Vec<CharDeviceDefinition>,
    pub host_devices: Vec<HostDeviceDefinition>,
}

#[derive(Debug)]
pub enum DefineError {
    EmptyName,
    InvalidName,
    InvalidUuid,
    MemoryCurrentExceedsMax,
    ZeroVcpus,
    DuplicateDiskTarget(String),
}

impl std::fmt::Display for DefineError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DefineError::EmptyName => write!(f, "domain name must not be empty"),
            DefineError::InvalidName => write!(f, "domain name contains invalid characters"),
            DefineError::InvalidUuid => write!(f, "uuid is not a well-formed 128-bit UUID"),
            DefineError::MemoryCurrentExceedsMax => {
                write!(f, "memory-current exceeds memory-max")
            }
            DefineError::ZeroVcpus => write!(f, "vcpu count must be at least 1"),
            DefineError::DuplicateDiskTarget(t) => {
                write!(f, "duplicate disk target '{}' within domain", t)
            }
        }
    }
}

impl DomainDefinition {
    /// Validates the invariants spec §3 states for a Domain Definition.
    /// Does not deduplicate against other domains in a registry — that is
    /// the registry's job (spec §4.4 UUID/name tie-break).
    pub fn validate(&self) -> Result<(), DefineError> {
        if self.name.is_empty() {
            return Err(DefineError::EmptyName);
        }
        if !qemud_util::validate_domain_name(&self.name) {
            return Err(DefineError::InvalidName);
        }
        if !qemud_util::validate_uuid(&self.uuid) {
            return Err(DefineError::InvalidUuid);
        }
        if self.memory_current_kib > self.memory_max_kib {
            return Err(DefineError::MemoryCurrentExceedsMax);
        }
        if self.vcpu_count == 0 {
            return Err(DefineError::ZeroVcpus);
        }
        let mut seen = std::collections::HashSet::new();
        for disk in &self.disks {
            if !seen.insert(disk.target.as_str()) {
                return Err(DefineError::DuplicateDiskTarget(disk.target.clone()));
            }
        }
        Ok(())
    }

    pub fn find_disk(&self, target: &str) -> Option<&DiskDefinition> {
        self.disks.iter().find(|d| d.target == target)
    }

    pub fn find_disk_mut(&mut self, target: &str) -> Option<&mut DiskDefinition> {
        self.disks.iter_mut().find(|d| d.target == target)
    }
}

/// Collaborator seam named in spec §6: `defFormat(def, flags) -> xml`. The
/// XML formatter itself is out of scope for this core; callers inject an
/// implementation (production code wires a real XML library, tests use a
/// round-trippable stand-in, see `domain::testing`).
pub trait DefinitionFormat {
    fn format(&self, def: &DomainDefinition) -> String;
}

/// Collaborator seam named in spec §6: `defParse(xml, flags) -> def`.
pub trait DefinitionParse {
    fn parse(&self, xml: &str) -> Result<DomainDefinition, String>;
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    //! A tiny JSON-backed stand-in for the XML parser/formatter collaborator,
    //! used only so the rest of the crate and its dependents have something
    //! round-trippable to test persistence against (spec §8 invariant 4).
    use super::*;

    #[derive(Clone, Default)]
    pub struct JsonFormat;

    impl DefinitionFormat for JsonFormat {
        fn format(&self, def: &DomainDefinition) -> String {
            serde_json::to_string_pretty(def).expect("domain definition must serialize")
        }
    }

    impl DefinitionParse for JsonFormat {
        fn parse(&self, xml: &str) -> Result<DomainDefinition, String> {
            serde_json::from_str(xml).map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DomainDefinition {
        DomainDefinition {
            name: "alpha".into(),
            uuid: "00000000-0000-0000-0000-000000000001".into(),
            emulator_path: "/usr/bin/qemu-kvm".into(),
            virt_type: VirtType::Accelerated,
            memory_max_kib: 65536,
            memory_current_kib: 65536,
            vcpu_count: 1,
            cpu_affinity: None,
            graphics: None,
            disks: vec![],
            net_interfaces: vec![],
            serials: vec![CharDeviceDefinition::pty()],
            parallels: vec![],
            host_devices: vec![],
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(sample().validate().is_ok());
    }

    #[test]
    fn test_validate_catches_memory_overflow() {
        let mut d = sample();
        d.memory_current_kib = d.memory_max_kib + 1;
        assert!(matches!(
            d.validate(),
            Err(DefineError::MemoryCurrentExceedsMax)
        ));
    }

    #[test]
    fn test_validate_catches_duplicate_target() {
        let mut d = sample();
        d.disks.push(DiskDefinition {
            bus: Bus::Virtio,
            device: DeviceKind::Disk,
            target: "vda".into(),
            source_path: Some("/tmp/a.img".into()),
            pci_slot: None,
        });
        d.disks.push(DiskDefinition {
            bus: Bus::Virtio,
            device: DeviceKind::Disk,
            target: "vda".into(),
            source_path: Some("/tmp/b.img".into()),
            pci_slot: None,
        });
        assert!(matches!(
            d.validate(),
            Err(DefineError::DuplicateDiskTarget(_))
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        let fmt = testing::JsonFormat;
        let def = sample();
        let xml = fmt.format(&def);
        let parsed = fmt.parse(&xml).unwrap();
        assert_eq!(def, parsed);
    }
}
