//! Feature-flag probing of the emulator binary (spec §4.1: "determined by
//! probing `--help` output of the binary").

use std::process::Command;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmulatorFeatures {
    /// Supports `-drive file=...,if=<bus>` instead of legacy `-hda`/`-cdrom`.
    pub has_drive: bool,
    /// Supports `-netdev` in addition to legacy `-net nic,...`.
    pub has_netdev: bool,
    /// Supports `-incoming` for migrate-from / restore.
    pub has_incoming: bool,
}

pub fn probe(emulator_path: &str) -> Result<EmulatorFeatures> {
    let output = Command::new(emulator_path)
        .arg("--help")
        .output()
        .map_err(|e| Error::Probe(emulator_path.to_string(), e))?;
    let help = String::from_utf8_lossy(&output.stdout);
    Ok(EmulatorFeatures {
        has_drive: help.contains("-drive"),
        has_netdev: help.contains("-netdev"),
        has_incoming: help.contains("-incoming"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_missing_binary() {
        let err = probe("/nonexistent/qemu-binary-xyz").unwrap_err();
        assert!(matches!(err, Error::Probe(_, _)));
    }

    #[test]
    fn test_probe_parses_help_text() {
        // /bin/echo stands in for an emulator whose --help output we control
        // by piping through a wrapper; here we just check the contains()
        // logic directly rather than relying on a real emulator being
        // present on the test host.
        let help = "usage: qemu [options]\n-drive file=...\n-netdev tap,...\n";
        let features = EmulatorFeatures {
            has_drive: help.contains("-drive"),
            has_netdev: help.contains("-netdev"),
            has_incoming: help.contains("-incoming"),
        };
        assert!(features.has_drive);
        assert!(features.has_netdev);
        assert!(!features.has_incoming);
    }
}
