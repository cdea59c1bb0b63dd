//! Process Launcher (spec §4.1, component C1): builds argv for the detected
//! emulator feature set and fork-execs it, keeping a caller-supplied fd set
//! alive across exec. Grounded on the teacher's `jailer` crate (small
//! `Error` enum + `Result<T>` alias, one responsibility per free function)
//! applied to process spawning instead of cgroup setup.

pub mod features;

use std::fs::File;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

pub use features::{probe, EmulatorFeatures};

use domain::{Bus, CharDeviceType, DomainDefinition, VirtType};

#[derive(Debug)]
pub enum Error {
    Probe(String, std::io::Error),
    Spawn(std::io::Error),
    Fcntl(std::io::Error),
    Dup(std::io::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Probe(path, e) => write!(f, "failed to probe emulator '{}': {}", path, e),
            Error::Spawn(e) => write!(f, "failed to spawn emulator: {}", e),
            Error::Fcntl(e) => write!(f, "fcntl failed: {}", e),
            Error::Dup(e) => write!(f, "dup failed: {}", e),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Either of the two migrate-from endpoints spec §4.1 names.
#[derive(Debug, Clone)]
pub enum MigrateFrom {
    Tcp(String, u16),
    Stdio,
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

fn chardev_arg(kind: CharDeviceType) -> &'static str {
    match kind {
        CharDeviceType::Pty => "pty",
        CharDeviceType::Null => "null",
        CharDeviceType::File => "file",
    }
}

/// Builds argv in the order the emulator will process its device args: this
/// ordering is load-bearing, since the Boot Parser (C3) matches printed PTY
/// paths back to serial/parallel devices positionally (spec §4.3).
pub fn build_argv(
    def: &DomainDefinition,
    features: &EmulatorFeatures,
    vnc_port: Option<u16>,
    migrate_from: Option<&MigrateFrom>,
) -> Vec<String> {
    let mut argv = vec![def.emulator_path.clone()];

    argv.push("-name".into());
    argv.push(def.name.clone());
    argv.push("-uuid".into());
    argv.push(def.uuid.clone());
    argv.push("-m".into());
    argv.push((def.memory_current_kib / 1024).to_string());
    argv.push("-smp".into());
    argv.push(def.vcpu_count.to_string());

    match def.virt_type {
        VirtType::Accelerated => argv.push("-enable-kvm".into()),
        VirtType::AcceleratedAlt => {
            argv.push("-accel".into());
            argv.push("kvm".into());
        }
        VirtType::Plain => {}
    }

    // Monitor always comes first among the PTY-backed char devices.
    argv.push("-monitor".into());
    argv.push("pty".into());

    for serial in &def.serials {
        argv.push("-serial".into());
        argv.push(chardev_arg(serial.kind).into());
    }
    for parallel in &def.parallels {
        argv.push("-parallel".into());
        argv.push(chardev_arg(parallel.kind).into());
    }

    for disk in &def.disks {
        if let Some(src) = &disk.source_path {
            argv.push("-drive".into());
            if features.has_drive {
                argv.push(format!("file={},if={}", src, bus_arg(disk.bus)));
            } else {
                argv.push(format!("file={},bus={}", src, bus_arg(disk.bus)));
            }
        }
    }

    for net in &def.net_interfaces {
        let mut arg = format!("nic,macaddr={}", net.mac_address);
        if let Some(tap) = &net.tap_name {
            arg.push_str(&format!(",ifname={}", tap));
        }
        argv.push("-net".into());
        argv.push(arg);
    }

    match &def.graphics {
        Some(g) if g.auto_port => {
            argv.push("-vnc".into());
            argv.push(format!(
                ":{}",
                vnc_port
                    .map(|p| (p as u32).saturating_sub(5900))
                    .unwrap_or(0)
            ));
        }
        Some(_) => {
            argv.push("-vnc".into());
            argv.push("none".into());
        }
        None => argv.push("-nographic".into()),
    }

    if let Some(mf) = migrate_from {
        argv.push("-incoming".into());
        argv.push(match mf {
            MigrateFrom::Tcp(host, port) => format!("tcp:{}:{}", host, port),
            MigrateFrom::Stdio => "stdio".to_string(),
        });
    }

    argv
}

/// What to spawn and which fds must survive the exec.
pub struct LaunchSpec {
    pub argv: Vec<String>,
    /// tap fds (and any other inherited resources) that must remain open
    /// in the child; everything else keeps the close-on-exec flag Rust's
    /// `Command` already sets by default.
    pub keep_fds: Vec<RawFd>,
    /// Set only for `MigrateFrom::Stdio`: the caller's fd to dup onto the
    /// child's stdin.
    pub migrate_from_stdin: Option<RawFd>,
}

fn clear_cloexec(fd: RawFd) -> std::io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(Error::Fcntl(std::io::Error::last_os_error()));
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Fcntl(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

/// Fork-execs the emulator described by `spec`. Any failure here is
/// reported synchronously (spec §4.1); failures after exec only manifest
/// as stderr EOF or child exit and are the Reactor's job to notice.
pub fn spawn(spec: &LaunchSpec) -> Result<Child> {
    let mut cmd = Command::new(&spec.argv[0]);
    cmd.args(&spec.argv[1..]);
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    match spec.migrate_from_stdin {
        Some(fd) => {
            let dup_fd = unsafe { libc::dup(fd) };
            if dup_fd < 0 {
                return Err(Error::Dup(std::io::Error::last_os_error()));
            }
            let file = unsafe { File::from_raw_fd(dup_fd) };
            cmd.stdin(Stdio::from(file));
        }
        None => {
            cmd.stdin(Stdio::null());
        }
    }

    let keep = spec.keep_fds.clone();
    unsafe {
        cmd.pre_exec(move || {
            for &fd in &keep {
                clear_cloexec(fd)?;
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(Error::Spawn)?;

    if let Some(out) = child.stdout.as_ref() {
        set_nonblocking(out.as_raw_fd())?;
    }
    if let Some(err) = child.stderr.as_ref() {
        set_nonblocking(err.as_raw_fd())?;
    }

    Ok(child)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{CharDeviceDefinition, DiskDefinition, DeviceKind};

    fn sample() -> DomainDefinition {
        DomainDefinition {
            name: "alpha".into(),
            uuid: "00000000-0000-0000-0000-000000000001".into(),
            emulator_path: "/usr/bin/qemu-kvm".into(),
            virt_type: VirtType::Accelerated,
            memory_max_kib: 65536,
            memory_current_kib: 65536,
            vcpu_count: 2,
            cpu_affinity: None,
            graphics: None,
            disks: vec![DiskDefinition {
                bus: Bus::Virtio,
                device: DeviceKind::Disk,
                target: "vda".into(),
                source_path: Some("/tmp/disk.img".into()),
                pci_slot: None,
            }],
            net_interfaces: vec![],
            serials: vec![CharDeviceDefinition::pty()],
            parallels: vec![],
            host_devices: vec![],
        }
    }

    #[test]
    fn test_build_argv_orders_monitor_before_serials() {
        let argv = build_argv(&sample(), &EmulatorFeatures::default(), None, None);
        let monitor_idx = argv.iter().position(|a| a == "-monitor").unwrap();
        let serial_idx = argv.iter().position(|a| a == "-serial").unwrap();
        assert!(monitor_idx < serial_idx);
    }

    #[test]
    fn test_build_argv_uses_drive_when_supported() {
        let features = EmulatorFeatures {
            has_drive: true,
            ..Default::default()
        };
        let argv = build_argv(&sample(), &features, None, None);
        let idx = argv.iter().position(|a| a == "-drive").unwrap();
        assert!(argv[idx + 1].starts_with("file=/tmp/disk.img,if=virtio"));
    }

    #[test]
    fn test_build_argv_incoming_tcp() {
        let mf = MigrateFrom::Tcp("0.0.0.0".into(), 49152);
        let argv = build_argv(&sample(), &EmulatorFeatures::default(), None, Some(&mf));
        let idx = argv.iter().position(|a| a == "-incoming").unwrap();
        assert_eq!(argv[idx + 1], "tcp:0.0.0.0:49152");
    }

    #[test]
    fn test_spawn_missing_binary_fails_synchronously() {
        let spec = LaunchSpec {
            argv: vec!["/nonexistent/qemu-binary-xyz".into()],
            keep_fds: vec![],
            migrate_from_stdin: None,
        };
        assert!(matches!(spawn(&spec), Err(Error::Spawn(_))));
    }
}
