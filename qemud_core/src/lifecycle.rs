//! Lifecycle Controller (spec §4.5, component C6): the start and shutdown
//! state machines tying the launcher, boot parser, monitor, reactor and
//! event subsystem together around one VM Object. Grounded on
//! `qemudStartVMDaemon`/`qemudShutdownVMDaemon` in the original driver;
//! the teacher contributes the pattern of driving every external
//! collaborator through a narrow trait/struct seam rather than inline
//! syscalls (`EpollContext`, `jailer::Env`).

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::os::unix::io::{FromRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use domain::{DefinitionFormat, DomainDefinition};
use launcher::{LaunchSpec, MigrateFrom};
use monitor::MonitorClient;
use registry::{DomainState, VmObject};

use crate::affinity::CpuAffinity;
use crate::error::{Error, InternalError, Result, UserError};
use crate::events::{Event, EventDetail, EventKind, EventQueue};
use crate::reactor::{Dispatch, Reactor};

const VNC_PORT_BASE: u16 = 5900;
const VNC_PORT_RANGE: u16 = 100;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Allocates the lowest free port in `[5900, 6000)` for auto-port VNC
/// (spec §4.5 step 2). Grounded on `qemudNextFreeVNCPort`: a setsockopt or
/// bind failure on one candidate port must not abort the scan, it should
/// move on to the next candidate (spec §9 — the original used `break`
/// here, which made one busy port starve every VM after it).
pub struct VncPortPool {
    in_use: Mutex<HashSet<u16>>,
}

impl VncPortPool {
    pub fn new() -> Self {
        VncPortPool {
            in_use: Mutex::new(HashSet::new()),
        }
    }

    pub fn allocate(&self) -> Result<u16> {
        let mut in_use = self.in_use.lock().unwrap();
        for port in VNC_PORT_BASE..VNC_PORT_BASE + VNC_PORT_RANGE {
            if in_use.contains(&port) {
                continue;
            }
            if probe_vnc_port(port) {
                in_use.insert(port);
                return Ok(port);
            }
        }
        Err(UserError::OperationFailed("no free VNC port in range".to_string()).into())
    }

    pub fn release(&self, port: u16) {
        self.in_use.lock().unwrap().remove(&port);
    }
}

impl Default for VncPortPool {
    fn default() -> Self {
        Self::new()
    }
}

fn probe_vnc_port(port: u16) -> bool {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    TcpListener::bind(addr).is_ok()
}

/// The collaborators the Lifecycle Controller needs that live for the
/// whole process lifetime, as opposed to one VM's start/shutdown call.
pub struct LifecycleContext {
    pub state_dir: PathBuf,
    pub vnc_pool: VncPortPool,
    pub affinity: Box<dyn CpuAffinity + Send + Sync>,
    pub definition_format: Box<dyn DefinitionFormat + Send + Sync>,
    next_runtime_id: AtomicI64,
}

impl LifecycleContext {
    pub fn new(
        state_dir: PathBuf,
        affinity: Box<dyn CpuAffinity + Send + Sync>,
        definition_format: Box<dyn DefinitionFormat + Send + Sync>,
    ) -> Self {
        LifecycleContext {
            state_dir,
            vnc_pool: VncPortPool::new(),
            affinity,
            definition_format,
            next_runtime_id: AtomicI64::new(1),
        }
    }

    fn state_xml_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.xml", name))
    }

    fn pid_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.pid", name))
    }

    fn log_path(&self, name: &str) -> PathBuf {
        self.state_dir.join(format!("{}.log", name))
    }
}

/// Writes `<stateDir>/<name>.xml` (the runtime definition, which may differ
/// from the on-disk config because of hot-plug) plus a pid file (spec
/// §4.4 "runtime state persistence").
fn write_status_file(ctx: &LifecycleContext, vm: &VmObject) -> Result<()> {
    let def = vm.definition();
    let data = ctx.definition_format.format(&def);
    std::fs::write(ctx.state_xml_path(&def.name), data).map_err(InternalError::Io)?;
    let pid = vm.pid.lock().unwrap().unwrap_or(-1);
    std::fs::write(ctx.pid_path(&def.name), pid.to_string()).map_err(InternalError::Io)?;
    Ok(())
}

fn remove_status_file(ctx: &LifecycleContext, name: &str) {
    let _ = std::fs::remove_file(ctx.state_xml_path(name));
    let _ = std::fs::remove_file(ctx.pid_path(name));
}

fn push_event(events: &EventQueue, vm: &VmObject, kind: EventKind, detail: EventDetail) {
    events.push(Event {
        vm_uuid: vm.uuid(),
        vm_name: vm.name(),
        vm_id: vm.runtime_id(),
        kind,
        detail,
    });
}

/// Runs the full start sequence (spec §4.5). On any failure partway
/// through, unwinds via the shutdown sequence before returning the error,
/// so a failed start never leaves the registry pointing at a half-started
/// VM (spec §5's atomicity note).
pub fn start_domain(
    ctx: &LifecycleContext,
    reactor: &mut Reactor,
    events: &EventQueue,
    vm: &Arc<VmObject>,
    migrate_from: Option<MigrateFrom>,
) -> Result<()> {
    start_domain_with_stdin(ctx, reactor, events, vm, migrate_from, None)
}

/// Like `start_domain`, but additionally wires `migrate_stdin_fd` as the
/// child's stdin when `migrate_from` is `MigrateFrom::Stdio` — the fd a
/// `restore` positions just past the save file's header and xml, so the
/// emulator reads the embedded migration stream directly (spec §4.5).
pub fn start_domain_with_stdin(
    ctx: &LifecycleContext,
    reactor: &mut Reactor,
    events: &EventQueue,
    vm: &Arc<VmObject>,
    migrate_from: Option<MigrateFrom>,
    migrate_stdin_fd: Option<RawFd>,
) -> Result<()> {
    if vm.state() != DomainState::Shutoff {
        return Err(UserError::AlreadyActive(vm.name()).into());
    }
    match do_start(ctx, reactor, events, vm, migrate_from, migrate_stdin_fd) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = shutdown_domain(ctx, reactor, events, vm, EventDetail::Failed);
            Err(e)
        }
    }
}

fn do_start(
    ctx: &LifecycleContext,
    reactor: &mut Reactor,
    events: &EventQueue,
    vm: &Arc<VmObject>,
    migrate_from: Option<MigrateFrom>,
    migrate_stdin_fd: Option<RawFd>,
) -> Result<()> {
    let def: DomainDefinition = vm.definition();

    // Step 2: auto-port VNC allocation.
    let vnc_port = match &def.graphics {
        Some(g) if g.auto_port => Some(ctx.vnc_pool.allocate()?),
        _ => None,
    };
    *vm.vnc_port.lock().unwrap() = vnc_port;

    // Step 3: stat and probe the emulator.
    std::fs::metadata(&def.emulator_path).map_err(|_| {
        Error::from(UserError::OperationFailed(format!(
            "emulator binary not found: {}",
            def.emulator_path
        )))
    })?;
    let features = launcher::probe(&def.emulator_path)?;

    // Step 4: assign the runtime numeric id.
    let runtime_id = ctx.next_runtime_id.fetch_add(1, Ordering::SeqCst);
    vm.set_runtime_id(runtime_id);

    // Step 5: open (truncate) the per-VM log file.
    let log_path = ctx.log_path(&def.name);
    std::fs::File::create(&log_path).map_err(InternalError::Io)?;
    *vm.log_path.lock().unwrap() = Some(log_path);

    // Steps 6/7: build argv in launch order and fork-exec.
    let argv = launcher::build_argv(&def, &features, vnc_port, migrate_from.as_ref());
    let spec = LaunchSpec {
        argv,
        keep_fds: Vec::new(),
        migrate_from_stdin: migrate_stdin_fd,
    };
    let mut child = launcher::spawn(&spec)?;
    *vm.pid.lock().unwrap() = Some(child.id() as i32);

    let stdout = child.stdout.take().expect("launcher always pipes stdout");
    let stderr = child.stderr.take().expect("launcher always pipes stderr");
    let stdout_fd = stdout.into_raw_fd();
    let stderr_fd = stderr.into_raw_fd();

    // Step 9: wait for the boot-time pty announcements on stderr. Reads
    // through a dup'd fd so the boot-parser's reader can be dropped (and
    // close its end) without taking `stderr_fd` down with it — the reactor
    // still needs that fd for the rest of the VM's life.
    let boot_fd = unsafe { libc::dup(stderr_fd) };
    if boot_fd < 0 {
        return Err(InternalError::System(std::io::Error::last_os_error()).into());
    }
    let boot_reader = unsafe { std::fs::File::from_raw_fd(boot_fd) };
    let boot = monitor::wait_for_boot_paths(boot_reader, def.serials.len(), def.parallels.len())?;

    // Step 8: install reactor watches.
    let stdout_token = reactor.watch(stdout_fd, Dispatch::Stdout(vm.id))?;
    let stderr_token = reactor.watch(stderr_fd, Dispatch::Stderr(vm.id))?;
    *vm.stdout_fd.lock().unwrap() = Some(stdout_fd);
    *vm.stderr_fd.lock().unwrap() = Some(stderr_fd);
    *vm.reactor_tokens.lock().unwrap() = vec![stdout_token, stderr_token];

    // Step 10: open the monitor pty.
    let monitor_fd = open_monitor_pty(&boot.monitor)?;
    *vm.monitor_fd.lock().unwrap() = Some(monitor_fd);
    let mut monitor_client = MonitorClient::new(monitor_fd);
    monitor_client.handshake()?;

    // Step 11: fetch vcpu thread ids, tolerating an emulator too old to
    // support `info cpus`. The original driver compared a vcpu's index
    // against the declared vcpu count with `>`, which let an emulator that
    // over-reported cpus write one entry past the end of the pid array; the
    // filter below rejects any index that is not strictly less than
    // `vcpu_count` (spec §9).
    let vcpu_pids: Vec<i32> = match monitor_client.command("info cpus") {
        Ok(reply) => monitor::parse_info_cpus(&reply)
            .into_iter()
            .filter(|cpu| cpu.index < def.vcpu_count)
            .map(|cpu| cpu.thread_id)
            .collect(),
        Err(monitor::Error::Closed) => return Err(monitor::Error::Closed.into()),
        Err(_) => Vec::new(),
    };
    vm.set_vcpu_pids(vcpu_pids.clone());

    // Step 12: apply CPU affinity, if the domain asked for it.
    if let Some(mask) = def.cpu_affinity {
        for tid in &vcpu_pids {
            ctx.affinity.set_affinity(*tid, mask)?;
        }
    }

    // Step 13: resume the guest unless this start is the target side of an
    // incoming migration (Finish resumes it instead), persist status, and
    // flip the registry's view of the VM to running.
    if migrate_from.is_none() {
        let reply = monitor_client.command("cont")?;
        monitor::command_ok(&reply).map_err(UserError::OperationFailed)?;
    }
    write_status_file(ctx, vm)?;
    vm.set_state(DomainState::Running);
    push_event(events, vm, EventKind::Started, EventDetail::Booted);

    Ok(())
}

fn open_monitor_pty(path: &str) -> Result<RawFd> {
    use std::os::unix::fs::OpenOptionsExt;
    let file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(InternalError::Io)?;
    Ok(file.into_raw_fd())
}

fn drain_nonblocking(fd: RawFd) -> Vec<u8> {
    let mut out = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut _, chunk.len()) };
        if n <= 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n as usize]);
    }
    out
}

/// Runs the shutdown sequence (spec §4.5): SIGTERM, drain pending output,
/// tear down the reactor watches and fds, reap the process (escalating to
/// SIGKILL past the grace period), remove the runtime state files, and
/// flip the VM back to SHUTOFF. Idempotent: calling this on a VM that is
/// already stopped is a no-op beyond re-emitting the event.
pub fn shutdown_domain(
    ctx: &LifecycleContext,
    reactor: &mut Reactor,
    events: &EventQueue,
    vm: &Arc<VmObject>,
    detail: EventDetail,
) -> Result<()> {
    let name = vm.name();
    let pid = *vm.pid.lock().unwrap();

    // Step 1: ask nicely first.
    if let Some(pid) = pid {
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }

    // Step 2: drain whatever the emulator still has buffered, into the
    // per-VM log file opened at start.
    let log_path = vm.log_path.lock().unwrap().clone();
    if let Some(log_path) = &log_path {
        let mut tail = Vec::new();
        if let Some(fd) = *vm.stdout_fd.lock().unwrap() {
            tail.extend(drain_nonblocking(fd));
        }
        if let Some(fd) = *vm.stderr_fd.lock().unwrap() {
            tail.extend(drain_nonblocking(fd));
        }
        if !tail.is_empty() {
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(log_path) {
                let _ = f.write_all(&tail);
            }
        }
    }

    // Step 3: remove the reactor watches, close every fd we opened at
    // start, and clear the runtime fields back to "never started".
    let tokens = vm.reactor_tokens.lock().unwrap().clone();
    let stdout_fd = *vm.stdout_fd.lock().unwrap();
    let stderr_fd = *vm.stderr_fd.lock().unwrap();
    let monitor_fd = *vm.monitor_fd.lock().unwrap();
    if let (Some(fd), Some(&token)) = (stdout_fd, tokens.first()) {
        reactor.unwatch(fd, token);
    }
    if let (Some(fd), Some(&token)) = (stderr_fd, tokens.get(1)) {
        reactor.unwatch(fd, token);
    }
    for fd in [stdout_fd, stderr_fd, monitor_fd].iter().filter_map(|fd| *fd) {
        unsafe {
            libc::close(fd);
        }
    }
    let vnc_port = vm.vnc_port();
    vm.clear_runtime();
    if let Some(port) = vnc_port {
        ctx.vnc_pool.release(port);
    }

    // Step 4: reap the process, escalating to SIGKILL if it outlives the
    // grace period.
    if let Some(pid) = pid {
        reap(pid);
    }

    // Step 5: remove the runtime state files.
    remove_status_file(ctx, &name);

    // Step 6: the VM is SHUTOFF; its numeric id is already -1 from
    // `clear_runtime`.
    vm.set_state(DomainState::Shutoff);
    push_event(events, vm, EventKind::Stopped, detail);

    Ok(())
}

fn reap(pid: i32) {
    let deadline = Instant::now() + SHUTDOWN_GRACE;
    loop {
        let mut status = 0;
        let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
        if rc == pid || rc < 0 {
            return;
        }
        if Instant::now() > deadline {
            unsafe {
                libc::kill(pid, libc::SIGKILL);
                libc::waitpid(pid, &mut status, 0);
            }
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vnc_pool_assigns_consecutive_ports() {
        let pool = VncPortPool::new();
        let first = pool.allocate().unwrap();
        let second = pool.allocate().unwrap();
        assert_eq!(first, VNC_PORT_BASE);
        assert_eq!(second, VNC_PORT_BASE + 1);
    }

    #[test]
    fn test_vnc_pool_release_frees_port_for_reuse() {
        let pool = VncPortPool::new();
        let first = pool.allocate().unwrap();
        pool.release(first);
        let reused = pool.allocate().unwrap();
        assert_eq!(reused, first);
    }

    #[test]
    fn test_start_rejects_already_active() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = LifecycleContext::new(
            dir.path().to_path_buf(),
            Box::new(crate::affinity::testing::RecordingAffinity::default()),
            Box::new(domain::testing::JsonFormat),
        );
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
        let reg = registry::Registry::new(
            dir.path().join("config"),
            dir.path().join("state"),
            dir.path().join("autostart"),
        );
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::create_dir_all(dir.path().join("state")).unwrap();
        std::fs::create_dir_all(dir.path().join("autostart")).unwrap();
        let vm = reg.define(def).unwrap();
        vm.set_state(DomainState::Running);

        let mut reactor = Reactor::new().unwrap();
        let events = EventQueue::new();
        let err = start_domain(&ctx, &mut reactor, &events, &vm, None).unwrap_err();
        assert!(matches!(err, Error::User(UserError::AlreadyActive(_))));
    }
}
