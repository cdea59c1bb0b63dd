//! Migration Coordinator (spec §4.6, component C7): the three-phase V2
//! protocol. Grounded on `qemudDomainMigratePrepare2` /
//! `qemudDomainMigratePerform` / `qemudDomainMigrateFinish2` in the
//! original driver; the port pool and URI parsing live here, the
//! VM-lookup/state-transition orchestration lives in the `Driver` facade
//! since it needs the registry and lifecycle controller together.

use std::sync::atomic::{AtomicU16, Ordering};

use monitor::MonitorClient;

use crate::error::{Error, Result, UserError};

pub const MIGRATION_FIRST_PORT: u16 = 49152;
pub const MIGRATION_NUM_PORTS: u16 = 64;

/// Round-robins across the migration port range on each `allocate` call
/// (spec §4.6 Prepare).
pub struct PortPool {
    next: AtomicU16,
}

impl PortPool {
    pub fn new() -> Self {
        PortPool {
            next: AtomicU16::new(0),
        }
    }

    pub fn allocate(&self) -> u16 {
        let slot = self.next.fetch_add(1, Ordering::SeqCst) % MIGRATION_NUM_PORTS;
        MIGRATION_FIRST_PORT + slot
    }
}

impl Default for PortPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses the port out of a caller-supplied `tcp:HOST:PORT` migration URI.
pub fn parse_migration_port(uri: &str) -> Result<u16> {
    let rest = uri.strip_prefix("tcp:").ok_or_else(|| {
        Error::User(UserError::InvalidArg(format!(
            "unsupported migration uri: {}",
            uri
        )))
    })?;
    let port_str = rest
        .rsplit(':')
        .next()
        .ok_or_else(|| Error::User(UserError::InvalidArg(uri.to_string())))?;
    port_str
        .parse()
        .map_err(|_| Error::User(UserError::InvalidArg(uri.to_string())))
}

/// Builds the `migrate "exec:dd of='<path>' ..."` command `Driver::save`
/// issues to stream the guest's memory image into the save file, exactly
/// as the original driver's `qemudDomainSave` does.
pub fn save_to_file_command(path: &std::path::Path) -> String {
    let escaped = monitor::shell_escape(&path.display().to_string());
    format!(
        "migrate \"exec:dd of='{}' oflag=append conv=notrunc 2>/dev/null\"",
        escaped
    )
}

/// Perform phase (spec §4.6, source side). Does not itself shut the source
/// VM down on success; the caller does that as the final step so the
/// driver lock discipline around VM shutdown stays in one place.
pub fn perform(
    monitor: &mut MonitorClient,
    live: bool,
    uri: &str,
    speed_mbps: Option<u32>,
) -> Result<()> {
    if !live {
        let reply = monitor.command("stop")?;
        monitor::command_ok(&reply).map_err(|e| Error::User(UserError::OperationFailed(e)))?;
    }
    if let Some(speed) = speed_mbps {
        monitor.command(&format!("migrate_set_speed {}m", speed))?;
    }
    let escaped = monitor::shell_escape(uri);
    let reply = monitor.command(&format!("migrate \"{}\"", escaped))?;
    if reply.contains("unknown command:") {
        return Err(Error::User(UserError::NoSupport("migrate".to_string())));
    }
    if reply.contains("fail") {
        return Err(Error::User(UserError::OperationFailed(reply)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_pool_round_robins() {
        let pool = PortPool::new();
        let first = pool.allocate();
        for _ in 0..MIGRATION_NUM_PORTS - 1 {
            pool.allocate();
        }
        assert_eq!(pool.allocate(), first);
    }

    #[test]
    fn test_parse_migration_port() {
        assert_eq!(parse_migration_port("tcp:10.0.0.5:49200").unwrap(), 49200);
        assert!(parse_migration_port("udp:10.0.0.5:1").is_err());
    }

    #[test]
    fn test_save_to_file_command_wraps_dd() {
        let cmd = save_to_file_command(std::path::Path::new("/var/run/libvirt/qemu/alpha.save"));
        assert_eq!(
            cmd,
            "migrate \"exec:dd of='/var/run/libvirt/qemu/alpha.save' oflag=append conv=notrunc 2>/dev/null\""
        );
    }
}
