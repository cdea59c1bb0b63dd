//! Monitor Client (spec §4.2, component C2): a line-oriented text protocol
//! over the PTY the emulator allocates for its human monitor. Grounded on
//! `qemudMonitorCommand` in the original C driver: the tricky part is not
//! the write, it is stripping the emulator's own echo of the command back
//! out of the reply before handing it to the caller.

pub mod boot;

use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

pub use boot::{wait_for_boot_paths, BootPaths};

#[derive(Debug)]
pub enum Error {
    Write(std::io::Error),
    Read(std::io::Error),
    Timeout,
    Closed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Write(e) => write!(f, "monitor write failed: {}", e),
            Error::Read(e) => write!(f, "monitor read failed: {}", e),
            Error::Timeout => write!(f, "timed out waiting for monitor reply"),
            Error::Closed => write!(f, "monitor connection closed"),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

const PROMPT: &[u8] = b"\n(qemu) ";
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Escapes a string for embedding inside a monitor command argument.
pub fn monitor_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out
}

/// Like `monitor_escape`, plus single-quote escaping for arguments that
/// will also cross a shell boundary (e.g. a migrate URI built with `sh -c`).
pub fn shell_escape(s: &str) -> String {
    monitor_escape(s).replace('\'', "'\\''")
}

/// A connection to one VM's monitor PTY.
pub struct MonitorClient {
    fd: RawFd,
    buffer: Vec<u8>,
}

impl MonitorClient {
    pub fn new(fd: RawFd) -> Self {
        MonitorClient {
            fd,
            buffer: Vec::new(),
        }
    }

    /// Blocks until the emulator's opening banner and first prompt appear,
    /// bounded by `COMMAND_TIMEOUT`. This is the one monitor read spec §5
    /// allows to fail on a timeout — once it completes, the monitor is
    /// trusted not to hang, and ordinary commands wait for it indefinitely.
    pub fn handshake(&mut self) -> Result<()> {
        let deadline = Instant::now() + COMMAND_TIMEOUT;
        loop {
            if let Some(prompt_pos) = qemud_util::find_from(&self.buffer, PROMPT, 0) {
                let consumed = prompt_pos + PROMPT.len();
                self.buffer.drain(..consumed);
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(Error::Timeout);
            }
            self.read_more()?;
        }
    }

    /// Sends `cmd` and returns the emulator's reply with the echoed command
    /// and trailing prompt stripped out. Waits indefinitely for the reply
    /// (spec §5: the monitor is trusted not to hang once connected).
    pub fn command(&mut self, cmd: &str) -> Result<String> {
        self.write_command(cmd)?;
        self.read_reply(cmd)
    }

    fn write_command(&mut self, cmd: &str) -> Result<()> {
        let mut line = String::with_capacity(cmd.len() + 1);
        line.push_str(cmd);
        line.push('\r');
        let mut written = 0;
        let bytes = line.as_bytes();
        while written < bytes.len() {
            let n = unsafe {
                libc::write(
                    self.fd,
                    bytes[written..].as_ptr() as *const _,
                    bytes.len() - written,
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::WouldBlock {
                    std::thread::sleep(Duration::from_millis(5));
                    continue;
                }
                return Err(Error::Write(err));
            }
            written += n as usize;
        }
        Ok(())
    }

    fn read_reply(&mut self, cmd: &str) -> Result<String> {
        loop {
            if let Some(reply) = self.try_extract(cmd) {
                return Ok(reply);
            }
            self.read_more()?;
        }
    }

    fn read_more(&mut self) -> Result<()> {
        let mut chunk = [0u8; 4096];
        let n = unsafe { libc::read(self.fd, chunk.as_mut_ptr() as *mut _, chunk.len()) };
        if n < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                std::thread::sleep(Duration::from_millis(10));
                return Ok(());
            }
            return Err(Error::Read(err));
        }
        if n == 0 {
            return Err(Error::Closed);
        }
        self.buffer.extend_from_slice(&chunk[..n as usize]);
        Ok(())
    }

    /// Mirrors `qemudMonitorCommand`'s echo-stripping: find the first full
    /// copy of the command we just sent, discard everything before it as
    /// line noise, then splice the command text back in front of whatever
    /// follows the echo up to the next prompt. The command text itself is
    /// never dropped, only the line-noise ahead of it.
    fn try_extract(&mut self, cmd: &str) -> Option<String> {
        let prompt_pos = qemud_util::find_from(&self.buffer, PROMPT, 0)?;
        let echo_pos = qemud_util::find_from(&self.buffer, cmd.as_bytes(), 0);
        let start = match echo_pos {
            Some(echo_pos) => {
                let after_echo = echo_pos + cmd.len();
                match qemud_util::find_from(&self.buffer, b"\n", after_echo) {
                    Some(nl) if nl < prompt_pos => nl + 1,
                    _ => after_echo,
                }
            }
            None => 0,
        };
        if start > prompt_pos {
            return None;
        }
        let rest = String::from_utf8_lossy(&self.buffer[start..prompt_pos])
            .trim_end()
            .to_string();
        let reply = match echo_pos {
            Some(_) if rest.is_empty() => cmd.to_string(),
            Some(_) => format!("{}\n{}", cmd, rest),
            None => rest,
        };
        let consumed = prompt_pos + PROMPT.len();
        self.buffer.drain(..consumed);
        Some(reply)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CpuInfo {
    pub index: u32,
    pub pc: u64,
    pub halted: bool,
    /// Host thread id backing this vcpu; 0 if the emulator's reply omitted
    /// `thread_id=`.
    pub thread_id: i32,
}

/// Parses `info cpus` output, one line per vcpu, e.g.:
/// `* CPU #0: pc=0xfffffff0 (halted) thread_id=1234`
pub fn parse_info_cpus(reply: &str) -> Vec<CpuInfo> {
    let mut out = Vec::new();
    for line in reply.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let halted = line.contains("(halted)");
        let rest = line.trim_start_matches('*').trim();
        let mut index = 0u32;
        let mut pc = 0u64;
        let mut thread_id = 0i32;
        for tok in rest.split_whitespace() {
            if let Some(n) = tok.strip_prefix("#").or_else(|| tok.strip_prefix("CPU#")) {
                index = n.trim_end_matches(':').parse().unwrap_or(index);
            } else if let Some(hex) = tok.strip_prefix("pc=0x") {
                pc = u64::from_str_radix(hex, 16).unwrap_or(0);
            } else if let Some(n) = tok.strip_prefix("thread_id=") {
                thread_id = n.parse().unwrap_or(0);
            }
        }
        out.push(CpuInfo {
            index,
            pc,
            halted,
            thread_id,
        });
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockStats {
    pub rd_req: u64,
    pub rd_bytes: u64,
    pub wr_req: u64,
    pub wr_bytes: u64,
}

/// Parses the `device: key=val key=val ...` line for `device` out of
/// `info blockstats` output.
pub fn parse_block_stats(reply: &str, device: &str) -> Option<BlockStats> {
    let prefix = format!("{}:", device);
    for line in reply.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(&prefix) {
            let mut stats = BlockStats::default();
            for kv in rest.split_whitespace() {
                if let Some((k, v)) = kv.split_once('=') {
                    let val: u64 = v.parse().unwrap_or(0);
                    match k {
                        "rd_bytes" => stats.rd_bytes = val,
                        "wr_bytes" => stats.wr_bytes = val,
                        "rd_operations" => stats.rd_req = val,
                        "wr_operations" => stats.wr_req = val,
                        _ => {}
                    }
                }
            }
            return Some(stats);
        }
    }
    None
}

/// Parses the slot number out of a `pci_add`/successful hot-plug reply,
/// e.g. `OK domain 0, bus 0, slot 4, function 0`.
pub fn parse_pci_add_slot(reply: &str) -> Option<u32> {
    let idx = reply.find("slot ")?;
    let rest = &reply[idx + "slot ".len()..];
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// A non-empty reply to `change`/`eject`/`pci_del`/`usb_del` is an error
/// message from the emulator; an empty reply means success.
pub fn command_ok(reply: &str) -> std::result::Result<(), String> {
    if reply.trim().is_empty() {
        Ok(())
    } else {
        Err(reply.trim().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    None,
    Active,
    Completed,
    Failed,
    Cancelled,
}

/// Parses `info migrate` output's `Migration status: <word>` line.
pub fn parse_migration_status(reply: &str) -> MigrationStatus {
    if reply.contains("Migration status: completed") {
        MigrationStatus::Completed
    } else if reply.contains("Migration status: active") {
        MigrationStatus::Active
    } else if reply.contains("Migration status: failed") {
        MigrationStatus::Failed
    } else if reply.contains("Migration status: cancelled") {
        MigrationStatus::Cancelled
    } else {
        MigrationStatus::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_monitor_escape() {
        assert_eq!(monitor_escape("a\"b\\c\r\n"), "a\\\"b\\\\c\\r\\n");
    }

    #[test]
    fn test_shell_escape_adds_quote_handling() {
        assert_eq!(shell_escape("it's"), "it'\\''s");
    }

    #[test]
    fn test_parse_info_cpus() {
        let reply = "* CPU #0: pc=0xfffffff0 (halted) thread_id=42\n  CPU #1: pc=0x1000 thread_id=43\n";
        let cpus = parse_info_cpus(reply);
        assert_eq!(cpus.len(), 2);
        assert_eq!(cpus[0].index, 0);
        assert!(cpus[0].halted);
        assert_eq!(cpus[0].thread_id, 42);
        assert_eq!(cpus[1].pc, 0x1000);
        assert!(!cpus[1].halted);
        assert_eq!(cpus[1].thread_id, 43);
    }

    #[test]
    fn test_parse_block_stats() {
        let reply = "ide0-hd0: rd_bytes=512 wr_bytes=0 rd_operations=1 wr_operations=0\n";
        let stats = parse_block_stats(reply, "ide0-hd0").unwrap();
        assert_eq!(stats.rd_bytes, 512);
        assert_eq!(stats.rd_req, 1);
    }

    #[test]
    fn test_parse_pci_add_slot() {
        let reply = "OK domain 0, bus 0, slot 4, function 0\n";
        assert_eq!(parse_pci_add_slot(reply), Some(4));
    }

    #[test]
    fn test_command_ok() {
        assert!(command_ok("").is_ok());
        assert_eq!(command_ok("device not found").unwrap_err(), "device not found");
    }

    #[test]
    fn test_parse_migration_status() {
        assert_eq!(
            parse_migration_status("Migration status: completed\n"),
            MigrationStatus::Completed
        );
        assert_eq!(parse_migration_status("garbage"), MigrationStatus::None);
    }

    #[test]
    fn test_try_extract_strips_noise_but_keeps_command_text() {
        let mut client = MonitorClient::new(-1);
        let output = "VM status: running";
        let raw = format!("info status\r\n{}\r\n\n(qemu) ", output);
        client.buffer.extend_from_slice(raw.as_bytes());
        let reply = client.try_extract("info status").unwrap();
        assert_eq!(reply, format!("info status\n{}", output));
        assert!(client.buffer.is_empty());
    }
}
