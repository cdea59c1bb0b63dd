//! Boot Parser (spec §4.3, component C3): the emulator is started with
//! `pty`-backed monitor/serial/parallel devices and announces the kernel
//! pty device it picked on stderr, one line per device, in the order the
//! devices were given on its command line. Grounded on
//! `qemudExtractMonitorPath` / `qemudFindCharDevicePTYs` /
//! `qemudWaitForMonitor` in the original C driver.

use std::io::Read;
use std::time::{Duration, Instant};

use crate::{Error, Result};

const REDIRECT_MARKER: &str = "char device redirected to ";
const MONITOR_TIMEOUT: Duration = Duration::from_secs(3);
const TOTAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Scans `stderr` for up to `want` "char device redirected to <path>"
/// announcements, in the order they appear.
fn extract_pty_paths(stderr: &[u8], want: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(stderr);
    text.lines()
        .filter_map(|line| {
            line.find(REDIRECT_MARKER).map(|idx| {
                let rest = &line[idx + REDIRECT_MARKER.len()..];
                match qemud_util::take_token(rest.as_bytes(), 0) {
                    Some((tok, _)) => String::from_utf8_lossy(tok).into_owned(),
                    None => rest.to_string(),
                }
            })
        })
        .take(want)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BootPaths {
    pub monitor: String,
    pub serials: Vec<String>,
    pub parallels: Vec<String>,
}

/// Blocks (with a 3s deadline for the monitor path and a 10s deadline for
/// everything else) until `serial_count + parallel_count + 1` pty paths
/// have been announced on `reader`, then splits them monitor/serials/
/// parallels in launch order (spec §4.1's argv ordering is what makes this
/// positional match valid).
pub fn wait_for_boot_paths<R: Read>(
    mut reader: R,
    serial_count: usize,
    parallel_count: usize,
) -> Result<BootPaths> {
    let want = 1 + serial_count + parallel_count;
    let monitor_deadline = Instant::now() + MONITOR_TIMEOUT;
    let total_deadline = Instant::now() + TOTAL_TIMEOUT;
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut have_monitor = false;

    loop {
        let found = extract_pty_paths(&buf, want);
        if !have_monitor && !found.is_empty() {
            have_monitor = true;
        }
        if found.len() >= want {
            return Ok(BootPaths {
                monitor: found[0].clone(),
                serials: found[1..1 + serial_count].to_vec(),
                parallels: found[1 + serial_count..].to_vec(),
            });
        }
        let deadline = if have_monitor {
            total_deadline
        } else {
            monitor_deadline
        };
        if Instant::now() > deadline {
            return Err(Error::Timeout);
        }
        match reader.read(&mut chunk) {
            Ok(0) => return Err(Error::Closed),
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(Error::Read(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_extract_pty_paths_in_order() {
        let stderr = b"char device redirected to /dev/pts/3\n\
                        char device redirected to /dev/pts/4\n\
                        char device redirected to /dev/pts/5\n";
        let paths = extract_pty_paths(stderr, 3);
        assert_eq!(paths, vec!["/dev/pts/3", "/dev/pts/4", "/dev/pts/5"]);
    }

    #[test]
    fn test_wait_for_boot_paths_splits_by_role() {
        let stderr = b"char device redirected to /dev/pts/3\n\
                        char device redirected to /dev/pts/4\n\
                        char device redirected to /dev/pts/5\n";
        let cursor = Cursor::new(stderr.to_vec());
        let paths = wait_for_boot_paths(cursor, 2, 0).unwrap();
        assert_eq!(paths.monitor, "/dev/pts/3");
        assert_eq!(paths.serials, vec!["/dev/pts/4", "/dev/pts/5"]);
        assert!(paths.parallels.is_empty());
    }

    #[test]
    fn test_wait_for_boot_paths_eof_before_enough_lines_is_closed() {
        let stderr = b"char device redirected to /dev/pts/3\n";
        let cursor = Cursor::new(stderr.to_vec());
        assert!(matches!(
            wait_for_boot_paths(cursor, 2, 0),
            Err(Error::Closed)
        ));
    }
}
