//! Small, business-logic-free helpers shared by the monitor, launcher and
//! registry crates. Grounded on the teacher's `fc_util` crate: a grab bag of
//! free functions with no state of their own.

use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the epoch. Used to timestamp log lines and to measure
/// boot-time budgets (spec §4.3's 3s/10s windows).
pub fn monotonic_now_us() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_micros()
}

/// Finds the first occurrence of `needle` in `haystack` starting at
/// `from`, returning the byte offset of the match.
pub fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from >= haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Extracts the whitespace-terminated token starting at `start`, or `None`
/// if no whitespace has appeared yet (i.e. the caller should read more).
pub fn take_token(haystack: &[u8], start: usize) -> Option<(&[u8], usize)> {
    let rest = &haystack[start..];
    let end = rest.iter().position(|b| b.is_ascii_whitespace())?;
    Some((&rest[..end], start + end))
}

/// Domain names are non-empty and contain no path separators or control
/// characters, since they are used verbatim as file names under
/// `<configDir>/<name>.xml`.
pub fn validate_domain_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\0')
        && name.chars().all(|c| !c.is_control())
}

/// A 128-bit UUID formatted as the canonical 8-4-4-4-12 hex string.
pub fn validate_uuid(uuid: &str) -> bool {
    let parts: Vec<&str> = uuid.split('-').collect();
    let expected_lens = [8usize, 4, 4, 4, 12];
    parts.len() == 5
        && parts
            .iter()
            .zip(expected_lens.iter())
            .all(|(p, len)| p.len() == *len && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_from() {
        let hay = b"abcXYZdefXYZ";
        assert_eq!(find_from(hay, b"XYZ", 0), Some(3));
        assert_eq!(find_from(hay, b"XYZ", 4), Some(9));
        assert_eq!(find_from(hay, b"nope", 0), None);
    }

    #[test]
    fn test_take_token() {
        let hay = b"/dev/pts/7\n(qemu) ";
        let (tok, end) = take_token(hay, 0).unwrap();
        assert_eq!(tok, b"/dev/pts/7");
        assert_eq!(end, 10);
    }

    #[test]
    fn test_take_token_incomplete() {
        let hay = b"/dev/pts/7";
        assert!(take_token(hay, 0).is_none());
    }

    #[test]
    fn test_validate_domain_name() {
        assert!(validate_domain_name("alpha"));
        assert!(!validate_domain_name(""));
        assert!(!validate_domain_name("a/b"));
    }

    #[test]
    fn test_validate_uuid() {
        assert!(validate_uuid("00000000-0000-0000-0000-000000000001"));
        assert!(!validate_uuid("not-a-uuid"));
    }
}
