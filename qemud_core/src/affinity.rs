//! CPU affinity application (spec §4.5 step 11, SPEC_FULL §F.5). The
//! "host affinity syscalls" collaborator named in spec §6 is a seam: the
//! real implementation shells out to `sched_setaffinity`, tests inject a
//! recording double.

use crate::error::{InternalError, Result};

pub trait CpuAffinity {
    /// Pins `tid` to the CPUs set in `mask` (bit `n` = cpu `n`).
    fn set_affinity(&self, tid: i32, mask: u64) -> Result<()>;
}

pub struct HostCpuAffinity;

impl CpuAffinity for HostCpuAffinity {
    fn set_affinity(&self, tid: i32, mask: u64) -> Result<()> {
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        unsafe { libc::CPU_ZERO(&mut set) };
        for cpu in 0..64u32 {
            if mask & (1u64 << cpu) != 0 {
                unsafe { libc::CPU_SET(cpu as usize, &mut set) };
            }
        }
        let rc = unsafe {
            libc::sched_setaffinity(tid, std::mem::size_of::<libc::cpu_set_t>(), &set)
        };
        if rc != 0 {
            return Err(InternalError::System(std::io::Error::last_os_error()).into());
        }
        Ok(())
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingAffinity {
        pub calls: Mutex<Vec<(i32, u64)>>,
    }

    impl CpuAffinity for RecordingAffinity {
        fn set_affinity(&self, tid: i32, mask: u64) -> Result<()> {
            self.calls.lock().unwrap().push((tid, mask));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testing::RecordingAffinity;

    #[test]
    fn test_recording_double_captures_calls() {
        let aff = RecordingAffinity::default();
        aff.set_affinity(42, 0b11).unwrap();
        assert_eq!(*aff.calls.lock().unwrap(), vec![(42, 0b11)]);
    }
}
