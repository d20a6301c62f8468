//! Process hardening for the agent daemon.
//!
//! Decrypted private keys live in this process for as long as they are
//! loaded, so they must not reach disk through a core dump or swap.  Each
//! step is best-effort: the outcome is recorded in a [`Hardening`] report
//! and the daemon starts either way.

use std::io;

use tracing::{info, warn};

/// Outcome of each hardening step, in the order applied.
#[derive(Debug)]
pub struct Hardening {
    steps: Vec<(&'static str, io::Result<()>)>,
}

impl Hardening {
    /// Apply every step.  Call before the first key can arrive.
    pub fn apply() -> Self {
        let mut steps = vec![("core limit", zero_core_limit())];

        #[cfg(target_os = "linux")]
        {
            let off: libc::c_ulong = 0;
            // SAFETY: prctl with PR_SET_DUMPABLE takes plain integer arguments.
            let ret = unsafe { libc::prctl(libc::PR_SET_DUMPABLE, off, off, off, off) };
            steps.push(("not dumpable", check(ret)));
        }

        // Needs CAP_IPC_LOCK or an RLIMIT_MEMLOCK covering the whole process.
        // SAFETY: mlockall only changes paging for this process.
        let ret = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
        steps.push(("mlockall", check(ret)));

        Self { steps }
    }

    pub fn failures(&self) -> impl Iterator<Item = (&'static str, &io::Error)> + '_ {
        self.steps
            .iter()
            .filter_map(|(step, outcome)| outcome.as_ref().err().map(|e| (*step, e)))
    }

    /// Log one warning per failed step and a summary line.
    pub fn log(&self) {
        for (step, err) in self.failures() {
            warn!(step, "process hardening step failed, continuing: {err}");
        }
        let applied = self.steps.len() - self.failures().count();
        info!(applied, total = self.steps.len(), "process hardening done");
    }
}

/// Drop the soft and hard core size limits to zero.
fn zero_core_limit() -> io::Result<()> {
    let none = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `none` is a valid rlimit that outlives the call.
    check(unsafe { libc::setrlimit(libc::RLIMIT_CORE, &none) })
}

fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
