//! SIGALRM kick timer used to bound hardware-virtualized runs
//!
//! `KVM_RUN` blocks until the guest exits on its own, so a periodic signal
//! is the mechanism that forces the vCPU back out (`EINTR`) often enough
//! for the backend to check its wall-clock limit. The signal stays blocked
//! outside of guest execution so host syscalls are not interrupted.

use anyhow::{anyhow, Result};
use libc::c_int;

use nix::errno::Errno;
use nix::sys::signal::{
    pthread_sigmask, sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal,
};

use std::sync::atomic::Ordering;
use std::time::Duration;

/// How often the vCPU is kicked out of guest execution
pub const KICK_INTERVAL: Duration = Duration::from_millis(250);

/// Timer value passed to `setitimer`
#[repr(C)]
#[derive(Debug, Clone)]
struct Itimerval {
    /// Interval for the periodic timer
    it_interval: Timeval,

    /// Time until the next expiration
    it_value: Timeval,
}

/// One `setitimer` interval
#[repr(C)]
#[derive(Debug, Clone, Default)]
struct Timeval {
    /// Seconds
    tv_sec: i64,

    /// Microseconds
    tv_usec: i64,
}

/// `ITIMER_REAL`: counts down in wall clock time, delivers `SIGALRM`
const ITIMER_REAL: c_int = 0;

extern "C" {
    fn setitimer(which: c_int, new_value: *mut Itimerval, old_value: *mut Itimerval) -> c_int;
}

/// `SIGALRM` handler. The side effect that matters is interrupting
/// `KVM_RUN`; the flag lets callers tell a timer kick from other `EINTR`s.
extern "C" fn handler_alarm(_val: c_int) {
    crate::KICK_GUEST.store(true, Ordering::SeqCst);
}

/// Install the `SIGALRM` handler and start the periodic kick timer.
///
/// The signal is left blocked; backends unblock it only while the guest is
/// running.
pub fn init_kick_timer() -> Result<()> {
    unsafe {
        sigaction(
            Signal::SIGALRM,
            &SigAction::new(
                SigHandler::Handler(handler_alarm),
                SaFlags::empty(),
                SigSet::empty(),
            ),
        )?
    };

    block_sigalrm()?;

    const MICROS_IN_SECOND: u64 = 1_000_000;
    let micros = u64::try_from(KICK_INTERVAL.as_micros())?;

    let interval = Timeval {
        tv_sec: i64::try_from(micros / MICROS_IN_SECOND)?,
        tv_usec: i64::try_from(micros % MICROS_IN_SECOND)?,
    };

    let mut timer_val = Itimerval {
        it_interval: interval.clone(),
        it_value: interval,
    };

    let ret = unsafe { setitimer(ITIMER_REAL, &mut timer_val, std::ptr::null_mut()) };
    if ret != 0 {
        return Err(anyhow!(Errno::last()));
    }

    Ok(())
}

/// Block `SIGALRM` on the current thread
pub fn block_sigalrm() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&set), None)?;
    Ok(())
}

/// Unblock `SIGALRM` on the current thread
pub fn unblock_sigalrm() -> Result<()> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGALRM);
    pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&set), None)?;
    Ok(())
}
