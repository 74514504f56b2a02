//! Kernel notification descriptors used by the reactor: a counting eventfd
//! for cross-thread wake-up and a monotonic timerfd driving the timer queue.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::Once;

use crate::timestamp::{Timestamp, MICROS_PER_SECOND};

macro_rules! syscall {
    ($fn:ident $args:tt) => {{
        let res = unsafe { libc::$fn $args };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

pub(crate) use syscall;

/// Expirations scheduled closer than this are rounded up, so that a rearm
/// always lands in the future of the kernel clock.
const MIN_TIMER_MICROS: i64 = 100;

/// Creates the wake-up descriptor. Failure here leaves the reactor unable to
/// ever be woken, hence fatal.
pub(crate) fn create_eventfd() -> RawFd {
    match syscall!(eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC)) {
        Ok(fd) => fd,
        Err(err) => {
            log::error!(target: "reactor", "Failed to create eventfd: {err}");
            panic!("eventfd creation failed: {err}");
        }
    }
}

pub(crate) fn write_eventfd(fd: RawFd) {
    let one: u64 = 1;
    match syscall!(write(fd, &one as *const u64 as *const libc::c_void, 8)) {
        Ok(8) => {}
        Ok(n) => log::error!(target: "reactor", "Eventfd write wrote {n} bytes instead of 8"),
        Err(err) => log::error!(target: "reactor", "Eventfd write failed: {err}"),
    }
}

pub(crate) fn read_eventfd(fd: RawFd) {
    let mut counter: u64 = 0;
    match syscall!(read(fd, &mut counter as *mut u64 as *mut libc::c_void, 8)) {
        Ok(8) => {}
        Ok(n) => log::error!(target: "reactor", "Eventfd read got {n} bytes instead of 8"),
        Err(err) => log::error!(target: "reactor", "Eventfd read failed: {err}"),
    }
}

/// Creates the timer descriptor; armed and re-armed with [`reset_timerfd`].
pub(crate) fn create_timerfd() -> RawFd {
    match syscall!(timerfd_create(
        libc::CLOCK_MONOTONIC,
        libc::TFD_NONBLOCK | libc::TFD_CLOEXEC
    )) {
        Ok(fd) => fd,
        Err(err) => {
            log::error!(target: "timer", "Failed to create timerfd: {err}");
            panic!("timerfd creation failed: {err}");
        }
    }
}

/// Consumes the expiration count after the timerfd turned readable.
pub(crate) fn read_timerfd(fd: RawFd, now: Timestamp) -> u64 {
    let mut howmany: u64 = 0;
    match syscall!(read(fd, &mut howmany as *mut u64 as *mut libc::c_void, 8)) {
        Ok(8) => log::trace!(target: "timer", "Timerfd fired {howmany} time(s) at {now}"),
        Ok(n) => log::error!(target: "timer", "Timerfd read got {n} bytes instead of 8"),
        Err(err) => log::error!(target: "timer", "Timerfd read failed: {err}"),
    }
    howmany
}

/// Programs the descriptor to fire once at `expiration` (relative arm against
/// the monotonic clock, computed from wall-clock timestamps).
pub(crate) fn reset_timerfd(fd: RawFd, expiration: Timestamp) {
    let micros = (expiration.micros_since_epoch() - Timestamp::now().micros_since_epoch())
        .max(MIN_TIMER_MICROS);
    let new_value = libc::itimerspec {
        it_interval: libc::timespec { tv_sec: 0, tv_nsec: 0 },
        it_value: libc::timespec {
            tv_sec: (micros / MICROS_PER_SECOND) as libc::time_t,
            tv_nsec: ((micros % MICROS_PER_SECOND) * 1000) as libc::c_long,
        },
    };
    let mut old_value = unsafe { std::mem::zeroed::<libc::itimerspec>() };
    if let Err(err) = syscall!(timerfd_settime(fd, 0, &new_value, &mut old_value)) {
        log::error!(target: "timer", "timerfd_settime failed: {err}");
    }
}

pub(crate) fn close_fd(fd: RawFd) {
    if let Err(err) = syscall!(close(fd)) {
        log::error!(target: "reactor", "Closing fd {fd} failed: {err}");
    }
}

/// Opens the placeholder descriptor the acceptor sacrifices on `EMFILE`.
pub(crate) fn open_idle_fd() -> io::Result<RawFd> {
    syscall!(open(
        b"/dev/null\0".as_ptr() as *const libc::c_char,
        libc::O_RDONLY | libc::O_CLOEXEC
    ))
}

/// Ignores `SIGPIPE` process-wide so writes to closed sockets surface as
/// `EPIPE` instead of killing the process. Installed once, on first reactor
/// construction.
pub(crate) fn ignore_sigpipe() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    });
}
