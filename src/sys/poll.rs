use std::convert::TryInto;
use std::io;
use std::time::Duration;
use std::{cmp, thread};

use libc::c_short;

use crate::ready::Ready;

/// Blocks in `poll(2)` for at most `timeout`, returning the number of
/// descriptors with pending events.
pub fn poll(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let timeout = cmp::min(timeout.as_millis(), libc::c_int::MAX as u128) as libc::c_int;

    if fds.is_empty() {
        // nothing registered; emulate the kernel wait
        thread::sleep(Duration::from_millis(timeout as u64));
        return Ok(0);
    }

    let ret = unsafe {
        libc::poll(
            fds.as_mut_ptr(),
            fds.len().try_into().unwrap_or(0),
            timeout,
        )
    };
    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
        return Ok(0);
    }

    Ok(ret as usize)
}

pub fn ready_to_poll(interest: Ready) -> c_short {
    let mut kind = 0;

    if interest.is_readable() {
        kind |= libc::POLLIN;
    }

    if interest.is_writable() {
        kind |= libc::POLLOUT;
    }

    kind
}

pub fn poll_to_ready(revents: c_short) -> Ready {
    let mut kind = Ready::empty();

    if (revents & libc::POLLIN) != 0 || (revents & libc::POLLPRI) != 0 {
        kind = kind | Ready::readable();
    }

    if (revents & libc::POLLOUT) != 0 {
        kind = kind | Ready::writable();
    }

    if (revents & libc::POLLERR) != 0 || (revents & libc::POLLNVAL) != 0 {
        kind = kind | Ready::error();
    }

    if (revents & libc::POLLHUP) != 0 {
        kind = kind | Ready::hup();
    }

    kind
}
