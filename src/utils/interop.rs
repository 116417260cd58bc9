use std::io;

/// Converts a C return value to a Rust `Result`.
///
/// Verbs return either `0`, a positive `errno`, or `-1` with `errno` set.
#[cfg_attr(not(feature = "ibverbs"), allow(dead_code))]
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    match ret {
        0 => Ok(()),
        _ => Err(errno_of(ret)),
    }
}

/// Converts a C return value to a Rust `Result`, attaching the explanation
/// produced by `f` when it recognizes the error code.
#[inline(always)]
pub(crate) fn from_c_ret_explained(
    ret: i32,
    f: impl FnOnce(i32) -> Option<&'static str>,
) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    Err(explained(errno_of(ret), f))
}

/// Replace the message of an OS error with the explanation `f` gives for
/// its code, if any. The error kind is kept.
pub(crate) fn explained(err: io::Error, f: impl FnOnce(i32) -> Option<&'static str>) -> io::Error {
    match err.raw_os_error().and_then(f) {
        Some(msg) => io::Error::new(err.kind(), msg),
        None => err,
    }
}

/// Converts a non-zero C return value to a Rust `Result`.
#[cfg_attr(not(feature = "ibverbs"), allow(dead_code))]
#[inline(always)]
pub(crate) fn from_c_err<T>(code: i32) -> io::Result<T> {
    Err(io::Error::from_raw_os_error(code))
}

#[inline(always)]
fn errno_of(ret: i32) -> io::Error {
    if ret > 0 {
        io::Error::from_raw_os_error(ret)
    } else {
        io::Error::last_os_error()
    }
}

/// Explain `ibv_post_send` errors.
pub(crate) fn send_err_explanation(ret: i32) -> Option<&'static str> {
    match ret {
        libc::EINVAL => Some("invalid work request"),
        libc::ENOMEM => Some("send queue is full, or not enough resources to complete this operation"),
        libc::EFAULT => Some("invalid QP"),
        _ => None,
    }
}

/// Explain `ibv_post_recv` errors.
pub(crate) fn recv_err_explanation(ret: i32) -> Option<&'static str> {
    match ret {
        libc::EINVAL => Some("invalid work request"),
        libc::ENOMEM => Some("recv queue is full, or not enough resources to complete this operation"),
        libc::EFAULT => Some("invalid QP"),
        _ => None,
    }
}
