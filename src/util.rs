use std::mem::size_of;

pub fn c_timeval_new(t: std::time::Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: t.as_secs() as libc::time_t,
        tv_usec: (t.subsec_nanos() / 1000) as libc::suseconds_t,
    }
}

/// `setsockopt` wrapper
///
/// Used to set the receive/send timeouts on the raw CAN socket and the
/// keepalive option on the gateway TCP stream without messing around with
/// `*const c_void`s.
///
/// A proper `std::io::Error` will be returned on failure.
///
/// Note that the `val` parameter must be specified correctly; if an option
/// expects an integer, it is advisable to pass in a `c_int`, not the default
/// of `i32`.
pub(crate) fn set_socket_option<T>(
    fd: libc::c_int,
    level: libc::c_int,
    name: libc::c_int,
    val: &T,
) -> std::io::Result<()> {
    let result = unsafe {
        let val_ptr: *const T = val as *const T;

        libc::setsockopt(
            fd,
            level,
            name,
            val_ptr as *const libc::c_void,
            size_of::<T>() as libc::socklen_t,
        )
    };

    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }

    Ok(())
}
