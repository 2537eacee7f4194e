// SPDX-License-Identifier: Apache-2.0

//! Portable error numbers
//!
//! Both virtual machines may run different kernels whose errno constants disagree. Every status
//! that crosses the ring uses the values below, which follow the Linux numbering.

use crate::Error;

macro_rules! errno {
    ($($(#[$attr:meta])* $name:ident = $value:literal;)*) => {
        $(
            $(#[$attr])*
            pub const $name: Error = $value;
        )*

        /// Returns the symbolic name of a portable errno value.
        pub const fn name(errno: Error) -> Option<&'static str> {
            match errno {
                $($value => Some(stringify!($name)),)*
                _ => None,
            }
        }
    };
}

errno! {
    /// Operation not permitted
    EPERM = 1;
    /// No such file or directory
    ENOENT = 2;
    /// Interrupted system call
    EINTR = 4;
    /// I/O error
    EIO = 5;
    /// Bad file number
    EBADF = 9;
    /// Try again
    EAGAIN = 11;
    /// Out of memory
    ENOMEM = 12;
    /// Permission denied
    EACCES = 13;
    /// Bad address
    EFAULT = 14;
    /// Device or resource busy
    EBUSY = 16;
    /// File exists
    EEXIST = 17;
    /// Invalid argument
    EINVAL = 22;
    /// Too many open files
    EMFILE = 24;
    /// No space left on device
    ENOSPC = 28;
    /// Broken pipe
    EPIPE = 32;
    /// Invalid system call number
    ENOSYS = 38;
    /// Timer expired
    ETIME = 62;
    /// Protocol error
    EPROTO = 71;
    /// Not a data message
    EBADMSG = 74;
    /// Value too large for defined data type
    EOVERFLOW = 75;
    /// Socket operation on non-socket
    ENOTSOCK = 88;
    /// Destination address required
    EDESTADDRREQ = 89;
    /// Message too long
    EMSGSIZE = 90;
    /// Protocol wrong type for socket
    EPROTOTYPE = 91;
    /// Protocol not available
    ENOPROTOOPT = 92;
    /// Protocol not supported
    EPROTONOSUPPORT = 93;
    /// Operation not supported on transport endpoint
    EOPNOTSUPP = 95;
    /// Address family not supported by protocol
    EAFNOSUPPORT = 97;
    /// Address already in use
    EADDRINUSE = 98;
    /// Cannot assign requested address
    EADDRNOTAVAIL = 99;
    /// Network is down
    ENETDOWN = 100;
    /// Network is unreachable
    ENETUNREACH = 101;
    /// Software caused connection abort
    ECONNABORTED = 103;
    /// Connection reset by peer
    ECONNRESET = 104;
    /// No buffer space available
    ENOBUFS = 105;
    /// Transport endpoint is already connected
    EISCONN = 106;
    /// Transport endpoint is not connected
    ENOTCONN = 107;
    /// Cannot send after transport endpoint shutdown
    ESHUTDOWN = 108;
    /// Connection timed out
    ETIMEDOUT = 110;
    /// Connection refused
    ECONNREFUSED = 111;
    /// No route to host
    EHOSTUNREACH = 113;
    /// Operation already in progress
    EALREADY = 114;
    /// Operation now in progress
    EINPROGRESS = 115;
    /// Stale file handle
    ESTALE = 116;
    /// Operation canceled
    ECANCELED = 125;
}

/// Operation would block
pub const EWOULDBLOCK: Error = EAGAIN;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names() {
        for (v, expected) in [
            (EAGAIN, Some("EAGAIN")),
            (EWOULDBLOCK, Some("EAGAIN")),
            (EINVAL, Some("EINVAL")),
            (ESTALE, Some("ESTALE")),
            (0, None),
            (3, None),
            (-22, None),
        ] {
            assert_eq!(name(v), expected, "Invalid name for {v}");
        }
    }
}
