//! Error taxonomy of the core.
//!
//! Guest-attributable faults and resource exhaustion travel as
//! [`AxError`] values inside [`AxResult`] and are converted to negative
//! error codes at the hypercall boundary by [`guest_errno`]. Broken core
//! invariants never do: they go through [`bug!`], which cannot be caught.

use axerrno::{AxError, LinuxError};

/// Violated core-safety invariant. Logs and stops the host.
///
/// Only for states that no guest behaviour can legally produce.
macro_rules! bug {
    ($($arg:tt)+) => {{
        error!($($arg)+);
        panic!($($arg)+)
    }};
}

/// Negative error code returned to a guest for `err`.
pub fn guest_errno(err: AxError) -> i64 {
    let linux = match err {
        AxError::InvalidInput | AxError::InvalidData | AxError::BadState => LinuxError::EINVAL,
        AxError::NoMemory => LinuxError::ENOMEM,
        AxError::StorageFull => LinuxError::ENOSPC,
        AxError::NotFound => LinuxError::ENOENT,
        AxError::PermissionDenied => LinuxError::EPERM,
        AxError::ResourceBusy => LinuxError::EBUSY,
        AxError::AlreadyExists => LinuxError::EEXIST,
        AxError::BadAddress => LinuxError::EFAULT,
        AxError::Unsupported => LinuxError::ENOSYS,
        AxError::WouldBlock => LinuxError::EAGAIN,
        _ => LinuxError::EINVAL,
    };
    -(linux as i32 as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(guest_errno(AxError::InvalidInput), -22);
        assert_eq!(guest_errno(AxError::NoMemory), -12);
        assert_eq!(guest_errno(AxError::StorageFull), -28);
        assert_eq!(guest_errno(AxError::NotFound), -2);
        assert_eq!(guest_errno(AxError::PermissionDenied), -1);
        assert_eq!(guest_errno(AxError::ResourceBusy), -16);
        assert_eq!(guest_errno(AxError::BadAddress), -14);
        assert_eq!(guest_errno(AxError::Unsupported), -38);
    }

    #[test]
    #[should_panic]
    fn bug_is_fatal() {
        bug!("frame {} in impossible state", 7);
    }
}
