//! Maps [`threadrt_core::RuntimeError`] onto the POSIX errno values a
//! pthread-flavored `extern "C"` function is expected to return, the way
//! `glibc-rs-abi`'s ABI modules translate their core crate's error types at
//! the C boundary.

use threadrt_core::RuntimeError;

/// Translate a core error into the `c_int` a `pthread_*`-style function
/// should return. Most pthread functions return the errno value directly
/// rather than setting the `errno` thread-local and returning `-1`.
pub fn to_errno(err: &RuntimeError) -> libc::c_int {
    match err {
        RuntimeError::NotFound => libc::ESRCH,
        RuntimeError::InvalidArgument(_) => libc::EINVAL,
        RuntimeError::Permission(_) => libc::EPERM,
        RuntimeError::DeadlockDetected => libc::EDEADLK,
        RuntimeError::ResourceExhausted(_) => libc::EAGAIN,
        RuntimeError::WouldBlock => libc::EAGAIN,
        RuntimeError::TimedOut => libc::ETIMEDOUT,
        RuntimeError::Io(_) => libc::EIO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_to_esrch() {
        assert_eq!(to_errno(&RuntimeError::NotFound), libc::ESRCH);
    }

    #[test]
    fn deadlock_maps_to_edeadlk() {
        assert_eq!(to_errno(&RuntimeError::DeadlockDetected), libc::EDEADLK);
    }

    #[test]
    fn timed_out_maps_to_etimedout() {
        assert_eq!(to_errno(&RuntimeError::TimedOut), libc::ETIMEDOUT);
    }
}
