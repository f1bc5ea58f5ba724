//! Raw `wait(2)` status decoding for child watches.

/// Decodes a raw wait status word into the exit-code convention callbacks
/// receive.
///
/// - signal death reports the negated signal number,
/// - a normal exit reports the exit code,
/// - anything else (stop, continue) reports `None`.
///
/// Foreign loop libraries have been seen handing a signal death through as
/// an exit status above 128 instead of a termination report; those are
/// folded back into the negative-signal form, so a status of 137 decodes
/// to -9 rather than 9.
pub(crate) fn decode_wait_status(status: i32) -> Option<i32> {
    if libc::WIFSIGNALED(status) {
        Some(-libc::WTERMSIG(status))
    } else if libc::WIFEXITED(status) {
        let mut code = libc::WEXITSTATUS(status);
        if code > 128 {
            code = 128 - code;
        }
        Some(code)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    fn signaled(signum: i32) -> i32 {
        signum & 0x7f
    }

    fn stopped(signum: i32) -> i32 {
        ((signum & 0xff) << 8) | 0x7f
    }

    #[test]
    fn test_clean_exit_decodes_to_code() {
        assert_eq!(decode_wait_status(exited(0)), Some(0));
        assert_eq!(decode_wait_status(exited(1)), Some(1));
        assert_eq!(decode_wait_status(exited(42)), Some(42));
        assert_eq!(decode_wait_status(exited(128)), Some(128));
    }

    #[test]
    fn test_signal_death_decodes_to_negated_signal() {
        assert_eq!(decode_wait_status(signaled(9)), Some(-9));
        assert_eq!(decode_wait_status(signaled(15)), Some(-15));
        assert_eq!(decode_wait_status(signaled(2)), Some(-2));
    }

    #[test]
    fn test_status_above_128_folds_to_negative() {
        // 137 = 128 + 9, the shape a kill by signal 9 takes when the
        // library reports it as a plain exit status.
        assert_eq!(decode_wait_status(exited(137)), Some(-9));
        assert_eq!(decode_wait_status(exited(130)), Some(-2));
        assert_eq!(decode_wait_status(exited(129)), Some(-1));
    }

    #[test]
    fn test_stop_reports_none() {
        assert_eq!(decode_wait_status(stopped(19)), None);
        assert_eq!(decode_wait_status(stopped(20)), None);
    }
}
