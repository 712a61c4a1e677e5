//! How a child process ended.

use std::fmt;

/// Exit status of a child process.
///
/// `code` is 0 only for success. A process killed by a signal reports
/// `signal = Some(n)` and `code = 128 + n`, the way shells print it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ExitStatus {
    /// Exit code. 0 means success.
    pub code: i32,
    /// Terminating signal, if the process was killed by one.
    pub signal: Option<i32>,
}

impl ExitStatus {
    /// A successful exit.
    pub const SUCCESS: ExitStatus = ExitStatus { code: 0, signal: None };

    /// Status for a process that exited normally with `code`.
    pub fn from_code(code: i32) -> Self {
        Self { code, signal: None }
    }

    /// Status for a process terminated by `signal`.
    pub fn from_signal(signal: i32) -> Self {
        Self {
            code: 128 + signal,
            signal: Some(signal),
        }
    }

    /// True if the process exited with code 0 and was not signalled.
    pub fn success(&self) -> bool {
        self.code == 0 && self.signal.is_none()
    }
}

impl From<std::process::ExitStatus> for ExitStatus {
    fn from(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Self::from_code(code);
        }

        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            match status.signal() {
                Some(sig) => Self::from_signal(sig),
                None => Self::from_code(-1),
            }
        }

        #[cfg(not(unix))]
        {
            Self::from_code(-1)
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.signal {
            Some(sig) => write!(f, "killed by signal {}", sig),
            None => write!(f, "exit code {}", self.code),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_requires_zero_and_no_signal() {
        assert!(ExitStatus::SUCCESS.success());
        assert!(!ExitStatus::from_code(17).success());
        assert!(!ExitStatus::from_signal(9).success());
    }

    #[test]
    fn test_signal_code_convention() {
        let status = ExitStatus::from_signal(15);
        assert_eq!(status.code, 143);
        assert_eq!(status.signal, Some(15));
        assert_eq!(status.to_string(), "killed by signal 15");
    }

    #[cfg(unix)]
    #[test]
    fn test_from_std_status() {
        use std::os::unix::process::ExitStatusExt;

        let exited = std::process::ExitStatus::from_raw(17 << 8);
        assert_eq!(ExitStatus::from(exited), ExitStatus::from_code(17));

        let killed = std::process::ExitStatus::from_raw(9);
        assert_eq!(ExitStatus::from(killed), ExitStatus::from_signal(9));
    }
}
