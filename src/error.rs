use std::process::ExitCode;

/// Errors that cause metamorph to exit with a specific code.
#[derive(Debug, thiserror::Error)]
pub enum ExitError {
    #[error("config error: {0}")]
    Config(String),

    #[error("tool not found: {tool}")]
    ToolNotFound { tool: String },

    #[error("{tool} failed (exit {code}): {message}")]
    ToolFailed {
        tool: String,
        code: i32,
        message: String,
    },

    #[error("{tool} timed out after {timeout_secs}s")]
    Timeout { tool: String, timeout_secs: u64 },

    #[error("daemon is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("daemon is not running")]
    NotRunning,

    #[error("{0}")]
    Other(String),
}

impl ExitError {
    /// Numeric process exit status for this error class.
    pub const fn code(&self) -> u8 {
        match self {
            ExitError::Config(_) => 2,
            ExitError::ToolNotFound { .. } => 3,
            ExitError::ToolFailed { .. } => 4,
            ExitError::Timeout { .. } => 5,
            ExitError::AlreadyRunning { .. } => 6,
            ExitError::NotRunning => 7,
            ExitError::Other(_) => 1,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct_per_failure_class() {
        let codes = [
            ExitError::Config("x".into()).code(),
            ExitError::ToolNotFound { tool: "git".into() }.code(),
            ExitError::ToolFailed {
                tool: "git".into(),
                code: 1,
                message: String::new(),
            }
            .code(),
            ExitError::Timeout {
                tool: "docker".into(),
                timeout_secs: 5,
            }
            .code(),
            ExitError::AlreadyRunning { pid: 1 }.code(),
            ExitError::NotRunning.code(),
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn already_running_message_names_pid() {
        let err = ExitError::AlreadyRunning { pid: 4242 };
        assert_eq!(err.to_string(), "daemon is already running (pid 4242)");
    }
}
