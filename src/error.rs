use thiserror::Error;

/// Process exit codes. Remote exits keep their own numeric value.
pub const EXIT_USAGE: i32 = 2;
pub const EXIT_CONFIG: i32 = 3;
pub const EXIT_TRANSPORT: i32 = 4;

/// Failure kinds surfaced to the user.
///
/// Validation errors are raised before any remote call is made; transport
/// and protocol errors carry enough context to point at the failing host.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{path}: {found} binary does not match target {target_os}/{target_arch}")]
    ArchMismatch {
        path: String,
        found: String,
        target_os: String,
        target_arch: String,
    },

    #[error("unable to classify payload {path}: {reason}")]
    ClassifyFailed { path: String, reason: String },

    #[error("failed to encode payload {path}: {source}")]
    EncodeFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot reach {host}:{port}: {source}")]
    RpcUnreachable {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("rpc protocol error: {0}")]
    RpcProtocol(String),

    /// Remote command exited non-zero. `prefix` is the line break to print
    /// before the error message so it lands on its own line after raw-mode
    /// output (\r, \n, or \r\n depending on the last byte the server sent).
    #[error("remote command exited with code {code}")]
    RemoteExit { code: i32, prefix: &'static str },

    #[error("stream closed before the server sent an exit frame")]
    TruncatedStream,

    #[error("flag {flag} is locked to {stored:?} for this service (got {given:?})")]
    LockedFlagMismatch {
        flag: &'static str,
        stored: String,
        given: String,
    },

    #[error("service {service} exists on multiple hosts: {}; pick one with svc@host or --host", .candidates.join(", "))]
    AmbiguousHost {
        service: String,
        candidates: Vec<String>,
    },

    #[error("service {0} not found")]
    MissingService(String),

    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },

    #[error("invalid assignment {0}: expected KEY=VALUE with key matching [A-Za-z_][A-Za-z0-9_]*")]
    InvalidAssignment(String),

    #[error("failed to read {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to write {path}: {source}")]
    ConfigWrite {
        path: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("canceled")]
    Canceled,
}

impl Error {
    /// Map a failure kind to its process exit code.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RemoteExit { code, .. } => *code,
            Self::ArchMismatch { .. }
            | Self::ClassifyFailed { .. }
            | Self::LockedFlagMismatch { .. }
            | Self::AmbiguousHost { .. }
            | Self::MissingService(_)
            | Self::InvalidEndpoint { .. }
            | Self::InvalidAssignment(_) => EXIT_USAGE,
            Self::ConfigRead { .. } | Self::ConfigWrite { .. } => EXIT_CONFIG,
            Self::EncodeFailed { .. }
            | Self::RpcUnreachable { .. }
            | Self::RpcProtocol(_)
            | Self::TruncatedStream
            | Self::Canceled => EXIT_TRANSPORT,
        }
    }

    /// Text printed before the error message. Non-empty only for remote
    /// exits that interrupted raw-mode output mid-line.
    pub fn message_prefix(&self) -> &'static str {
        match self {
            Self::RemoteExit { prefix, .. } => prefix,
            _ => "",
        }
    }
}

/// Resolve the exit code for a top-level error, looking through anyhow's
/// context chain for a typed kind.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>()
        .map_or(EXIT_TRANSPORT, Error::exit_code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_exit_preserves_code() {
        let err = Error::RemoteExit {
            code: 42,
            prefix: "\r\n",
        };
        assert_eq!(err.exit_code(), 42);
        assert_eq!(err.message_prefix(), "\r\n");
    }

    #[test]
    fn validation_errors_are_usage() {
        let err = Error::InvalidAssignment("1BAD=x".into());
        assert_eq!(err.exit_code(), EXIT_USAGE);
        let err = Error::AmbiguousHost {
            service: "svc".into(),
            candidates: vec!["a".into(), "b".into()],
        };
        assert_eq!(err.exit_code(), EXIT_USAGE);
    }

    #[test]
    fn config_errors_map_to_three() {
        let err = Error::ConfigRead {
            path: "yeet.toml".into(),
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn anyhow_chain_is_searched() {
        let err = anyhow::Error::from(Error::TruncatedStream).context("while deploying");
        assert_eq!(exit_code_for(&err), EXIT_TRANSPORT);

        let plain = anyhow::anyhow!("no typed kind");
        assert_eq!(exit_code_for(&plain), EXIT_TRANSPORT);
    }

    #[test]
    fn ambiguous_host_lists_candidates() {
        let err = Error::AmbiguousHost {
            service: "svc".into(),
            candidates: vec!["host-a".into(), "host-b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("host-a, host-b"));
    }
}
