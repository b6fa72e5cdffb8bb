use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("origin '{origin}' is not on the allow-list")]
    OriginRejected { origin: String },
    #[error("client did not offer the '{expected}' sub-protocol")]
    ProtocolMismatch { expected: &'static str },
    #[error("failed to launch worker '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("write to a closed peer dropped")]
    BrokenPipe,
    #[error("peer disconnected")]
    PeerDisconnect,
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RelayError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            RelayError::OriginRejected { .. } => "origin_rejected",
            RelayError::ProtocolMismatch { .. } => "protocol_mismatch",
            RelayError::Spawn { .. } => "spawn_error",
            RelayError::BrokenPipe => "broken_pipe",
            RelayError::PeerDisconnect => "peer_disconnect",
            RelayError::Protocol(_) => "protocol_error",
        }
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn errors_carry_metric_labels_and_context() {
        let origin = RelayError::OriginRejected {
            origin: "http://evil.example".into(),
        };
        assert_eq!(origin.metric_label(), "origin_rejected");
        assert!(origin.to_string().contains("http://evil.example"));

        let spawn = RelayError::Spawn {
            program: "/usr/local/bin/apl".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(spawn.to_string().contains("/usr/local/bin/apl"));
        assert_eq!(spawn.metric_label(), "spawn_error");
    }
}
