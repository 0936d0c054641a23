//! Deterministic exit codes for the operator CLI.
//!
//! Scripts and build drivers branch on these, so the mapping from error to
//! code must be stable.

use buildgov_shim::client::ClientError;

/// Exit code constants.
pub mod codes {
    /// Success.
    pub const SUCCESS: u8 = 0;

    /// Generic error (fallback for unmapped failures).
    pub const GENERIC_ERROR: u8 = 1;

    /// Governor unavailable (connect failure or timeout).
    pub const GOVERNOR_UNAVAILABLE: u8 = 20;

    /// Protocol error (malformed or unexpected reply).
    pub const PROTOCOL_ERROR: u8 = 21;
}

/// Maps a client error to its exit code.
///
/// | Error | Code |
/// |-------|------|
/// | `Unreachable`, `Timeout` | 20 |
/// | `Protocol` | 21 |
/// | `Io` | 1 |
#[must_use]
pub fn exit_code_for(err: &ClientError) -> u8 {
    match err {
        ClientError::Unreachable | ClientError::Timeout { .. } => codes::GOVERNOR_UNAVAILABLE,
        ClientError::Protocol { .. } => codes::PROTOCOL_ERROR,
        _ => codes::GENERIC_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_maps_to_unavailable() {
        assert_eq!(
            exit_code_for(&ClientError::Unreachable),
            codes::GOVERNOR_UNAVAILABLE
        );
        assert_eq!(
            exit_code_for(&ClientError::Timeout { operation: "status" }),
            codes::GOVERNOR_UNAVAILABLE
        );
    }

    #[test]
    fn protocol_errors_map_to_protocol_code() {
        let err = ClientError::Protocol {
            operation: "status",
            detail: "wrong variant".to_string(),
        };
        assert_eq!(exit_code_for(&err), codes::PROTOCOL_ERROR);
    }
}
