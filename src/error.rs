//! Error kinds surfaced by the resolution engine.

use hickory_proto::op::ResponseCode;
use thiserror::Error;

/// Errors produced while resolving a single request.
///
/// Per-upstream failures are absorbed inside the dispatcher; only terminal
/// kinds reach the pipeline boundary, where they are converted into a DNS
/// response carrying the matching response code.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Query could not be decoded or carries no question.
    #[error("malformed query: {0}")]
    Malformed(&'static str),

    /// Query violates a configured policy.
    #[error("refused by policy: {0}")]
    PolicyRefused(&'static str),

    /// No upstream applies to the queried name.
    #[error("no upstream configured for this query")]
    NoRoute,

    /// A single upstream exchange failed; the dispatcher continues with the
    /// next candidate.
    #[error("upstream {0} failed: {1}")]
    UpstreamFailed(String, String),

    /// Every primary and fallback upstream failed.
    #[error("all upstreams failed")]
    AllUpstreamsFailed,

    /// The request was cancelled before a response could be produced.
    #[error("request cancelled")]
    Cancelled,
}

impl ResolveError {
    /// Response code reported to the client for this error.
    pub fn rcode(&self) -> ResponseCode {
        match self {
            ResolveError::PolicyRefused(_) => ResponseCode::NotImp,
            _ => ResponseCode::ServFail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rcode_mapping() {
        assert_eq!(
            ResolveError::PolicyRefused("ANY queries are refused").rcode(),
            ResponseCode::NotImp
        );
        assert_eq!(ResolveError::AllUpstreamsFailed.rcode(), ResponseCode::ServFail);
        assert_eq!(ResolveError::Malformed("no question").rcode(), ResponseCode::ServFail);
    }
}
