// SPDX-License-Identifier: MIT
//! Error taxonomy for the language-service bridge.

/// Failure of one bridge query, as surfaced to collaborators.
///
/// `Communication` is terminal for the supervisor instance that produced it:
/// every later query on that process fails the same way until the process is
/// replaced (remove and re-add the project root). The other variants fail
/// only the one request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServiceError {
    /// Launch failure, stream desync, closed pipe, or malformed reply.
    /// Carries the captured worker stderr (plus exit status) when available,
    /// otherwise the recorded communication error.
    #[error("{0}")]
    Communication(String),

    /// The worker caught an exception while servicing the request and
    /// reported it as a string reply.
    #[error("caught exception in worker: {0}")]
    Worker(String),

    /// The library directory is unset or `configure` failed. Blocks every
    /// query until the configuration generation is bumped with a fix.
    #[error("{0}")]
    Configuration(String),

    /// The caller referenced a file no source root tracks.
    #[error("unknown source root for file {0}")]
    UnknownFile(String),
}
