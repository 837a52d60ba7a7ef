use thiserror::Error;

/// Failure kinds surfaced by the socket layer.
///
/// Peer close on a stream read is not an error; it is reported as
/// `Ok(0)`, following the POSIX convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// Empty buffer, wrong socket type for the operation, or an
    /// uninitialized module.
    #[error("invalid argument")]
    InvalidArgument,
    /// The stack could not allocate buffer space for the operation.
    #[error("allocation failure")]
    AllocationFailure,
    /// The underlying stack refused the operation.
    #[error("protocol error")]
    Protocol,
    /// Documented surface without a wired-up implementation.
    #[error("operation not supported")]
    Unsupported,
}
