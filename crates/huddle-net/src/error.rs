use thiserror::Error;

/// Errors returned by [`ControlPlane`](crate::control::ControlPlane) calls.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The bearer token is missing, expired or invalid (HTTP 401).
    #[error("Not authenticated")]
    NotAuthenticated,

    /// The server denied access (HTTP 403).
    #[error("Access denied: {0}")]
    Forbidden(String),

    /// The requested resource was not found (HTTP 404).
    #[error("Not found: {0}")]
    NotFound(String),

    /// The envelope came back with `success: false`.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The envelope reported success but carried no data.
    #[error("Response carried no data")]
    EmptyResponse,

    /// A server error with status code and body.
    #[error("Server error ({status}): {body}")]
    Server { status: u16, body: String },

    /// A network or decoding error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Request parameters failed local validation.
    #[error("Invalid request: {0}")]
    Invalid(String),
}
