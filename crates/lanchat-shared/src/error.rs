use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty line")]
    Empty,

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Missing argument for {0}")]
    MissingArgument(&'static str),

    #[error("Invalid number in {field}: {value}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("Invalid base64 payload")]
    InvalidBase64,
}

/// Reasons a credential is refused.
///
/// These never leave the server: the session just keeps withholding
/// processing, whatever the variant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Malformed credential")]
    Malformed,

    #[error("Unsupported token algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("Signature mismatch")]
    BadSignature,

    #[error("Token has no subject")]
    MissingSubject,

    #[error("Token expired")]
    Expired,

    #[error("Scheme not enabled on this server")]
    SchemeDisabled,
}
