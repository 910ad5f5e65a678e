use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum TokenError {
    #[error("Invalid token length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid token character: {0:?}")]
    InvalidCharacter(char),

    #[error("Salt must not be empty")]
    EmptySalt,
}
