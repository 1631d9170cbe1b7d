use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Binary not found: {0}")]
    BinaryNotFound(String),

    #[error("Input not found: {}", .0.display())]
    InputNotFound(PathBuf),

    #[error("Timed out after {0}s")]
    Timeout(u64),

    #[error("Process failure ({tool}): {message}")]
    ProcessFailure { tool: String, message: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Comparison error: {0}")]
    Comparison(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Template error: {0}")]
    Template(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn binary_not_found(name: impl Into<String>) -> Self {
        Self::BinaryNotFound(name.into())
    }

    pub fn input_not_found(path: impl Into<PathBuf>) -> Self {
        Self::InputNotFound(path.into())
    }

    pub fn process(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessFailure {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    pub fn comparison(msg: impl Into<String>) -> Self {
        Self::Comparison(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_missing_piece() {
        assert_eq!(
            Error::binary_not_found("circomspect").to_string(),
            "Binary not found: circomspect"
        );
        assert_eq!(
            Error::input_not_found("/tmp/c.circom").to_string(),
            "Input not found: /tmp/c.circom"
        );
        assert_eq!(
            Error::process("picus", "exit code 127").to_string(),
            "Process failure (picus): exit code 127"
        );
        assert_eq!(
            Error::template("missing field").to_string(),
            "Template error: missing field"
        );
    }

    #[test]
    fn io_errors_convert() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
