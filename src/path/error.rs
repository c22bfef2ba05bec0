use std::fmt;

#[derive(Debug, Clone)]
pub enum IntoNodePathError {
    UnrepresentableStr,
    EmptyPath,
}

impl std::error::Error for IntoNodePathError {}

impl fmt::Display for IntoNodePathError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl IntoNodePathError {
    pub fn as_str(&self) -> &str {
        match self {
            IntoNodePathError::UnrepresentableStr => "unrepresentable string found in path",
            IntoNodePathError::EmptyPath => "no path provided",
        }
    }

    pub fn as_io_error(&self) -> std::io::Error {
        use std::io::{Error, ErrorKind};
        Error::new(ErrorKind::InvalidInput, self.as_str())
    }
}
