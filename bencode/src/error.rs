pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A required dictionary key was absent.
    MissingKey,
    /// The input is not well formed bencode.
    InvalidData,
    /// The input ended in the middle of a value.
    UnexpectedEof,
    /// Extra bytes follow the top level value.
    TrailingData,
    /// The value is well formed but does not have the expected shape.
    Other,
}

pub struct Error {
    kind: ErrorKind,
    offset: Option<usize>,
    context: Vec<String>,
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Error");
        s.field("kind", &self.kind);
        if let Some(offset) = self.offset {
            s.field("offset", &offset);
        }
        if !self.context.is_empty() {
            s.field("context", &self.context);
        }
        s.finish()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            ErrorKind::MissingKey => f.write_str("missing key")?,
            ErrorKind::InvalidData => f.write_str("invalid bencode")?,
            ErrorKind::UnexpectedEof => f.write_str("unexpected end of input")?,
            ErrorKind::TrailingData => f.write_str("trailing data after value")?,
            ErrorKind::Other => f.write_str("unexpected value")?,
        }
        if let Some(offset) = self.offset {
            write!(f, " at byte {offset}")?;
        }
        // innermost context was pushed first, print outermost first
        for line in self.context.iter().rev() {
            write!(f, ": {line}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            offset: None,
            context: Vec::new(),
        }
    }

    pub(crate) fn at(kind: ErrorKind, offset: usize) -> Self {
        Self {
            kind,
            offset: Some(offset),
            context: Vec::new(),
        }
    }

    pub(crate) fn missing_key(key: &[u8]) -> Self {
        let mut err = Self::new(ErrorKind::MissingKey);
        err.add_context(format!("'{}'", TryDisplayUtf8(key)));
        err
    }

    pub fn message(msg: impl Into<String>) -> Self {
        let mut err = Self::new(ErrorKind::Other);
        err.add_context(msg.into());
        err
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    fn add_context(&mut self, msg: String) {
        self.context.push(msg);
    }
}

pub trait Context<T> {
    fn context(self, context: &str) -> Result<T>;
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T> Context<T> for Result<T> {
    fn context(mut self, context: &str) -> Result<T> {
        if let Err(ref mut error) = self {
            error.add_context(context.to_string());
        }
        self
    }

    fn with_context<F: FnOnce() -> String>(mut self, f: F) -> Result<T> {
        if let Err(ref mut error) = self {
            error.add_context(f());
        }
        self
    }
}

pub(crate) struct TryDisplayUtf8<'a>(pub &'a [u8]);

impl std::fmt::Display for TryDisplayUtf8<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match std::str::from_utf8(self.0) {
            Ok(str) => f.write_str(str),
            _ => write!(f, "{:?}", self.0),
        }
    }
}
