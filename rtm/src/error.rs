use std::io;

/// The kind of an [`Error`].
///
/// Protocol level failures reported by the service (a negative reply, a
/// subscription error) are never turned into an `Error`; they are delivered
/// through the reply and event handlers instead.
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum ErrorKind {
    #[error("IO error")]
    Io(io::ErrorKind),
    #[error("JSON Serialization Error")]
    SerdeJsonSer(serde_json::error::Category),
    #[error("JSON Deserialization Error of '{0}'")]
    SerdeJsonDe(String),
    #[error("Connection error ({code}): {reason}")]
    Connection { code: u16, reason: String },
    #[error("Client is a single-use object. You can't connect twice.")]
    SingleUse,
    #[error("Invalid key for message authentication")]
    InvalidKey,
    #[error("Invalid endpoint: '{0}'")]
    InvalidEndpoint(String),
}

impl ErrorKind {
    /// A connection failure with the abnormal closure code 1006.
    pub fn abnormal<S: Into<String>>(reason: S) -> Self {
        ErrorKind::Connection {
            code: crate::pdu::CLOSE_ABNORMAL,
            reason: reason.into(),
        }
    }

    /// Returns `true` for [`ErrorKind::Connection`].
    pub fn is_connection(&self) -> bool {
        matches!(self, ErrorKind::Connection { .. })
    }
}

impl From<&io::Error> for ErrorKind {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::UnexpectedEof => ErrorKind::abnormal("Socket is closed"),
            kind => ErrorKind::Io(kind),
        }
    }
}

impl From<&serde_json::Error> for ErrorKind {
    fn from(e: &serde_json::Error) -> Self {
        ErrorKind::SerdeJsonSer(e.classify())
    }
}

pub struct Error(
    pub ErrorKind,
    pub Option<Box<dyn std::error::Error + 'static + Send + Sync>>,
    pub Option<&'static str>,
);

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        &self.0
    }

    /// Close code carried by a connection error.
    pub fn close_code(&self) -> Option<u16> {
        match self.0 {
            ErrorKind::Connection { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(e: ErrorKind) -> Self {
        Error(e, None, None)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.1
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        use std::error::Error as StdError;

        if let Some(ref o) = self.2 {
            std::fmt::Display::fmt(o, f)?;
        }

        std::fmt::Debug::fmt(&self.0, f)?;
        if let Some(e) = self.source() {
            std::fmt::Display::fmt("\nCaused by:\n", f)?;
            std::fmt::Debug::fmt(&e, f)?;
        }
        Ok(())
    }
}

/// Builds an [`Error`] from an [`ErrorKind`], optionally with a source
/// error, recording the call site.
#[macro_export]
macro_rules! context {
    ( $k:expr ) => {{
        $crate::error::Error($k, None, Some(concat!(file!(), ":", line!(), ": ")))
    }};
    ( $e:expr, $k:expr ) => {{
        $crate::error::Error(
            $k,
            Some(Box::from($e)),
            Some(concat!(file!(), ":", line!(), ": ")),
        )
    }};
}

/// Closure for `map_err` that derives the [`ErrorKind`] from the source
/// error and keeps the source.
#[macro_export]
macro_rules! map_context {
    () => {
        |e| {
            let kind = $crate::error::ErrorKind::from(&e);
            $crate::context!(e, kind)
        }
    };
}

pub type Result<T> = std::result::Result<T, Error>;
