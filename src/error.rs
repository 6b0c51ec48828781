use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Display};
use std::io;

pub(crate) type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub(crate) struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, PartialEq, Fail)]
pub(crate) enum ErrorKind {
    #[fail(display = "lexical error: {}", _0)]
    Lexical(String),
    #[fail(display = "{}", _0)]
    Syntax(String),
    #[fail(display = "unknown variable name '{}'", _0)]
    UnknownVariable(String),
    #[fail(display = "unknown function referenced '{}'", _0)]
    UnknownFunction(String),
    #[fail(
        display = "incorrect # arguments passed to '{}': expected {}, found {}",
        callee, expected, found
    )]
    Arity {
        callee: String,
        expected: usize,
        found: usize,
    },
    #[fail(display = "invalid binary operator '{}'", _0)]
    InvalidOperator(char),
    #[fail(display = "backend: {}", _0)]
    Backend(String),
    #[fail(display = "i/o error")]
    Io,
}

impl Error {
    pub(crate) fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }

    pub(crate) fn syntax<S: Into<String>>(msg: S) -> Error {
        Error::from(ErrorKind::Syntax(msg.into()))
    }

    pub(crate) fn backend<S: Into<String>>(msg: S) -> Error {
        Error::from(ErrorKind::Backend(msg.into()))
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.cause() {
            Some(cause) => write!(f, "{}: {}", self.inner, cause),
            None => Display::fmt(&self.inner, f),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error {
            inner: e.context(ErrorKind::Io),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_kind_survives_conversion() {
        let e = Error::from(ErrorKind::InvalidOperator('/'));
        assert_eq!(e.kind(), &ErrorKind::InvalidOperator('/'));
        assert_eq!(e.to_string(), "invalid binary operator '/'");
    }

    #[test]
    fn test_io_error_keeps_cause() {
        let e = Error::from(io::Error::new(io::ErrorKind::Other, "pipe closed"));
        assert_eq!(e.kind(), &ErrorKind::Io);
        assert_eq!(e.to_string(), "i/o error: pipe closed");
    }

    #[test]
    fn test_arity_message() {
        let e = Error::from(ErrorKind::Arity {
            callee: "f".to_owned(),
            expected: 2,
            found: 1,
        });
        assert_eq!(
            e.to_string(),
            "incorrect # arguments passed to 'f': expected 2, found 1"
        );
    }
}
