// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2018 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! A small gRPC-`StatusCode`-flavored error type.
//!
//! There's no `anyhow`/`failure` dependency here: `Error` carries a kind, an
//! optional message, and an optional boxed cause, and `.chain()` walks the
//! `source()` chain for logging. Build one with the `err!`/`bail!` macros
//! rather than constructing `Error` directly.

use std::fmt;

/// Error kind.
///
/// These codes are taken from
/// [grpc::StatusCode](https://github.com/grpc/grpc/blob/0e00c430827e81d61e1e7164ef04ca21ccbfaa77/include/grpcpp/impl/codegen/status_code_enum.h),
/// which is a nice general-purpose classification of errors. See that link
/// for descriptions of each error.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[non_exhaustive]
#[rustfmt::skip]
pub enum ErrorKind {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Unknown => "Unknown",
            ErrorKind::InvalidArgument => "Invalid argument",
            ErrorKind::DeadlineExceeded => "Deadline exceeded",
            ErrorKind::NotFound => "Not found",
            ErrorKind::AlreadyExists => "Already exists",
            ErrorKind::PermissionDenied => "Permission denied",
            ErrorKind::Unauthenticated => "Unauthenticated",
            ErrorKind::ResourceExhausted => "Resource exhausted",
            ErrorKind::FailedPrecondition => "Failed precondition",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::OutOfRange => "Out of range",
            ErrorKind::Unimplemented => "Unimplemented",
            ErrorKind::Internal => "Internal",
            ErrorKind::Unavailable => "Unavailable",
            ErrorKind::DataLoss => "Data loss",
        })
    }
}

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

pub struct Error {
    kind: ErrorKind,
    msg: Option<String>,
    cause: Option<Cause>,
}

impl Error {
    #[doc(hidden)]
    pub fn new_(kind: ErrorKind, msg: Option<String>, cause: Option<Cause>) -> Self {
        Error { kind, msg, cause }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns an iterator over this error's message (if any) followed by
    /// the `source()` chain, suitable for `%e.chain()` in a `tracing` event.
    pub fn chain(&self) -> Chain<'_> {
        Chain {
            next: Some(self as &(dyn std::error::Error + 'static)),
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.msg {
            Some(m) => write!(f, "{}: {}", self.kind, m),
            None => fmt::Display::fmt(&self.kind, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause.as_deref().map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error::new_(kind, None, None)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        let kind = match e.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            std::io::ErrorKind::TimedOut => ErrorKind::DeadlineExceeded,
            _ => ErrorKind::Unknown,
        };
        Error::new_(kind, None, Some(Box::new(e)))
    }
}

/// Iterator over an `Error`'s message followed by its `source()` chain.
pub struct Chain<'a> {
    next: Option<&'a (dyn std::error::Error + 'static)>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a (dyn std::error::Error + 'static);

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        self.next = cur.source();
        Some(cur)
    }
}

impl fmt::Display for Chain<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut chain = Chain { next: self.next };
        let mut first = true;
        while let Some(e) = chain.next() {
            if !first {
                f.write_str(": ")?;
            }
            write!(f, "{e}")?;
            first = false;
        }
        Ok(())
    }
}

/// Extension methods for `Result`.
pub trait ResultExt<T> {
    /// Annotates an error with the given kind, wrapping it as the cause.
    fn err_kind(self, k: ErrorKind) -> Result<T, Error>;
}

impl<T, E> ResultExt<T> for Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn err_kind(self, k: ErrorKind) -> Result<T, Error> {
        self.map_err(|e| Error::new_(k, None, Some(Box::new(e))))
    }
}

/// Builds an [`Error`] with a given [`ErrorKind`].
///
/// ```ignore
/// err!(NotFound, msg("no such stream {}", id));
/// err!(Internal, source(io_err));
/// err!(Internal, msg("while opening {}", path), source(io_err));
/// ```
#[macro_export]
macro_rules! err {
    ($kind:ident, msg($($arg:tt)+)) => {
        $crate::Error::new_($crate::ErrorKind::$kind, Some(format!($($arg)+)), None)
    };
    ($kind:ident, source($src:expr)) => {
        $crate::Error::new_(
            $crate::ErrorKind::$kind,
            None,
            Some(Box::new($src) as Box<dyn std::error::Error + Send + Sync + 'static>),
        )
    };
    ($kind:ident, msg($($arg:tt)+), source($src:expr)) => {
        $crate::Error::new_(
            $crate::ErrorKind::$kind,
            Some(format!($($arg)+)),
            Some(Box::new($src) as Box<dyn std::error::Error + Send + Sync + 'static>),
        )
    };
}

/// Like [`err!`], but returns immediately with `Err(...)`.
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return Err($crate::err!($($args)+))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msg_only() {
        let e: Error = (|| -> Result<(), Error> { bail!(NotFound, msg("no such stream {}", 1)) })()
            .unwrap_err();
        assert_eq!(e.kind(), ErrorKind::NotFound);
        assert_eq!(e.to_string(), "Not found: no such stream 1");
    }

    #[test]
    fn source_chain() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e = err!(Internal, msg("writing chunk"), source(io_err));
        assert_eq!(e.chain().count(), 2);
        assert_eq!(e.chain().to_string(), "Internal: writing chunk: disk full");
    }
}
