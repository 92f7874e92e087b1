// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error taxonomy for the sample pipeline.
//!
//! The set of error kinds is closed: every fallible operation in the crate
//! reports one of the variants below. `Io(Eof)` is ordinary end-of-input and
//! terminates read loops without being a pipeline failure.

use std::io;
use thiserror::Error;

/// Classification of an I/O failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoKind {
    /// End of input. Expected; ends a read loop, never a program failure.
    Eof,
    /// Interrupted system call; the operation should be retried.
    Interrupted,
    /// Transient condition (EAGAIN, connection refused); retry with backoff.
    Temporary,
    /// Peer closed the connection (EPIPE, ECONNRESET).
    ConnectionClosed,
    /// Unrecoverable; the owning channel disconnects.
    Fatal,
}

/// Which layer a parse failure occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseKind {
    /// Archive or sync-record header.
    Header,
    /// Per-sample frame or payload.
    Sample,
    /// Configuration text (path templates, scanner specs).
    Config,
}

/// Pipeline errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{name}: {kind:?}: {source}")]
    Io {
        /// Channel or device name the failure belongs to.
        name: String,
        kind: IoKind,
        #[source]
        source: io::Error,
    },

    #[error("{kind:?} parse error at byte {offset}: {msg}")]
    Parse {
        kind: ParseKind,
        /// Byte offset into the stream where parsing failed.
        offset: u64,
        msg: String,
    },

    #[error("invalid parameter {name}: {msg}")]
    InvalidParameter { name: String, msg: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("checksum mismatch on {name}")]
    ChecksumMismatch { name: String },
}

impl Error {
    /// Wrap an `io::Error`, classifying it into an [`IoKind`].
    pub fn io(name: impl Into<String>, source: io::Error) -> Self {
        let kind = match source.kind() {
            io::ErrorKind::UnexpectedEof => IoKind::Eof,
            io::ErrorKind::Interrupted => IoKind::Interrupted,
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::ConnectionRefused => {
                IoKind::Temporary
            }
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => IoKind::ConnectionClosed,
            _ => IoKind::Fatal,
        };
        Error::Io {
            name: name.into(),
            kind,
            source,
        }
    }

    /// An explicit end-of-input marker for `name`.
    pub fn eof(name: impl Into<String>) -> Self {
        Error::Io {
            name: name.into(),
            kind: IoKind::Eof,
            source: io::Error::new(io::ErrorKind::UnexpectedEof, "end of input"),
        }
    }

    pub fn parse(kind: ParseKind, offset: u64, msg: impl Into<String>) -> Self {
        Error::Parse {
            kind,
            offset,
            msg: msg.into(),
        }
    }

    pub fn invalid_parameter(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::InvalidParameter {
            name: name.into(),
            msg: msg.into(),
        }
    }

    /// True if this is `Io(Eof)`.
    pub fn is_eof(&self) -> bool {
        matches!(
            self,
            Error::Io {
                kind: IoKind::Eof,
                ..
            }
        )
    }

    /// True if the operation should be retried after a short delay.
    pub fn is_temporary(&self) -> bool {
        matches!(
            self,
            Error::Io {
                kind: IoKind::Temporary | IoKind::Interrupted,
                ..
            }
        )
    }

    /// True if the owning channel should disconnect and schedule a reconnect.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Error::Io {
                kind: IoKind::ConnectionClosed | IoKind::Fatal,
                ..
            }
        )
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
