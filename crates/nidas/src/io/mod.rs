// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte transports.
//!
//! [`IOChannel`] is a sum type over the concrete transports with a shared
//! capability set: open/close, read/write, connection requests, and (for the
//! FileSet variant) time-based file rolling. [`IOStream`](stream::IOStream)
//! adds buffering with a latency-bounded flush policy on top of any channel.
//!
//! ```text
//!  IOStream (buffering, backup, latency flush)
//!     |
//!  IOChannel:  File | FileSet | Socket | ServerSocket
//!            | McSocket | MulticastSender | Pty | UnixSocket
//! ```
//!
//! Connection model: a channel may be asynchronous. Callers hand a
//! [`ConnectionRequester`] to [`IOChannel::request_connection`]; the channel
//! calls back `connected(channel)` from its own thread once established.
//! Listening variants fire the callback once per accepted peer with a derived
//! channel whose lifetime is independent of the listener.

pub mod fileset;
pub mod mcsocket;
pub mod pty;
pub mod socket;
pub mod stream;

pub use fileset::FileSet;
pub use mcsocket::{McSocket, McSocketListener, MulticastSender, RequestType};
pub use pty::PtyChannel;
pub use socket::{ServerSocket, SocketChannel, UnixChannel};
pub use stream::IOStream;

use crate::config::DEFAULT_SOCKET_PORT;
use crate::error::{Error, Result};
use crate::time::DsmTime;
use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Callback target for asynchronous connection establishment.
pub trait ConnectionRequester: Send + Sync {
    /// Called from the channel's connection thread when a channel is ready.
    fn connected(&self, channel: IOChannel);
}

/// Peer/endpoint description for status display.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub local: String,
    pub remote: String,
}

/// A plain file channel (read or write).
pub struct FileChannel {
    name: String,
    file: File,
}

impl FileChannel {
    pub fn open_read(path: impl Into<PathBuf>) -> Result<FileChannel> {
        let path = path.into();
        let name = path.display().to_string();
        let file = File::open(&path).map_err(|e| Error::io(&name, e))?;
        Ok(FileChannel { name, file })
    }

    pub fn create(path: impl Into<PathBuf>) -> Result<FileChannel> {
        let path = path.into();
        let name = path.display().to_string();
        let file = File::create(&path).map_err(|e| Error::io(&name, e))?;
        Ok(FileChannel { name, file })
    }

    /// Open for appending to an existing file.
    pub fn create_append(path: impl Into<PathBuf>) -> Result<FileChannel> {
        let path = path.into();
        let name = path.display().to_string();
        let file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| Error::io(&name, e))?;
        Ok(FileChannel { name, file })
    }
}

/// The transport sum type.
pub enum IOChannel {
    File(FileChannel),
    FileSet(FileSet),
    Socket(SocketChannel),
    ServerSocket(ServerSocket),
    McSocket(McSocket),
    MulticastSender(MulticastSender),
    Pty(PtyChannel),
    UnixSocket(UnixChannel),
}

impl IOChannel {
    pub fn name(&self) -> String {
        match self {
            IOChannel::File(c) => c.name.clone(),
            IOChannel::FileSet(c) => c.name(),
            IOChannel::Socket(c) => c.name().to_string(),
            IOChannel::ServerSocket(c) => c.name().to_string(),
            IOChannel::McSocket(c) => c.name().to_string(),
            IOChannel::MulticastSender(c) => c.name().to_string(),
            IOChannel::Pty(c) => c.name().to_string(),
            IOChannel::UnixSocket(c) => c.name().to_string(),
        }
    }

    /// Read into `buf`. Zero bytes at end-of-input surfaces as `Io(Eof)`.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self {
            IOChannel::File(c) => {
                let n = c.file.read(buf).map_err(|e| Error::io(&c.name, e))?;
                if n == 0 && !buf.is_empty() {
                    return Err(Error::eof(&c.name));
                }
                Ok(n)
            }
            IOChannel::FileSet(c) => c.read(buf),
            IOChannel::Socket(c) => c.read(buf),
            IOChannel::UnixSocket(c) => c.read(buf),
            IOChannel::Pty(c) => c.read(buf),
            IOChannel::McSocket(c) => c.read(buf),
            IOChannel::ServerSocket(c) => Err(Error::InvalidState(format!(
                "{}: listening channel does not read",
                c.name()
            ))),
            IOChannel::MulticastSender(c) => Err(Error::InvalidState(format!(
                "{}: datagram sender does not read",
                c.name()
            ))),
        }
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self {
            IOChannel::File(c) => c.file.write(buf).map_err(|e| Error::io(&c.name, e)),
            IOChannel::FileSet(c) => c.write(buf),
            IOChannel::Socket(c) => c.write(buf),
            IOChannel::UnixSocket(c) => c.write(buf),
            IOChannel::Pty(c) => c.write(buf),
            IOChannel::McSocket(c) => c.write(buf),
            IOChannel::ServerSocket(c) => Err(Error::InvalidState(format!(
                "{}: listening channel does not write",
                c.name()
            ))),
            IOChannel::MulticastSender(c) => c.send(buf),
        }
    }

    /// Flush and close. Errors on close are reported, not retried.
    pub fn close(&mut self) -> Result<()> {
        match self {
            IOChannel::File(c) => c.file.sync_all().map_err(|e| Error::io(&c.name, e)),
            IOChannel::FileSet(c) => c.close(),
            IOChannel::Socket(c) => c.close(),
            IOChannel::UnixSocket(c) => c.close(),
            IOChannel::Pty(_) | IOChannel::McSocket(_) | IOChannel::MulticastSender(_) => Ok(()),
            IOChannel::ServerSocket(c) => c.close(),
        }
    }

    /// Begin asynchronous connection; `requester.connected` fires from the
    /// channel's own thread. Listening variants fire once per peer.
    pub fn request_connection(self, requester: Arc<dyn ConnectionRequester>) -> Result<()> {
        match self {
            IOChannel::ServerSocket(c) => c.accept_loop(requester),
            IOChannel::McSocket(c) => c.request(requester),
            // Already-connected variants call back immediately.
            other => {
                requester.connected(other);
                Ok(())
            }
        }
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        match self {
            IOChannel::Socket(c) => c.connection_info(),
            IOChannel::UnixSocket(c) => c.connection_info(),
            other => ConnectionInfo {
                local: other.name(),
                remote: String::new(),
            },
        }
    }

    /// Next time-boundary at which this channel rolls to a new file.
    /// Non-rolling channels never roll.
    pub fn next_file_time(&self) -> DsmTime {
        match self {
            IOChannel::FileSet(c) => c.next_file_time(),
            _ => DsmTime::MAX,
        }
    }

    /// Flush the current file and open the one covering `tt`.
    pub fn create_file(&mut self, tt: DsmTime) -> Result<()> {
        match self {
            IOChannel::FileSet(c) => c.create_file(tt),
            _ => Ok(()),
        }
    }

    /// Current filename for status display, if file-backed.
    pub fn current_file(&self) -> Option<String> {
        match self {
            IOChannel::File(c) => Some(c.name.clone()),
            IOChannel::FileSet(c) => c.current_file(),
            _ => None,
        }
    }
}

/// Endpoint spec recognized by consumers: `sock:host[:port]`,
/// `unix:<path>`, or a bare path (file).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelSpec {
    Socket { host: String, port: u16 },
    Unix { path: PathBuf },
    File { path: PathBuf },
}

impl ChannelSpec {
    pub fn parse(spec: &str) -> Result<ChannelSpec> {
        if let Some(rest) = spec.strip_prefix("sock:") {
            let (host, port) = match rest.rsplit_once(':') {
                Some((h, p)) => {
                    let port = p.parse::<u16>().map_err(|_| {
                        Error::invalid_parameter("spec", format!("bad port in {spec}"))
                    })?;
                    (h.to_string(), port)
                }
                None => (rest.to_string(), DEFAULT_SOCKET_PORT),
            };
            if host.is_empty() {
                return Err(Error::invalid_parameter("spec", "empty host"));
            }
            Ok(ChannelSpec::Socket { host, port })
        } else if let Some(path) = spec.strip_prefix("unix:") {
            Ok(ChannelSpec::Unix { path: path.into() })
        } else {
            Ok(ChannelSpec::File { path: spec.into() })
        }
    }

    /// Open the endpoint for reading an archive stream.
    pub fn open_read(&self) -> Result<IOChannel> {
        match self {
            ChannelSpec::Socket { host, port } => Ok(IOChannel::Socket(
                socket::SocketChannel::connect(host, *port)?,
            )),
            ChannelSpec::Unix { path } => {
                Ok(IOChannel::UnixSocket(socket::UnixChannel::connect(path)?))
            }
            ChannelSpec::File { path } => Ok(IOChannel::File(FileChannel::open_read(path)?)),
        }
    }
}
