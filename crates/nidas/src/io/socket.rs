// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream socket channels: TCP, Unix-domain, and their listeners.
//!
//! Sockets are built through `socket2` so options (reuse-address, nodelay)
//! are set before bind/connect, then converted into std sockets for I/O.

use super::{ConnectionInfo, ConnectionRequester, IOChannel};
use crate::error::{Error, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Connected TCP channel.
pub struct SocketChannel {
    name: String,
    stream: TcpStream,
}

impl SocketChannel {
    /// Connect to `host:port`.
    pub fn connect(host: &str, port: u16) -> Result<SocketChannel> {
        let name = format!("sock:{host}:{port}");
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| Error::io(&name, e))?
            .next()
            .ok_or_else(|| Error::invalid_parameter("host", format!("{host}: no address")))?;

        let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::io(&name, e))?;
        sock.set_nodelay(true).map_err(|e| Error::io(&name, e))?;
        sock.connect_timeout(&addr.into(), Duration::from_secs(10))
            .map_err(|e| Error::io(&name, e))?;
        Ok(SocketChannel {
            name,
            stream: sock.into(),
        })
    }

    pub(crate) fn from_stream(stream: TcpStream, peer: SocketAddr) -> SocketChannel {
        SocketChannel {
            name: format!("sock:{peer}"),
            stream,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.stream.read(buf).map_err(|e| Error::io(&self.name, e))?;
        if n == 0 && !buf.is_empty() {
            return Err(Error::eof(&self.name));
        }
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(|e| Error::io(&self.name, e))
    }

    pub fn close(&mut self) -> Result<()> {
        self.stream
            .shutdown(Shutdown::Both)
            .map_err(|e| Error::io(&self.name, e))
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            local: self
                .stream
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
            remote: self
                .stream
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_default(),
        }
    }
}

/// Connected Unix-domain stream channel.
pub struct UnixChannel {
    name: String,
    stream: UnixStream,
}

impl UnixChannel {
    pub fn connect(path: impl AsRef<Path>) -> Result<UnixChannel> {
        let name = format!("unix:{}", path.as_ref().display());
        let stream = UnixStream::connect(path.as_ref()).map_err(|e| Error::io(&name, e))?;
        Ok(UnixChannel { name, stream })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.stream.read(buf).map_err(|e| Error::io(&self.name, e))?;
        if n == 0 && !buf.is_empty() {
            return Err(Error::eof(&self.name));
        }
        Ok(n)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.stream.write(buf).map_err(|e| Error::io(&self.name, e))
    }

    pub fn close(&mut self) -> Result<()> {
        self.stream
            .shutdown(Shutdown::Both)
            .map_err(|e| Error::io(&self.name, e))
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            local: self.name.clone(),
            remote: String::new(),
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

/// Listening channel. Each accepted peer becomes an independent connected
/// channel delivered through the [`ConnectionRequester`] callback.
pub struct ServerSocket {
    name: String,
    listener: Listener,
}

impl ServerSocket {
    /// Bind a TCP listener on `port`, all interfaces.
    pub fn bind(port: u16) -> Result<ServerSocket> {
        let name = format!("sock::{port}");
        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let sock = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| Error::io(&name, e))?;
        sock.set_reuse_address(true).map_err(|e| Error::io(&name, e))?;
        sock.bind(&addr.into()).map_err(|e| Error::io(&name, e))?;
        sock.listen(8).map_err(|e| Error::io(&name, e))?;
        Ok(ServerSocket {
            name,
            listener: Listener::Tcp(sock.into()),
        })
    }

    /// Bind a Unix-domain listener at `path`, replacing a stale socket file.
    pub fn bind_unix(path: impl Into<PathBuf>) -> Result<ServerSocket> {
        let path = path.into();
        let name = format!("unix:{}", path.display());
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| Error::io(&name, e))?;
        }
        let listener = UnixListener::bind(&path).map_err(|e| Error::io(&name, e))?;
        Ok(ServerSocket {
            name,
            listener: Listener::Unix(listener),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local address actually bound (useful with port 0).
    pub fn local_port(&self) -> Option<u16> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
            Listener::Unix(_) => None,
        }
    }

    pub fn close(&mut self) -> Result<()> {
        Ok(())
    }

    /// Consume the listener into an accept thread. Fires
    /// `requester.connected` once per accepted peer until accept fails.
    pub fn accept_loop(self, requester: Arc<dyn ConnectionRequester>) -> Result<()> {
        let name = self.name.clone();
        std::thread::Builder::new()
            .name(format!("accept {name}"))
            .spawn(move || match self.listener {
                Listener::Tcp(listener) => loop {
                    match listener.accept() {
                        Ok((stream, peer)) => {
                            log::info!("[ServerSocket] {name}: connection from {peer}");
                            requester
                                .connected(IOChannel::Socket(SocketChannel::from_stream(
                                    stream, peer,
                                )));
                        }
                        Err(e) => {
                            log::warn!("[ServerSocket] {name}: accept failed: {e}");
                            break;
                        }
                    }
                },
                Listener::Unix(listener) => loop {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            log::info!("[ServerSocket] {name}: connection");
                            requester.connected(IOChannel::UnixSocket(UnixChannel {
                                name: name.clone(),
                                stream,
                            }));
                        }
                        Err(e) => {
                            log::warn!("[ServerSocket] {name}: accept failed: {e}");
                            break;
                        }
                    }
                },
            })
            .map_err(|e| Error::io("accept thread", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Captured {
        channels: Mutex<Vec<IOChannel>>,
    }

    impl ConnectionRequester for Captured {
        fn connected(&self, channel: IOChannel) {
            self.channels.lock().push(channel);
        }
    }

    #[test]
    fn test_tcp_accept_and_exchange() {
        let server = ServerSocket::bind(0).expect("bind");
        let port = server.local_port().expect("port");
        let captured = Arc::new(Captured {
            channels: Mutex::new(Vec::new()),
        });
        server
            .accept_loop(captured.clone())
            .expect("accept thread");

        let mut client = SocketChannel::connect("127.0.0.1", port).expect("connect");
        client.write(b"ping").expect("write");

        // wait for the accept thread to deliver the peer channel
        let mut peer = loop {
            if let Some(ch) = captured.channels.lock().pop() {
                break ch;
            }
            std::thread::sleep(Duration::from_millis(5));
        };

        let mut buf = [0u8; 8];
        let n = peer.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"ping");

        client.close().expect("close");
        assert!(peer.read(&mut buf).unwrap_err().is_eof());
    }

    #[test]
    fn test_unix_socket_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nidas.sock");
        let server = ServerSocket::bind_unix(&path).expect("bind");
        let captured = Arc::new(Captured {
            channels: Mutex::new(Vec::new()),
        });
        server.accept_loop(captured.clone()).expect("accept");

        let mut client = UnixChannel::connect(&path).expect("connect");
        client.write(b"hello").expect("write");

        let mut peer = loop {
            if let Some(ch) = captured.channels.lock().pop() {
                break ch;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        let mut buf = [0u8; 8];
        let n = peer.read(&mut buf).expect("read");
        assert_eq!(&buf[..n], b"hello");
    }
}
