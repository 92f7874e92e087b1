// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Pseudo-terminal channel, used to simulate serial sensors.
//!
//! Opens the pty master non-blocking; the slave path is handed to whatever
//! process plays the sensor. The fd closes on drop.

use crate::error::{Error, Result};
use std::ffi::CStr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

pub struct PtyChannel {
    name: String,
    master: OwnedFd,
    slave_path: String,
}

impl PtyChannel {
    /// Open a new pty master. Reads are non-blocking, per the acquisition
    /// loop's requirements.
    pub fn open() -> Result<PtyChannel> {
        // SAFETY: posix_openpt/grantpt/unlockpt/ptsname_r are used per their
        // contracts; the fd is immediately wrapped in OwnedFd.
        unsafe {
            let fd = libc::posix_openpt(libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK);
            if fd < 0 {
                return Err(Error::io("pty", std::io::Error::last_os_error()));
            }
            let master = OwnedFd::from_raw_fd(fd);
            if libc::grantpt(fd) != 0 || libc::unlockpt(fd) != 0 {
                return Err(Error::io("pty", std::io::Error::last_os_error()));
            }
            let mut buf = [0 as libc::c_char; 128];
            if libc::ptsname_r(fd, buf.as_mut_ptr(), buf.len()) != 0 {
                return Err(Error::io("pty", std::io::Error::last_os_error()));
            }
            let slave_path = CStr::from_ptr(buf.as_ptr())
                .to_string_lossy()
                .into_owned();
            Ok(PtyChannel {
                name: format!("pty:{slave_path}"),
                master,
                slave_path,
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path a peer opens to play the sensor side.
    pub fn slave_path(&self) -> &str {
        &self.slave_path
    }

    pub fn raw_fd(&self) -> i32 {
        self.master.as_raw_fd()
    }

    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        // SAFETY: fd is owned and open; buf bounds are passed explicitly.
        let n = unsafe {
            libc::read(
                self.master.as_raw_fd(),
                buf.as_mut_ptr().cast(),
                buf.len(),
            )
        };
        if n < 0 {
            return Err(Error::io(&self.name, std::io::Error::last_os_error()));
        }
        if n == 0 && !buf.is_empty() {
            return Err(Error::eof(&self.name));
        }
        Ok(n as usize)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        // SAFETY: fd is owned and open; buf bounds are passed explicitly.
        let n = unsafe {
            libc::write(self.master.as_raw_fd(), buf.as_ptr().cast(), buf.len())
        };
        if n < 0 {
            return Err(Error::io(&self.name, std::io::Error::last_os_error()));
        }
        Ok(n as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn test_pty_echo_through_slave() {
        let mut pty = match PtyChannel::open() {
            Ok(p) => p,
            // containers without /dev/pts get a pass, not a failure
            Err(_) => return,
        };
        assert!(pty.slave_path().starts_with("/dev/"));

        let mut slave = match std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(pty.slave_path())
        {
            Ok(f) => f,
            Err(_) => return,
        };
        slave.write_all(b"$GPGGA,").expect("slave write");

        // non-blocking master may need a moment
        let mut buf = [0u8; 16];
        let mut got = 0;
        for _ in 0..100 {
            match pty.read(&mut buf[got..]) {
                Ok(n) => {
                    got += n;
                    if got >= 7 {
                        break;
                    }
                }
                Err(e) if e.is_temporary() => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                Err(e) => panic!("pty read: {e}"),
            }
        }
        assert_eq!(&buf[..7], b"$GPGGA,");

        pty.write(b"ok\n").expect("master write");
        let mut echo = [0u8; 3];
        slave.read_exact(&mut echo).expect("slave read");
        assert_eq!(&echo, b"ok\n");
    }
}
