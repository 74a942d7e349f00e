// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Raw non-blocking serial port for the modem's AT channel.
//!
//! Opened `O_NONBLOCK` in raw mode so the supervisor's per-tick polls
//! never stall the scheduler. Unix only; the supervisor is always built
//! against the [`ModemPort`](crate::cell::at::ModemPort) trait, so other
//! targets substitute their own port.

#![cfg(unix)]

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;

use crate::cell::at::ModemPort;

/// Non-blocking serial AT port.
pub struct SerialPort {
    fd: RawFd,
    device: String,
}

impl SerialPort {
    /// Open `device` at `baud` in raw non-blocking mode.
    pub fn open(device: &str, baud: u32) -> io::Result<Self> {
        let path = CString::new(device)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "NUL in device path"))?;

        // SAFETY: path is a valid NUL-terminated string; flags are plain
        // libc constants.
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let port = Self {
            fd,
            device: device.to_string(),
        };
        port.configure(baud)?;
        log::info!("[SerialPort] opened {} at {} baud", device, baud);
        Ok(port)
    }

    fn configure(&self, baud: u32) -> io::Result<()> {
        // SAFETY: fd is owned by self; termios is a plain C struct fully
        // initialized by tcgetattr before use.
        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(self.fd, &mut tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::cfmakeraw(&mut tio);
            // 8N1, receiver on, no modem control lines.
            tio.c_cflag |= libc::CREAD | libc::CLOCAL;
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = 0;

            let speed = baud_constant(baud)?;
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);

            if libc::tcsetattr(self.fd, libc::TCSANOW, &tio) != 0 {
                return Err(io::Error::last_os_error());
            }
            libc::tcflush(self.fd, libc::TCIOFLUSH);
        }
        Ok(())
    }
}

fn baud_constant(baud: u32) -> io::Result<libc::speed_t> {
    let speed = match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unsupported baud rate {}", other),
            ))
        }
    };
    Ok(speed)
}

impl ModemPort for SerialPort {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let framed = format!("{}\r", line);
        let bytes = framed.as_bytes();
        let mut written = 0usize;
        while written < bytes.len() {
            // SAFETY: buffer pointer and length describe a live slice.
            let n = unsafe {
                libc::write(
                    self.fd,
                    bytes[written..].as_ptr().cast(),
                    bytes.len() - written,
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    std::thread::yield_now();
                    continue;
                }
                return Err(err);
            }
            written += n as usize;
        }
        Ok(())
    }

    fn read_available(&mut self) -> io::Result<String> {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            // SAFETY: buf is a live, writable 256-byte buffer.
            let n = unsafe { libc::read(self.fd, buf.as_mut_ptr().cast(), buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(err);
            }
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
            if (n as usize) < buf.len() {
                break;
            }
        }
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        // SAFETY: fd was opened by us and is closed exactly once.
        unsafe {
            libc::close(self.fd);
        }
        log::debug!("[SerialPort] closed {}", self.device);
    }
}
