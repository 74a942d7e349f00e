// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Line-oriented TCP console server.
//!
//! Accepts connections on the configured port, reads commands one line at
//! a time, and writes the dispatcher's reply. Connections are handled on
//! short-lived threads; the accept loop polls a shutdown flag so `Drop`
//! can join it.

use socket2::{Domain, Protocol, Socket, Type};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::console::Console;
use crate::error::{Error, Result};

/// Poll interval of the accept loop (bounds shutdown latency).
const ACCEPT_POLL: Duration = Duration::from_millis(200);
/// Per-connection read deadline.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(30);

/// The running console listener.
pub struct ConsoleServer {
    port: u16,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<thread::JoinHandle<()>>,
}

impl ConsoleServer {
    /// Bind and start accepting. Port 0 binds an ephemeral port (tests).
    pub fn bind(bind_addr: &str, port: u16, console: Arc<Console>) -> Result<Self> {
        let listener = create_listener(bind_addr, port)
            .map_err(|e| Error::BindFailed(format!("{}:{}: {}", bind_addr, port, e)))?;
        let local_port = listener
            .local_addr()
            .map(|a| a.port())
            .map_err(|e| Error::BindFailed(e.to_string()))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = spawn_accept_thread(listener, shutdown.clone(), console);
        log::info!("[ConsoleServer] listening on {}:{}", bind_addr, local_port);

        Ok(Self {
            port: local_port,
            shutdown,
            accept_thread: Some(accept_thread),
        })
    }

    /// Actual listen port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Signal the accept loop to exit.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

impl Drop for ConsoleServer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

fn create_listener(bind_addr: &str, port: u16) -> std::io::Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", bind_addr, port).parse().map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid address: {}", e),
        )
    })?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(16)?;

    let listener: TcpListener = socket.into();
    listener.set_nonblocking(true)?;
    Ok(listener)
}

fn spawn_accept_thread(
    listener: TcpListener,
    shutdown: Arc<AtomicBool>,
    console: Arc<Console>,
) -> thread::JoinHandle<()> {
    thread::Builder::new()
        .name("tgw-console".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                match listener.accept() {
                    Ok((stream, peer)) => {
                        log::debug!("[ConsoleServer] connection from {}", peer);
                        let console = console.clone();
                        let _ = thread::Builder::new()
                            .name("tgw-console-client".into())
                            .spawn(move || {
                                if let Err(e) = serve_client(stream, &console) {
                                    log::debug!("[ConsoleServer] client {}: {}", peer, e);
                                }
                            });
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) => {
                        log::warn!("[ConsoleServer] accept failed: {}", e);
                        thread::sleep(ACCEPT_POLL);
                    }
                }
            }
            log::info!("[ConsoleServer] accept loop stopped");
        })
        .expect("spawn console accept thread")
}

/// One command per line; the reply is terminated by a blank line.
fn serve_client(stream: TcpStream, console: &Console) -> std::io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(CLIENT_TIMEOUT))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(()); // EOF
        }
        let cmd = line.trim();
        if cmd.is_empty() || cmd == "quit" {
            return Ok(());
        }
        let reply = console.dispatch(cmd);
        writer.write_all(reply.as_bytes())?;
        writer.write_all(b"\n")?;
        writer.flush()?;
    }
}

// ============================================================================
// TESTS
// ============================================================================
