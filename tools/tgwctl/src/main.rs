// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! tgwctl: operator console client for a running tgw-agent.
//!
//! ```bash
//! tgwctl ms                     # pool summary (default agent on localhost)
//! tgwctl ms use                 # per-sensor chain usage
//! tgwctl net                    # interface manager status
//! tgwctl cell                   # cellular supervisor status
//! tgwctl ppp logs 40            # last 40 PPP log lines
//! tgwctl -a 10.0.0.5:4245 net   # remote agent
//! ```

use std::io::{Read, Write};
use std::net::TcpStream;

fn main() {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut addr = format!("127.0.0.1:{}", tgw::CONSOLE_PORT);
    if args.first().map(String::as_str) == Some("-a") {
        args.remove(0);
        if args.is_empty() {
            eprintln!("-a needs an address");
            std::process::exit(2);
        }
        addr = args.remove(0);
    }

    if args.is_empty() {
        eprintln!("usage: tgwctl [-a host:port] <command...>");
        eprintln!("commands: ms | ms use | debug <hex> | net | cell | ppp <...>");
        std::process::exit(2);
    }
    let command = args.join(" ");

    match TcpStream::connect(&addr) {
        Ok(mut stream) => {
            if let Err(e) = send_command(&mut stream, &command) {
                eprintln!("console I/O failed: {}", e);
                std::process::exit(1);
            }
        }
        Err(e) => {
            eprintln!("cannot reach tgw-agent at {}: {}", addr, e);
            eprintln!("is the agent running with the console enabled?");
            std::process::exit(1);
        }
    }
}

fn send_command(stream: &mut TcpStream, command: &str) -> std::io::Result<()> {
    stream.write_all(command.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    stream.shutdown(std::net::Shutdown::Write)?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    print!("{}", reply);
    Ok(())
}
