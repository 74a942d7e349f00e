// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Non-blocking AT command exchanges.
//!
//! The supervisor never blocks the scheduler: it sends a command, then
//! polls the port's read side once per tick until a terminal response
//! (`OK`, `ERROR`, `+CME ERROR`) or the deadline arrives.

use std::io;
use std::time::{Duration, Instant};

/// Byte-level access to the modem's AT command port.
///
/// Production uses the serial port; tests script the conversation.
pub trait ModemPort: Send {
    /// Write one command line (CR appended by the implementation).
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Read whatever has arrived, without blocking. Empty string when
    /// nothing is pending.
    fn read_available(&mut self) -> io::Result<String>;
}

/// Progress of an in-flight exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Still waiting for a terminal response.
    Pending,
    /// Terminal response received; the full accumulated reply.
    Done(String),
    /// Deadline passed without a terminal response.
    TimedOut,
}

/// One in-flight AT command.
#[derive(Debug)]
pub struct AtExchange {
    cmd: String,
    buf: String,
    deadline: Instant,
}

impl AtExchange {
    /// Send `cmd` and start the response clock.
    pub fn send(
        port: &mut dyn ModemPort,
        cmd: &str,
        now: Instant,
        timeout: Duration,
    ) -> io::Result<Self> {
        port.write_line(cmd)?;
        Ok(Self {
            cmd: cmd.to_string(),
            buf: String::new(),
            deadline: now + timeout,
        })
    }

    /// The command this exchange is waiting on.
    pub fn command(&self) -> &str {
        &self.cmd
    }

    /// Poll once; accumulates input and checks for a terminal response.
    pub fn poll(&mut self, port: &mut dyn ModemPort, now: Instant) -> io::Result<ExchangeStatus> {
        let chunk = port.read_available()?;
        if !chunk.is_empty() {
            self.buf.push_str(&chunk);
        }

        if is_terminal(&self.buf) {
            return Ok(ExchangeStatus::Done(std::mem::take(&mut self.buf)));
        }
        if now >= self.deadline {
            return Ok(ExchangeStatus::TimedOut);
        }
        Ok(ExchangeStatus::Pending)
    }
}

fn is_terminal(buf: &str) -> bool {
    buf.lines().any(|l| {
        let l = l.trim();
        l == "OK" || l == "ERROR" || l.starts_with("+CME ERROR") || l.starts_with("+CMS ERROR")
    })
}

/// True when the reply carries a final `OK`.
pub fn reply_ok(reply: &str) -> bool {
    reply.lines().any(|l| l.trim() == "OK")
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted port: each written command pops the next canned reply,
    /// which is then dribbled out by `read_available`.
    pub struct ScriptPort {
        pub replies: VecDeque<String>,
        pending: String,
        pub sent: Vec<String>,
    }

    impl ScriptPort {
        pub fn new() -> Self {
            Self {
                replies: VecDeque::new(),
                pending: String::new(),
                sent: Vec::new(),
            }
        }
    }

    impl ModemPort for ScriptPort {
        fn write_line(&mut self, line: &str) -> io::Result<()> {
            self.sent.push(line.to_string());
            if let Some(reply) = self.replies.pop_front() {
                self.pending = reply;
            }
            Ok(())
        }

        fn read_available(&mut self) -> io::Result<String> {
            Ok(std::mem::take(&mut self.pending))
        }
    }

    #[test]
    fn test_exchange_completes_on_ok() {
        let mut port = ScriptPort::new();
        port.replies.push_back("ATZ\r\nOK\r\n".into());

        let now = Instant::now();
        let mut ex =
            AtExchange::send(&mut port, "ATZ", now, Duration::from_secs(5)).expect("send");
        match ex.poll(&mut port, now).expect("poll") {
            ExchangeStatus::Done(reply) => assert!(reply_ok(&reply)),
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_exchange_pends_then_times_out() {
        let mut port = ScriptPort::new();
        // No reply scripted: the modem stays silent.
        let now = Instant::now();
        let mut ex =
            AtExchange::send(&mut port, "AT+CREG?", now, Duration::from_secs(5)).expect("send");

        assert_eq!(
            ex.poll(&mut port, now + Duration::from_secs(1)).expect("poll"),
            ExchangeStatus::Pending
        );
        assert_eq!(
            ex.poll(&mut port, now + Duration::from_secs(6)).expect("poll"),
            ExchangeStatus::TimedOut
        );
    }

    #[test]
    fn test_cme_error_is_terminal() {
        let mut port = ScriptPort::new();
        port.replies.push_back("+CME ERROR: SIM not inserted\r\n".into());

        let now = Instant::now();
        let mut ex =
            AtExchange::send(&mut port, "AT+COPS?", now, Duration::from_secs(5)).expect("send");
        match ex.poll(&mut port, now).expect("poll") {
            ExchangeStatus::Done(reply) => assert!(!reply_ok(&reply)),
            other => panic!("expected Done, got {:?}", other),
        }
    }

    #[test]
    fn test_partial_reply_accumulates() {
        struct Dribble {
            chunks: VecDeque<&'static str>,
        }
        impl ModemPort for Dribble {
            fn write_line(&mut self, _line: &str) -> io::Result<()> {
                Ok(())
            }
            fn read_available(&mut self) -> io::Result<String> {
                Ok(self.chunks.pop_front().unwrap_or("").to_string())
            }
        }

        let mut port = Dribble {
            chunks: VecDeque::from(["+CREG: 0,", "1\r\n", "OK\r\n"]),
        };
        let now = Instant::now();
        let mut ex =
            AtExchange::send(&mut port, "AT+CREG?", now, Duration::from_secs(5)).expect("send");

        assert_eq!(ex.poll(&mut port, now).expect("p"), ExchangeStatus::Pending);
        assert_eq!(ex.poll(&mut port, now).expect("p"), ExchangeStatus::Pending);
        match ex.poll(&mut port, now).expect("p") {
            ExchangeStatus::Done(reply) => assert!(reply.contains("+CREG: 0,1")),
            other => panic!("expected Done, got {:?}", other),
        }
    }
}
