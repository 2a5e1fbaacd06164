// MIT License - Copyright (c) 2021 TJForc

//! Timeout-bounded reads and spaced writes over one transport.

use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, trace, warn};

use crate::config::WaitPolicy;
use crate::constants::{CR, LF, VRCOP_LINE_LIMIT};
use crate::error::{LinkError, Result};
use crate::transport::Transport;

/// Traffic and error counters for one link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub frames_in: u64,
    pub frames_out: u64,
    pub bad_messages: u64,
    pub unknown_messages: u64,
    pub timeouts: u64,
    pub naks: u64,
}

/// Exclusive owner of an open transport.
///
/// Every read is sliced into ticks so the shutdown flag is seen within one
/// tick. Writes are spaced by the minimum send interval, measured from the
/// end of the previous write.
pub struct Link {
    stream: BufReader<Box<dyn Transport>>,
    line: Vec<u8>,
    min_interval: Duration,
    next_send: Instant,
    tick: Duration,
    extension: Duration,
    write_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    stats: LinkStats,
}

impl Link {
    pub fn new(
        stream: Box<dyn Transport>,
        min_interval: Duration,
        policy: &WaitPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            stream: BufReader::new(stream),
            line: Vec::with_capacity(128),
            min_interval,
            next_send: Instant::now(),
            tick: policy.read_tick(),
            extension: policy.read_extension(),
            write_timeout: policy.write_timeout(),
            shutdown,
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn stats_mut(&mut self) -> &mut LinkStats {
        &mut self.stats
    }

    /// Fails with `Shutdown` once the owner has asked the driver to stop.
    pub fn check_shutdown(&self) -> Result<()> {
        if *self.shutdown.borrow() {
            return Err(LinkError::Shutdown);
        }
        Ok(())
    }

    /// Write one complete frame.
    pub async fn send(&mut self, frame: &[u8]) -> Result<()> {
        self.check_shutdown()?;
        if Instant::now() < self.next_send {
            sleep_until(self.next_send).await;
        }

        trace!("TX {:?}", String::from_utf8_lossy(frame));
        let limit = self.write_timeout;
        let stream = self.stream.get_mut();
        let write = async move {
            stream.write_all(frame).await?;
            stream.flush().await
        };
        match timeout(limit, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(LinkError::Io(e)),
            Err(_) => {
                warn!("Write stalled for {:?}", limit);
                return Err(LinkError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "write timed out",
                )));
            }
        }

        // Measured after the write so write latency is not counted twice
        self.next_send = Instant::now() + self.min_interval;
        self.stats.frames_out += 1;
        Ok(())
    }

    /// Read one CR-terminated line. `Ok(None)` on deadline.
    ///
    /// If part of a line is already buffered when the deadline passes, the
    /// deadline is extended once so a line that started in time completes.
    pub async fn read_line(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>> {
        let mut deadline = deadline;
        let mut extended = false;

        loop {
            self.check_shutdown()?;

            let now = Instant::now();
            if now >= deadline {
                if !extended && self.has_partial_line() {
                    debug!("Partial line buffered, extending read deadline");
                    deadline = now + self.extension;
                    extended = true;
                    continue;
                }
                return Ok(None);
            }

            let slice = (deadline - now).min(self.tick);
            // read_until is cancel safe: partial data stays in self.line
            match timeout(slice, self.stream.read_until(CR, &mut self.line)).await {
                Err(_) => continue,
                Ok(Err(e)) => return Err(LinkError::Io(e)),
                Ok(Ok(0)) => return Err(LinkError::Disconnected),
                Ok(Ok(_)) => {
                    if self.line.last() == Some(&CR) {
                        let line = std::mem::take(&mut self.line);
                        trace!("RX {:?}", String::from_utf8_lossy(&line));
                        self.stats.frames_in += 1;
                        return Ok(Some(line));
                    }
                    if self.line.len() > VRCOP_LINE_LIMIT {
                        self.line.clear();
                        self.stats.bad_messages += 1;
                        return Err(LinkError::format("line exceeds length limit"));
                    }
                }
            }
        }
    }

    fn has_partial_line(&self) -> bool {
        self.line.iter().any(|b| *b != CR && *b != LF)
    }

    /// Read one byte. `Ok(None)` on deadline.
    pub async fn read_byte(&mut self, deadline: Instant) -> Result<Option<u8>> {
        loop {
            self.check_shutdown()?;

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let slice = (deadline - now).min(self.tick);
            let next = match timeout(slice, self.stream.fill_buf()).await {
                Err(_) => continue,
                Ok(Err(e)) => return Err(LinkError::Io(e)),
                Ok(Ok(buf)) => buf.first().copied(),
            };
            match next {
                Some(byte) => {
                    self.stream.consume(1);
                    return Ok(Some(byte));
                }
                None => return Err(LinkError::Disconnected),
            }
        }
    }

    /// Read-deadline extension granted once a frame has started.
    pub fn extension(&self) -> Duration {
        self.extension
    }

    /// Close the write side. Errors are irrelevant at this point.
    pub async fn close(mut self) {
        let _ = self.stream.get_mut().shutdown().await;
    }
}
