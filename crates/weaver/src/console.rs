//! Serial console capture and pattern matching.
//!
//! A background task reads the serial port continuously into a bounded
//! buffer, tees it to a log file and to subscribers. [`ConsoleChannel::expect`]
//! waits until the unconsumed part of the buffer matches and then consumes
//! everything up to the end of the match, so one occurrence is never
//! matched twice.

use regex::bytes::{Regex, RegexBuilder};
use std::path::Path;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};
use weaver_core::{ChannelStream, Error, Result};

const READ_CHUNK: usize = 4096;
const SUBSCRIBER_CAPACITY: usize = 256;

/// Output consumed by a successful [`ConsoleChannel::expect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleMatch {
    /// Output between the previous match point and this match.
    pub before: String,
    /// The text the pattern matched.
    pub matched: String,
}

impl ConsoleMatch {
    /// Everything consumed, `before` followed by `matched`.
    pub fn output(&self) -> String {
        format!("{}{}", self.before, self.matched)
    }
}

struct Buffer {
    data: Vec<u8>,
    limit: usize,
    dropped: u64,
    closed: bool,
}

impl Buffer {
    fn push(&mut self, chunk: &[u8]) -> usize {
        self.data.extend_from_slice(chunk);
        let excess = self.data.len().saturating_sub(self.limit);
        if excess > 0 {
            self.data.drain(..excess);
            self.dropped += excess as u64;
        }
        excess
    }
}

struct Shared {
    buffer: Mutex<Buffer>,
    notify: Notify,
}

impl Shared {
    fn buffer(&self) -> std::sync::MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One serial port of a running machine.
pub struct ConsoleChannel {
    index: usize,
    shared: Arc<Shared>,
    writer: tokio::sync::Mutex<WriteHalf<ChannelStream>>,
    expecting: tokio::sync::Mutex<()>,
    output: broadcast::Sender<Vec<u8>>,
    reader: JoinHandle<()>,
}

impl ConsoleChannel {
    /// Starts capturing `stream`. When `log` is given, all output is
    /// appended to it as it arrives.
    pub async fn open(
        index: usize,
        stream: ChannelStream,
        buffer_limit: usize,
        log: Option<&Path>,
    ) -> Result<Self> {
        let log = match log {
            Some(path) => Some(
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?,
            ),
            None => None,
        };

        let (read_half, write_half) = tokio::io::split(stream);
        let shared = Arc::new(Shared {
            buffer: Mutex::new(Buffer {
                data: Vec::new(),
                limit: buffer_limit,
                dropped: 0,
                closed: false,
            }),
            notify: Notify::new(),
        });
        let (output, _) = broadcast::channel(SUBSCRIBER_CAPACITY);

        let reader = tokio::spawn(read_loop(
            index,
            read_half,
            shared.clone(),
            output.clone(),
            log,
        ));

        Ok(Self {
            index,
            shared,
            writer: tokio::sync::Mutex::new(write_half),
            expecting: tokio::sync::Mutex::new(()),
            output,
            reader,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Waits until the output since the last match matches the regular
    /// expression `pattern`.
    ///
    /// Fails with [`Error::Timeout`] when `timeout` elapses and with
    /// [`Error::PatternNotFound`] when the port closes first.
    pub async fn expect(&self, pattern: &str, timeout: Duration) -> Result<ConsoleMatch> {
        let regex = compile(pattern)?;
        let (_, found) = self
            .wait_for(std::slice::from_ref(&regex), pattern, timeout)
            .await?;
        Ok(found)
    }

    /// Like [`expect`](Self::expect) for a literal string.
    pub async fn expect_exact(&self, text: &str, timeout: Duration) -> Result<ConsoleMatch> {
        let regex = compile(&regex::escape(text))?;
        let (_, found) = self
            .wait_for(std::slice::from_ref(&regex), text, timeout)
            .await?;
        Ok(found)
    }

    /// Waits for whichever of `patterns` matches first in the output and
    /// returns its index. Ties go to the earliest match in the stream.
    pub async fn expect_any(
        &self,
        patterns: &[&str],
        timeout: Duration,
    ) -> Result<(usize, ConsoleMatch)> {
        let regexes = patterns
            .iter()
            .map(|p| compile(p))
            .collect::<Result<Vec<_>>>()?;
        self.wait_for(&regexes, &patterns.join(" | "), timeout).await
    }

    async fn wait_for(
        &self,
        regexes: &[Regex],
        description: &str,
        timeout: Duration,
    ) -> Result<(usize, ConsoleMatch)> {
        let deadline = Instant::now() + timeout;
        let _turn = tokio::time::timeout_at(deadline, self.expecting.lock())
            .await
            .map_err(|_| self.timed_out(description, timeout))?;

        loop {
            let notified = self.shared.notify.notified();
            let mut notified = pin!(notified);
            notified.as_mut().enable();

            {
                let mut buffer = self.shared.buffer();
                if let Some((index, found)) = consume_first_match(&mut buffer.data, regexes) {
                    debug!(serial = self.index, pattern = description, "console matched");
                    return Ok((index, found));
                }
                if buffer.closed {
                    return Err(Error::PatternNotFound {
                        pattern: description.to_string(),
                    });
                }
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(self.timed_out(description, timeout));
            }
        }
    }

    fn timed_out(&self, pattern: &str, timeout: Duration) -> Error {
        Error::Timeout(format!(
            "serial {} did not match '{pattern}' within {timeout:?}",
            self.index
        ))
    }

    /// Writes raw bytes to the port.
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data.as_ref()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Writes `line` followed by a carriage return.
    pub async fn send_line(&self, line: &str) -> Result<()> {
        self.send(format!("{line}\r")).await
    }

    /// Sends a control character, e.g. `send_control('c')` for Ctrl-C.
    pub async fn send_control(&self, key: char) -> Result<()> {
        let key = key.to_ascii_lowercase();
        if !key.is_ascii_lowercase() {
            return Err(Error::InvalidConfig(format!(
                "no control character for '{key}'"
            )));
        }
        self.send([key as u8 - b'a' + 1]).await
    }

    /// Output not yet consumed by a match.
    pub fn pending(&self) -> String {
        String::from_utf8_lossy(&self.shared.buffer().data).into_owned()
    }

    /// Discards all unconsumed output.
    pub fn clear(&self) {
        self.shared.buffer().data.clear();
    }

    /// Bytes discarded because the buffer was full.
    pub fn dropped_bytes(&self) -> u64 {
        self.shared.buffer().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.shared.buffer().closed
    }

    /// Receives every chunk read from the port from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.output.subscribe()
    }

    /// Stops the background reader.
    pub(crate) fn close(&self) {
        self.reader.abort();
        let mut buffer = self.shared.buffer();
        buffer.closed = true;
        drop(buffer);
        self.shared.notify.notify_waiters();
    }
}

impl Drop for ConsoleChannel {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn compile(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .multi_line(true)
        .build()
        .map_err(|e| Error::InvalidConfig(format!("invalid console pattern '{pattern}': {e}")))
}

fn consume_first_match(data: &mut Vec<u8>, regexes: &[Regex]) -> Option<(usize, ConsoleMatch)> {
    let (index, start, end) = regexes
        .iter()
        .enumerate()
        .filter_map(|(i, re)| re.find(data).map(|m| (i, m.start(), m.end())))
        .min_by_key(|&(i, start, _)| (start, i))?;

    let consumed: Vec<u8> = data.drain(..end).collect();
    Some((
        index,
        ConsoleMatch {
            before: String::from_utf8_lossy(&consumed[..start]).into_owned(),
            matched: String::from_utf8_lossy(&consumed[start..]).into_owned(),
        },
    ))
}

async fn write_log(file: &mut tokio::fs::File, data: &[u8]) -> std::io::Result<()> {
    file.write_all(data).await?;
    file.flush().await
}

async fn read_loop(
    index: usize,
    mut reader: ReadHalf<ChannelStream>,
    shared: Arc<Shared>,
    output: broadcast::Sender<Vec<u8>>,
    mut log: Option<tokio::fs::File>,
) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(serial = index, error = %e, "console read failed");
                break;
            }
        };
        let data = &chunk[..n];

        if let Some(file) = log.as_mut() {
            if let Err(e) = write_log(file, data).await {
                warn!(serial = index, error = %e, "console log write failed, disabling log");
                log = None;
            }
        }
        let _ = output.send(data.to_vec());

        let dropped = shared.buffer().push(data);
        if dropped > 0 {
            warn!(serial = index, dropped, "console buffer full, dropped oldest output");
        }
        shared.notify.notify_waiters();
    }

    debug!(serial = index, "console closed");
    shared.buffer().closed = true;
    shared.notify.notify_waiters();
}
