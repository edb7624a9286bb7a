//! Interactive console support for connecting a machine's console to stdio.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use weaver::ConsoleChannel;

#[cfg(unix)]
use nix::sys::termios::{self, SetArg, Termios};

const DETACH: u8 = 0x1D;

/// RAII guard that puts the terminal in raw mode and restores on drop.
#[cfg(unix)]
struct RawTerminalGuard {
    original: Termios,
}

#[cfg(unix)]
impl RawTerminalGuard {
    fn new() -> Option<Self> {
        use std::os::fd::AsFd;

        let stdin = std::io::stdin();
        let original = termios::tcgetattr(stdin.as_fd()).ok()?;
        let mut raw = original.clone();
        termios::cfmakeraw(&mut raw);
        termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw).ok()?;
        Some(Self { original })
    }
}

#[cfg(unix)]
impl Drop for RawTerminalGuard {
    fn drop(&mut self) {
        use std::os::fd::AsFd;
        let stdin = std::io::stdin();
        let _ = termios::tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.original);
    }
}

/// Copies console output to stdout and stdin to the console until the user
/// presses Ctrl+] or the console closes.
///
/// Raw mode passes Ctrl+C to the guest as byte 0x03 instead of raising
/// SIGINT here.
pub async fn attach(console: &ConsoleChannel) -> anyhow::Result<()> {
    let mut output = console.subscribe();
    let backlog = console.pending();
    console.clear();

    #[cfg(unix)]
    let _raw_guard = RawTerminalGuard::new();

    eprintln!("Connected to console. Press Ctrl+] to exit.\r");
    let mut stdout = tokio::io::stdout();
    stdout.write_all(backlog.as_bytes()).await?;
    stdout.flush().await?;

    let mut stdin = tokio::io::stdin();
    let mut key = [0u8; 1];
    let mut closed_check = tokio::time::interval(Duration::from_millis(250));

    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Ok(data) => {
                    stdout.write_all(&data).await?;
                    stdout.flush().await?;
                    // Already shown; keep the match buffer from filling up.
                    console.clear();
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "console output skipped");
                }
                Err(RecvError::Closed) => break,
            },
            read = stdin.read(&mut key) => match read {
                Ok(1) if key[0] == DETACH => {
                    eprintln!("\r\nDetached.\r");
                    break;
                }
                Ok(1) => console.send(key).await?,
                _ => break,
            },
            _ = closed_check.tick() => {
                if console.is_closed() {
                    eprintln!("\r\nConsole closed.\r");
                    break;
                }
            }
        }
    }

    Ok(())
}
