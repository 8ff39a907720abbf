//! Communication channel with a single bot process.
//!
//! A [`BotChannel`] owns the child process and its three standard streams.
//! Two dedicated threads service the readable streams: one assembles
//! deadline-bounded lines from stdout, one forwards stderr chunks to the
//! referee's stderr. The referee thread is the only writer to stdin.
//!
//! The stdout pipe is switched to `O_NONBLOCK` at spawn so the reader can
//! poll single bytes at millisecond granularity without ever blocking on
//! I/O: unread bytes stay in the OS pipe buffer, and a partial line arriving
//! just before a deadline survives in the channel's buffer until the
//! newline shows up in a later read.

use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{trace, warn};

pub(crate) fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

/// Line-assembly state shared between the stdout reader and the referee.
///
/// Guarded by the channel's read mutex: the reader holds it for the whole
/// read session, the referee acquires it to inspect `response`.
struct ReadState {
    stdout: ChildStdout,
    /// The last fully assembled line, without its newline.
    response: String,
    /// Bytes of an incomplete line, kept across read sessions.
    buf: Vec<u8>,
}

/// Owns one bot process and its standard streams, and offers
/// deadline-bounded line reads from the bot's stdout.
///
/// Channel state machine for stdout reads:
/// `Idle -> Armed (start_read) -> Reading -> {Completed | TimedOut |
/// Cancelled} -> Idle`. All terminal transitions re-set `wait_for_message`.
pub struct BotChannel {
    bot_index: usize,
    child: Mutex<Child>,
    stdin: Mutex<ChildStdin>,
    read: Mutex<ReadState>,
    /// Taken once by the stderr reader thread.
    stderr_pipe: Mutex<Option<ChildStderr>>,
    /// Deadline of the current read, in milliseconds.
    deadline_ms: AtomicU64,
    /// True while no read is armed; the reader parks on this flag.
    wait_for_message: AtomicBool,
    has_read: AtomicBool,
    time_out: AtomicBool,
    cancel_read: AtomicBool,
    shutdown: AtomicBool,
}

impl BotChannel {
    /// Launch the bot executable with piped standard streams.
    ///
    /// # Errors
    /// Returned when the process cannot be spawned or its pipes cannot be
    /// switched to non-blocking mode.
    pub fn spawn(bot_index: usize, executable: &Path) -> anyhow::Result<Arc<BotChannel>> {
        let mut child = Command::new(executable)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("could not spawn bot '{}'", executable.display()))?;

        let stdin = child.stdin.take().context("bot stdin was not captured")?;
        let stdout = child.stdout.take().context("bot stdout was not captured")?;
        let stderr = child.stderr.take().context("bot stderr was not captured")?;

        set_nonblocking(stdout.as_raw_fd())
            .with_context(|| format!("Bot#{bot_index}: stdout O_NONBLOCK"))?;
        set_nonblocking(stderr.as_raw_fd())
            .with_context(|| format!("Bot#{bot_index}: stderr O_NONBLOCK"))?;

        Ok(Arc::new(BotChannel {
            bot_index,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            read: Mutex::new(ReadState {
                stdout,
                response: String::new(),
                buf: Vec::new(),
            }),
            stderr_pipe: Mutex::new(Some(stderr)),
            deadline_ms: AtomicU64::new(0),
            wait_for_message: AtomicBool::new(true),
            has_read: AtomicBool::new(false),
            time_out: AtomicBool::new(false),
            cancel_read: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// Seat index this channel serves.
    pub fn bot_index(&self) -> usize {
        self.bot_index
    }

    /// Arm a read of one line with the given deadline.
    ///
    /// The previous read session, if any, may still be winding down (the
    /// reader observes deadlines at 1 ms granularity), so this first waits
    /// for the reader to go idle.
    pub fn start_read(&self, deadline: Duration) {
        assert!(!self.is_shut_down(), "start_read on a shut down channel");
        while !self.wait_for_message.load(Ordering::SeqCst) {
            sleep_ms(1);
        }
        // The reader is parked, so the lock is uncontended here. Clearing
        // the response keeps a stale line from satisfying a later check.
        self.read.lock().expect("poisoned").response.clear();
        self.deadline_ms
            .store(deadline.as_millis() as u64, Ordering::SeqCst);
        self.has_read.store(false, Ordering::SeqCst);
        self.time_out.store(false, Ordering::SeqCst);
        self.cancel_read.store(false, Ordering::SeqCst);
        // Released last: this is what the reader parks on.
        self.wait_for_message.store(false, Ordering::SeqCst);
    }

    /// The last fully assembled line (empty if none).
    ///
    /// Valid after a read completed, timed out or was cancelled.
    pub fn response(&self) -> String {
        self.read.lock().expect("poisoned").response.clone()
    }

    /// Whether a full line was assembled since the last [`BotChannel::start_read`].
    pub fn has_read(&self) -> bool {
        self.has_read.load(Ordering::SeqCst)
    }

    /// Whether the deadline elapsed before a line was assembled.
    pub fn is_time_out(&self) -> bool {
        self.time_out.load(Ordering::SeqCst)
    }

    /// Cancel any in-flight read and block until the reader has observed
    /// the cancellation and stopped touching the response state.
    ///
    /// Idempotent; after this returns, [`BotChannel::response`],
    /// [`BotChannel::has_read`] and [`BotChannel::is_time_out`] are stable.
    pub fn cancel_read_blocking(&self) {
        self.cancel_read.store(true, Ordering::SeqCst);
        while !self.wait_for_message.load(Ordering::SeqCst) {
            if self.is_shut_down() {
                return;
            }
            sleep_ms(1);
        }
    }

    /// Ask both reader threads to terminate at their next poll.
    pub fn shut_down(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel_read.store(true, Ordering::SeqCst);
    }

    /// Whether [`BotChannel::shut_down`] was called.
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Raw write to the bot's stdin; no framing.
    ///
    /// # Errors
    /// Returned when the pipe is broken, typically because the bot died.
    /// The referee logs this and lets the missing reply be accounted at
    /// response-check time.
    pub fn write_stdin(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let mut stdin = self.stdin.lock().expect("poisoned");
        stdin
            .write_all(bytes)
            .with_context(|| format!("Bot#{}: stdin write failed", self.bot_index))?;
        stdin
            .flush()
            .with_context(|| format!("Bot#{}: stdin flush failed", self.bot_index))
    }
}

impl Drop for BotChannel {
    fn drop(&mut self) {
        // Reader threads hold clones of the Arc, so by the time this runs
        // they have already exited; killing and reaping here leaves no
        // zombies behind.
        let mut child = self.child.lock().expect("poisoned");
        if let Err(e) = child.kill() {
            // Already exited is the common case.
            trace!("Bot#{}: kill: {e}", self.bot_index);
        }
        if let Err(e) = child.wait() {
            warn!("Bot#{}: could not reap child: {e}", self.bot_index);
        }
    }
}

fn set_nonblocking(fd: RawFd) -> anyhow::Result<()> {
    // SAFETY: fd belongs to a pipe owned by the calling channel.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error()).context("fcntl(F_GETFL)");
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error()).context("fcntl(F_SETFL, O_NONBLOCK)");
    }
    Ok(())
}

/// Drain available stdout bytes into the line buffer.
///
/// Returns true when a newline committed the buffer to `response`.
fn poll_line(read: &mut ReadState) -> bool {
    let mut byte = [0u8; 1];
    loop {
        match read.stdout.read(&mut byte) {
            // EOF; whatever remains buffered may still be completed if the
            // deadline has not passed, so treat like "no data yet".
            Ok(0) => return false,
            Ok(_) => {
                if byte[0] == b'\n' {
                    read.response = String::from_utf8_lossy(&read.buf).into_owned();
                    read.buf.clear();
                    return true;
                }
                read.buf.push(byte[0]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return false,
        }
    }
}

/// Stdout reader loop: one dedicated thread per channel.
pub(crate) fn run_stdout_reader(channel: Arc<BotChannel>) {
    while !channel.is_shut_down() {
        // Park until the referee arms a read.
        while channel.wait_for_message.load(Ordering::SeqCst) {
            sleep_ms(1);
            if channel.is_shut_down() {
                return;
            }
        }

        {
            let mut read = channel.read.lock().expect("poisoned");
            let deadline = Duration::from_millis(channel.deadline_ms.load(Ordering::SeqCst));
            let start = Instant::now();
            loop {
                if poll_line(&mut read) {
                    channel.has_read.store(true, Ordering::SeqCst);
                    break;
                }
                if start.elapsed() > deadline {
                    channel.time_out.store(true, Ordering::SeqCst);
                    break;
                }
                if channel.cancel_read.load(Ordering::SeqCst) {
                    break;
                }
                if channel.is_shut_down() {
                    return;
                }
                sleep_ms(1);
            }
        }

        channel.wait_for_message.store(true, Ordering::SeqCst);
    }
}

/// Stderr forwarding loop: one dedicated thread per channel.
///
/// Each chunk is written under the process-wide stderr lock with a
/// `Bot#<i>: ` prefix, so chunks from concurrent bots never interleave.
pub(crate) fn run_stderr_reader(channel: Arc<BotChannel>) {
    let Some(mut stderr) = channel.stderr_pipe.lock().expect("poisoned").take() else {
        return;
    };
    let mut buf = [0u8; 1024];
    while !channel.is_shut_down() {
        match stderr.read(&mut buf) {
            Ok(n) if n > 0 => {
                let mut sink = io::stderr().lock();
                let _ = write!(sink, "Bot#{}: ", channel.bot_index);
                let _ = sink.write_all(&buf[..n]);
                let _ = sink.flush();
            }
            // EOF, no data yet, or a transient error: poll again.
            _ => {}
        }
        sleep_ms(1);
    }
}

#[cfg(test)]
mod channel_tests {
    use super::*;
    use std::thread::JoinHandle;

    fn start_cat() -> (Arc<BotChannel>, JoinHandle<()>, JoinHandle<()>) {
        let channel = BotChannel::spawn(0, Path::new("/bin/cat")).unwrap();
        let out = std::thread::spawn({
            let channel = channel.clone();
            move || run_stdout_reader(channel)
        });
        let err = std::thread::spawn({
            let channel = channel.clone();
            move || run_stderr_reader(channel)
        });
        (channel, out, err)
    }

    fn wait_until(cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            sleep_ms(1);
        }
        cond()
    }

    fn shut_down(channel: &Arc<BotChannel>, out: JoinHandle<()>, err: JoinHandle<()>) {
        channel.shut_down();
        out.join().unwrap();
        err.join().unwrap();
    }

    #[test]
    fn reads_a_full_line() {
        let (channel, out, err) = start_cat();
        channel.write_stdin(b"hello\n").unwrap();
        channel.start_read(Duration::from_millis(500));
        assert!(wait_until(|| channel.has_read(), Duration::from_secs(2)));
        assert_eq!(channel.response(), "hello");
        assert!(!channel.is_time_out());
        shut_down(&channel, out, err);
    }

    #[test]
    fn deadline_expiry_sets_time_out() {
        let (channel, out, err) = start_cat();
        channel.start_read(Duration::from_millis(30));
        assert!(wait_until(|| channel.is_time_out(), Duration::from_secs(2)));
        assert!(!channel.has_read());
        assert_eq!(channel.response(), "");
        shut_down(&channel, out, err);
    }

    #[test]
    fn partial_line_survives_across_reads() {
        let (channel, out, err) = start_cat();
        channel.write_stdin(b"par").unwrap();
        channel.start_read(Duration::from_millis(30));
        assert!(wait_until(|| channel.is_time_out(), Duration::from_secs(2)));
        assert!(!channel.has_read());

        channel.write_stdin(b"tial\n").unwrap();
        channel.start_read(Duration::from_millis(500));
        assert!(wait_until(|| channel.has_read(), Duration::from_secs(2)));
        assert_eq!(channel.response(), "partial");
        shut_down(&channel, out, err);
    }

    #[test]
    fn stale_response_does_not_leak_into_next_read() {
        let (channel, out, err) = start_cat();
        channel.write_stdin(b"first\n").unwrap();
        channel.start_read(Duration::from_millis(500));
        assert!(wait_until(|| channel.has_read(), Duration::from_secs(2)));
        assert_eq!(channel.response(), "first");

        channel.start_read(Duration::from_millis(30));
        assert!(wait_until(|| channel.is_time_out(), Duration::from_secs(2)));
        assert!(!channel.has_read());
        assert_eq!(channel.response(), "");
        shut_down(&channel, out, err);
    }

    #[test]
    fn cancel_quiesces_the_reader() {
        let (channel, out, err) = start_cat();
        channel.start_read(Duration::from_millis(5_000));
        sleep_ms(20);
        channel.cancel_read_blocking();
        assert!(!channel.has_read());
        assert!(!channel.is_time_out());
        assert_eq!(channel.response(), "");
        // Cancelling with no read in flight is a no-op.
        channel.cancel_read_blocking();

        // The channel is usable again after a cancel.
        channel.write_stdin(b"after\n").unwrap();
        channel.start_read(Duration::from_millis(500));
        assert!(wait_until(|| channel.has_read(), Duration::from_secs(2)));
        assert_eq!(channel.response(), "after");
        shut_down(&channel, out, err);
    }

    #[test]
    fn shutdown_terminates_both_readers() {
        let (channel, out, err) = start_cat();
        channel.start_read(Duration::from_millis(10_000));
        sleep_ms(10);
        shut_down(&channel, out, err);
        assert!(channel.is_shut_down());
    }
}
