//! Stream capture
//!
//! Each captured pipe gets a reader thread that drains it until end-of-file.
//! Readers never take a job's state lock; they only touch the buffer they
//! fill, so waiting on or inspecting a job never blocks behind a pipe read.

use std::io::{self, Read};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 8 * 1024;

/// Standard output of a job, filled by its capture thread
#[derive(Debug, Default)]
pub struct CapturedOutput {
    state: Mutex<OutputState>,
    changed: Condvar,
}

#[derive(Debug, Default)]
struct OutputState {
    data: Vec<u8>,
    eof: bool,
}

impl CapturedOutput {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn append(&self, bytes: &[u8]) {
        self.state.lock().data.extend_from_slice(bytes);
        self.changed.notify_all();
    }

    fn finish(&self) {
        self.state.lock().eof = true;
        self.changed.notify_all();
    }

    /// Whether the writer closed the stream
    pub fn is_finished(&self) -> bool {
        self.state.lock().eof
    }

    /// Lines available right now, without blocking.
    ///
    /// While the stream is open only terminated lines are returned; the
    /// unterminated tail shows up once end-of-file is reached. An empty
    /// result means nothing has been produced yet.
    pub fn lines(&self) -> Vec<String> {
        let state = self.state.lock();
        if state.eof {
            return split_lines(&state.data);
        }
        match state.data.iter().rposition(|&b| b == b'\n') {
            Some(last) => split_lines(&state.data[..=last]),
            None => Vec::new(),
        }
    }

    /// Block until end-of-file, then return every captured line
    pub fn read_lines(&self) -> Vec<String> {
        let mut state = self.state.lock();
        while !state.eof {
            self.changed.wait(&mut state);
        }
        split_lines(&state.data)
    }

    /// Everything captured so far as text
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().data).into_owned()
    }
}

/// Split captured bytes into lines.
///
/// `\n` and `\r\n` terminate lines. A trailing segment without a terminator
/// is kept verbatim as the last line.
pub fn split_lines(data: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(data);
    let mut lines: Vec<String> = text
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line).to_string())
        .collect();
    // The piece after the final terminator is empty when the text ends with one.
    if lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

/// Error text of a job, appended to by its stderr capture thread
#[derive(Debug, Default)]
pub struct ErrorBuffer {
    state: Mutex<ErrorState>,
    closed: Condvar,
}

#[derive(Debug, Default)]
struct ErrorState {
    text: String,
    eof: bool,
}

impl ErrorBuffer {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn append(&self, text: &str) {
        if !text.is_empty() {
            self.state.lock().text.push_str(text);
        }
    }

    /// Mark that no more text will arrive from the stream
    pub(crate) fn finish(&self) {
        self.state.lock().eof = true;
        self.closed.notify_all();
    }

    /// Copy of the accumulated text
    pub fn snapshot(&self) -> String {
        self.state.lock().text.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().text.is_empty()
    }

    /// Whether the error stream reached end-of-file
    pub fn is_finished(&self) -> bool {
        self.state.lock().eof
    }

    /// Wait up to `timeout` for end-of-file; returns whether it was reached
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.eof {
            self.closed.wait_for(&mut state, timeout);
        }
        state.eof
    }

    /// Run `f` with the accumulator locked
    pub fn with<R>(&self, f: impl FnOnce(&str) -> R) -> R {
        f(&self.state.lock().text)
    }
}

/// Reader threads draining a job's pipes
#[derive(Debug, Default)]
pub(crate) struct StreamCapture {
    readers: Vec<JoinHandle<()>>,
}

impl StreamCapture {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Drain `stream` into `output`
    pub(crate) fn capture_output<R>(
        &mut self,
        job_id: u64,
        mut stream: R,
        output: Arc<CapturedOutput>,
    ) -> io::Result<()>
    where
        R: Read + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("job-{job_id}-stdout"))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => output.append(&buf[..n]),
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(job_id, error = %e, "Reading job output failed");
                            break;
                        }
                    }
                }
                output.finish();
                trace!(job_id, "Output capture reached end of stream");
            })?;
        self.readers.push(handle);
        Ok(())
    }

    /// Drain `stream` into `errors`
    pub(crate) fn capture_errors<R>(
        &mut self,
        job_id: u64,
        mut stream: R,
        errors: Arc<ErrorBuffer>,
    ) -> io::Result<()>
    where
        R: Read + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name(format!("job-{job_id}-stderr"))
            .spawn(move || {
                let mut buf = [0u8; READ_CHUNK];
                let mut pending = Vec::new();
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            pending.extend_from_slice(&buf[..n]);
                            errors.append(&take_decoded(&mut pending));
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!(job_id, error = %e, "Reading job errors failed");
                            break;
                        }
                    }
                }
                if !pending.is_empty() {
                    errors.append(&String::from_utf8_lossy(&pending));
                }
                errors.finish();
                trace!(job_id, "Error capture reached end of stream");
            })?;
        self.readers.push(handle);
        Ok(())
    }

    /// Block until every reader hit end-of-file
    pub(crate) fn join(&mut self) {
        for handle in self.readers.drain(..) {
            if handle.join().is_err() {
                warn!("Capture thread panicked");
            }
        }
    }

    /// Join readers that are done and detach the rest.
    ///
    /// A reader is still running when some other process inherited the pipe;
    /// it exits by itself once that process closes it.
    pub(crate) fn release(&mut self) {
        for handle in self.readers.drain(..) {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                debug!("Detaching capture thread still waiting for end of stream");
            }
        }
    }
}

/// Decode the longest valid UTF-8 prefix of `pending`, leaving an incomplete
/// trailing sequence in place for the next read.
fn take_decoded(pending: &mut Vec<u8>) -> String {
    let mut out = String::new();
    loop {
        match std::str::from_utf8(pending) {
            Ok(text) => {
                out.push_str(text);
                pending.clear();
                return out;
            }
            Err(e) => {
                let valid = e.valid_up_to();
                out.push_str(&String::from_utf8_lossy(&pending[..valid]));
                match e.error_len() {
                    Some(bad) => {
                        out.push(char::REPLACEMENT_CHARACTER);
                        pending.drain(..valid + bad);
                    }
                    None => {
                        pending.drain(..valid);
                        return out;
                    }
                }
            }
        }
    }
}
