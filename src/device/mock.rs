//! Scripted in-memory device for tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::{DeviceError, SerialLink};

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

struct MockState {
    responder: Responder,
    written: Vec<u8>,
    partial: String,
    replies: VecDeque<(Instant, String)>,
    reply_delay: Duration,
    present: bool,
    fail_writes: bool,
    probes: usize,
    closes: usize,
}

/// Test-side handle to a fake device. Clones share state with every
/// [`MockLink`] created from it.
#[derive(Clone)]
pub(crate) struct MockDevice {
    state: Arc<Mutex<MockState>>,
}

impl MockDevice {
    /// A device that answers each request line with `responder(line)`.
    pub(crate) fn new(responder: impl FnMut(&str) -> Option<String> + Send + 'static) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                responder: Box::new(responder),
                written: Vec::new(),
                partial: String::new(),
                replies: VecDeque::new(),
                reply_delay: Duration::ZERO,
                present: true,
                fail_writes: false,
                probes: 0,
                closes: 0,
            })),
        }
    }

    /// A device that never answers.
    pub(crate) fn silent() -> Self {
        Self::new(|_| None)
    }

    pub(crate) fn link(&self) -> MockLink {
        MockLink {
            state: Arc::clone(&self.state),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    /// Everything written to the device so far.
    pub(crate) fn written(&self) -> String {
        self.with(|s| String::from_utf8_lossy(&s.written).into_owned())
    }

    pub(crate) fn probes(&self) -> usize {
        self.with(|s| s.probes)
    }

    pub(crate) fn closes(&self) -> usize {
        self.with(|s| s.closes)
    }

    pub(crate) fn set_present(&self, present: bool) {
        self.with(|s| s.present = present);
    }

    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.with(|s| s.fail_writes = fail);
    }

    pub(crate) fn set_reply_delay(&self, delay: Duration) {
        self.with(|s| s.reply_delay = delay);
    }

    /// Queue a line the device emits without being asked.
    pub(crate) fn push_unsolicited(&self, line: &str) {
        self.with(|s| s.replies.push_back((Instant::now(), line.to_string())));
    }
}

pub(crate) struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl SerialLink for MockLink {
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DeviceError> {
        let mut s = self.state.lock().unwrap();
        if s.fail_writes {
            return Err(DeviceError::Transport("write: device unplugged".into()));
        }
        s.written.extend_from_slice(bytes);
        s.partial.push_str(&String::from_utf8_lossy(bytes));
        while let Some(pos) = s.partial.find('\n') {
            let line: String = s.partial.drain(..=pos).collect();
            if let Some(reply) = (s.responder)(line.trim_end()) {
                let ready_at = Instant::now() + s.reply_delay;
                s.replies.push_back((ready_at, reply));
            }
        }
        Ok(())
    }

    fn receive_line(&mut self, timeout: Duration) -> Result<Option<String>, DeviceError> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut s = self.state.lock().unwrap();
                if s.replies.front().is_some_and(|(at, _)| *at <= Instant::now()) {
                    let (_, line) = s.replies.pop_front().unwrap();
                    return Ok(Some(line.trim().to_string()));
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(5)));
        }
    }

    fn is_present(&mut self) -> bool {
        let mut s = self.state.lock().unwrap();
        s.probes += 1;
        s.present
    }

    fn close(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}
