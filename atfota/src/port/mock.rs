//! Scripted in-memory modem for tests.
//!
//! Every write is matched against a list of rules; the first rule whose trigger
//! occurs in the written bytes queues its reply for the reader side. Rules added
//! with [`ScriptedModem::once`] are consumed on first use, which lets a test model
//! a modem that answers the same poll differently over time.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

struct Rule {
    trigger: Vec<u8>,
    reply: Vec<u8>,
    once: bool,
}

#[derive(Default)]
struct ModemState {
    inbound: VecDeque<u8>,
    written: Vec<u8>,
    rules: Vec<Rule>,
    closed: bool,
}

#[derive(Clone)]
pub(crate) struct ScriptedModem {
    state: Arc<(Mutex<ModemState>, Condvar)>,
    timeout: Duration,
}

impl ScriptedModem {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new((Mutex::new(ModemState::default()), Condvar::new())),
            timeout: Duration::from_millis(10),
        }
    }

    /// Answer every write containing `trigger` with `reply`.
    pub(crate) fn on(self, trigger: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> Self {
        self.add_rule(trigger.as_ref(), reply.as_ref(), false);
        self
    }

    /// Answer the next write containing `trigger` with `reply`, then forget the rule.
    pub(crate) fn once(self, trigger: impl AsRef<[u8]>, reply: impl AsRef<[u8]>) -> Self {
        self.add_rule(trigger.as_ref(), reply.as_ref(), true);
        self
    }

    pub(crate) fn add_rule(&self, trigger: &[u8], reply: &[u8], once: bool) {
        let (lock, _) = &*self.state;
        lock.lock().unwrap().rules.push(Rule {
            trigger: trigger.to_vec(),
            reply: reply.to_vec(),
            once,
        });
    }

    /// Queue unsolicited bytes as if the modem had sent them.
    pub(crate) fn push_inbound(&self, bytes: &[u8]) {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().inbound.extend(bytes);
        cvar.notify_all();
    }

    /// Everything written so far, lossily decoded.
    pub(crate) fn written_text(&self) -> String {
        let (lock, _) = &*self.state;
        String::from_utf8_lossy(&lock.lock().unwrap().written).into_owned()
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        let (lock, _) = &*self.state;
        lock.lock().unwrap().written.clone()
    }

    pub(crate) fn count_written(&self, needle: &str) -> usize {
        self.written_text().matches(needle).count()
    }

    pub(crate) fn boxed(&self) -> Box<dyn Port> {
        Box::new(self.clone())
    }
}

impl Read for ScriptedModem {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        if state.inbound.is_empty() && !state.closed {
            state = cvar.wait_timeout(state, self.timeout).unwrap().0;
        }
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "closed"));
        }
        if state.inbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(state.inbound.len());
        for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for ScriptedModem {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (lock, cvar) = &*self.state;
        let mut state = lock.lock().unwrap();
        state.written.extend_from_slice(buf);
        let hit = state
            .rules
            .iter()
            .position(|rule| buf.windows(rule.trigger.len()).any(|w| w == rule.trigger));
        if let Some(index) = hit {
            let reply = if state.rules[index].once {
                state.rules.remove(index).reply
            } else {
                state.rules[index].reply.clone()
            };
            state.inbound.extend(reply);
            cvar.notify_all();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for ScriptedModem {
    fn name(&self) -> &str {
        "scripted"
    }

    fn try_clone_port(&self) -> Result<Box<dyn Port>> {
        Ok(Box::new(self.clone()))
    }

    fn close(&mut self) -> Result<()> {
        let (lock, cvar) = &*self.state;
        lock.lock().unwrap().closed = true;
        cvar.notify_all();
        Ok(())
    }
}
