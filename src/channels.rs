// Logical byte streams to the outside world (USB CDC ports on the real
// cartridge).  The core only sees this trait; the transport behind it is
// provided by the host integration.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// The five logical channels, numbered as on the cartridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelId {
    Console = 0,
    Tracer = 1,
    HpilWire = 2,
    IlScope = 3,
    Printer = 4,
}

/// One logical byte stream with non-blocking reads.
///
/// `write` may block until send-buffer space is free; everything else
/// returns immediately.
pub trait ByteChannel: Send {
    fn connected(&self) -> bool;
    fn available(&self) -> usize;
    fn read_byte(&mut self) -> Option<u8>;
    fn write(&mut self, data: &[u8]);
    fn flush(&mut self);

    fn write_str(&mut self, s: &str) {
        self.write(s.as_bytes());
    }
}

/// In-memory channel: both ends are byte queues.  Used by the tests and
/// by the host binary's loopback mode; the external integration drains
/// `take_output` and feeds `feed_input`.
#[derive(Clone)]
pub struct MemChannel {
    inner: Arc<Mutex<MemChannelState>>,
}

struct MemChannelState {
    connected: bool,
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl MemChannel {
    pub fn new(connected: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemChannelState {
                connected,
                input: VecDeque::new(),
                output: Vec::new(),
            })),
        }
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.lock().unwrap().connected = connected;
    }

    /// Host side: queue bytes for the core to read.
    pub fn feed_input(&self, data: &[u8]) {
        let mut st = self.inner.lock().unwrap();
        st.input.extend(data.iter().copied());
    }

    /// Host side: take everything the core has written so far.
    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.lock().unwrap().output)
    }

    /// Host side: the output as lossy UTF-8, for text channels.
    pub fn take_output_string(&self) -> String {
        String::from_utf8_lossy(&self.take_output()).into_owned()
    }
}

impl ByteChannel for MemChannel {
    fn connected(&self) -> bool {
        self.inner.lock().unwrap().connected
    }

    fn available(&self) -> usize {
        self.inner.lock().unwrap().input.len()
    }

    fn read_byte(&mut self) -> Option<u8> {
        self.inner.lock().unwrap().input.pop_front()
    }

    fn write(&mut self, data: &[u8]) {
        let mut st = self.inner.lock().unwrap();
        if st.connected {
            st.output.extend_from_slice(data);
        }
    }

    fn flush(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_channel_roundtrip() {
        let chan = MemChannel::new(true);
        chan.feed_input(b"ab");
        let mut reader = chan.clone();
        assert_eq!(reader.available(), 2);
        assert_eq!(reader.read_byte(), Some(b'a'));
        assert_eq!(reader.read_byte(), Some(b'b'));
        assert_eq!(reader.read_byte(), None);

        reader.write(b"out");
        assert_eq!(chan.take_output(), b"out");
        assert!(chan.take_output().is_empty());
    }

    #[test]
    fn test_disconnected_channel_drops_writes() {
        let chan = MemChannel::new(false);
        let mut writer = chan.clone();
        writer.write(b"lost");
        assert!(chan.take_output().is_empty());
    }
}
