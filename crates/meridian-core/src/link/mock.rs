//! In-memory transport double for driver tests.
//!
//! `MockLink` stands in for the serial port; its paired `MockRemote` plays
//! the node ring: it decodes frames the host writes, answers through an
//! optional responder, and can inject faults (failed writes, corrupted
//! checksums, silence).

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::codec::{ParsedItem, StreamParser};
use super::packet::{Packet, PacketSource, PacketType};
use super::transport::LinkTransport;

type Responder = Box<dyn FnMut(&Packet) -> Vec<Packet> + Send>;

struct BusState {
    rx: VecDeque<u8>,
    written_frames: Vec<Packet>,
    parser: StreamParser,
    responder: Option<Responder>,
    fail_writes: usize,
    corrupt_responses: usize,
    drop_responses: usize,
    baud: u32,
    breaks_sent: u32,
    purges: u32,
}

struct MockBus {
    state: Mutex<BusState>,
    data_ready: Condvar,
}

/// Host-side handle implementing [`LinkTransport`]
pub(crate) struct MockLink {
    bus: Arc<MockBus>,
    timeout: Duration,
}

/// Test-side handle: inject traffic, script responses, observe line control
pub(crate) struct MockRemote {
    bus: Arc<MockBus>,
}

/// Create a connected transport/remote pair
pub(crate) fn mock_link() -> (MockLink, MockRemote) {
    let bus = Arc::new(MockBus {
        state: Mutex::new(BusState {
            rx: VecDeque::new(),
            written_frames: Vec::new(),
            parser: StreamParser::new(),
            responder: None,
            fail_writes: 0,
            corrupt_responses: 0,
            drop_responses: 0,
            baud: 9600,
            breaks_sent: 0,
            purges: 0,
        }),
        data_ready: Condvar::new(),
    });
    (
        MockLink {
            bus: Arc::clone(&bus),
            timeout: Duration::from_millis(100),
        },
        MockRemote { bus },
    )
}

impl Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now() + self.timeout;
        let mut state = self.bus.state.lock().unwrap();
        while state.rx.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock read timeout"));
            }
            let (s, _) = self
                .bus
                .data_ready
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = s;
        }
        let n = buf.len().min(state.rx.len());
        for slot in buf.iter_mut().take(n) {
            *slot = state.rx.pop_front().unwrap();
        }
        Ok(n)
    }
}

impl Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.bus.state.lock().unwrap();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "mock write fault"));
        }
        let mut items = Vec::new();
        let mut parser = std::mem::take(&mut state.parser);
        parser.feed(buf, &mut items);
        state.parser = parser;
        for item in items {
            if let ParsedItem::Packet(pkt) = item {
                state.written_frames.push(pkt.clone());
                let responses = match state.responder.as_mut() {
                    Some(r) => r(&pkt),
                    None => Vec::new(),
                };
                for resp in responses {
                    if state.drop_responses > 0 {
                        state.drop_responses -= 1;
                        continue;
                    }
                    let mut frame = resp.encode();
                    if state.corrupt_responses > 0 {
                        state.corrupt_responses -= 1;
                        let last = frame.len() - 1;
                        frame[last] = frame[last].wrapping_add(1) & 0x7F;
                    }
                    state.rx.extend(frame);
                }
            }
        }
        self.bus.data_ready.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LinkTransport for MockLink {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn purge(&mut self) -> io::Result<()> {
        let mut state = self.bus.state.lock().unwrap();
        state.rx.clear();
        state.purges += 1;
        Ok(())
    }

    fn bytes_to_read(&mut self) -> io::Result<u32> {
        Ok(self.bus.state.lock().unwrap().rx.len() as u32)
    }

    fn try_clone(&self) -> io::Result<Box<dyn LinkTransport>> {
        Ok(Box::new(MockLink {
            bus: Arc::clone(&self.bus),
            timeout: self.timeout,
        }))
    }

    fn set_baud_rate(&mut self, baud: u32) -> io::Result<()> {
        self.bus.state.lock().unwrap().baud = baud;
        Ok(())
    }

    fn send_break(&mut self, _duration: Duration) -> io::Result<()> {
        self.bus.state.lock().unwrap().breaks_sent += 1;
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> io::Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> io::Result<()> {
        Ok(())
    }
}

impl MockRemote {
    /// Queue raw bytes for the host to read
    pub fn inject_bytes(&self, bytes: &[u8]) {
        let mut state = self.bus.state.lock().unwrap();
        state.rx.extend(bytes);
        self.bus.data_ready.notify_all();
    }

    /// Queue an encoded packet for the host to read
    pub fn inject_frame(&self, pkt: &Packet) {
        self.inject_bytes(&pkt.encode());
    }

    /// Take every complete frame the host has written so far
    pub fn take_written_frames(&self) -> Vec<Packet> {
        std::mem::take(&mut self.bus.state.lock().unwrap().written_frames)
    }

    /// Script the ring's response to each host frame
    pub fn set_responder<F>(&self, f: F)
    where
        F: FnMut(&Packet) -> Vec<Packet> + Send + 'static,
    {
        self.bus.state.lock().unwrap().responder = Some(Box::new(f));
    }

    /// Fail the next `n` host writes with an I/O error
    pub fn fail_writes(&self, n: usize) {
        self.bus.state.lock().unwrap().fail_writes = n;
    }

    /// Corrupt the checksum of the next `n` scripted responses
    pub fn corrupt_responses(&self, n: usize) {
        self.bus.state.lock().unwrap().corrupt_responses = n;
    }

    /// Silently drop the next `n` scripted responses
    pub fn drop_responses(&self, n: usize) {
        self.bus.state.lock().unwrap().drop_responses = n;
    }

    /// Number of break conditions the host has generated
    pub fn breaks_sent(&self) -> u32 {
        self.bus.state.lock().unwrap().breaks_sent
    }

    /// Number of times the host purged the channel
    pub fn purges(&self) -> u32 {
        self.bus.state.lock().unwrap().purges
    }

    /// Current channel speed as set by the host
    pub fn baud(&self) -> u32 {
        self.bus.state.lock().unwrap().baud
    }
}

/// A well-behaved ring of `ids.len()` nodes: answers enumeration with the
/// node count, parameter reads with the per-node device ID, and forwards
/// control frames back to the host the way the physical ring does.
pub(crate) fn ring_responder(ids: Vec<u16>) -> impl FnMut(&Packet) -> Vec<Packet> + Send {
    move |pkt: &Packet| match pkt.pkt_type {
        PacketType::SetAddr => {
            let count = ids.len();
            let mut resp = pkt.clone();
            resp.addr = (count & 0x0F) as u8;
            resp.mode = count == 16;
            vec![resp]
        }
        PacketType::Command => {
            let id = ids.get(pkt.addr as usize).copied().unwrap_or(0);
            let payload = if pkt.payload.first() == Some(&0) {
                vec![(id & 0xFF) as u8, (id >> 8) as u8]
            } else {
                pkt.payload.clone()
            };
            let mut resp = Packet::new(PacketType::Response, pkt.addr, payload).unwrap();
            resp.src = PacketSource::Host;
            vec![resp]
        }
        // Control frames circulate the ring and come back to the host
        PacketType::ExtendHigh | PacketType::Trigger => vec![pkt.clone()],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_roundtrip() {
        let (mut link, remote) = mock_link();
        remote.set_responder(ring_responder(vec![0x2D01, 0x2D02]));

        let cmd = Packet::command(1, vec![0]).unwrap();
        link.write_all(&cmd.encode()).unwrap();

        let mut buf = [0u8; 64];
        let n = link.read(&mut buf).unwrap();
        let resp = Packet::decode(&buf[..n]).unwrap();
        assert_eq!(resp.pkt_type, PacketType::Response);
        assert_eq!(resp.addr, 1);
        assert_eq!(resp.payload, vec![0x02, 0x2D]);
        assert_eq!(remote.take_written_frames(), vec![cmd]);
    }

    #[test]
    fn test_mock_read_timeout() {
        let (mut link, _remote) = mock_link();
        link.set_timeout(Duration::from_millis(10)).unwrap();
        let mut buf = [0u8; 8];
        let err = link.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_mock_write_fault() {
        let (mut link, remote) = mock_link();
        remote.fail_writes(1);
        assert!(link.write_all(&[0x80, 0x00]).is_err());
        assert!(link.write_all(&[0x80]).is_ok());
    }

    #[test]
    fn test_mock_inject_bytes() {
        let (mut link, remote) = mock_link();
        remote.inject_bytes(&[0x01, 0x02, 0x03]);
        let mut buf = [0u8; 8];
        let n = link.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[0x01, 0x02, 0x03]);
    }
}
