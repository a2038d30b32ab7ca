#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use lcp_proto::frame::decode;
use lcp_proto::transport::{self, LineState, Received, Transport, TransportFault};
use lcp_proto::{ExpansionUnits, Frame};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum LineEvent {
    Byte(u8),
    Line(LineState),
    Fault(TransportFault),
}

#[derive(Default)]
struct Direction {
    rx: Mutex<VecDeque<LineEvent>>,
    data_available: Condvar,
    /// Every byte that went this way, for inspection by the test.
    log: Mutex<Vec<u8>>,
}

impl Direction {
    fn push(&self, event: LineEvent) {
        if let LineEvent::Byte(byte) = event {
            self.log.lock().unwrap().push(byte);
        }
        self.rx.lock().unwrap().push_back(event);
        self.data_available.notify_all();
    }
}

/// A simulated serial line between two link ends. Bytes written by one end
/// show up at the other, and tests can inject line breaks and receive
/// faults.
#[derive(Default)]
pub struct SerialLine {
    to_controller: Direction,
    to_station: Direction,
    cut: AtomicBool,
}

impl SerialLine {
    pub fn new() -> Arc<SerialLine> {
        Default::default()
    }

    pub fn controller_end(self: &Arc<Self>) -> LineEnd {
        LineEnd::new(Arc::clone(self), true)
    }

    pub fn station_end(self: &Arc<Self>) -> LineEnd {
        LineEnd::new(Arc::clone(self), false)
    }

    /// Hold the line in break, then release it, as seen by the station.
    pub fn pulse_break(&self) {
        self.to_station.push(LineEvent::Line(LineState::Break));
        self.to_station.push(LineEvent::Line(LineState::Idle));
    }

    pub fn fault_at_station(&self, fault: TransportFault) {
        self.to_station.push(LineEvent::Fault(fault));
    }

    pub fn fault_at_controller(&self, fault: TransportFault) {
        self.to_controller.push(LineEvent::Fault(fault));
    }

    /// Put raw bytes on the line towards the controller.
    pub fn inject_to_controller(&self, bytes: &[u8]) {
        for byte in bytes {
            self.to_controller.push(LineEvent::Byte(*byte));
        }
    }

    /// Stop delivering bytes in both directions.
    pub fn cut(&self) {
        self.cut.store(true, SeqCst);
    }

    pub fn restore(&self) {
        self.cut.store(false, SeqCst);
    }

    /// Frames the station sent so far.
    pub fn sent_by_station(&self, units: ExpansionUnits) -> Vec<Frame> {
        split_frames(&self.to_controller.log.lock().unwrap(), units)
    }

    /// Frames the controller sent so far.
    pub fn sent_by_controller(&self, units: ExpansionUnits) -> Vec<Frame> {
        split_frames(&self.to_station.log.lock().unwrap(), units)
    }
}

fn split_frames(mut bytes: &[u8], units: ExpansionUnits) -> Vec<Frame> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let len = usize::from(bytes[0] & 0x1f) + 1;
        if len > bytes.len() {
            break;
        }
        if let Ok(frame) = decode(&bytes[..len], units) {
            frames.push(frame);
        }
        bytes = &bytes[len..];
    }
    frames
}

/// One end of a [`SerialLine`].
pub struct LineEnd {
    line: Arc<SerialLine>,
    is_controller: bool,
    open: bool,
}

impl LineEnd {
    fn new(line: Arc<SerialLine>, is_controller: bool) -> LineEnd {
        LineEnd {
            line,
            is_controller,
            open: false,
        }
    }

    fn incoming(&self) -> &Direction {
        if self.is_controller {
            &self.line.to_controller
        } else {
            &self.line.to_station
        }
    }

    fn outgoing(&self) -> &Direction {
        if self.is_controller {
            &self.line.to_station
        } else {
            &self.line.to_controller
        }
    }
}

impl Transport for LineEnd {
    fn open(&mut self) -> Result<(), transport::Error> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), transport::Error> {
        self.open = false;
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8]) -> Result<(), transport::Error> {
        if !self.open {
            return Err(transport::Error::NotOpen);
        }
        if self.line.cut.load(SeqCst) {
            return Ok(());
        }
        for byte in data {
            self.outgoing().push(LineEvent::Byte(*byte));
        }
        Ok(())
    }

    fn receive_bytes(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<Received, transport::Error> {
        if !self.open {
            return Err(transport::Error::NotOpen);
        }
        let incoming = self.incoming();
        let deadline = Instant::now() + timeout;
        let mut rx = incoming.rx.lock().unwrap();
        while rx.is_empty() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return Ok(Received::Nothing);
            }
            rx = incoming.data_available.wait_timeout(rx, left).unwrap().0;
        }

        let mut len = 0;
        while len < buf.len() {
            match rx.front() {
                Some(LineEvent::Byte(byte)) => {
                    buf[len] = *byte;
                    len += 1;
                    rx.pop_front();
                }
                Some(&event) if len == 0 => {
                    rx.pop_front();
                    return Ok(match event {
                        LineEvent::Line(line) => Received::Line(line),
                        LineEvent::Fault(fault) => Received::Fault(fault),
                        LineEvent::Byte(_) => unreachable!(),
                    });
                }
                _ => break,
            }
        }
        Ok(Received::Data(len))
    }
}

/// Poll `condition` until it holds, or panic after `timeout`.
pub fn wait_for(what: &str, timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !condition() {
        assert!(Instant::now() < deadline, "Timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(10));
    }
}
