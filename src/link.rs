//! Blocking driver running a [`LinkSupervisor`] over a [`Transport`].
//!
//! # Example
//!
//! ```no_run
//! use std::net::UdpSocket;
//! use lcp_proto::config::LinkConfig;
//! use lcp_proto::link::Link;
//! use lcp_proto::transport::UdpTransport;
//! use lcp_proto::point;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = UdpTransport::bind("0.0.0.0:4000".parse()?, "10.0.0.2:4000".parse()?)?;
//! let mut link = Link::new(transport, LinkConfig::default())?;
//! let handle = link.handle();
//!
//! std::thread::spawn(move || {
//!     handle.set_point(point(17), true).unwrap();
//! });
//! link.run(|event| println!("{:?}", event))?;
//! # Ok(()) }
//! ```

use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::time::{Duration, Instant};

use log::{debug, warn};
use snafu::{ResultExt, Snafu};

use crate::bits::{self, BitVector, HEALTH_BIT};
use crate::config::{self, LinkConfig};
use crate::frame::{FrameBytes, MAX_FRAME_LEN};
use crate::supervisor::{LinkMonitor, LinkState, LinkStatus, LinkSupervisor, Notification, Output};
use crate::transport::{self, LineState, Received, Transport};
use crate::types::{self, ExpansionUnits, IntoPointIndex, PointIndex};

/// Longest single wait for received bytes, so that commands from a
/// [`LinkHandle`] are picked up promptly.
const MAX_RECEIVE_WAIT: Duration = Duration::from_millis(50);

/// Error type for the link driver.
#[derive(Debug, Snafu)]
#[non_exhaustive]
pub enum Error {
    #[snafu(display("Invalid link configuration"))]
    Config { source: config::Error },
    #[snafu(display("Transport failed"))]
    Transport { source: transport::Error },
    #[snafu(display("Invalid point index"))]
    Index { source: types::Error },
    #[snafu(display("Invalid point"))]
    Point { source: bits::Error },
    /// The [`Link`] was dropped.
    #[snafu(display("Link is gone"))]
    Disconnected,
}

/// Requests from application threads.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    SetPoint(PointIndex, bool),
    SetAll(BitVector),
    Line(LineState),
    Reset,
    Close,
}

/// Cloneable handle for changing local points and reading the link status
/// from other threads.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    commands: Sender<Command>,
    monitor: LinkMonitor,
    units: ExpansionUnits,
}

impl LinkHandle {
    /// Queue a change of a local point.
    /// # Errors
    /// Returns [`Error::Index`] for an invalid index, [`Error::Point`] if the
    /// point is read only or beyond the vector, or [`Error::Disconnected`] if
    /// the link is gone.
    pub fn set_point(&self, index: impl IntoPointIndex, state: bool) -> Result<(), Error> {
        let index = index.into_point_index().context(IndexSnafu)?;
        if index == HEALTH_BIT {
            return Err(bits::Error::ReadOnlyPoint { index: *index }).context(PointSnafu);
        }
        BitVector::new(self.units)
            .apply(index, state)
            .context(PointSnafu)?;
        self.send(Command::SetPoint(index, state))
    }

    /// Queue a replacement of all local points.
    /// # Errors
    /// Returns [`Error::Point`] on a length mismatch, or
    /// [`Error::Disconnected`] if the link is gone.
    pub fn set_all(&self, points: BitVector) -> Result<(), Error> {
        BitVector::new(self.units)
            .replace_all(&points)
            .context(PointSnafu)?;
        self.send(Command::SetAll(points))
    }

    /// Report the line state for transports that can't sense it, e.g. when
    /// the peer of a datagram link comes and goes.
    /// # Errors
    /// Returns [`Error::Disconnected`] if the link is gone.
    pub fn line_state(&self, line: LineState) -> Result<(), Error> {
        self.send(Command::Line(line))
    }

    /// # Errors
    /// Returns [`Error::Disconnected`] if the link is gone.
    pub fn reset(&self) -> Result<(), Error> {
        self.send(Command::Reset)
    }

    /// Ask the link to close, which ends [`Link::run`].
    /// # Errors
    /// Returns [`Error::Disconnected`] if the link is gone.
    pub fn close(&self) -> Result<(), Error> {
        self.send(Command::Close)
    }

    pub fn status(&self) -> LinkStatus {
        self.monitor.snapshot()
    }

    pub fn state(&self) -> LinkState {
        self.monitor.state()
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.commands
            .send(command)
            .map_err(|_| Error::Disconnected)
    }
}

/// Owns the transport and the supervisor of one link.
///
/// Every [`step`](Self::step) runs queued commands, waits a bounded time for
/// received bytes, services expired timers and writes pending frames.
/// Frames are held back while a partial frame is being received.
#[derive(Debug)]
pub struct Link<T> {
    transport: T,
    supervisor: LinkSupervisor,
    commands: Receiver<Command>,
    handle: LinkHandle,
    pending: VecDeque<FrameBytes>,
    closed: bool,
}

impl<T: Transport> Link<T> {
    /// Validate the configuration and open the transport.
    /// # Errors
    /// Returns [`Error::Config`] or [`Error::Transport`].
    pub fn new(mut transport: T, config: LinkConfig) -> Result<Self, Error> {
        config.validate().context(ConfigSnafu)?;
        transport.open().context(TransportSnafu)?;

        let units = config.expansion_units;
        let supervisor = LinkSupervisor::new(config, Instant::now());
        let (tx, commands) = mpsc::channel();
        let handle = LinkHandle {
            commands: tx,
            monitor: supervisor.monitor(),
            units,
        };
        Ok(Self {
            transport,
            supervisor,
            commands,
            handle,
            pending: VecDeque::new(),
            closed: false,
        })
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub fn supervisor(&self) -> &LinkSupervisor {
        &self.supervisor
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// True once a close was requested and carried out, or the peer closed
    /// the transport.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Run until closed by a [`LinkHandle`] or by the peer, passing every
    /// notification to `on_event`.
    /// # Errors
    /// Returns the first transport error. The supervisor is moved to
    /// [`LinkState::Failed`] before the error is returned.
    pub fn run(&mut self, mut on_event: impl FnMut(Notification)) -> Result<(), Error> {
        while !self.closed {
            for event in self.step()? {
                on_event(event);
            }
        }
        Ok(())
    }

    /// One iteration of the driver loop.
    /// # Errors
    /// See [`run`](Self::run).
    pub fn step(&mut self) -> Result<Vec<Notification>, Error> {
        if self.closed {
            return Err(Error::Transport {
                source: transport::Error::NotOpen,
            });
        }
        self.run_commands()?;
        if self.closed {
            return Ok(self.collect_outputs());
        }

        let wait = self.receive_wait();
        let mut buf = [0u8; 4 * MAX_FRAME_LEN];
        let received = self.transport.receive_bytes(&mut buf, wait);
        let now = Instant::now();
        match received {
            Ok(Received::Data(len)) => self.supervisor.receive_data(&buf[..len], now),
            Ok(Received::Nothing) => {}
            Ok(Received::Line(line)) => self.supervisor.line_state(line, now),
            Ok(Received::Fault(fault)) => self.supervisor.transport_fault(fault, now),
            Ok(Received::Closed) => {
                debug!("Transport closed by peer");
                self.supervisor.link_down();
                // every further read would return at once
                self.closed = true;
                self.pending.clear();
                self.transport.close().context(TransportSnafu)?;
                return Ok(self.collect_outputs());
            }
            Err(source) => {
                self.supervisor.link_down();
                return Err(Error::Transport { source });
            }
        }
        self.supervisor.handle_timeouts(Instant::now());

        let events = self.collect_outputs();
        self.flush_pending()?;
        Ok(events)
    }

    fn run_commands(&mut self) -> Result<(), Error> {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            };
            debug!("Command {:?}", command);
            let now = Instant::now();
            match command {
                Command::SetPoint(index, state) => {
                    if let Err(err) = self.supervisor.set_point(index, state, now) {
                        warn!("Ignoring point change: {}", err);
                    }
                }
                Command::SetAll(points) => {
                    if let Err(err) = self.supervisor.set_all(&points, now) {
                        warn!("Ignoring point vector: {}", err);
                    }
                }
                Command::Line(line) => self.supervisor.line_state(line, now),
                Command::Reset => self.supervisor.reset(now),
                Command::Close => {
                    self.supervisor.close();
                    self.pending.clear();
                    self.closed = true;
                    return self.transport.close().context(TransportSnafu);
                }
            }
        }
    }

    /// Wait until the next timer, bounded by [`MAX_RECEIVE_WAIT`].
    fn receive_wait(&self) -> Duration {
        match self.supervisor.next_timeout() {
            Some((deadline, _)) => deadline
                .saturating_duration_since(Instant::now())
                .min(MAX_RECEIVE_WAIT),
            None => MAX_RECEIVE_WAIT,
        }
    }

    fn collect_outputs(&mut self) -> Vec<Notification> {
        let mut events = Vec::new();
        while let Some(output) = self.supervisor.poll_output() {
            match output {
                Output::Transmit(bytes) => self.pending.push_back(bytes),
                Output::Notify(event) => events.push(event),
            }
        }
        events
    }

    fn flush_pending(&mut self) -> Result<(), Error> {
        if self.supervisor.receiving() {
            return Ok(());
        }
        while let Some(bytes) = self.pending.pop_front() {
            if let Err(source) = self.transport.send_bytes(&bytes) {
                self.pending.clear();
                self.supervisor.link_down();
                return Err(Error::Transport { source });
            }
        }
        Ok(())
    }
}
