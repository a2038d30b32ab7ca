//! See [`LinkSupervisor`] for more details.

use std::collections::VecDeque;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use log::{debug, info, trace, warn};
use snafu::Snafu;

use crate::bits::{self, BitVector, HEALTH_BIT};
use crate::buffer::Buffer;
use crate::config::{LinkConfig, Role, POWER_UP_DELAY};
use crate::frame::{DecodeError, Frame, FrameBytes, Update};
use crate::nom_parser::{parse_frame, FrameToken};
use crate::transport::{LineState, TransportFault};
use crate::types::PointIndex;

/// Phase of the link.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Waiting for the power up delay, or for a station Recall trigger.
    PoweredUp,
    /// A Recall was sent and the `All` answer hasn't arrived yet.
    AwaitingRecallResponse,
    /// Both ends are exchanging updates.
    Active,
    /// Terminal until [`LinkSupervisor::reset`].
    Failed,
}

/// A frame was received but discarded.
#[derive(Debug, Snafu, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum FrameFault {
    #[snafu(display("{source}"))]
    Decode { source: DecodeError },
    /// A partial frame wasn't completed within the link timeout.
    #[snafu(display("Message timeout"))]
    MessageTimeout,
    /// A new frame started arriving before the previous one completed.
    #[snafu(display("Incomplete message"))]
    IncompleteMessage,
    /// An `Update` addressed a point outside of the configured vector.
    #[snafu(display("{source}"))]
    InvalidPoint { source: bits::Error },
}

/// Causes of a transition to [`LinkState::Failed`].
#[derive(Debug, Snafu, Copy, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum LinkFault {
    #[snafu(display("Poll timeout"))]
    PollTimeout,
    #[snafu(display("Response timeout, retries exhausted"))]
    ResponseTimeout,
    #[snafu(display("Too many consecutive transmission faults"))]
    FaultLimit,
    #[snafu(display("Transport reported link down"))]
    LinkDown,
    #[snafu(display("Link closed"))]
    Closed,
}

/// Things the application should know about.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Notification {
    StateChanged {
        from: LinkState,
        to: LinkState,
        cause: Option<LinkFault>,
    },
    /// A remote point changed, by `Update` or as part of an `All`.
    PointChanged { index: PointIndex, state: bool },
    /// The peer asked for our points.
    RecallReceived,
    /// No `All` arrived in time for Recall number `attempt`.
    ResponseTimeout { attempt: u32 },
    HealthChanged(bool),
    FrameFault(FrameFault),
    TransportFault(TransportFault),
}

/// Work produced by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Bytes to write to the transport.
    Transmit(FrameBytes),
    Notify(Notification),
}

/// Counters kept for the life of the supervisor.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub recalls_sent: u64,
    pub frame_faults: u64,
    pub transport_faults: u64,
    /// Faults since the last valid frame.
    pub consecutive_faults: u32,
}

/// Consistent view of a link, published after every event.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LinkStatus {
    pub state: LinkState,
    /// Why the link last failed.
    pub cause: Option<LinkFault>,
    pub healthy: bool,
    /// Points reported by this end.
    pub local: BitVector,
    /// Points reported by the peer.
    pub remote: BitVector,
    pub stats: LinkStats,
}

/// Read side of the link status, cheap to clone and safe to share between
/// threads.
#[derive(Debug, Clone)]
pub struct LinkMonitor(Arc<RwLock<LinkStatus>>);

impl LinkMonitor {
    pub fn snapshot(&self) -> LinkStatus {
        *self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> LinkState {
        self.snapshot().state
    }

    fn publish(&self, status: LinkStatus) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = status;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TimerKind {
    PowerUp,
    Response,
    Poll,
    /// Inter-byte gap of a partially received frame.
    Assembly,
    /// Repeats the health bit on a quiet active link.
    Keepalive,
}

const TIMER_KINDS: [TimerKind; 5] = [
    TimerKind::PowerUp,
    TimerKind::Response,
    TimerKind::Poll,
    TimerKind::Assembly,
    TimerKind::Keepalive,
];

/// Identifies one arming of a timer. Re-arming or cancelling a timer makes
/// older tokens stale, and stale tokens are ignored.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerToken {
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Debug, Default)]
struct Timers {
    armed: [Option<(Instant, u64)>; 5],
    generation: u64,
}

impl Timers {
    fn arm(&mut self, kind: TimerKind, deadline: Instant) {
        self.generation += 1;
        self.armed[kind as usize] = Some((deadline, self.generation));
    }

    fn cancel(&mut self, kind: TimerKind) {
        self.armed[kind as usize] = None;
    }

    fn cancel_all(&mut self) {
        self.armed = [None; 5];
    }

    fn next(&self) -> Option<(Instant, TimerToken)> {
        TIMER_KINDS
            .iter()
            .filter_map(|&kind| {
                self.armed[kind as usize]
                    .map(|(deadline, generation)| (deadline, TimerToken { kind, generation }))
            })
            .min_by_key(|(deadline, _)| *deadline)
    }

    /// Disarms the timer if `token` is its current arming.
    fn take(&mut self, token: TimerToken) -> bool {
        match self.armed[token.kind as usize] {
            Some((_, generation)) if generation == token.generation => {
                self.armed[token.kind as usize] = None;
                true
            }
            _ => false,
        }
    }
}

/// The link supervision state machine for one end of one link.
///
/// The supervisor does no I/O. Feed it received bytes, transport events and
/// the current time, then drain [`Output`]s: frames to transmit and
/// notifications for the application. Timers are serviced by calling
/// [`handle_timeouts`](Self::handle_timeouts) at or after
/// [`next_timeout`](Self::next_timeout).
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use lcp_proto::config::{LinkConfig, POWER_UP_DELAY};
/// use lcp_proto::supervisor::{LinkState, LinkSupervisor, Output};
///
/// let start = Instant::now();
/// let mut controller = LinkSupervisor::new(LinkConfig::default(), start);
///
/// controller.handle_timeouts(start + POWER_UP_DELAY);
/// assert_eq!(controller.state(), LinkState::AwaitingRecallResponse);
/// let sent: Vec<_> = controller
///     .drain_outputs()
///     .filter_map(|out| match out {
///         Output::Transmit(bytes) => Some(bytes.to_vec()),
///         _ => None,
///     })
///     .collect();
/// assert_eq!(sent, vec![vec![0x81, 0x7F]]); // Recall
/// ```
#[derive(Debug)]
pub struct LinkSupervisor {
    config: LinkConfig,
    state: LinkState,
    cause: Option<LinkFault>,
    local: BitVector,
    /// What the peer last heard of `local`.
    reported: BitVector,
    remote: BitVector,
    input_buffer: Buffer,
    timers: Timers,
    retries: u32,
    last_valid_rx: Option<Instant>,
    line: LineState,
    closed: bool,
    stats: LinkStats,
    outputs: VecDeque<Output>,
    monitor: LinkMonitor,
}

impl LinkSupervisor {
    /// Create a supervisor in [`LinkState::PoweredUp`]. A controller sends
    /// its first Recall [`POWER_UP_DELAY`] after `now`.
    pub fn new(config: LinkConfig, now: Instant) -> Self {
        let empty = BitVector::new(config.expansion_units);
        let status = LinkStatus {
            state: LinkState::PoweredUp,
            cause: None,
            healthy: false,
            local: empty,
            remote: empty,
            stats: LinkStats::default(),
        };
        let mut supervisor = Self {
            config,
            state: LinkState::PoweredUp,
            cause: None,
            local: empty,
            reported: empty,
            remote: empty,
            input_buffer: Buffer::new(),
            timers: Timers::default(),
            retries: 0,
            last_valid_rx: None,
            line: LineState::Idle,
            closed: false,
            stats: LinkStats::default(),
            outputs: VecDeque::new(),
            monitor: LinkMonitor(Arc::new(RwLock::new(status))),
        };
        supervisor.power_up(now);
        supervisor
    }

    pub const fn state(&self) -> LinkState {
        self.state
    }

    /// Why the link last failed.
    pub const fn cause(&self) -> Option<LinkFault> {
        self.cause
    }

    pub const fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub const fn local(&self) -> &BitVector {
        &self.local
    }

    pub const fn remote(&self) -> &BitVector {
        &self.remote
    }

    pub const fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn healthy(&self) -> bool {
        self.local.get(HEALTH_BIT).unwrap_or(false)
    }

    /// True while a partial frame is buffered. A half-duplex transport
    /// should hold back transmissions until this clears.
    pub fn receiving(&self) -> bool {
        !self.input_buffer.is_empty()
    }

    /// Handle for concurrent readers of the link status.
    pub fn monitor(&self) -> LinkMonitor {
        self.monitor.clone()
    }

    /// Next output, in the order produced.
    pub fn poll_output(&mut self) -> Option<Output> {
        self.outputs.pop_front()
    }

    pub fn drain_outputs(&mut self) -> impl Iterator<Item = Output> + '_ {
        self.outputs.drain(..)
    }

    /// The earliest armed timer.
    pub fn next_timeout(&self) -> Option<(Instant, TimerToken)> {
        self.timers.next()
    }

    /// Feed received bytes, and handle every frame they complete.
    pub fn receive_data(&mut self, data: &[u8], now: Instant) {
        if self.closed || self.state == LinkState::Failed {
            trace!("Dropping {} bytes on inactive link", data.len());
            return;
        }
        trace!("Received {:02x?}", data);

        if self
            .input_buffer
            .stalled(now, self.config.inter_byte_gap())
        {
            self.input_buffer.clear();
            self.frame_fault(FrameFault::IncompleteMessage, now);
        }
        self.input_buffer.write(data, now);
        self.parse_buffer(now);
        self.publish();
    }

    fn parse_buffer(&mut self, now: Instant) {
        while !self.input_buffer.is_empty() {
            if self.state == LinkState::Failed {
                self.input_buffer.clear();
                break;
            }
            match parse_frame(self.input_buffer.as_ref(), self.config.expansion_units) {
                (_, FrameToken::NeedData) => break,
                (consumed, FrameToken::Frame(frame)) => {
                    self.input_buffer.consume(consumed);
                    self.handle_frame(frame, now);
                }
                (consumed, FrameToken::Invalid(source)) => {
                    self.input_buffer.consume(consumed);
                    self.frame_fault(FrameFault::Decode { source }, now);
                }
            }
        }

        if self.input_buffer.is_empty() {
            self.timers.cancel(TimerKind::Assembly);
        } else {
            let gap = self.config.inter_byte_gap();
            self.timers.arm(TimerKind::Assembly, now + gap);
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) {
        debug!("Received {:?} in {:?}", frame, self.state);
        self.stats.frames_received += 1;
        self.stats.consecutive_faults = 0;
        self.last_valid_rx = Some(now);
        if self.state == LinkState::Active {
            self.timers.arm(TimerKind::Poll, now + self.config.poll_timeout);
        }
        self.update_health(now);

        match frame {
            Frame::Recall => {
                self.notify(Notification::RecallReceived);
                self.report_all(now);
                // the controller just came up or recovered, recall its controls
                if self.config.role == Role::Station && self.state == LinkState::PoweredUp {
                    self.send_recall(now);
                }
            }
            Frame::All(bits) => {
                let old = self.remote;
                if let Err(source) = self.remote.replace_all(&bits) {
                    self.frame_fault(FrameFault::InvalidPoint { source }, now);
                    return;
                }
                for (index, state) in old.diff(&self.remote) {
                    self.notify(Notification::PointChanged { index, state });
                }
                if self.state == LinkState::AwaitingRecallResponse {
                    self.timers.cancel(TimerKind::Response);
                    self.retries = 0;
                    self.enter_active(now);
                }
            }
            Frame::Update(Update { index, state }) => match self.remote.apply(index, state) {
                Ok(true) => self.notify(Notification::PointChanged { index, state }),
                Ok(false) => {}
                Err(source) => self.frame_fault(FrameFault::InvalidPoint { source }, now),
            },
        }
    }

    fn enter_active(&mut self, now: Instant) {
        self.set_state(LinkState::Active, None);
        self.timers.arm(TimerKind::Poll, now + self.config.poll_timeout);
        self.timers
            .arm(TimerKind::Keepalive, now + self.config.keepalive_interval);
        self.update_health(now);
        self.flush_updates(now);
    }

    /// Service every timer that expired at `now`, and recompute the health
    /// bit.
    pub fn handle_timeouts(&mut self, now: Instant) {
        while let Some((deadline, token)) = self.timers.next() {
            if deadline > now {
                break;
            }
            self.handle_timer(token, now);
        }
        self.update_health(now);
        self.publish();
    }

    /// Handle a single timer expiry. Stale tokens are ignored.
    pub fn handle_timer(&mut self, token: TimerToken, now: Instant) {
        if self.closed || !self.timers.take(token) {
            trace!("Ignoring stale timer {:?}", token);
            return;
        }
        debug!("Timer {:?} expired in {:?}", token.kind, self.state);

        match (token.kind, self.state) {
            (TimerKind::PowerUp, LinkState::PoweredUp) => self.send_recall(now),
            (TimerKind::Response, LinkState::AwaitingRecallResponse) => {
                self.notify(Notification::ResponseTimeout {
                    attempt: self.retries + 1,
                });
                if self.retries < self.config.retry_limit {
                    self.retries += 1;
                    self.send_recall(now);
                } else {
                    self.fail(LinkFault::ResponseTimeout);
                }
            }
            (TimerKind::Poll, LinkState::Active) => self.fail(LinkFault::PollTimeout),
            (TimerKind::Keepalive, LinkState::Active) => {
                let healthy = self.healthy();
                self.transmit(Frame::Update(Update::new(HEALTH_BIT, healthy)), now);
            }
            (TimerKind::Assembly, _) if !self.input_buffer.is_empty() => {
                self.input_buffer.clear();
                self.frame_fault(FrameFault::MessageTimeout, now);
            }
            (kind, state) => trace!("Timer {:?} has no effect in {:?}", kind, state),
        }
    }

    /// Report a fault detected by the transport, such as a parity error.
    pub fn transport_fault(&mut self, fault: TransportFault, now: Instant) {
        if self.closed {
            return;
        }
        warn!("Transport fault: {}", fault);
        self.stats.transport_faults += 1;
        self.count_fault(Notification::TransportFault(fault), now);
        self.publish();
    }

    /// Report the current physical line state. A station in
    /// [`LinkState::PoweredUp`] sends a Recall when a break clears. Stations
    /// on transports without a line signal recall when the controller's
    /// Recall arrives instead.
    pub fn line_state(&mut self, line: LineState, now: Instant) {
        let previous = core::mem::replace(&mut self.line, line);
        debug!("Line {:?} -> {:?}", previous, line);
        if self.closed {
            return;
        }
        if previous == LineState::Break
            && line == LineState::Idle
            && self.config.role == Role::Station
            && self.state == LinkState::PoweredUp
        {
            self.send_recall(now);
        }
        self.publish();
    }

    /// The transport lost the link.
    pub fn link_down(&mut self) {
        if self.state != LinkState::Failed {
            self.fail(LinkFault::LinkDown);
        }
        self.publish();
    }

    /// Leave [`LinkState::Failed`], or restart the link from any other
    /// state, as after a reconnection.
    pub fn reset(&mut self, now: Instant) {
        info!("Link reset in {:?}", self.state);
        self.closed = false;
        self.timers.cancel_all();
        self.input_buffer.clear();
        self.retries = 0;
        self.last_valid_rx = None;
        self.stats.consecutive_faults = 0;
        // quietly drop the health bit, the peer recalls everything anyway
        let _ = self.local.apply(HEALTH_BIT, false);
        self.reported = self.local;
        self.set_state(LinkState::PoweredUp, None);
        self.power_up(now);
        self.publish();
    }

    /// Tear the link down. Timers are cancelled and all input is ignored
    /// until [`reset`](Self::reset).
    pub fn close(&mut self) {
        info!("Closing link");
        self.timers.cancel_all();
        self.input_buffer.clear();
        if self.state != LinkState::Failed {
            self.fail(LinkFault::Closed);
        }
        self.closed = true;
        self.publish();
    }

    /// Change a local point. While the link is active the change is sent
    /// to the peer immediately. Returns whether the point changed.
    /// # Errors
    /// Returns [`bits::Error::ReadOnlyPoint`] for the health bit, or
    /// [`bits::Error::IndexOutOfRange`] for a point beyond the vector.
    pub fn set_point(
        &mut self,
        index: PointIndex,
        state: bool,
        now: Instant,
    ) -> Result<bool, bits::Error> {
        if index == HEALTH_BIT {
            return Err(bits::Error::ReadOnlyPoint { index: *index });
        }
        let changed = self.local.apply(index, state)?;
        if changed {
            self.flush_updates(now);
            self.publish();
        }
        Ok(changed)
    }

    /// Replace all local points. The health bit of `points` is ignored.
    /// # Errors
    /// Returns [`bits::Error::LengthMismatch`] if `points` has the wrong length.
    pub fn set_all(&mut self, points: &BitVector, now: Instant) -> Result<(), bits::Error> {
        let mut points = *points;
        let healthy = self.healthy();
        // point 16 exists in every vector length
        let _ = points.apply(HEALTH_BIT, healthy);
        self.local.replace_all(&points)?;
        self.flush_updates(now);
        self.publish();
        Ok(())
    }

    fn power_up(&mut self, now: Instant) {
        match self.config.role {
            Role::Controller => self.timers.arm(TimerKind::PowerUp, now + POWER_UP_DELAY),
            // a station that failed before recalls as soon as it is reset
            Role::Station if self.cause.is_some() => self.send_recall(now),
            Role::Station => {}
        }
    }

    fn send_recall(&mut self, now: Instant) {
        self.stats.recalls_sent += 1;
        self.transmit(Frame::Recall, now);
        if self.state != LinkState::AwaitingRecallResponse {
            self.set_state(LinkState::AwaitingRecallResponse, None);
        }
        self.timers
            .arm(TimerKind::Response, now + self.config.response_timeout);
    }

    fn report_all(&mut self, now: Instant) {
        self.transmit(Frame::All(self.local), now);
        self.reported = self.local;
    }

    /// Send an `Update` for every local point the peer hasn't heard of.
    fn flush_updates(&mut self, now: Instant) {
        if self.state != LinkState::Active {
            return;
        }
        let changes = self.reported.diff(&self.local);
        self.reported = self.local;
        for (index, state) in changes {
            self.transmit(Frame::Update(Update::new(index, state)), now);
        }
    }

    fn update_health(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        let healthy = self.last_valid_rx.map_or(false, |last| {
            now.saturating_duration_since(last) < self.config.poll_timeout
        });
        if let Ok(true) = self.local.apply(HEALTH_BIT, healthy) {
            debug!("Health {}", healthy);
            self.notify(Notification::HealthChanged(healthy));
            self.flush_updates(now);
        }
    }

    fn frame_fault(&mut self, fault: FrameFault, now: Instant) {
        warn!("Frame fault: {}", fault);
        self.stats.frame_faults += 1;
        self.count_fault(Notification::FrameFault(fault), now);
    }

    fn count_fault(&mut self, notification: Notification, now: Instant) {
        self.stats.consecutive_faults += 1;
        self.notify(notification);

        if let Some(limit) = self.config.fault_limit {
            if self.stats.consecutive_faults >= limit && self.state != LinkState::Failed {
                self.fail(LinkFault::FaultLimit);
                return;
            }
        }
        if self.config.role == Role::Station && self.state == LinkState::PoweredUp {
            self.send_recall(now);
        }
    }

    fn fail(&mut self, cause: LinkFault) {
        warn!("Link failed: {}", cause);
        self.timers.cancel_all();
        self.input_buffer.clear();
        self.retries = 0;
        self.cause = Some(cause);
        self.set_state(LinkState::Failed, Some(cause));
    }

    fn set_state(&mut self, to: LinkState, cause: Option<LinkFault>) {
        let from = core::mem::replace(&mut self.state, to);
        info!("Link state {:?} -> {:?}", from, to);
        self.notify(Notification::StateChanged { from, to, cause });
    }

    fn transmit(&mut self, frame: Frame, now: Instant) {
        debug!("Sending {:?}", frame);
        let bytes = frame.encode();
        trace!("Sending {:02x?}", bytes.as_slice());
        self.stats.frames_sent += 1;
        self.outputs.push_back(Output::Transmit(bytes));
        if self.state == LinkState::Active {
            self.timers.arm(
                TimerKind::Keepalive,
                now + self.config.keepalive_interval,
            );
        }
    }

    fn notify(&mut self, notification: Notification) {
        self.outputs.push_back(Output::Notify(notification));
    }

    fn publish(&self) {
        self.monitor.publish(LinkStatus {
            state: self.state,
            cause: self.cause,
            healthy: self.healthy(),
            local: self.local,
            remote: self.remote,
            stats: self.stats,
        });
    }
}
