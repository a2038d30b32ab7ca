use std::time::{Duration, Instant};

use lcp_proto::config::POWER_UP_DELAY;
use lcp_proto::supervisor::{FrameFault, TimerKind};
use lcp_proto::transport::LineState;
use lcp_proto::{
    point, units, BitVector, DecodeError, Frame, LinkConfig, LinkFault, LinkState,
    LinkSupervisor, Notification, Output, Role, Update, HEALTH_BIT,
};

fn config(role: Role) -> LinkConfig {
    LinkConfig::default()
        .with_role(role)
        .with_expansion_units(units(2))
}

/// Deliver everything `from` transmitted to `to`. Returns the number of
/// frames moved.
fn pump(from: &mut LinkSupervisor, to: &mut LinkSupervisor, now: Instant) -> usize {
    let sent: Vec<_> = from
        .drain_outputs()
        .filter_map(|output| match output {
            Output::Transmit(bytes) => Some(bytes),
            Output::Notify(_) => None,
        })
        .collect();
    for bytes in &sent {
        to.receive_data(bytes, now);
    }
    sent.len()
}

/// Run both ends at `now` until neither has anything left to send.
fn exchange(a: &mut LinkSupervisor, b: &mut LinkSupervisor, now: Instant) {
    loop {
        a.handle_timeouts(now);
        b.handle_timeouts(now);
        if pump(a, b, now) + pump(b, a, now) == 0 {
            break;
        }
    }
}

/// Bring both ends up over a line that reports no line state: the
/// controller recalls after the power up delay, and its Recall makes the
/// station recall in turn.
fn connected(start: Instant) -> (LinkSupervisor, LinkSupervisor, Instant) {
    let mut controller = LinkSupervisor::new(config(Role::Controller), start);
    let mut station = LinkSupervisor::new(config(Role::Station), start);

    let now = start + POWER_UP_DELAY;
    exchange(&mut controller, &mut station, now);
    assert_eq!(controller.state(), LinkState::Active);
    assert_eq!(station.state(), LinkState::Active);
    (controller, station, now)
}

#[test]
fn test_handshake_and_point_exchange() {
    let start = Instant::now();
    let (mut controller, mut station, now) = connected(start);
    assert!(controller.healthy());
    assert!(station.healthy());
    assert_eq!(controller.remote().get(HEALTH_BIT), Some(true));
    assert_eq!(station.remote().get(HEALTH_BIT), Some(true));

    controller.set_point(point(64), true, now).unwrap();
    let mut controls = *controller.local();
    controls.apply(point(1), true).unwrap();
    controller.set_all(&controls, now).unwrap();
    exchange(&mut controller, &mut station, now);

    let remote = station.remote();
    assert_eq!(remote.get(point(1)), Some(true));
    assert_eq!(remote.get(point(64)), Some(true));
    assert_eq!(remote, controller.local());
}

#[test]
fn test_keepalive_holds_link() {
    let start = Instant::now();
    let (mut controller, mut station, mut now) = connected(start);
    let step = Duration::from_millis(250);
    for _ in 0..40 {
        now += step;
        controller.handle_timeouts(now);
        station.handle_timeouts(now);
        exchange(&mut controller, &mut station, now);
    }
    assert_eq!(controller.state(), LinkState::Active);
    assert_eq!(station.state(), LinkState::Active);
    assert!(controller.stats().frames_sent > 5);
}

#[test]
fn test_link_stays_up_without_line_events() {
    let start = Instant::now();
    let mut controller = LinkSupervisor::new(config(Role::Controller), start);
    let mut station = LinkSupervisor::new(config(Role::Station), start);

    let mut now = start;
    while now < start + POWER_UP_DELAY + Duration::from_secs(10) {
        now += Duration::from_millis(100);
        exchange(&mut controller, &mut station, now);
    }
    assert_eq!(controller.state(), LinkState::Active);
    assert_eq!(station.state(), LinkState::Active);
    assert_eq!(controller.stats().recalls_sent, 1);
    assert_eq!(station.stats().recalls_sent, 1);

    station.set_point(point(50), true, now).unwrap();
    exchange(&mut controller, &mut station, now);
    assert_eq!(controller.remote().get(point(50)), Some(true));
}

#[test]
fn test_station_recalls_when_break_clears() {
    let start = Instant::now();
    let mut controller = LinkSupervisor::new(config(Role::Controller), start);
    let mut station = LinkSupervisor::new(config(Role::Station), start);

    station.line_state(LineState::Break, start);
    exchange(&mut controller, &mut station, start);
    assert_eq!(station.state(), LinkState::PoweredUp);

    // the controller answers while still inside its power up delay
    station.line_state(LineState::Idle, start);
    exchange(&mut controller, &mut station, start);
    assert_eq!(station.state(), LinkState::Active);
    assert_eq!(controller.state(), LinkState::PoweredUp);
    assert_eq!(station.stats().recalls_sent, 1);
}

#[test]
fn test_silent_peer_fails_link() {
    let start = Instant::now();
    let (mut controller, _station, now) = connected(start);
    controller.drain_outputs().for_each(drop);

    let (deadline, token) = controller.next_timeout().unwrap();
    assert_eq!(token.kind, TimerKind::Keepalive);
    controller.handle_timeouts(deadline);

    let poll = now + config(Role::Controller).poll_timeout;
    controller.handle_timeouts(poll - Duration::from_millis(1));
    assert!(controller.healthy());
    controller.handle_timeouts(poll);
    assert_eq!(controller.state(), LinkState::Failed);
    assert_eq!(controller.cause(), Some(LinkFault::PollTimeout));
    assert!(!controller.healthy());
    let events: Vec<_> = controller.drain_outputs().collect();
    assert!(events.contains(&Output::Notify(Notification::HealthChanged(false))));
    assert!(events.contains(&Output::Notify(Notification::StateChanged {
        from: LinkState::Active,
        to: LinkState::Failed,
        cause: Some(LinkFault::PollTimeout),
    })));
}

#[test]
fn test_noise_is_skipped() {
    let start = Instant::now();
    let (mut controller, _station, now) = connected(start);
    controller.drain_outputs().for_each(drop);

    let mut noisy = vec![0x00, 0xFF];
    noisy.extend(Frame::Update(Update::new(point(33), true)).encode());
    let mut corrupted = Frame::Update(Update::new(point(34), true)).encode();
    corrupted[1] ^= 0x01;
    noisy.extend(corrupted);
    noisy.extend(Frame::Update(Update::new(point(35), true)).encode());
    controller.receive_data(&noisy, now);

    assert_eq!(controller.remote().get(point(33)), Some(true));
    assert_eq!(controller.remote().get(point(34)), Some(false));
    assert_eq!(controller.remote().get(point(35)), Some(true));
    assert_eq!(controller.stats().frame_faults, 3);
    assert_eq!(controller.stats().consecutive_faults, 0);
    assert_eq!(controller.state(), LinkState::Active);

    let faults: Vec<_> = controller
        .drain_outputs()
        .filter_map(|out| match out {
            Output::Notify(Notification::FrameFault(fault)) => Some(fault),
            _ => None,
        })
        .collect();
    assert_eq!(
        faults,
        vec![
            FrameFault::Decode {
                source: DecodeError::InvalidMessageType { header: 0x00 }
            },
            FrameFault::Decode {
                source: DecodeError::InvalidMessageLength {
                    declared: 31,
                    expected: 2
                }
            },
            FrameFault::Decode {
                source: DecodeError::ChecksumFailure { sum: 1 }
            },
        ]
    );
}

#[test]
fn test_all_with_wrong_length_is_rejected() {
    let start = Instant::now();
    let (mut controller, _station, now) = connected(start);
    let before = *controller.remote();

    let mut short = BitVector::new(units(0));
    short.apply(point(3), true).unwrap();
    controller.receive_data(&Frame::All(short).encode(), now);
    assert_eq!(controller.remote(), &before);
    assert_eq!(controller.state(), LinkState::Active);
}

#[test]
fn test_failed_until_reset() {
    let start = Instant::now();
    let mut controller = LinkSupervisor::new(
        config(Role::Controller).with_retry_limit(0),
        start,
    );
    let now = start + POWER_UP_DELAY;
    controller.handle_timeouts(now);
    controller.handle_timeouts(now + config(Role::Controller).response_timeout);
    assert_eq!(controller.state(), LinkState::Failed);
    assert_eq!(controller.stats().recalls_sent, 1);

    controller.drain_outputs().for_each(drop);
    controller.receive_data(&Frame::Recall.encode(), now);
    controller.handle_timeouts(now + Duration::from_secs(3600));
    assert!(controller.poll_output().is_none());

    controller.reset(now);
    assert_eq!(controller.state(), LinkState::PoweredUp);
    let (deadline, token) = controller.next_timeout().unwrap();
    assert_eq!(token.kind, TimerKind::PowerUp);
    assert_eq!(deadline, now + POWER_UP_DELAY);
}
