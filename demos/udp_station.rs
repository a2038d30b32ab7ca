//! A station over UDP that reports every control it receives straight back
//! as an indication. Run it against a controller, e.g. another instance
//! with `role=controller`:
//!
//! ```text
//! udp_station 127.0.0.1:4001 127.0.0.1:4000 expansionUnitCount=1
//! ```

use anyhow::{Context, Result};
use log::{info, warn};

use lcp_proto::link::Link;
use lcp_proto::transport::{LineState, UdpTransport};
use lcp_proto::{LinkConfig, LinkState, Notification, Role, HEALTH_BIT};

fn main() -> Result<()> {
    env_logger::init();

    let mut args = std::env::args();
    args.next(); // Skip program name
    let local = args.next().unwrap_or_else(|| "0.0.0.0:4001".to_string());
    let peer = args.next().context("Missing peer address")?;
    let mut config = LinkConfig::default().with_role(Role::Station);
    for option in args {
        let (name, value) = option.split_once('=').context("Expected name=value")?;
        config.set_option(name, value)?;
    }

    let transport = UdpTransport::bind(local.parse()?, peer.parse()?)?;
    let mut link = Link::new(transport, config)?;
    let handle = link.handle();
    info!("Station on {} talking to {}", local, peer);

    // There is no line to break over UDP. Signal a cleared break to recall
    // right away, and reset after every failure to recall again.
    handle.line_state(LineState::Break)?;
    handle.line_state(LineState::Idle)?;
    link.run(|event| match event {
        Notification::PointChanged { index, state } if index != HEALTH_BIT => {
            if let Err(err) = handle.set_point(index, state) {
                warn!("Can't echo point {}: {}", *index, err);
            }
        }
        Notification::StateChanged {
            to: LinkState::Failed,
            cause,
            ..
        } => {
            warn!("Link failed ({:?}), recalling", cause);
            if let Err(err) = handle.reset() {
                warn!("Reset failed: {}", err);
            }
        }
        event => info!("{:?}", event),
    })?;
    Ok(())
}
