//! Link control protocol for a point-to-point link between a controller and
//! a field station.
//!
//! Both ends hold a vector of 32 to 128 binary points and keep each other
//! informed with three frame types: `Recall` asks for all points, `All`
//! reports all points and `Update` reports a single point.
//!
//! The protocol core is the sans-io [`LinkSupervisor`]: feed it bytes, line
//! events and the current time, and it produces frames to transmit and
//! notifications. [`Link`](link::Link) drives a supervisor over any
//! [`Transport`](transport::Transport) from a blocking loop.

mod buffer;
mod nom_parser;

pub mod bits;
pub mod config;
pub mod frame;
pub mod link;
pub mod supervisor;
pub mod transport;
pub mod types;

pub use bits::{BitVector, HEALTH_BIT};
pub use config::{LinkConfig, Role};
pub use frame::{decode, encode, DecodeError, EncodeError, Frame, Update};
pub use supervisor::{LinkFault, LinkState, LinkStatus, LinkSupervisor, Notification, Output};
pub use types::{point, units, ExpansionUnits, IntoPointIndex, MessageType, PointIndex};
