//! Handheld side of TabletLink: a controller peer that answers the host's
//! offers and streams input telegrams over the data channel.

mod controller;
mod input;

pub use controller::{ControllerPeer, DEFAULT_TICK};
pub use input::{InputSource, SharedInput, SyntheticInput};
