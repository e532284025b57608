//! Byte-level register access to the preamp microcontrollers, and the
//! one-shot profile discovery built on top of it.

mod bus;
mod profile;
mod registers;

pub use bus::{make_bus, pack_bitmask, pack_zone_sources, HardwareBus, MockBus, RealBus};
pub use profile::{detect, Profile, StreamCapability};
pub use registers::*;
