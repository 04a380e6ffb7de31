//! Bridge: typed build events and the non-blocking fan-out that carries them
//! to observers.

pub mod event_bus;
pub mod protocol;
