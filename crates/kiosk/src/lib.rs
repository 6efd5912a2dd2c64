//! Face attendance kiosk.
//!
//! Wires the decision logic from `kiosk-core` to persistent state: the
//! template store, the attendance log and the frame loop that drives them.

pub mod attendance;
pub mod config;
pub mod engine;
pub mod enroll;
pub mod feed;
pub mod store;
