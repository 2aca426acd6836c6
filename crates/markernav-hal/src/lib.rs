//! `markernav-hal` – hardware-facing primitives shared by the controller.
//!
//! # Modules
//!
//! - [`clock`] – the [`Clock`] abstraction with system and manual sources.
//! - [`pid`] – a clamped PID controller used by the follow law.
//! - [`stamp`] – maps sensor timestamps onto the node clock.

pub mod clock;
pub mod pid;
pub mod stamp;

pub use clock::{Clock, ManualClock, SystemClock};
pub use pid::{PidController, PidGains};
pub use stamp::{ClockOffset, StampMapper, StampPolicy};
