//! Process-level plumbing
//!
//! This module contains:
//! - The D-Bus control surface
//! - Signal-driven shutdown and event-loop wakeups

pub mod control;
pub mod shutdown;
