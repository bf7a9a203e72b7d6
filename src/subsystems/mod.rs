//! Subsystem modules for the Neko bot.

pub mod comms;
pub mod runtime;
