//! Gamepad input aggregation and link-cable sessions for a handheld emulator
//! frontend.

pub mod config;
pub mod controller;
pub mod link;
