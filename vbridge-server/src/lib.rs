//! # vbridge-server: Streaming Server
//!
//! Drives a video session over UDP: a synthetic [`pattern::PatternSource`]
//! produces frames, `vbridge-core` paces, encodes and chunks them, and
//! the datagrams go to a configured remote address.
//!
//! ## Modes
//!
//! - **Stream** (default): send the test pattern until stopped.
//! - **Receive** (`--receive`): listen on the remote address, decode and
//!   log what a streaming instance sends.

pub mod config;
pub mod pattern;
pub mod service;
