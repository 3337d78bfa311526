//! `drover` CLI library
//!
//! Client side of the control socket plus the text rendering used by the
//! `drover` binary.

pub mod client;
pub mod output;
