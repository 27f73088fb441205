//! Master-worker channel plumbing.
//!
//! - [`protocol`]: envelope wire types
//! - [`codec`]: length-delimited JSON framing
//! - [`transport`]: the spawn boundary (real subprocess or in-process stub)

pub mod codec;
pub mod protocol;
pub mod transport;
