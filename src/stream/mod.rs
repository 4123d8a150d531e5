//! Telephony media-stream protocol: wire frames and the per-call session.

pub mod frame;
pub mod session;
