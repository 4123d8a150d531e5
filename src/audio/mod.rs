//! # Audio Processing Module
//!
//! Everything that touches audio samples on the way in and out of a call.
//!
//! ## Key Components:
//! - **μ-law codec**: sample-accurate G.711 companding
//! - **Transcoder**: synthesized containers → telephony μ-law
//! - **Segmenter**: inbound stream → time-bounded utterance segments
//! - **Pacer**: telephony audio → fixed-size frames at real-time speed
//! - **Cache**: synthesized replies kept for later retrieval
//!
//! ## Audio Format:
//! - **Wire**: 8 kHz, mono, 8-bit μ-law
//! - **Internal**: 16-bit PCM, little-endian

pub mod cache;
pub mod mulaw;
pub mod pacer;
pub mod segmenter;
pub mod transcoder;
