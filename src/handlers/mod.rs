pub mod audio;
pub mod config;

pub use audio::*;
pub use config::*;
