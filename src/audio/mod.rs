//! Audio capture, amplitude analysis, and playback via cpal.

pub mod analysis;
pub mod capture;
pub mod device;
pub mod playback;
