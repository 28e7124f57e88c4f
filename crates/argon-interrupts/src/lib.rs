#![forbid(unsafe_code)]

pub mod gicv2;

pub use gicv2::{GicConfig, Gicv2, LineEvent};
