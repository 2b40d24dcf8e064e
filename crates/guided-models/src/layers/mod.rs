//! # Common Layers

pub mod conv_norm;
pub mod util;
