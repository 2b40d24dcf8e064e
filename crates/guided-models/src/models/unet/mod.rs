//! # Denoising U-Net
//!
//! A U-Net which takes a spatial conditioning map at its bottleneck.

pub mod blocks;
pub mod unet_model;

pub use unet_model::{DenoisingUNet, DenoisingUNetConfig};
