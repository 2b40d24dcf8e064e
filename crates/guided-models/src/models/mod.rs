//! # Complete Models

pub mod guided;
pub mod resnet;
pub mod unet;
