#![warn(missing_docs)]
//!# guided-models - Class Guided Burn Models
//!
//! ## Notable Components
//!
//! * [`errors`] - architecture configuration errors.
//! * [`layers`] - reusable neural network modules.
//!   * [`layers::conv_norm`] - ``Conv2d + Option<BatchNorm2d>`` block.
//! * [`models`] - complete models.
//!   * [`models::resnet`] - [`models::resnet::ClassifyingResNet`], a compact residual classifier.
//!   * [`models::unet`] - [`models::unet::DenoisingUNet`], a conditioned denoising U-Net.
//!   * [`models::guided`] - [`models::guided::ClassGuidedUNet`], a frozen classifier
//!     steering a U-Net through a learned conditioning map.

/// Test-only macro import.
#[cfg(test)]
#[allow(unused_imports)]
#[macro_use]
extern crate hamcrest;

pub mod errors;
pub mod layers;
pub mod models;
