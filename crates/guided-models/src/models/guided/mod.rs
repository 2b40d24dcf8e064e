//! # Class Guided Models
//!
//! [`ClassGuidedUNet`] composes two externally supplied modules:
//! * an [`ImageClassifier`], frozen at construction;
//! * a [`ConditionedDenoiser`], trained through the guided model.

pub mod class_guided_unet;

pub use class_guided_unet::{ClassGuidedUNet, ClassGuidedUNetConfig};

use crate::errors::ArchitectureError;
use burn::module::Module;
use burn::prelude::{Backend, Tensor};

/// An image classifier usable as a guidance source.
pub trait ImageClassifier<B: Backend>: Module<B> {
    /// Channels of the input images.
    fn in_channels(&self) -> usize;

    /// The width of the logit vector.
    fn num_classes(&self) -> usize;

    /// Map ``[batch, channels, height, width]`` images to ``[batch, num_classes]`` logits.
    fn classify(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2>;
}

/// A denoiser which accepts a spatial conditioning map.
///
/// The conditioning map is injected where the denoiser's own features
/// have been downsampled [`ConditionedDenoiser::num_downsamples`] times by 2.
pub trait ConditionedDenoiser<B: Backend>: Module<B> {
    /// Channels of the input images.
    fn in_channels(&self) -> usize;

    /// Channels of the conditioning map.
    fn conditioning_channels(&self) -> usize;

    /// Number of stride-2 reductions before the injection point.
    fn num_downsamples(&self) -> usize;

    /// Resolution of the injection point for a given input resolution.
    fn conditioning_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> Result<[usize; 2], ArchitectureError> {
        halve_resolution(input_resolution, self.num_downsamples())
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, channels, height, width]``.
    /// - `conditioning`: ``[batch, conditioning_channels, cond_height, cond_width]``.
    ///
    /// # Returns
    ///
    /// The denoised ``[batch, out_channels, height, width]`` tensor.
    fn forward_conditioned(
        &self,
        input: Tensor<B, 4>,
        conditioning: Tensor<B, 4>,
    ) -> Tensor<B, 4>;
}

/// Divide a resolution by ``2^stages``, requiring exact division.
pub fn halve_resolution(
    resolution: [usize; 2],
    stages: usize,
) -> Result<[usize; 2], ArchitectureError> {
    let factor = u32::try_from(stages)
        .ok()
        .and_then(|shift| 1usize.checked_shl(shift))
        .ok_or(ArchitectureError::IndivisibleResolution {
            resolution,
            stages,
            factor: 0,
        })?;

    if resolution.iter().any(|&size| size == 0 || size % factor != 0) {
        return Err(ArchitectureError::IndivisibleResolution {
            resolution,
            stages,
            factor,
        });
    }
    Ok(resolution.map(|size| size / factor))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_halve_resolution() {
        assert_eq!(halve_resolution([96, 96], 3), Ok([12, 12]));
        assert_eq!(halve_resolution([96, 64], 4), Ok([6, 4]));
        assert_eq!(halve_resolution([5, 7], 0), Ok([5, 7]));

        assert_eq!(
            halve_resolution([90, 96], 3),
            Err(ArchitectureError::IndivisibleResolution {
                resolution: [90, 96],
                stages: 3,
                factor: 8,
            })
        );
        assert!(halve_resolution([0, 8], 1).is_err());
        assert!(halve_resolution([8, 8], 80).is_err());
        assert!(halve_resolution([8, 8], 1 << 32).is_err());
        assert!(halve_resolution([8, 8], usize::MAX).is_err());
    }
}
