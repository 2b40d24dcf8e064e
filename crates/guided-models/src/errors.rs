//! # Architecture Errors
//!
//! Every model config validates eagerly, before any weights are allocated;
//! an invalid architecture is reported as an [`ArchitectureError`].

use thiserror::Error;

/// A configuration that cannot describe a consistent network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArchitectureError {
    /// A per-stage configuration list has the wrong length.
    #[error("{field} has {actual} entries; expected {expected}")]
    StageArity {
        /// Name of the config field.
        field: &'static str,
        /// Required number of entries.
        expected: usize,
        /// Number of entries found.
        actual: usize,
    },

    /// A size which must be positive is zero.
    #[error("{field} must be > 0")]
    ZeroSize {
        /// Name of the config field.
        field: String,
    },

    /// The kernel size cannot preserve resolution with ``kernel_size / 2`` padding.
    #[error("kernel_size ({0}) must be odd")]
    EvenKernel(usize),

    /// Two chained components disagree on the channel count between them.
    #[error("{upstream}.out_channels ({out_channels}) != {downstream}.in_channels ({in_channels})")]
    ChannelChain {
        /// Name of the producing component.
        upstream: String,
        /// Channels produced.
        out_channels: usize,
        /// Name of the consuming component.
        downstream: String,
        /// Channels consumed.
        in_channels: usize,
    },

    /// A channel count grows past the supported width.
    #[error("{field} exceeds the limit of {limit} channels")]
    ExcessiveWidth {
        /// Name of the config field, or the derived quantity.
        field: String,
        /// Largest supported channel count.
        limit: usize,
    },

    /// The input resolution does not survive the downsampling stages exactly.
    #[error(
        "input resolution {resolution:?} is not divisible by 2^{stages} = {factor}"
    )]
    IndivisibleResolution {
        /// The input resolution.
        resolution: [usize; 2],
        /// Number of stride-2 stages.
        stages: usize,
        /// The total downsampling factor.
        factor: usize,
    },

    /// The conditioning map disagrees with the U-Net's injection point.
    #[error(
        "conditioning map [{channels}, {height}, {width}] does not match the U-Net injection point \
         [{expected_channels}, {expected_height}, {expected_width}]"
    )]
    ConditioningMismatch {
        /// Conditioning channels produced by the projection.
        channels: usize,
        /// Conditioning height produced by the projection.
        height: usize,
        /// Conditioning width produced by the projection.
        width: usize,
        /// Channels expected by the U-Net.
        expected_channels: usize,
        /// Height expected by the U-Net.
        expected_height: usize,
        /// Width expected by the U-Net.
        expected_width: usize,
    },

    /// The classifier and the U-Net read images with different channel counts.
    #[error(
        "classifier.in_channels ({classifier}) != unet.in_channels ({unet}); \
         both read the same images"
    )]
    InputChannelMismatch {
        /// Channels read by the classifier.
        classifier: usize,
        /// Channels read by the U-Net.
        unet: usize,
    },
}

impl ArchitectureError {
    /// Build a [`ArchitectureError::ZeroSize`] error.
    pub fn zero_size<S: Into<String>>(field: S) -> Self {
        Self::ZeroSize {
            field: field.into(),
        }
    }
}

/// Check that `value` is positive.
pub fn expect_positive(
    field: &str,
    value: usize,
) -> Result<(), ArchitectureError> {
    if value == 0 {
        Err(ArchitectureError::zero_size(field))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = ArchitectureError::StageArity {
            field: "block_channels",
            expected: 4,
            actual: 3,
        };
        assert_eq!(err.to_string(), "block_channels has 3 entries; expected 4");

        let err = ArchitectureError::IndivisibleResolution {
            resolution: [90, 96],
            stages: 3,
            factor: 8,
        };
        assert_eq!(
            err.to_string(),
            "input resolution [90, 96] is not divisible by 2^3 = 8"
        );

        let err = ArchitectureError::InputChannelMismatch {
            classifier: 3,
            unet: 1,
        };
        assert_eq!(
            err.to_string(),
            "classifier.in_channels (3) != unet.in_channels (1); both read the same images"
        );

        let err = ArchitectureError::ExcessiveWidth {
            field: "level_channels[9]".to_string(),
            limit: 4096,
        };
        assert_eq!(
            err.to_string(),
            "level_channels[9] exceeds the limit of 4096 channels"
        );
    }

    #[test]
    fn test_expect_positive() {
        assert!(expect_positive("stride", 1).is_ok());
        assert_eq!(
            expect_positive("stride", 0),
            Err(ArchitectureError::zero_size("stride"))
        );
    }
}
