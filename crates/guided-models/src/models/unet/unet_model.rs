//! # Denoising U-Net
//!
//! ```text
//! enc[0] ------------------------------------> dec[0] -> head
//!   enc[1] ----------------------------> dec[1]
//!     ...                            ...
//!       enc[depth-1] ++ conditioning -> bottleneck
//! ```
//!
//! ``enc[0]`` runs at full resolution; every later level halves it,
//! so the conditioning map enters at ``input / 2^(depth - 1)``.

use crate::errors::{ArchitectureError, expect_positive};
use crate::models::guided::{ConditionedDenoiser, halve_resolution};
use crate::models::unet::blocks::{
    ConvBlock, ConvBlockConfig, DecoderBlock, DecoderBlockConfig, EncoderBlock, EncoderBlockConfig,
};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::prelude::{Backend, Tensor};

/// Widest supported level, and widest conditioning map.
pub const MAX_LEVEL_CHANNELS: usize = 4096;

/// [`DenoisingUNet`] Config.
#[derive(Config, Debug)]
pub struct DenoisingUNetConfig {
    /// Input image channels.
    #[config(default = 3)]
    pub in_channels: usize,

    /// Output image channels.
    #[config(default = 3)]
    pub out_channels: usize,

    /// Channels of the full resolution level; doubled per level.
    #[config(default = 32)]
    pub base_channels: usize,

    /// Number of encoder levels.
    #[config(default = 4)]
    pub depth: usize,

    /// Channels of the conditioning map concatenated at the bottleneck.
    #[config(default = 32)]
    pub conditioning_channels: usize,

    /// Normalize every conv block.
    #[config(default = true)]
    pub use_batchnorm: bool,
}

impl DenoisingUNetConfig {
    /// Check if the config is valid.
    pub fn try_validate(&self) -> Result<(), ArchitectureError> {
        expect_positive("in_channels", self.in_channels)?;
        expect_positive("out_channels", self.out_channels)?;
        expect_positive("base_channels", self.base_channels)?;
        expect_positive("depth", self.depth)?;
        expect_positive("conditioning_channels", self.conditioning_channels)?;

        let deepest = self.depth - 1;
        u32::try_from(deepest)
            .ok()
            .and_then(|shift| 1usize.checked_shl(shift))
            .and_then(|factor| self.base_channels.checked_mul(factor))
            .filter(|&channels| channels <= MAX_LEVEL_CHANNELS)
            .ok_or_else(|| ArchitectureError::ExcessiveWidth {
                field: format!("level_channels[{deepest}]"),
                limit: MAX_LEVEL_CHANNELS,
            })?;

        if self.conditioning_channels > MAX_LEVEL_CHANNELS {
            return Err(ArchitectureError::ExcessiveWidth {
                field: "conditioning_channels".to_string(),
                limit: MAX_LEVEL_CHANNELS,
            });
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// Channels of encoder level `level`.
    ///
    /// Only levels below a validated `depth` are guaranteed not to overflow.
    pub fn level_channels(
        &self,
        level: usize,
    ) -> usize {
        self.base_channels << level
    }

    /// Number of stride-2 reductions before the bottleneck.
    pub fn num_downsamples(&self) -> usize {
        self.depth.saturating_sub(1)
    }

    /// Initialize a [`DenoisingUNet`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DenoisingUNet<B> {
        self.expect_valid();

        let encoders = (0..self.depth)
            .map(|level| {
                let in_channels = if level == 0 {
                    self.in_channels
                } else {
                    self.level_channels(level - 1)
                };
                EncoderBlockConfig::new(
                    ConvBlockConfig::new(in_channels, self.level_channels(level))
                        .with_use_batchnorm(self.use_batchnorm),
                )
                .with_downsample(level > 0)
                .init(device)
            })
            .collect();

        let deepest = self.level_channels(self.depth - 1);
        let bottleneck = ConvBlockConfig::new(deepest + self.conditioning_channels, deepest)
            .with_use_batchnorm(self.use_batchnorm)
            .init(device);

        // Deepest first, in application order.
        let decoders = (0..self.depth - 1)
            .rev()
            .map(|level| {
                DecoderBlockConfig::new(
                    self.level_channels(level + 1),
                    self.level_channels(level),
                    self.level_channels(level),
                )
                .with_use_batchnorm(self.use_batchnorm)
                .init(device)
            })
            .collect();

        let head =
            Conv2dConfig::new([self.level_channels(0), self.out_channels], [1, 1]).init(device);

        tracing::info!(
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            base_channels = self.base_channels,
            depth = self.depth,
            conditioning_channels = self.conditioning_channels,
            "building DenoisingUNet"
        );

        DenoisingUNet {
            encoders,
            bottleneck,
            decoders,
            head,
            conditioning_channels: self.conditioning_channels,
        }
    }

    /// Initialize a [`DenoisingUNet`], or report why the config is invalid.
    pub fn try_init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> Result<DenoisingUNet<B>, ArchitectureError> {
        self.try_validate()?;
        Ok(self.init(device))
    }
}

/// Conditioned denoising U-Net.
#[derive(Module, Debug)]
pub struct DenoisingUNet<B: Backend> {
    /// Encoder levels, full resolution first.
    pub encoders: Vec<EncoderBlock<B>>,
    /// Bottleneck over the deepest features and the conditioning map.
    pub bottleneck: ConvBlock<B>,
    /// Decoder levels, deepest first.
    pub decoders: Vec<DecoderBlock<B>>,
    /// ``1x1`` output projection.
    pub head: Conv2d<B>,
    /// Conditioning map channels.
    pub conditioning_channels: usize,
}

impl<B: Backend> DenoisingUNet<B> {
    /// Input image channels.
    pub fn in_channels(&self) -> usize {
        self.encoders[0].conv.in_channels()
    }

    /// Output image channels.
    pub fn out_channels(&self) -> usize {
        self.head.weight.shape().dims[0]
    }

    /// Number of encoder levels.
    pub fn depth(&self) -> usize {
        self.encoders.len()
    }

    /// ``[channels, height, width]`` of the conditioning map for a given input resolution.
    pub fn conditioning_shape(
        &self,
        input_resolution: [usize; 2],
    ) -> Result<[usize; 3], ArchitectureError> {
        let [height, width] = halve_resolution(input_resolution, self.num_downsamples())?;
        Ok([self.conditioning_channels, height, width])
    }
}

impl<B: Backend> ConditionedDenoiser<B> for DenoisingUNet<B> {
    fn in_channels(&self) -> usize {
        DenoisingUNet::in_channels(self)
    }

    fn conditioning_channels(&self) -> usize {
        self.conditioning_channels
    }

    fn num_downsamples(&self) -> usize {
        self.encoders
            .iter()
            .filter(|encoder| encoder.is_downsampling())
            .count()
    }

    fn forward_conditioned(
        &self,
        input: Tensor<B, 4>,
        conditioning: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let factor = 1usize << self.num_downsamples();
        static INPUT_CONTRACT: ShapeContract = shape_contract![
            "batch",
            "in_channels",
            "height" = "cond_height" * "factor",
            "width" = "cond_width" * "factor",
        ];
        let [batch, cond_height, cond_width] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch", "cond_height", "cond_width"],
            &[("in_channels", self.in_channels()), ("factor", factor)],
        );
        static CONDITIONING_CONTRACT: ShapeContract =
            shape_contract!["batch", "conditioning_channels", "cond_height", "cond_width"];
        CONDITIONING_CONTRACT.assert_shape(
            &conditioning,
            &[
                ("batch", batch),
                ("conditioning_channels", self.conditioning_channels),
                ("cond_height", cond_height),
                ("cond_width", cond_width),
            ],
        );

        let mut skips = Vec::with_capacity(self.encoders.len());
        let mut x = input;
        for encoder in &self.encoders {
            x = encoder.forward(x);
            skips.push(x.clone());
        }
        // The deepest level feeds the bottleneck, not a decoder.
        skips.pop();

        let x = self.bottleneck.forward(Tensor::cat(vec![x, conditioning], 1));

        let x = self
            .decoders
            .iter()
            .zip(skips.into_iter().rev())
            .fold(x, |x, (decoder, skip)| decoder.forward(x, skip));

        let x = self.head.forward(x);

        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract =
                shape_contract!["batch", "out_channels", "height", "width"];
            OUTPUT_CONTRACT.assert_shape(
                &x,
                &[
                    ("batch", batch),
                    ("out_channels", self.out_channels()),
                    ("height", cond_height * factor),
                    ("width", cond_width * factor),
                ],
            );
        });

        x
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::{Autodiff, NdArray};

    #[test]
    fn test_default_config() {
        let config = DenoisingUNetConfig::new();
        config.expect_valid();
        assert_eq!(config.num_downsamples(), 3);
        assert_eq!(config.level_channels(0), 32);
        assert_eq!(config.level_channels(3), 256);

        assert_eq!(
            DenoisingUNetConfig::new().with_depth(0).try_validate(),
            Err(ArchitectureError::zero_size("depth"))
        );
    }

    #[test]
    fn test_config_rejects_excessive_width() {
        let config = DenoisingUNetConfig::new().with_depth(8);
        assert_eq!(config.level_channels(7), MAX_LEVEL_CHANNELS);
        config.expect_valid();

        assert_eq!(
            DenoisingUNetConfig::new().with_depth(9).try_validate(),
            Err(ArchitectureError::ExcessiveWidth {
                field: "level_channels[8]".to_string(),
                limit: MAX_LEVEL_CHANNELS,
            })
        );

        for depth in [60, 64, 65, 1000, usize::MAX] {
            assert!(matches!(
                DenoisingUNetConfig::new().with_depth(depth).try_validate(),
                Err(ArchitectureError::ExcessiveWidth { .. })
            ));
        }

        assert_eq!(
            DenoisingUNetConfig::new()
                .with_conditioning_channels(MAX_LEVEL_CHANNELS + 1)
                .try_validate(),
            Err(ArchitectureError::ExcessiveWidth {
                field: "conditioning_channels".to_string(),
                limit: MAX_LEVEL_CHANNELS,
            })
        );
    }

    #[test]
    fn test_try_init_rejects_deep_config() {
        type B = NdArray<f32>;
        let device = Default::default();

        let result = DenoisingUNetConfig::new()
            .with_depth(64)
            .try_init::<B>(&device);
        assert!(matches!(
            result.err(),
            Some(ArchitectureError::ExcessiveWidth { .. })
        ));
    }

    #[test]
    #[should_panic(expected = "exceeds the limit of 4096 channels")]
    fn test_init_panics_on_deep_config() {
        let device = Default::default();
        let _unet: DenoisingUNet<NdArray<f32>> = DenoisingUNetConfig::new()
            .with_depth(40)
            .init(&device);
    }

    #[test]
    fn test_structure() {
        type B = NdArray<f32>;
        let device = Default::default();

        let unet: DenoisingUNet<B> = DenoisingUNetConfig::new()
            .with_base_channels(4)
            .with_conditioning_channels(6)
            .init(&device);

        assert_eq!(unet.depth(), 4);
        assert_eq!(unet.decoders.len(), 3);
        assert_eq!(unet.in_channels(), 3);
        assert_eq!(unet.out_channels(), 3);
        assert_eq!(unet.num_downsamples(), 3);
        assert_eq!(unet.conditioning_channels(), 6);
        assert_eq!(unet.conditioning_resolution([96, 96]), Ok([12, 12]));
        assert_eq!(unet.conditioning_shape([96, 64]), Ok([6, 12, 8]));
        assert!(unet.conditioning_resolution([90, 96]).is_err());
    }

    #[test]
    fn test_forward_conditioned() {
        type B = Autodiff<NdArray<f32>>;
        let device = Default::default();

        let unet: DenoisingUNet<B> = DenoisingUNetConfig::new()
            .with_in_channels(2)
            .with_out_channels(1)
            .with_base_channels(4)
            .with_depth(3)
            .with_conditioning_channels(5)
            .init(&device);

        let input = Tensor::ones([2, 2, 16, 24], &device);
        let conditioning = Tensor::ones([2, 5, 4, 6], &device);

        let output = unet.forward_conditioned(input, conditioning);
        assert_eq!(output.dims(), [2, 1, 16, 24]);
    }

    #[test]
    fn test_forward_single_level() {
        type B = NdArray<f32>;
        let device = Default::default();

        let unet: DenoisingUNet<B> = DenoisingUNetConfig::new()
            .with_base_channels(4)
            .with_depth(1)
            .with_conditioning_channels(2)
            .with_use_batchnorm(false)
            .init(&device);
        assert_eq!(unet.num_downsamples(), 0);

        let output = unet.forward_conditioned(
            Tensor::zeros([1, 3, 5, 7], &device),
            Tensor::zeros([1, 2, 5, 7], &device),
        );
        assert_eq!(output.dims(), [1, 3, 5, 7]);
    }

    #[test]
    #[should_panic]
    fn test_forward_rejects_misplaced_conditioning() {
        type B = NdArray<f32>;
        let device = Default::default();

        let unet: DenoisingUNet<B> = DenoisingUNetConfig::new()
            .with_base_channels(2)
            .with_depth(2)
            .with_conditioning_channels(2)
            .init(&device);

        unet.forward_conditioned(
            Tensor::zeros([1, 3, 8, 8], &device),
            Tensor::zeros([1, 2, 8, 8], &device),
        );
    }
}
