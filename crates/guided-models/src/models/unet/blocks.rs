//! # U-Net Blocks
//!
//! * [`ConvBlock`] - two ``3x3`` conv/norm/relu layers.
//! * [`EncoderBlock`] - optional ``2x2`` max-pool, then a [`ConvBlock`].
//! * [`DecoderBlock`] - ``2x2/2`` transposed conv, skip concat, then a [`ConvBlock`].

use crate::errors::{ArchitectureError, expect_positive};
use crate::layers::conv_norm::{ConvNorm2d, ConvNorm2dConfig, ConvNorm2dMeta};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig};
use burn::nn::pool::{MaxPool2d, MaxPool2dConfig};
use burn::nn::{PaddingConfig2d, Relu};
use burn::prelude::{Backend, Tensor};

/// [`ConvBlock`] Config.
#[derive(Config, Debug)]
pub struct ConvBlockConfig {
    /// Input channels.
    pub in_channels: usize,

    /// Output channels.
    pub out_channels: usize,

    /// Normalize both convs.
    #[config(default = true)]
    pub use_batchnorm: bool,
}

impl ConvBlockConfig {
    /// Check if the config is valid.
    pub fn try_validate(&self) -> Result<(), ArchitectureError> {
        expect_positive("in_channels", self.in_channels)?;
        expect_positive("out_channels", self.out_channels)
    }

    fn conv_config(
        &self,
        in_channels: usize,
    ) -> ConvNorm2dConfig {
        ConvNorm2dConfig::new(
            Conv2dConfig::new([in_channels, self.out_channels], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(!self.use_batchnorm),
        )
        .with_normalize(self.use_batchnorm)
    }

    /// Initialize a [`ConvBlock`].
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> ConvBlock<B> {
        ConvBlock {
            conv1: self.conv_config(self.in_channels).init(device),
            conv2: self.conv_config(self.out_channels).init(device),
            act: Relu::new(),
        }
    }
}

/// Resolution preserving double conv.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    /// First conv/norm.
    pub conv1: ConvNorm2d<B>,
    /// Second conv/norm.
    pub conv2: ConvNorm2d<B>,
    /// Shared activation.
    pub act: Relu,
}

impl<B: Backend> ConvBlock<B> {
    /// Input channels.
    pub fn in_channels(&self) -> usize {
        self.conv1.in_channels()
    }

    /// Output channels.
    pub fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }

    /// Forward pass.
    ///
    /// Maps ``[batch, in_channels, height, width]`` to ``[batch, out_channels, height, width]``.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!["batch", "in_channels", "height", "width"];
        let [batch, height, width] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch", "height", "width"],
            &[("in_channels", self.in_channels())],
        );

        let x = self.act.forward(self.conv1.forward(input));
        let x = self.act.forward(self.conv2.forward(x));

        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract =
                shape_contract!["batch", "out_channels", "height", "width"];
            OUTPUT_CONTRACT.assert_shape(
                &x,
                &[
                    ("batch", batch),
                    ("out_channels", self.out_channels()),
                    ("height", height),
                    ("width", width),
                ],
            );
        });

        x
    }
}

/// [`EncoderBlock`] Config.
#[derive(Config, Debug)]
pub struct EncoderBlockConfig {
    /// The conv block.
    pub conv: ConvBlockConfig,

    /// Halve the resolution before the conv block.
    #[config(default = true)]
    pub downsample: bool,
}

impl EncoderBlockConfig {
    /// Initialize an [`EncoderBlock`].
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> EncoderBlock<B> {
        EncoderBlock {
            pool: if self.downsample {
                Some(MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init())
            } else {
                None
            },
            conv: self.conv.init(device),
        }
    }
}

/// U-Net encoder level.
#[derive(Module, Debug)]
pub struct EncoderBlock<B: Backend> {
    /// Optional ``2x2/2`` pool.
    pub pool: Option<MaxPool2d>,
    /// The conv block.
    pub conv: ConvBlock<B>,
}

impl<B: Backend> EncoderBlock<B> {
    /// Does this level halve its input?
    pub fn is_downsampling(&self) -> bool {
        self.pool.is_some()
    }

    /// Forward pass.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = match &self.pool {
            Some(pool) => pool.forward(input),
            None => input,
        };
        self.conv.forward(x)
    }
}

/// [`DecoderBlock`] Config.
#[derive(Config, Debug)]
pub struct DecoderBlockConfig {
    /// Channels arriving from the level below.
    pub in_channels: usize,

    /// Channels of the skip connection.
    pub skip_channels: usize,

    /// Output channels.
    pub out_channels: usize,

    /// Normalize the conv block.
    #[config(default = true)]
    pub use_batchnorm: bool,
}

impl DecoderBlockConfig {
    /// Initialize a [`DecoderBlock`].
    pub fn init<B: Backend>(
        &self,
        device: &B::Device,
    ) -> DecoderBlock<B> {
        DecoderBlock {
            up: ConvTranspose2dConfig::new([self.in_channels, self.out_channels], [2, 2])
                .with_stride([2, 2])
                .init(device),
            conv: ConvBlockConfig::new(self.out_channels + self.skip_channels, self.out_channels)
                .with_use_batchnorm(self.use_batchnorm)
                .init(device),
        }
    }
}

/// U-Net decoder level.
#[derive(Module, Debug)]
pub struct DecoderBlock<B: Backend> {
    /// ``2x2/2`` upsampling.
    pub up: ConvTranspose2d<B>,
    /// The conv block, over the upsampled features and the skip.
    pub conv: ConvBlock<B>,
}

impl<B: Backend> DecoderBlock<B> {
    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, height, width]``.
    /// - `skip`: ``[batch, skip_channels, 2 * height, 2 * width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_channels, 2 * height, 2 * width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        skip: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!["batch", "in_channels", "height", "width"];
        let [batch, height, width] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch", "height", "width"],
            &[("in_channels", self.up.weight.shape().dims[0])],
        );
        run_every_nth!({
            static SKIP_CONTRACT: ShapeContract =
                shape_contract!["batch", "skip_channels", "skip_height", "skip_width"];
            SKIP_CONTRACT.assert_shape(
                &skip,
                &[
                    ("batch", batch),
                    ("skip_height", 2 * height),
                    ("skip_width", 2 * width),
                ],
            );
        });

        let x = self.up.forward(input);
        let x = Tensor::cat(vec![x, skip], 1);
        self.conv.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    #[test]
    fn test_conv_block() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: ConvBlock<B> = ConvBlockConfig::new(3, 8).init(&device);
        assert_eq!(block.in_channels(), 3);
        assert_eq!(block.out_channels(), 8);

        let output = block.forward(Tensor::ones([2, 3, 9, 7], &device));
        assert_eq!(output.dims(), [2, 8, 9, 7]);

        assert!(ConvBlockConfig::new(0, 8).try_validate().is_err());
    }

    #[test]
    fn test_encoder_block() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: EncoderBlock<B> =
            EncoderBlockConfig::new(ConvBlockConfig::new(4, 8)).init(&device);
        assert!(block.is_downsampling());
        assert_eq!(block.forward(Tensor::ones([1, 4, 12, 8], &device)).dims(), [1, 8, 6, 4]);

        let block: EncoderBlock<B> = EncoderBlockConfig::new(ConvBlockConfig::new(4, 8))
            .with_downsample(false)
            .init(&device);
        assert!(!block.is_downsampling());
        assert_eq!(block.forward(Tensor::ones([1, 4, 12, 8], &device)).dims(), [1, 8, 12, 8]);
    }

    #[test]
    fn test_decoder_block() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: DecoderBlock<B> = DecoderBlockConfig::new(16, 8, 8).init(&device);

        let input = Tensor::ones([2, 16, 6, 5], &device);
        let skip = Tensor::ones([2, 8, 12, 10], &device);
        let output = block.forward(input, skip);

        static CONTRACT: ShapeContract =
            shape_contract!["batch", "out_channels", "height", "width"];
        CONTRACT.assert_shape(
            &output,
            &[
                ("batch", 2),
                ("out_channels", 8),
                ("height", 12),
                ("width", 10),
            ],
        );
    }
}
