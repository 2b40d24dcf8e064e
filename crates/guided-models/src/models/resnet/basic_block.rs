//! # Basic Block for `ResNet`
//!
//! [`BasicBlock`] is the core `ResNet` convolution unit.
//!
//! [`BasicBlockMeta`] defines a common meta API for [`BasicBlock`]
//! and [`BasicBlockConfig`].
//!
//! [`BasicBlockConfig`] implements [`Config`], and provides
//! [`BasicBlockConfig::init`] to initialize a [`BasicBlock`].
//!
//! [`BasicBlock`] implements [`Module`], and provides
//! [`BasicBlock::forward`].
//!
//! ```text
//! out = relu(conv2(relu(conv1(x))) + shortcut(x))
//! ```

use crate::errors::{ArchitectureError, expect_positive};
use crate::layers::conv_norm::{ConvNorm2d, ConvNorm2dConfig, ConvNorm2dMeta};
use crate::layers::util::{conv_output_resolution, same_padding, scalar_to_array};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::nn::conv::Conv2dConfig;
use burn::nn::{PaddingConfig2d, Relu};
use burn::prelude::{Backend, Config, Module, Tensor};
use serde::{Deserialize, Serialize};

/// Normalization policy for the second conv branch of a [`BasicBlock`].
///
/// Only meaningful when the block is normalized at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SecondBranchNorm {
    /// Both conv branches carry a norm layer.
    #[default]
    Normalized,

    /// The second conv branch has neither a norm layer nor a bias.
    ///
    /// Reproduces blocks trained with an un-normalized second branch.
    Unnormalized,
}

/// [`BasicBlock`] Meta trait.
pub trait BasicBlockMeta {
    /// The size of the in channels dimension.
    fn in_channels(&self) -> usize;

    /// The size of the out channels dimension.
    fn out_channels(&self) -> usize;

    /// The (square) conv kernel size.
    fn kernel_size(&self) -> usize;

    /// The stride of the first conv, and of the shortcut projection.
    fn stride(&self) -> usize;

    /// Does the shortcut path project its input?
    ///
    /// True iff the channel count or the resolution changes.
    fn has_projection(&self) -> bool {
        self.stride() != 1 || self.in_channels() != self.out_channels()
    }

    /// Get the output resolution for a given input resolution.
    ///
    /// # Arguments
    ///
    /// - `input_resolution`: ``[in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// ``[out_height, out_width]``, ``out = (in - 1) / stride + 1``.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        let kernel_size = self.kernel_size();
        conv_output_resolution(
            input_resolution,
            kernel_size,
            self.stride(),
            same_padding(kernel_size),
        )
    }
}

/// [`BasicBlock`] Config.
///
/// Implements [`BasicBlockMeta`].
#[derive(Config, Debug)]
pub struct BasicBlockConfig {
    /// The size of the in channels dimension.
    pub in_channels: usize,

    /// The size of the out channels dimension.
    pub out_channels: usize,

    /// The (square, odd) conv kernel size.
    #[config(default = 3)]
    pub kernel_size: usize,

    /// The stride of the first conv and the shortcut.
    #[config(default = 1)]
    pub stride: usize,

    /// Normalize conv outputs; normalized convs drop their bias.
    #[config(default = false)]
    pub use_batchnorm: bool,

    /// Second branch normalization policy.
    #[config(default = "SecondBranchNorm::Normalized")]
    pub second_branch_norm: SecondBranchNorm,
}

impl BasicBlockMeta for BasicBlockConfig {
    fn in_channels(&self) -> usize {
        self.in_channels
    }

    fn out_channels(&self) -> usize {
        self.out_channels
    }

    fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    fn stride(&self) -> usize {
        self.stride
    }
}

impl BasicBlockConfig {
    /// Check if the config is valid.
    pub fn try_validate(&self) -> Result<(), ArchitectureError> {
        expect_positive("in_channels", self.in_channels)?;
        expect_positive("out_channels", self.out_channels)?;
        expect_positive("kernel_size", self.kernel_size)?;
        expect_positive("stride", self.stride)?;
        if self.kernel_size % 2 == 0 {
            return Err(ArchitectureError::EvenKernel(self.kernel_size));
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// The first conv/norm layer config.
    pub fn conv1_config(&self) -> ConvNorm2dConfig {
        let padding = same_padding(self.kernel_size);
        ConvNorm2dConfig::new(
            Conv2dConfig::new(
                [self.in_channels, self.out_channels],
                scalar_to_array(self.kernel_size),
            )
            .with_stride(scalar_to_array(self.stride))
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(!self.use_batchnorm),
        )
        .with_normalize(self.use_batchnorm)
    }

    /// The second conv/norm layer config.
    pub fn conv2_config(&self) -> ConvNorm2dConfig {
        let padding = same_padding(self.kernel_size);
        let normalize =
            self.use_batchnorm && self.second_branch_norm == SecondBranchNorm::Normalized;
        ConvNorm2dConfig::new(
            Conv2dConfig::new(
                [self.out_channels, self.out_channels],
                scalar_to_array(self.kernel_size),
            )
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_bias(!self.use_batchnorm),
        )
        .with_normalize(normalize)
    }

    /// The shortcut projection config; `None` for an identity shortcut.
    pub fn shortcut_config(&self) -> Option<ConvNorm2dConfig> {
        if !self.has_projection() {
            return None;
        }
        ConvNorm2dConfig::new(
            Conv2dConfig::new([self.in_channels, self.out_channels], [1, 1])
                .with_stride(scalar_to_array(self.stride))
                .with_padding(PaddingConfig2d::Explicit(0, 0))
                .with_bias(false),
        )
        .with_normalize(self.use_batchnorm)
        .into()
    }

    /// Initialize a [`BasicBlock`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> BasicBlock<B> {
        self.expect_valid();

        tracing::debug!(
            in_channels = self.in_channels,
            out_channels = self.out_channels,
            stride = self.stride,
            projection = self.has_projection(),
            "building BasicBlock"
        );

        BasicBlock {
            projection: self.shortcut_config().map(|cfg| cfg.init(device)),
            conv1: self.conv1_config().init(device),
            conv2: self.conv2_config().init(device),
            act: Relu::new(),
        }
    }
}

/// Basic Block for `ResNet`.
///
/// Implements [`BasicBlockMeta`].
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    /// Optional projection for the residual connection.
    pub projection: Option<ConvNorm2d<B>>,

    /// First conv/norm; carries the stride.
    pub conv1: ConvNorm2d<B>,

    /// Second conv/norm; stride 1.
    pub conv2: ConvNorm2d<B>,

    /// Shared activation.
    pub act: Relu,
}

impl<B: Backend> BasicBlockMeta for BasicBlock<B> {
    fn in_channels(&self) -> usize {
        self.conv1.in_channels()
    }

    fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }

    fn kernel_size(&self) -> usize {
        self.conv1.conv.kernel_size[0]
    }

    fn stride(&self) -> usize {
        self.conv1.stride()[0]
    }

    fn has_projection(&self) -> bool {
        self.projection.is_some()
    }
}

impl<B: Backend> BasicBlock<B> {
    /// The shortcut path alone.
    ///
    /// The identity when the block has no projection.
    pub fn shortcut(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        match &self.projection {
            Some(projection) => projection.forward(input),
            None => input,
        }
    }

    /// Forward Pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, in_height, in_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, out_channels, out_height, out_width]`` tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!["batch", "in_channels", "in_height", "in_width"];
        let [batch, in_height, in_width] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch", "in_height", "in_width"],
            &[("in_channels", self.in_channels())],
        );
        let [out_height, out_width] = self.output_resolution([in_height, in_width]);

        let identity = self.shortcut(input.clone());

        let x = self.conv1.forward(input);
        let x = self.act.forward(x);
        let x = self.conv2.forward(x);
        let x = self.act.forward(x + identity);

        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract =
                shape_contract!["batch", "out_channels", "out_height", "out_width"];
            OUTPUT_CONTRACT.assert_shape(
                &x,
                &[
                    ("batch", batch),
                    ("out_channels", self.out_channels()),
                    ("out_height", out_height),
                    ("out_width", out_width),
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
    use burn::tensor::Distribution;
    use burn::tensor::activation::relu;

    static OUTPUT_CONTRACT: ShapeContract =
        shape_contract!["batch", "out_channels", "out_height", "out_width"];

    #[test]
    fn test_basic_block_config() {
        let config = BasicBlockConfig::new(16, 32);
        config.expect_valid();
        assert_eq!(config.in_channels(), 16);
        assert_eq!(config.out_channels(), 32);
        assert_eq!(config.kernel_size(), 3);
        assert_eq!(config.stride(), 1);
        assert!(config.has_projection());
        assert_eq!(config.output_resolution([16, 16]), [16, 16]);

        let config = config.with_stride(2);
        assert_eq!(config.output_resolution([16, 16]), [8, 8]);
        assert_eq!(config.output_resolution([7, 9]), [4, 5]);

        let config = BasicBlockConfig::new(8, 8);
        assert!(!config.has_projection());
        assert!(config.shortcut_config().is_none());
    }

    #[test]
    fn test_basic_block_config_validation() {
        assert_eq!(
            BasicBlockConfig::new(4, 4)
                .with_kernel_size(4)
                .try_validate(),
            Err(ArchitectureError::EvenKernel(4))
        );
        assert_eq!(
            BasicBlockConfig::new(4, 4).with_stride(0).try_validate(),
            Err(ArchitectureError::zero_size("stride"))
        );
        assert_eq!(
            BasicBlockConfig::new(0, 4).try_validate(),
            Err(ArchitectureError::zero_size("in_channels"))
        );
    }

    #[test]
    #[should_panic(expected = "kernel_size (2) must be odd")]
    fn test_basic_block_init_rejects_even_kernel() {
        let device = Default::default();
        let _block: BasicBlock<NdArray<f32>> = BasicBlockConfig::new(4, 4)
            .with_kernel_size(2)
            .init(&device);
    }

    #[test]
    fn test_second_branch_norm_policy() {
        type B = NdArray<f32>;
        let device = Default::default();

        let normalized: BasicBlock<B> = BasicBlockConfig::new(2, 4)
            .with_use_batchnorm(true)
            .init(&device);
        assert!(normalized.conv1.is_normalized());
        assert!(normalized.conv2.is_normalized());
        assert!(normalized.conv2.conv.bias.is_none());
        assert!(normalized.projection.as_ref().unwrap().is_normalized());

        let asymmetric: BasicBlock<B> = BasicBlockConfig::new(2, 4)
            .with_use_batchnorm(true)
            .with_second_branch_norm(SecondBranchNorm::Unnormalized)
            .init(&device);
        assert!(asymmetric.conv1.is_normalized());
        assert!(!asymmetric.conv2.is_normalized());
        assert!(asymmetric.conv2.conv.bias.is_none());
        assert!(asymmetric.projection.as_ref().unwrap().is_normalized());

        let plain: BasicBlock<B> = BasicBlockConfig::new(2, 4).init(&device);
        assert!(!plain.conv1.is_normalized());
        assert!(!plain.conv2.is_normalized());
        assert!(plain.conv1.conv.bias.is_some());
        assert!(plain.conv2.conv.bias.is_some());
        assert!(!plain.projection.as_ref().unwrap().is_normalized());
    }

    #[test]
    fn test_identity_shortcut() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: BasicBlock<B> = BasicBlockConfig::new(4, 4)
            .with_use_batchnorm(true)
            .init(&device);
        assert!(!block.has_projection());

        let input: Tensor<B, 4> = Tensor::random([2, 4, 6, 6], Distribution::Default, &device);
        let identity = block.shortcut(input.clone());

        identity.to_data().assert_eq(&input.to_data(), true);
    }

    #[test]
    fn test_projection_shortcut_matches_main_path() {
        type B = NdArray<f32>;
        let device = Default::default();

        for (in_channels, out_channels, stride, size) in
            [(2, 4, 1, 8), (4, 4, 2, 8), (2, 6, 2, 7), (3, 5, 3, 10)]
        {
            let block: BasicBlock<B> = BasicBlockConfig::new(in_channels, out_channels)
                .with_stride(stride)
                .init(&device);
            assert!(block.has_projection());

            let input: Tensor<B, 4> =
                Tensor::random([2, in_channels, size, size], Distribution::Default, &device);

            let identity = block.shortcut(input.clone());
            let main = block.conv2.forward(block.conv1.forward(input));
            assert_eq!(identity.dims(), main.dims());
        }
    }

    #[test]
    fn test_forward_is_residual_sum() {
        type B = NdArray<f32>;
        let device = Default::default();

        for config in [
            BasicBlockConfig::new(4, 4),
            BasicBlockConfig::new(4, 4).with_use_batchnorm(true),
            BasicBlockConfig::new(2, 6).with_stride(2),
            BasicBlockConfig::new(3, 5)
                .with_use_batchnorm(true)
                .with_second_branch_norm(SecondBranchNorm::Unnormalized),
        ] {
            let block: BasicBlock<B> = config.init(&device);

            let input: Tensor<B, 4> = Tensor::random(
                [2, block.in_channels(), 7, 7],
                Distribution::Uniform(-1.0, 1.0),
                &device,
            );

            let main = block.conv2.forward(relu(block.conv1.forward(input.clone())));
            let expected = relu(main + block.shortcut(input.clone()));

            block
                .forward(input)
                .to_data()
                .assert_eq(&expected.to_data(), true);
        }
    }

    #[test]
    fn test_basic_block_forward_same_channels_autodiff() {
        type B = Autodiff<NdArray<f32>>;
        let device = Default::default();

        let block: BasicBlock<B> = BasicBlockConfig::new(4, 4)
            .with_use_batchnorm(true)
            .init(&device);

        let input = Tensor::ones([2, 4, 8, 8], &device);
        let output = block.forward(input);

        OUTPUT_CONTRACT.assert_shape(
            &output,
            &[
                ("batch", 2),
                ("out_channels", 4),
                ("out_height", 8),
                ("out_width", 8),
            ],
        );
    }

    #[test]
    fn test_basic_block_forward_downsample() {
        type B = NdArray<f32>;
        let device = Default::default();

        let block: BasicBlock<B> = BasicBlockConfig::new(2, 8)
            .with_stride(2)
            .with_kernel_size(5)
            .init(&device);

        let [out_height, out_width] = block.output_resolution([9, 12]);
        assert_eq!([out_height, out_width], [5, 6]);

        let input = Tensor::ones([3, 2, 9, 12], &device);
        let output = block.forward(input);

        OUTPUT_CONTRACT.assert_shape(
            &output,
            &[
                ("batch", 3),
                ("out_channels", 8),
                ("out_height", out_height),
                ("out_width", out_width),
            ],
        );

        // relu output.
        let min: f32 = output.min().into_scalar();
        assert!(min >= 0.0);
    }
}
