//! # Classifying `ResNet` Model
//!
//! ```text
//! stem:  conv 7x7/2 [+ norm] -> relu -> maxpool 3x3/2
//! body:  layer1 -> layer2 -> layer3 -> layer4
//! head:  adaptive avgpool 1x1 -> flatten -> linear
//! ```
//!
//! The stem preserves the input channel count; ``layer1`` maps
//! ``in_channels -> block_channels[0]``.

use crate::errors::{ArchitectureError, expect_positive};
use crate::layers::conv_norm::{ConvNorm2d, ConvNorm2dConfig, ConvNorm2dMeta};
use crate::layers::util::conv_output_resolution;
use crate::models::guided::ImageClassifier;
use crate::models::resnet::basic_block::{BasicBlockConfig, SecondBranchNorm};
use crate::models::resnet::layer_block::{LayerBlock, LayerBlockConfig, LayerBlockMeta};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::Conv2dConfig;
use burn::nn::pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig};
use burn::nn::{Linear, LinearConfig, PaddingConfig2d, Relu};
use burn::prelude::{Backend, Tensor};

/// The number of residual stages.
pub const NUM_STAGES: usize = 4;

const STEM_KERNEL: usize = 7;
const STEM_STRIDE: usize = 2;
const STEM_PADDING: usize = 3;

const POOL_KERNEL: usize = 3;
const POOL_STRIDE: usize = 2;
const POOL_PADDING: usize = 1;

/// [`ClassifyingResNet`] Config.
#[derive(Config, Debug)]
pub struct ClassifyingResNetConfig {
    /// Input image channels.
    #[config(default = 3)]
    pub in_channels: usize,

    /// Output logit count.
    #[config(default = 10)]
    pub num_classes: usize,

    /// Per-stage output channels.
    #[config(default = "vec![16, 32, 64, 128]")]
    pub block_channels: Vec<usize>,

    /// Per-stage block counts.
    #[config(default = "vec![2, 2, 2, 2]")]
    pub num_blocks: Vec<usize>,

    /// Per-stage stride of the first block.
    #[config(default = "vec![2, 1, 1, 1]")]
    pub strides: Vec<usize>,

    /// Normalize the stem and every block.
    #[config(default = true)]
    pub use_batchnorm: bool,

    /// Second branch norm policy for every block.
    #[config(default = "SecondBranchNorm::Normalized")]
    pub second_branch_norm: SecondBranchNorm,
}

impl ClassifyingResNetConfig {
    /// Check if the config is valid.
    ///
    /// Stage arrays must each have [`NUM_STAGES`] entries; every
    /// stage must build a valid [`LayerBlockConfig`].
    pub fn try_validate(&self) -> Result<(), ArchitectureError> {
        expect_positive("in_channels", self.in_channels)?;
        expect_positive("num_classes", self.num_classes)?;

        for (field, values) in [
            ("block_channels", &self.block_channels),
            ("num_blocks", &self.num_blocks),
            ("strides", &self.strides),
        ] {
            if values.len() != NUM_STAGES {
                return Err(ArchitectureError::StageArity {
                    field,
                    expected: NUM_STAGES,
                    actual: values.len(),
                });
            }
        }

        for (idx, stage) in self.stage_configs().iter().enumerate() {
            expect_positive(&format!("num_blocks[{idx}]"), stage.len())?;
            stage.try_validate()?;
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// The stem conv/norm config.
    pub fn stem_config(&self) -> ConvNorm2dConfig {
        ConvNorm2dConfig::new(
            Conv2dConfig::new([self.in_channels, self.in_channels], [STEM_KERNEL; 2])
                .with_stride([STEM_STRIDE; 2])
                .with_padding(PaddingConfig2d::Explicit(STEM_PADDING, STEM_PADDING))
                .with_bias(!self.use_batchnorm),
        )
        .with_normalize(self.use_batchnorm)
    }

    /// The per-stage configs.
    ///
    /// Stage `i` maps ``block_channels[i - 1] -> block_channels[i]``;
    /// stage 0 consumes the stem output.
    ///
    /// Assumes the stage arrays have equal length.
    pub fn stage_configs(&self) -> Vec<LayerBlockConfig> {
        std::iter::once(self.in_channels)
            .chain(self.block_channels.iter().copied())
            .zip(self.block_channels.iter())
            .zip(self.num_blocks.iter().zip(self.strides.iter()))
            .map(|((in_channels, &out_channels), (&num_blocks, &stride))| {
                LayerBlockConfig::build(
                    num_blocks,
                    BasicBlockConfig::new(in_channels, out_channels)
                        .with_stride(stride)
                        .with_use_batchnorm(self.use_batchnorm)
                        .with_second_branch_norm(self.second_branch_norm),
                )
            })
            .collect()
    }

    /// Initialize a [`ClassifyingResNet`].
    ///
    /// # Panics
    ///
    /// If the config is invalid.
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> ClassifyingResNet<B> {
        self.expect_valid();

        let [layer1, layer2, layer3, layer4] = match <[LayerBlockConfig; NUM_STAGES]>::try_from(
            self.stage_configs(),
        ) {
            Ok(stages) => stages,
            Err(stages) => unreachable!("validated stage count: {}", stages.len()),
        };

        let feature_channels = layer4.out_channels();

        tracing::info!(
            in_channels = self.in_channels,
            num_classes = self.num_classes,
            block_channels = ?self.block_channels,
            num_blocks = ?self.num_blocks,
            strides = ?self.strides,
            use_batchnorm = self.use_batchnorm,
            "building ClassifyingResNet"
        );

        ClassifyingResNet {
            stem: self.stem_config().init(device),
            act: Relu::new(),
            maxpool: MaxPool2dConfig::new([POOL_KERNEL; 2])
                .with_strides([POOL_STRIDE; 2])
                .with_padding(PaddingConfig2d::Explicit(POOL_PADDING, POOL_PADDING))
                .init(),

            layer1: layer1.init(device),
            layer2: layer2.init(device),
            layer3: layer3.init(device),
            layer4: layer4.init(device),

            avgpool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            fc: LinearConfig::new(feature_channels, self.num_classes).init(device),
        }
    }

    /// Initialize a [`ClassifyingResNet`], or report why the config is invalid.
    pub fn try_init<B: Backend>(
        self,
        device: &B::Device,
    ) -> Result<ClassifyingResNet<B>, ArchitectureError> {
        self.try_validate()?;
        Ok(self.init(device))
    }
}

/// Residual image classifier.
///
/// Maps ``[batch, in_channels, height, width]`` images to ``[batch, num_classes]`` logits.
#[derive(Module, Debug)]
pub struct ClassifyingResNet<B: Backend> {
    /// Stem conv/norm.
    pub stem: ConvNorm2d<B>,
    /// Shared activation.
    pub act: Relu,
    /// Stem pool.
    pub maxpool: MaxPool2d,

    /// Stage 1.
    pub layer1: LayerBlock<B>,
    /// Stage 2.
    pub layer2: LayerBlock<B>,
    /// Stage 3.
    pub layer3: LayerBlock<B>,
    /// Stage 4.
    pub layer4: LayerBlock<B>,

    /// Global pool.
    pub avgpool: AdaptiveAvgPool2d,
    /// Classifier head.
    pub fc: Linear<B>,
}

impl<B: Backend> ClassifyingResNet<B> {
    /// Input image channels.
    pub fn in_channels(&self) -> usize {
        self.stem.in_channels()
    }

    /// Channels entering the global pool.
    pub fn feature_channels(&self) -> usize {
        self.layer4.out_channels()
    }

    /// Output logit count.
    pub fn num_classes(&self) -> usize {
        self.fc.weight.shape().dims[1]
    }

    /// Spatial size of the feature map entering the global pool.
    pub fn feature_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        let res =
            conv_output_resolution(input_resolution, STEM_KERNEL, STEM_STRIDE, STEM_PADDING);
        let res = conv_output_resolution(res, POOL_KERNEL, POOL_STRIDE, POOL_PADDING);
        [&self.layer1, &self.layer2, &self.layer3, &self.layer4]
            .iter()
            .fold(res, |res, layer| layer.output_resolution(res))
    }

    /// Global average pool.
    ///
    /// Maps ``[batch, channels, height, width]`` to ``[batch, channels]``.
    pub fn global_pool(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        let x = self.avgpool.forward(input);
        // [B, C, 1, 1] -> [B, C]
        x.flatten(1, 3)
    }

    /// Pooled penultimate features.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, height, width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, feature_channels]`` tensor.
    pub fn features(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!["batch", "in_channels", "height", "width"];
        let [batch] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch"],
            &[("in_channels", self.in_channels())],
        );

        // Stem
        let x = self.stem.forward(input);
        let x = self.act.forward(x);
        let x = self.maxpool.forward(x);

        // Residual stages
        let x = self.layer1.forward(x);
        let x = self.layer2.forward(x);
        let x = self.layer3.forward(x);
        let x = self.layer4.forward(x);

        let x = self.global_pool(x);

        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract = shape_contract!["batch", "feature_channels"];
            OUTPUT_CONTRACT.assert_shape(
                &x,
                &[
                    ("batch", batch),
                    ("feature_channels", self.feature_channels()),
                ],
            );
        });

        x
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, height, width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, num_classes]`` logits tensor.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        let x = self.features(input);
        self.fc.forward(x)
    }
}

impl<B: Backend> ImageClassifier<B> for ClassifyingResNet<B> {
    fn in_channels(&self) -> usize {
        ClassifyingResNet::in_channels(self)
    }

    fn num_classes(&self) -> usize {
        ClassifyingResNet::num_classes(self)
    }

    fn classify(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 2> {
        self.forward(input)
    }
}
