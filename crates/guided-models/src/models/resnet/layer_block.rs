//! # `ResNet` Layer Block
//!
//! A [`LayerBlock`] is one `ResNet` stage: a sequence of [`BasicBlock`]s.
//!
//! [`LayerBlockMeta`] defines a common meta API for [`LayerBlock`]
//! and [`LayerBlockConfig`].
//!
//! [`LayerBlockConfig`] implements [`Config`], and provides
//! [`LayerBlockConfig::init`] to initialize a [`LayerBlock`].
//!
//! [`LayerBlock`] implements [`Module`], and provides
//! [`LayerBlock::forward`].

use crate::errors::ArchitectureError;
use crate::models::resnet::basic_block::{BasicBlock, BasicBlockConfig, BasicBlockMeta};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::prelude::{Backend, Module, Tensor};

/// [`LayerBlock`] Meta API.
pub trait LayerBlockMeta {
    /// The number of blocks.
    fn len(&self) -> usize;

    /// Check if the layer block is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of input feature planes.
    fn in_channels(&self) -> usize;

    /// The number of output feature planes.
    fn out_channels(&self) -> usize;

    /// Get the output resolution for a given input resolution.
    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2];
}

/// [`LayerBlock`] Configuration.
#[derive(Config, Debug)]
pub struct LayerBlockConfig {
    /// The component blocks.
    pub blocks: Vec<BasicBlockConfig>,
}

impl From<Vec<BasicBlockConfig>> for LayerBlockConfig {
    fn from(blocks: Vec<BasicBlockConfig>) -> Self {
        Self { blocks }
    }
}

impl LayerBlockMeta for LayerBlockConfig {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn in_channels(&self) -> usize {
        self.blocks[0].in_channels()
    }

    fn out_channels(&self) -> usize {
        self.blocks[self.blocks.len() - 1].out_channels()
    }

    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        self.blocks
            .iter()
            .fold(input_resolution, |res, block| block.output_resolution(res))
    }
}

impl LayerBlockConfig {
    /// Build a stage config.
    ///
    /// The `head` block carries the stage's channel change and stride;
    /// the remaining ``num_blocks - 1`` blocks copy its settings with
    /// ``out_channels -> out_channels`` at stride 1.
    pub fn build(
        num_blocks: usize,
        head: BasicBlockConfig,
    ) -> Self {
        let tail = BasicBlockConfig {
            in_channels: head.out_channels,
            stride: 1,
            ..head.clone()
        };

        let blocks = (0..num_blocks)
            .map(|b| if b == 0 { head.clone() } else { tail.clone() })
            .collect();

        Self { blocks }
    }

    /// Check if the config is valid.
    pub fn try_validate(&self) -> Result<(), ArchitectureError> {
        if self.is_empty() {
            return Err(ArchitectureError::zero_size("blocks"));
        }

        for (idx, block) in self.blocks.iter().enumerate() {
            block.try_validate()?;
            if idx == 0 {
                continue;
            }
            let prev = &self.blocks[idx - 1];
            if prev.out_channels() != block.in_channels() {
                return Err(ArchitectureError::ChannelChain {
                    upstream: format!("block[{}]", idx - 1),
                    out_channels: prev.out_channels(),
                    downstream: format!("block[{idx}]"),
                    in_channels: block.in_channels(),
                });
            }
        }
        Ok(())
    }

    /// Panic if `try_validate` returns an error.
    pub fn expect_valid(&self) {
        if let Err(err) = self.try_validate() {
            panic!("{err}");
        }
    }

    /// Initialize a new [`LayerBlock`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> LayerBlock<B> {
        self.expect_valid();

        LayerBlock {
            blocks: self
                .blocks
                .into_iter()
                .map(|block| block.init(device))
                .collect(),
        }
    }
}

/// Layer block.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    /// Internal blocks.
    pub blocks: Vec<BasicBlock<B>>,
}

impl<B: Backend> LayerBlockMeta for LayerBlock<B> {
    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn in_channels(&self) -> usize {
        self.blocks[0].in_channels()
    }

    fn out_channels(&self) -> usize {
        self.blocks[self.blocks.len() - 1].out_channels()
    }

    fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        self.blocks
            .iter()
            .fold(input_resolution, |res, block| block.output_resolution(res))
    }
}

impl<B: Backend> LayerBlock<B> {
    /// Apply the layer block.
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

        let x = self.blocks.iter().fold(input, |x, block| block.forward(x));

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
