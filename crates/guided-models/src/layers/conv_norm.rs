//! # `ConvNorm` Module
//!
//! A [`ConvNorm2d`] module is a [`Conv2d`] layer optionally followed by a [`BatchNorm`] layer.
//!
//! The optional norm is decided once, from [`ConvNorm2dConfig::normalize`];
//! a block never grows or loses its norm after construction.

use crate::layers::util::conv_output_resolution;
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::conv::{Conv2d, Conv2dConfig};
use burn::nn::{BatchNorm, BatchNormConfig, PaddingConfig2d};
use burn::prelude::{Backend, Tensor};

/// [`ConvNorm2d`] Meta.
pub trait ConvNorm2dMeta {
    /// Number of input channels.
    fn in_channels(&self) -> usize;

    /// Number of output channels.
    fn out_channels(&self) -> usize;

    /// Get the stride.
    fn stride(&self) -> &[usize; 2];

    /// Does this block have a norm layer?
    fn is_normalized(&self) -> bool;
}

/// [`ConvNorm2d`] Config.
#[derive(Config, Debug)]
pub struct ConvNorm2dConfig {
    /// The [`Conv2d`] config.
    pub conv: Conv2dConfig,

    /// Append a [`BatchNorm`] over the conv output channels.
    #[config(default = true)]
    pub normalize: bool,
}

impl ConvNorm2dMeta for ConvNorm2dConfig {
    fn in_channels(&self) -> usize {
        self.conv.channels[0]
    }

    fn out_channels(&self) -> usize {
        self.conv.channels[1]
    }

    fn stride(&self) -> &[usize; 2] {
        &self.conv.stride
    }

    fn is_normalized(&self) -> bool {
        self.normalize
    }
}

impl From<Conv2dConfig> for ConvNorm2dConfig {
    fn from(conv: Conv2dConfig) -> Self {
        Self {
            conv,
            normalize: true,
        }
    }
}

impl ConvNorm2dConfig {
    /// Get the output resolution for a given input resolution.
    ///
    /// Only square kernels with ``Explicit`` or ``Valid`` padding are supported.
    pub fn output_resolution(
        &self,
        input_resolution: [usize; 2],
    ) -> [usize; 2] {
        let padding = match &self.conv.padding {
            PaddingConfig2d::Explicit(h, w) => {
                assert_eq!(h, w, "non-square padding: {:?}", self.conv.padding);
                *h
            }
            PaddingConfig2d::Valid => 0,
            other => panic!("unsupported padding: {other:?}"),
        };
        conv_output_resolution(
            input_resolution,
            self.conv.kernel_size[0],
            self.conv.stride[0],
            padding,
        )
    }

    /// Initialize a [`ConvNorm2d`].
    pub fn init<B: Backend>(
        self,
        device: &B::Device,
    ) -> ConvNorm2d<B> {
        let out_channels = self.out_channels();
        ConvNorm2d {
            conv: self.conv.init(device),
            norm: if self.normalize {
                Some(BatchNormConfig::new(out_channels).init(device))
            } else {
                None
            },
        }
    }
}

/// Grouped [`Conv2d`] and optional [`BatchNorm`] layer.
#[derive(Module, Debug)]
pub struct ConvNorm2d<B: Backend> {
    /// Internal Conv2d layer.
    pub conv: Conv2d<B>,

    /// Optional Norm Layer.
    pub norm: Option<BatchNorm<B, 2>>,
}

impl<B: Backend> ConvNorm2dMeta for ConvNorm2d<B> {
    fn in_channels(&self) -> usize {
        self.conv.weight.shape().dims[1] * self.conv.groups
    }

    fn out_channels(&self) -> usize {
        self.conv.weight.shape().dims[0]
    }

    fn stride(&self) -> &[usize; 2] {
        &self.conv.stride
    }

    fn is_normalized(&self) -> bool {
        self.norm.is_some()
    }
}

impl<B: Backend> ConvNorm2d<B> {
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
        let [batch] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch"],
            &[("in_channels", self.in_channels())],
        );

        let x = self.conv.forward(input);

        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };

        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract =
                shape_contract!["batch", "out_channels", "out_height", "out_width"];
            OUTPUT_CONTRACT.assert_shape(
                &x,
                &[("batch", batch), ("out_channels", self.out_channels())],
            );
        });

        x
    }
}
