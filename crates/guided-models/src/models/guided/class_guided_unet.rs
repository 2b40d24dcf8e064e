//! # Class Guided U-Net
//!
//! ```text
//! image -> classifier (frozen) -> logits [batch, num_classes]
//!       -> projection          -> [batch, feature_channels * h * w]
//!       -> reshape             -> [batch, feature_channels, h, w]
//! (image, conditioning) -> unet -> output
//! ```
//!
//! ``[h, w] = input_resolution / 2^downsample_stages``; the U-Net must
//! declare the same injection point, which is checked at construction.
//!
//! The classifier is frozen once, at construction: its parameters stop
//! requiring gradients, and its logits are detached in every forward
//! pass. An optimizer stepping the guided model therefore never sees a
//! classifier gradient, and leaves the classifier weights unchanged.
//! The frozen classifier is only reachable through
//! [`ClassGuidedUNet::classifier`], so it cannot be swapped for a
//! trainable one after construction.

use crate::errors::{ArchitectureError, expect_positive};
use crate::models::guided::{ConditionedDenoiser, ImageClassifier, halve_resolution};
use bimm_contracts::{ShapeContract, run_every_nth, shape_contract};
use burn::config::Config;
use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::prelude::{Backend, Tensor};

/// [`ClassGuidedUNet`] Config.
#[derive(Config, Debug)]
pub struct ClassGuidedUNetConfig {
    /// Channels of the conditioning map.
    #[config(default = 32)]
    pub feature_channels: usize,

    /// Expected ``[height, width]`` of input images.
    #[config(default = "[96, 96]")]
    pub input_resolution: [usize; 2],

    /// Number of stride-2 reductions between the input and the U-Net injection point.
    #[config(default = 3)]
    pub downsample_stages: usize,
}

impl ClassGuidedUNetConfig {
    /// The ``[height, width]`` of the conditioning map.
    pub fn conditioning_resolution(&self) -> Result<[usize; 2], ArchitectureError> {
        halve_resolution(self.input_resolution, self.downsample_stages)
    }

    /// Check if the config is valid, on its own.
    pub fn try_validate(&self) -> Result<(), ArchitectureError> {
        expect_positive("feature_channels", self.feature_channels)?;
        self.conditioning_resolution()?;
        Ok(())
    }

    /// Check the config against the modules it will compose.
    pub fn try_validate_with<B, C, U>(
        &self,
        classifier: &C,
        unet: &U,
    ) -> Result<(), ArchitectureError>
    where
        B: Backend,
        C: ImageClassifier<B>,
        U: ConditionedDenoiser<B>,
    {
        self.try_validate()?;
        expect_positive("classifier.num_classes", classifier.num_classes())?;

        if classifier.in_channels() != unet.in_channels() {
            return Err(ArchitectureError::InputChannelMismatch {
                classifier: classifier.in_channels(),
                unet: unet.in_channels(),
            });
        }

        let [height, width] = self.conditioning_resolution()?;
        let [expected_height, expected_width] =
            unet.conditioning_resolution(self.input_resolution)?;
        let expected_channels = unet.conditioning_channels();

        if [self.feature_channels, height, width]
            != [expected_channels, expected_height, expected_width]
        {
            return Err(ArchitectureError::ConditioningMismatch {
                channels: self.feature_channels,
                height,
                width,
                expected_channels,
                expected_height,
                expected_width,
            });
        }
        Ok(())
    }

    /// Initialize a [`ClassGuidedUNet`], or report why the modules cannot be composed.
    ///
    /// Freezes the classifier.
    pub fn try_init<B, C, U>(
        &self,
        classifier: C,
        unet: U,
        device: &B::Device,
    ) -> Result<ClassGuidedUNet<B, C, U>, ArchitectureError>
    where
        B: Backend,
        C: ImageClassifier<B>,
        U: ConditionedDenoiser<B>,
    {
        self.try_validate_with::<B, C, U>(&classifier, &unet)?;

        let [conditioning_height, conditioning_width] = self.conditioning_resolution()?;
        let num_classes = classifier.num_classes();

        tracing::info!(
            num_classes,
            feature_channels = self.feature_channels,
            input_resolution = ?self.input_resolution,
            conditioning_resolution = ?[conditioning_height, conditioning_width],
            "building ClassGuidedUNet"
        );

        let classifier = classifier.no_grad();
        tracing::debug!(
            frozen_params = classifier.num_params(),
            "froze classifier parameters"
        );

        let projection = LinearConfig::new(
            num_classes,
            self.feature_channels * conditioning_height * conditioning_width,
        )
        .init(device);

        Ok(ClassGuidedUNet {
            classifier,
            unet,
            projection,
            feature_channels: self.feature_channels,
            input_height: self.input_resolution[0],
            input_width: self.input_resolution[1],
            conditioning_height,
            conditioning_width,
        })
    }

    /// Initialize a [`ClassGuidedUNet`].
    ///
    /// Freezes the classifier.
    ///
    /// # Panics
    ///
    /// If the config disagrees with the classifier or the U-Net.
    pub fn init<B, C, U>(
        &self,
        classifier: C,
        unet: U,
        device: &B::Device,
    ) -> ClassGuidedUNet<B, C, U>
    where
        B: Backend,
        C: ImageClassifier<B>,
        U: ConditionedDenoiser<B>,
    {
        match self.try_init(classifier, unet, device) {
            Ok(model) => model,
            Err(err) => panic!("{err}"),
        }
    }
}

/// A U-Net conditioned on the logits of a frozen classifier.
#[derive(Module, Debug)]
pub struct ClassGuidedUNet<B: Backend, C, U> {
    classifier: C,
    /// Conditioned U-Net.
    pub unet: U,
    /// Logits to flattened conditioning map.
    pub projection: Linear<B>,

    /// Conditioning map channels.
    pub feature_channels: usize,
    /// Expected input height.
    pub input_height: usize,
    /// Expected input width.
    pub input_width: usize,
    /// Conditioning map height.
    pub conditioning_height: usize,
    /// Conditioning map width.
    pub conditioning_width: usize,
}

impl<B, C, U> ClassGuidedUNet<B, C, U>
where
    B: Backend,
    C: ImageClassifier<B>,
    U: ConditionedDenoiser<B>,
{
    /// The frozen classifier.
    pub fn classifier(&self) -> &C {
        &self.classifier
    }

    /// The conditioned U-Net.
    pub fn unet(&self) -> &U {
        &self.unet
    }

    /// ``[feature_channels, height, width]`` of the conditioning map.
    pub fn conditioning_shape(&self) -> [usize; 3] {
        [
            self.feature_channels,
            self.conditioning_height,
            self.conditioning_width,
        ]
    }

    /// Build the class conditioning map for a batch of images.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, in_channels, input_height, input_width]``.
    ///
    /// # Returns
    ///
    /// A ``[batch, feature_channels, conditioning_height, conditioning_width]`` tensor.
    pub fn condition(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        static INPUT_CONTRACT: ShapeContract =
            shape_contract!["batch", "channels", "height", "width"];
        let [batch] = INPUT_CONTRACT.unpack_shape(
            &input,
            &["batch"],
            &[
                ("channels", self.classifier.in_channels()),
                ("height", self.input_height),
                ("width", self.input_width),
            ],
        );

        let logits = self.classifier.classify(input).detach();
        run_every_nth!({
            static OUTPUT_CONTRACT: ShapeContract = shape_contract!["batch", "num_classes"];
            OUTPUT_CONTRACT.assert_shape(
                &logits,
                &[
                    ("batch", batch),
                    ("num_classes", self.classifier.num_classes()),
                ],
            );
        });

        let x = self.projection.forward(logits);
        x.reshape([
            batch,
            self.feature_channels,
            self.conditioning_height,
            self.conditioning_width,
        ])
    }

    /// Forward pass.
    ///
    /// # Arguments
    ///
    /// - `input`: ``[batch, channels, input_height, input_width]``.
    ///
    /// # Returns
    ///
    /// The U-Net output for `input`, conditioned on its class map.
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let conditioning = self.condition(input.clone());
        self.unet.forward_conditioned(input, conditioning)
    }
}
