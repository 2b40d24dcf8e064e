//! # `ResNet`
//!
//! A compact residual image classifier built from [`basic_block::BasicBlock`] stages.

pub mod basic_block;
pub mod layer_block;
pub mod resnet_model;

pub use basic_block::{BasicBlock, BasicBlockConfig, BasicBlockMeta, SecondBranchNorm};
pub use layer_block::{LayerBlock, LayerBlockConfig, LayerBlockMeta};
pub use resnet_model::{ClassifyingResNet, ClassifyingResNetConfig, NUM_STAGES};
