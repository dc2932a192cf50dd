//! # clsbench-core — Model Zoo
//!
//! Image-classification architectures built on `candle-nn`, with parameter
//! names matching torchvision:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`resnet`] | ResNet-18/34/50/101/152 |
//! | [`densenet`] | DenseNet-121/161/169/201 |
//! | [`inception`] | Inception v3 (no auxiliary head, 299×299 input) |
//! | [`vgg`] | VGG-11/13/16/19, optional batch norm |
//! | [`alexnet`] | AlexNet |
//! | [`squeezenet`] | SqueezeNet 1.0 / 1.1 |
//! | [`pool`] | padded, ceil-mode and adaptive pooling |
//! | [`model`] | [`Classifier`], dispatch from a [`ModelArch`](clsbench_common::ModelArch) |
//!
//! Every model implements [`candle_nn::ModuleT`]; `train = true` switches
//! batch norm to batch statistics and enables dropout.

pub mod alexnet;
pub mod densenet;
pub mod inception;
pub mod model;
pub mod pool;
pub mod resnet;
pub mod squeezenet;
pub mod vgg;

pub use model::Classifier;
