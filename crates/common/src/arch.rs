//! Supported model architectures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Names accepted by `--model`, in the order they are listed in help text.
pub const SUPPORTED_MODELS: &[&str] = &[
    "alexnet",
    "densenet121",
    "densenet161",
    "densenet169",
    "densenet201",
    "inception_v3",
    "resnet101",
    "resnet152",
    "resnet18",
    "resnet34",
    "resnet50",
    "squeezenet1_0",
    "squeezenet1_1",
    "vgg11",
    "vgg11_bn",
    "vgg13",
    "vgg13_bn",
    "vgg16",
    "vgg16_bn",
    "vgg19",
    "vgg19_bn",
];

/// Number of output classes (ImageNet).
pub const NUM_CLASSES: usize = 1000;

/// A classification architecture, named the way torchvision names it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelArch {
    AlexNet,
    DenseNet121,
    DenseNet161,
    DenseNet169,
    DenseNet201,
    InceptionV3,
    ResNet18,
    ResNet34,
    #[default]
    ResNet50,
    ResNet101,
    ResNet152,
    SqueezeNet1_0,
    SqueezeNet1_1,
    Vgg11 { batch_norm: bool },
    Vgg13 { batch_norm: bool },
    Vgg16 { batch_norm: bool },
    Vgg19 { batch_norm: bool },
}

impl ModelArch {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AlexNet => "alexnet",
            Self::DenseNet121 => "densenet121",
            Self::DenseNet161 => "densenet161",
            Self::DenseNet169 => "densenet169",
            Self::DenseNet201 => "densenet201",
            Self::InceptionV3 => "inception_v3",
            Self::ResNet18 => "resnet18",
            Self::ResNet34 => "resnet34",
            Self::ResNet50 => "resnet50",
            Self::ResNet101 => "resnet101",
            Self::ResNet152 => "resnet152",
            Self::SqueezeNet1_0 => "squeezenet1_0",
            Self::SqueezeNet1_1 => "squeezenet1_1",
            Self::Vgg11 { batch_norm: false } => "vgg11",
            Self::Vgg11 { batch_norm: true } => "vgg11_bn",
            Self::Vgg13 { batch_norm: false } => "vgg13",
            Self::Vgg13 { batch_norm: true } => "vgg13_bn",
            Self::Vgg16 { batch_norm: false } => "vgg16",
            Self::Vgg16 { batch_norm: true } => "vgg16_bn",
            Self::Vgg19 { batch_norm: false } => "vgg19",
            Self::Vgg19 { batch_norm: true } => "vgg19_bn",
        }
    }

    /// Square input resolution the architecture is trained at.
    pub fn img_dim(&self) -> usize {
        match self {
            Self::InceptionV3 => 299,
            _ => 224,
        }
    }
}

impl fmt::Display for ModelArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelArch {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let arch = match s {
            "alexnet" => Self::AlexNet,
            "densenet121" => Self::DenseNet121,
            "densenet161" => Self::DenseNet161,
            "densenet169" => Self::DenseNet169,
            "densenet201" => Self::DenseNet201,
            "inception_v3" => Self::InceptionV3,
            "resnet18" => Self::ResNet18,
            "resnet34" => Self::ResNet34,
            "resnet50" => Self::ResNet50,
            "resnet101" => Self::ResNet101,
            "resnet152" => Self::ResNet152,
            "squeezenet1_0" => Self::SqueezeNet1_0,
            "squeezenet1_1" => Self::SqueezeNet1_1,
            _ => {
                let (name, batch_norm) = match s.strip_suffix("_bn") {
                    Some(name) => (name, true),
                    None => (s, false),
                };
                match name {
                    "vgg11" => Self::Vgg11 { batch_norm },
                    "vgg13" => Self::Vgg13 { batch_norm },
                    "vgg16" => Self::Vgg16 { batch_norm },
                    "vgg19" => Self::Vgg19 { batch_norm },
                    _ => return Err(ConfigurationError::UnknownModel(s.to_string())),
                }
            }
        };
        Ok(arch)
    }
}

impl TryFrom<String> for ModelArch {
    type Error = ConfigurationError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<ModelArch> for String {
    fn from(arch: ModelArch) -> Self {
        arch.as_str().to_string()
    }
}
