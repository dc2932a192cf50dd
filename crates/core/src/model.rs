//! Architecture dispatch: build any supported [`ModelArch`] behind one type.

use candle_core::{Result, Tensor};
use candle_nn::{ModuleT, VarBuilder};

use clsbench_common::ModelArch;

use crate::alexnet::AlexNet;
use crate::densenet::{DenseNet, DenseNetConfig};
use crate::inception::InceptionV3;
use crate::resnet::{ResNet, ResNetConfig};
use crate::squeezenet::{SqueezeNet, SqueezeNetVersion};
use crate::vgg::{plan, Vgg};

/// Any supported image classifier. `forward_t` maps `(batch, 3, h, w)`
/// images to `(batch, num_classes)` logits.
pub enum Classifier {
    AlexNet(AlexNet),
    DenseNet(DenseNet),
    InceptionV3(InceptionV3),
    ResNet(ResNet),
    SqueezeNet(SqueezeNet),
    Vgg(Vgg),
}

impl Classifier {
    /// Build `arch` with freshly initialised weights from `vb`.
    pub fn new(arch: ModelArch, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let model = match arch {
            ModelArch::AlexNet => Self::AlexNet(AlexNet::new(num_classes, vb)?),
            ModelArch::DenseNet121 => {
                Self::densenet(DenseNetConfig::densenet121(), num_classes, vb)?
            }
            ModelArch::DenseNet161 => {
                Self::densenet(DenseNetConfig::densenet161(), num_classes, vb)?
            }
            ModelArch::DenseNet169 => {
                Self::densenet(DenseNetConfig::densenet169(), num_classes, vb)?
            }
            ModelArch::DenseNet201 => {
                Self::densenet(DenseNetConfig::densenet201(), num_classes, vb)?
            }
            ModelArch::InceptionV3 => Self::InceptionV3(InceptionV3::new(num_classes, vb)?),
            ModelArch::ResNet18 => Self::resnet(ResNetConfig::resnet18(), num_classes, vb)?,
            ModelArch::ResNet34 => Self::resnet(ResNetConfig::resnet34(), num_classes, vb)?,
            ModelArch::ResNet50 => Self::resnet(ResNetConfig::resnet50(), num_classes, vb)?,
            ModelArch::ResNet101 => Self::resnet(ResNetConfig::resnet101(), num_classes, vb)?,
            ModelArch::ResNet152 => Self::resnet(ResNetConfig::resnet152(), num_classes, vb)?,
            ModelArch::SqueezeNet1_0 => {
                Self::SqueezeNet(SqueezeNet::new(SqueezeNetVersion::V1_0, num_classes, vb)?)
            }
            ModelArch::SqueezeNet1_1 => {
                Self::SqueezeNet(SqueezeNet::new(SqueezeNetVersion::V1_1, num_classes, vb)?)
            }
            ModelArch::Vgg11 { batch_norm } => Self::vgg(11, batch_norm, num_classes, vb)?,
            ModelArch::Vgg13 { batch_norm } => Self::vgg(13, batch_norm, num_classes, vb)?,
            ModelArch::Vgg16 { batch_norm } => Self::vgg(16, batch_norm, num_classes, vb)?,
            ModelArch::Vgg19 { batch_norm } => Self::vgg(19, batch_norm, num_classes, vb)?,
        };
        Ok(model)
    }

    fn densenet(config: DenseNetConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self::DenseNet(DenseNet::new(&config, num_classes, vb)?))
    }

    fn resnet(config: ResNetConfig, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self::ResNet(ResNet::new(&config, num_classes, vb)?))
    }

    fn vgg(depth: usize, batch_norm: bool, num_classes: usize, vb: VarBuilder) -> Result<Self> {
        let stages = plan(depth)
            .ok_or_else(|| candle_core::Error::Msg(format!("no VGG plan for depth {depth}")))?;
        Ok(Self::Vgg(Vgg::new(stages, batch_norm, num_classes, vb)?))
    }
}

impl ModuleT for Classifier {
    fn forward_t(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::AlexNet(m) => m.forward_t(x, train),
            Self::DenseNet(m) => m.forward_t(x, train),
            Self::InceptionV3(m) => m.forward_t(x, train),
            Self::ResNet(m) => m.forward_t(x, train),
            Self::SqueezeNet(m) => m.forward_t(x, train),
            Self::Vgg(m) => m.forward_t(x, train),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn builds_from_arch_name() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let arch: ModelArch = "resnet18".parse().unwrap();
        let model = Classifier::new(arch, 5, vb).unwrap();
        assert!(matches!(model, Classifier::ResNet(_)));

        let x = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward_t(&x, true).unwrap().dims(), &[1, 5]);
    }

    #[test]
    fn dense_and_inception_archs_dispatch() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let model = Classifier::new(ModelArch::DenseNet121, 3, vb.pp("d")).unwrap();
        assert!(matches!(model, Classifier::DenseNet(_)));
        let x = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward_t(&x, false).unwrap().dims(), &[1, 3]);

        let model = Classifier::new(ModelArch::InceptionV3, 3, vb.pp("i")).unwrap();
        assert!(matches!(model, Classifier::InceptionV3(_)));
    }
}
