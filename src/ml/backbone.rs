//! MobileNetV2 feature extractor
//!
//! Layout follows torchvision's `mobilenet_v2` without the classifier, so an
//! ImageNet checkpoint can be loaded after renaming its keys.

use std::path::Path;

use anyhow::Result;
use burn::{
    config::Config,
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        PaddingConfig2d,
    },
    record::FullPrecisionSettings,
    record::Recorder,
    tensor::{backend::Backend, Tensor},
};
use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

/// Inverted residual settings: (expansion t, channels c, repeats n, stride s)
const INVERTED_RESIDUAL_SETTINGS: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

const STEM_CHANNELS: usize = 32;
const LAST_CHANNELS: usize = 1280;
const NORM_EPSILON: f64 = 1e-5;

/// Rounds a channel count to a multiple of 8, never going more than 10% below `value`.
pub fn make_divisible(value: f64, divisor: usize) -> usize {
    let divisor_f = divisor as f64;
    let mut rounded = ((value + divisor_f / 2.0) / divisor_f).floor() as usize * divisor;
    rounded = rounded.max(divisor);
    if (rounded as f64) < 0.9 * value {
        rounded += divisor;
    }
    rounded
}

#[derive(Config, Debug)]
pub struct MobileNetV2Config {
    /// Channel width multiplier (ImageNet weights exist for 1.0)
    #[config(default = 1.0)]
    pub width_multiplier: f64,
}

impl MobileNetV2Config {
    /// Channels produced by the last feature layer
    pub fn out_channels(&self) -> usize {
        make_divisible(LAST_CHANNELS as f64 * self.width_multiplier.max(1.0), 8)
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> MobileNetV2<B> {
        let mut in_channels = make_divisible(STEM_CHANNELS as f64 * self.width_multiplier, 8);
        let stem = ConvNorm::new(3, in_channels, 3, 2, 1, device);

        let mut blocks = Vec::new();
        for (expansion, channels, repeats, stride) in INVERTED_RESIDUAL_SETTINGS {
            let out_channels = make_divisible(channels as f64 * self.width_multiplier, 8);
            for i in 0..repeats {
                let stride = if i == 0 { stride } else { 1 };
                blocks.push(InvertedResidual::new(
                    in_channels,
                    out_channels,
                    stride,
                    expansion,
                    device,
                ));
                in_channels = out_channels;
            }
        }

        let head = ConvNorm::new(in_channels, self.out_channels(), 1, 1, 1, device);

        MobileNetV2 { stem, blocks, head }
    }
}

/// Batch normalization that always applies its stored statistics.
///
/// Parameter names match PyTorch's `BatchNorm2d` state dict.
#[derive(Module, Debug)]
pub struct FrozenNorm<B: Backend> {
    pub weight: Param<Tensor<B, 1>>,
    pub bias: Param<Tensor<B, 1>>,
    pub running_mean: Param<Tensor<B, 1>>,
    pub running_var: Param<Tensor<B, 1>>,
}

impl<B: Backend> FrozenNorm<B> {
    pub fn new(channels: usize, device: &B::Device) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::ones([channels], device)),
            bias: Param::from_tensor(Tensor::zeros([channels], device)),
            running_mean: Param::from_tensor(Tensor::zeros([channels], device)),
            running_var: Param::from_tensor(Tensor::ones([channels], device)),
        }
    }

    /// `x`: [batch, channels, height, width]
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [channels] = self.weight.dims();
        let scale = self
            .weight
            .val()
            .div(self.running_var.val().add_scalar(NORM_EPSILON).sqrt());
        let shift = self.bias.val().sub(self.running_mean.val().mul(scale.clone()));

        x.mul(scale.reshape([1, channels, 1, 1]))
            .add(shift.reshape([1, channels, 1, 1]))
    }
}

/// Convolution without bias followed by normalization
#[derive(Module, Debug)]
pub struct ConvNorm<B: Backend> {
    pub conv: Conv2d<B>,
    pub norm: FrozenNorm<B>,
}

impl<B: Backend> ConvNorm<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        stride: usize,
        groups: usize,
        device: &B::Device,
    ) -> Self {
        let padding = (kernel - 1) / 2;
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [kernel, kernel])
                .with_stride([stride, stride])
                .with_padding(PaddingConfig2d::Explicit(padding, padding))
                .with_groups(groups)
                .with_bias(false)
                .init(device),
            norm: FrozenNorm::new(out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.norm.forward(self.conv.forward(x))
    }
}

/// Expand (1x1) -> depthwise (3x3) -> linear projection (1x1), with a skip
/// connection when input and output shapes agree.
#[derive(Module, Debug)]
pub struct InvertedResidual<B: Backend> {
    pub expand: Option<ConvNorm<B>>,
    pub depthwise: ConvNorm<B>,
    pub project: ConvNorm<B>,
}

impl<B: Backend> InvertedResidual<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expansion: usize,
        device: &B::Device,
    ) -> Self {
        let hidden = in_channels * expansion;
        let expand = (expansion != 1).then(|| ConvNorm::new(in_channels, hidden, 1, 1, 1, device));

        Self {
            expand,
            depthwise: ConvNorm::new(hidden, hidden, 3, stride, hidden, device),
            project: ConvNorm::new(hidden, out_channels, 1, 1, 1, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut out = x.clone();
        if let Some(expand) = &self.expand {
            out = relu6(expand.forward(out));
        }
        let out = relu6(self.depthwise.forward(out));
        let out = self.project.forward(out);

        if out.dims() == x.dims() {
            out + x
        } else {
            out
        }
    }
}

#[derive(Module, Debug)]
pub struct MobileNetV2<B: Backend> {
    pub stem: ConvNorm<B>,
    pub blocks: Vec<InvertedResidual<B>>,
    pub head: ConvNorm<B>,
}

impl<B: Backend> MobileNetV2<B> {
    /// `images`: [batch, 3, height, width] -> feature map [batch, channels, h/32, w/32]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = relu6(self.stem.forward(images));
        let x = self.blocks.iter().fold(x, |x, block| block.forward(x));
        relu6(self.head.forward(x))
    }

    /// Replaces the weights with a torchvision `mobilenet_v2` checkpoint.
    pub fn load_pretrained(self, checkpoint: &Path, device: &B::Device) -> Result<Self> {
        let mut args = LoadArgs::new(checkpoint.to_path_buf());
        for (from, to) in torchvision_key_remap(self.blocks.len()) {
            args = args.with_key_remap(&from, &to);
        }

        let record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
            .load(args, device)
            .map_err(|e| {
                anyhow::anyhow!(
                    "failed to load backbone weights from {}: {:?}",
                    checkpoint.display(),
                    e
                )
            })?;

        Ok(self.load_record(record))
    }
}

fn relu6<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    x.clamp(0.0, 6.0)
}

/// Key renames from torchvision's `features.N...` layout to this module tree.
///
/// `features.0` is the stem, `features.1..=num_blocks` the inverted residual
/// blocks and `features.{num_blocks + 1}` the final 1x1 conv.
fn torchvision_key_remap(num_blocks: usize) -> Vec<(String, String)> {
    let mut remap = vec![
        (r"^features\.0\.0\.(.+)$".to_string(), "stem.conv.$1".to_string()),
        (r"^features\.0\.1\.(.+)$".to_string(), "stem.norm.$1".to_string()),
    ];

    // The first block has no expansion layer, so its sequence is one shorter.
    remap.extend([
        (r"^features\.1\.conv\.0\.0\.(.+)$".to_string(), "blocks.0.depthwise.conv.$1".to_string()),
        (r"^features\.1\.conv\.0\.1\.(.+)$".to_string(), "blocks.0.depthwise.norm.$1".to_string()),
        (r"^features\.1\.conv\.1\.(.+)$".to_string(), "blocks.0.project.conv.$1".to_string()),
        (r"^features\.1\.conv\.2\.(.+)$".to_string(), "blocks.0.project.norm.$1".to_string()),
    ]);

    for feature in 2..=num_blocks {
        let block = feature - 1;
        let prefix = format!(r"^features\.{feature}\.conv");
        remap.extend([
            (format!(r"{prefix}\.0\.0\.(.+)$"), format!("blocks.{block}.expand.conv.$1")),
            (format!(r"{prefix}\.0\.1\.(.+)$"), format!("blocks.{block}.expand.norm.$1")),
            (format!(r"{prefix}\.1\.0\.(.+)$"), format!("blocks.{block}.depthwise.conv.$1")),
            (format!(r"{prefix}\.1\.1\.(.+)$"), format!("blocks.{block}.depthwise.norm.$1")),
            (format!(r"{prefix}\.2\.(.+)$"), format!("blocks.{block}.project.conv.$1")),
            (format!(r"{prefix}\.3\.(.+)$"), format!("blocks.{block}.project.norm.$1")),
        ]);
    }

    let last = num_blocks + 1;
    remap.extend([
        (format!(r"^features\.{last}\.0\.(.+)$"), "head.conv.$1".to_string()),
        (format!(r"^features\.{last}\.1\.(.+)$"), "head.norm.$1".to_string()),
    ]);
    remap
}
