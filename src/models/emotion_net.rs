//! Facial expression CNN trained on 48x48 grayscale FER-2013 crops.
//!
//! Layout of the widely used Keras expression model: three convolution
//! stages feeding two 1024-wide dense layers and a 7-way output in
//! [`EmotionLabel::ALL`](crate::types::EmotionLabel::ALL) order.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Linear, VarBuilder, conv2d, linear};

pub const INPUT_SIZE: usize = 48;
pub const NUM_CLASSES: usize = 7;

pub struct EmotionNet {
    conv1: Conv2d,
    conv2: Conv2d,
    conv3: Conv2d,
    conv4: Conv2d,
    conv5: Conv2d,
    fc1: Linear,
    fc2: Linear,
    fc3: Linear,
}

impl EmotionNet {
    pub fn load(vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv2d(1, 64, 5, Default::default(), vb.pp("conv1"))?,
            conv2: conv2d(64, 64, 3, Default::default(), vb.pp("conv2"))?,
            conv3: conv2d(64, 64, 3, Default::default(), vb.pp("conv3"))?,
            conv4: conv2d(64, 128, 3, Default::default(), vb.pp("conv4"))?,
            conv5: conv2d(128, 128, 3, Default::default(), vb.pp("conv5"))?,
            fc1: linear(128, 1024, vb.pp("fc1"))?,
            fc2: linear(1024, 1024, vb.pp("fc2"))?,
            fc3: linear(1024, NUM_CLASSES, vb.pp("fc3"))?,
        })
    }
}

impl Module for EmotionNet {
    /// `(b, 1, 48, 48)` in `[0, 1]` to `(b, 7)` logits.
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let xs = self.conv1.forward(xs)?.relu()?;
        let xs = xs.max_pool2d_with_stride(5, 2)?;
        let xs = self.conv2.forward(&xs)?.relu()?;
        let xs = self.conv3.forward(&xs)?.relu()?;
        let xs = xs.avg_pool2d_with_stride(3, 2)?;
        let xs = self.conv4.forward(&xs)?.relu()?;
        let xs = self.conv5.forward(&xs)?.relu()?;
        let xs = xs.avg_pool2d_with_stride(3, 2)?;
        // dense weights expect channels-last flattening
        let xs = xs.permute((0, 2, 3, 1))?.flatten_from(1)?;
        let xs = self.fc1.forward(&xs)?.relu()?;
        let xs = self.fc2.forward(&xs)?.relu()?;
        self.fc3.forward(&xs)
    }
}
