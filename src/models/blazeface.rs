//! BlazeFace front-camera face detector.
//!
//! Takes a `(batch, 3, 128, 128)` tensor normalized to `[-1, 1]` and returns
//! per-anchor box regressions `(batch, 896, 16)` and logits `(batch, 896, 1)`.
//! The first four regression values are the box center offset and size, the
//! remaining twelve are six keypoints which are not used here.
//!
//! Tensor names follow the common PyTorch port (`backbone1.0`,
//! `backbone1.2.convs.0`, `classifier_8`, ...), so `blazeface.pth` from that
//! port loads unchanged.

use candle_core::{Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, conv2d};

pub const INPUT_SIZE: usize = 128;
pub const NUM_ANCHORS: usize = 896;
const NUM_COORDS: usize = 16;
const SCORE_CLIPPING_THRESH: f32 = 100.0;

struct BlazeBlock {
    depthwise: Conv2d,
    pointwise: Conv2d,
    stride: usize,
    channel_pad: usize,
}

impl BlazeBlock {
    fn new(in_channels: usize, out_channels: usize, stride: usize, vb: VarBuilder) -> Result<Self> {
        let kernel_size = 3;
        let depthwise_cfg = Conv2dConfig {
            padding: if stride == 2 { 0 } else { (kernel_size - 1) / 2 },
            stride,
            groups: in_channels,
            ..Default::default()
        };
        let convs = vb.pp("convs");
        let depthwise = conv2d(in_channels, in_channels, kernel_size, depthwise_cfg, convs.pp("0"))?;
        let pointwise = conv2d(in_channels, out_channels, 1, Default::default(), convs.pp("1"))?;
        Ok(Self {
            depthwise,
            pointwise,
            stride,
            channel_pad: out_channels - in_channels,
        })
    }
}

impl Module for BlazeBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (h, mut residual) = if self.stride == 2 {
            let padded = xs.pad_with_zeros(3, 0, 2)?.pad_with_zeros(2, 0, 2)?;
            (padded, xs.max_pool2d(2)?)
        } else {
            (xs.clone(), xs.clone())
        };
        if self.channel_pad > 0 {
            residual = residual.pad_with_zeros(1, 0, self.channel_pad)?;
        }
        let h = self.pointwise.forward(&self.depthwise.forward(&h)?)?;
        (h + residual)?.relu()
    }
}

pub struct BlazeFace {
    stem: Conv2d,
    backbone1: Vec<BlazeBlock>,
    backbone2: Vec<BlazeBlock>,
    classifier_8: Conv2d,
    classifier_16: Conv2d,
    regressor_8: Conv2d,
    regressor_16: Conv2d,
}

impl BlazeFace {
    pub fn load(vb: VarBuilder) -> Result<Self> {
        let stem_cfg = Conv2dConfig {
            stride: 2,
            ..Default::default()
        };
        let vb1 = vb.pp("backbone1");
        let stem = conv2d(3, 24, 5, stem_cfg, vb1.pp("0"))?;

        // (in, out, stride); index 1 of backbone1 is the stem's ReLU
        let blocks1 = [
            (24, 24, 1),
            (24, 28, 1),
            (28, 32, 2),
            (32, 36, 1),
            (36, 42, 1),
            (42, 48, 2),
            (48, 56, 1),
            (56, 64, 1),
            (64, 72, 1),
            (72, 80, 1),
            (80, 88, 1),
        ];
        let backbone1 = blocks1
            .iter()
            .enumerate()
            .map(|(i, &(cin, cout, stride))| BlazeBlock::new(cin, cout, stride, vb1.pp(i + 2)))
            .collect::<Result<Vec<_>>>()?;

        let vb2 = vb.pp("backbone2");
        let blocks2 = [(88, 96, 2), (96, 96, 1), (96, 96, 1), (96, 96, 1), (96, 96, 1)];
        let backbone2 = blocks2
            .iter()
            .enumerate()
            .map(|(i, &(cin, cout, stride))| BlazeBlock::new(cin, cout, stride, vb2.pp(i)))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            stem,
            backbone1,
            backbone2,
            classifier_8: conv2d(88, 2, 1, Default::default(), vb.pp("classifier_8"))?,
            classifier_16: conv2d(96, 6, 1, Default::default(), vb.pp("classifier_16"))?,
            regressor_8: conv2d(88, 32, 1, Default::default(), vb.pp("regressor_8"))?,
            regressor_16: conv2d(96, 96, 1, Default::default(), vb.pp("regressor_16"))?,
        })
    }

    /// Returns `(boxes, logits)` shaped `(b, 896, 16)` and `(b, 896, 1)`.
    pub fn forward(&self, xs: &Tensor) -> Result<(Tensor, Tensor)> {
        let b = xs.dim(0)?;
        let xs = xs.pad_with_zeros(3, 1, 2)?.pad_with_zeros(2, 1, 2)?;
        let mut x = self.stem.forward(&xs)?.relu()?;
        for block in &self.backbone1 {
            x = block.forward(&x)?;
        }
        let mut h = x.clone();
        for block in &self.backbone2 {
            h = block.forward(&h)?;
        }

        let heads = |conv: &Conv2d, xs: &Tensor, width: usize| -> Result<Tensor> {
            conv.forward(xs)?
                .permute((0, 2, 3, 1))?
                .contiguous()?
                .reshape((b, (), width))
        };

        let c = Tensor::cat(
            &[heads(&self.classifier_8, &x, 1)?, heads(&self.classifier_16, &h, 1)?],
            1,
        )?;
        let r = Tensor::cat(
            &[
                heads(&self.regressor_8, &x, NUM_COORDS)?,
                heads(&self.regressor_16, &h, NUM_COORDS)?,
            ],
            1,
        )?;
        Ok((r, c))
    }
}

/// SSD anchor center in normalized input coordinates. Anchor size is fixed at 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub x_center: f32,
    pub y_center: f32,
}

/// Anchors for the front model: a 16x16 grid with 2 anchors per cell
/// followed by an 8x8 grid with 6 anchors per cell.
pub fn gen_anchors() -> Vec<Anchor> {
    let mut anchors = Vec::with_capacity(NUM_ANCHORS);
    for (grid, per_cell) in [(16usize, 2usize), (8, 6)] {
        for y in 0..grid {
            for x in 0..grid {
                let anchor = Anchor {
                    x_center: (x as f32 + 0.5) / grid as f32,
                    y_center: (y as f32 + 0.5) / grid as f32,
                };
                anchors.extend(std::iter::repeat_n(anchor, per_cell));
            }
        }
    }
    anchors
}

/// Axis-aligned box in normalized `[0, 1]` input coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Detection {
    pub xmin: f32,
    pub ymin: f32,
    pub xmax: f32,
    pub ymax: f32,
    pub score: f32,
}

fn sigmoid(x: f32) -> f32 {
    let x = x.clamp(-SCORE_CLIPPING_THRESH, SCORE_CLIPPING_THRESH);
    1.0 / (1.0 + (-x).exp())
}

/// Picks the highest scoring detection at or above `min_score`.
///
/// `boxes` and `logits` are the per-anchor rows for a single image.
pub fn best_detection(
    boxes: &[Vec<f32>],
    logits: &[f32],
    anchors: &[Anchor],
    min_score: f32,
) -> Option<Detection> {
    let scale = INPUT_SIZE as f32;
    let mut best: Option<Detection> = None;

    for ((raw, &logit), anchor) in boxes.iter().zip(logits).zip(anchors) {
        let score = sigmoid(logit);
        if score.is_nan() || score < min_score || raw.len() < 4 {
            continue;
        }
        if best.is_some_and(|d| d.score >= score) {
            continue;
        }

        let x_center = raw[0] / scale + anchor.x_center;
        let y_center = raw[1] / scale + anchor.y_center;
        let w = raw[2] / scale;
        let h = raw[3] / scale;
        best = Some(Detection {
            xmin: x_center - w / 2.0,
            ymin: y_center - h / 2.0,
            xmax: x_center + w / 2.0,
            ymax: y_center + h / 2.0,
            score,
        });
    }

    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn anchors_cover_both_feature_maps() {
        let anchors = gen_anchors();
        assert_eq!(anchors.len(), NUM_ANCHORS);
        assert_eq!(anchors[0], Anchor { x_center: 1.0 / 32.0, y_center: 1.0 / 32.0 });
        assert_eq!(anchors[0], anchors[1]);
        assert_eq!(anchors[2].x_center, 3.0 / 32.0);
        // first anchor of the 8x8 grid
        assert_eq!(anchors[512], Anchor { x_center: 1.0 / 16.0, y_center: 1.0 / 16.0 });
        assert_eq!(anchors[NUM_ANCHORS - 1], Anchor { x_center: 15.0 / 16.0, y_center: 15.0 / 16.0 });
    }

    #[test]
    fn forward_produces_one_row_per_anchor() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = BlazeFace::load(vb).unwrap();
        let input = Tensor::zeros((1, 3, INPUT_SIZE, INPUT_SIZE), DType::F32, &Device::Cpu).unwrap();

        let (boxes, logits) = model.forward(&input).unwrap();
        assert_eq!(boxes.dims(), &[1, NUM_ANCHORS, NUM_COORDS]);
        assert_eq!(logits.dims(), &[1, NUM_ANCHORS, 1]);
    }

    #[test]
    fn best_detection_decodes_relative_to_anchor() {
        let anchors = gen_anchors();
        let mut boxes = vec![vec![0.0; NUM_COORDS]; NUM_ANCHORS];
        let mut logits = vec![-10.0; NUM_ANCHORS];

        // weak face on one anchor, strong face on another
        logits[10] = 1.5;
        boxes[10][2] = 16.0;
        boxes[10][3] = 16.0;
        logits[600] = 6.0;
        boxes[600][0] = 12.8;
        boxes[600][2] = 64.0;
        boxes[600][3] = 32.0;

        let d = best_detection(&boxes, &logits, &anchors, 0.75).unwrap();
        let anchor = anchors[600];
        assert!((d.xmin - (anchor.x_center + 0.1 - 0.25)).abs() < 1e-6);
        assert!((d.xmax - (anchor.x_center + 0.1 + 0.25)).abs() < 1e-6);
        assert!((d.ymin - (anchor.y_center - 0.125)).abs() < 1e-6);
        assert!(d.score > 0.99);
    }

    #[test]
    fn nothing_above_threshold_means_no_face() {
        let anchors = gen_anchors();
        let boxes = vec![vec![0.0; NUM_COORDS]; NUM_ANCHORS];
        let logits = vec![0.0; NUM_ANCHORS];
        // sigmoid(0) = 0.5
        assert!(best_detection(&boxes, &logits, &anchors, 0.75).is_none());
        assert!(best_detection(&boxes, &logits, &anchors, 0.5).is_some());
    }

    #[test]
    fn nan_logits_are_ignored() {
        let anchors = gen_anchors();
        let mut boxes = vec![vec![0.0; NUM_COORDS]; NUM_ANCHORS];
        boxes[3][2] = 20.0;
        boxes[3][3] = 20.0;
        let mut logits = vec![-10.0; NUM_ANCHORS];
        logits[3] = 4.0;
        logits[10] = f32::NAN;

        let best = best_detection(&boxes, &logits, &anchors, 0.75).unwrap();
        assert!(best.score > 0.9);
        assert!((best.xmax - best.xmin - 20.0 / INPUT_SIZE as f32).abs() < 1e-6);

        let all_nan = vec![f32::NAN; NUM_ANCHORS];
        assert!(best_detection(&boxes, &all_nan, &anchors, 0.75).is_none());
    }
}
