//! 通道级图像变换.
//!
//! 通道级变换一次只看到一个通道. 多通道同步由调用方保证: 同一个样本的每个通道都用
//! 相同种子新建的生成器跑一遍完整流水线, 见 [`ChannelPipeline::apply_synchronized`].
//! 因此实现者必须在每次 `apply` 中以固定的顺序、固定的次数抽取随机数.

use crate::error::{ConfigurationError, Result};
use crate::SampleRng;
use ndarray::{s, Array2};
use rand::{Rng, SeedableRng};
use std::fmt::Debug;
use std::sync::Arc;

/// 通道级变换.
pub trait ChannelTransform: Debug + Send + Sync {
    /// 变换单个通道.
    fn apply(&self, channel: Array2<f32>, rng: &mut SampleRng) -> Array2<f32>;

    /// 变换的稳定文字描述.
    fn describe(&self) -> String {
        format!("{self:?}")
    }
}

/// 有序的通道级变换流水线.
#[derive(Clone, Debug, Default)]
pub struct ChannelPipeline {
    transforms: Vec<Arc<dyn ChannelTransform>>,
}

impl ChannelPipeline {
    /// 追加变换.
    pub fn push<T: ChannelTransform + 'static>(&mut self, transform: T) {
        self.transforms.push(Arc::new(transform));
    }

    /// 追加已共享的变换.
    #[inline]
    pub fn push_shared(&mut self, transform: Arc<dyn ChannelTransform>) {
        self.transforms.push(transform);
    }

    /// 变换数.
    #[inline]
    pub fn len(&self) -> usize {
        self.transforms.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.transforms.is_empty()
    }

    /// 每个变换的描述, 按顺序.
    pub fn describe(&self) -> Vec<String> {
        self.transforms.iter().map(|t| t.describe()).collect()
    }

    /// 用给定生成器顺序执行所有变换.
    pub fn apply(&self, channel: Array2<f32>, rng: &mut SampleRng) -> Array2<f32> {
        self.transforms.iter().fold(channel, |c, t| t.apply(c, rng))
    }

    /// 对样本的所有通道执行流水线. 每个通道都使用由 `channel_seed`
    /// 新建的生成器, 因此所有通道拿到相同的随机参数.
    pub fn apply_synchronized(&self, channels: Vec<Array2<f32>>, channel_seed: u64) -> Vec<Array2<f32>> {
        channels
            .into_iter()
            .map(|c| self.apply(c, &mut SampleRng::seed_from_u64(channel_seed)))
            .collect()
    }
}

impl FromIterator<Arc<dyn ChannelTransform>> for ChannelPipeline {
    fn from_iter<T: IntoIterator<Item = Arc<dyn ChannelTransform>>>(iter: T) -> Self {
        Self {
            transforms: iter.into_iter().collect(),
        }
    }
}

macro_rules! impl_random_flip {
    ($(#[$doc:meta])* $name: ident, $axis: expr) => {
        $(#[$doc])*
        #[derive(Copy, Clone, Debug, PartialEq)]
        pub struct $name {
            p: f64,
        }

        impl $name {
            /// 以概率 `p` 翻转.
            pub fn new(p: f64) -> Result<Self> {
                if (0.0..=1.0).contains(&p) {
                    Ok(Self { p })
                } else {
                    Err(ConfigurationError::InvalidArgument {
                        name: "p",
                        reason: format!("{p} is not in [0, 1]"),
                    }
                    .into())
                }
            }
        }

        impl ChannelTransform for $name {
            fn apply(&self, channel: Array2<f32>, rng: &mut SampleRng) -> Array2<f32> {
                if rng.gen_bool(self.p) {
                    let mut channel = channel;
                    channel.invert_axis(ndarray::Axis($axis));
                    channel.as_standard_layout().into_owned()
                } else {
                    channel
                }
            }
        }
    };
}

impl_random_flip!(
    /// 随机水平翻转 (左右).
    HorizontalFlip,
    1
);
impl_random_flip!(
    /// 随机垂直翻转 (上下).
    VerticalFlip,
    0
);

/// 逆时针旋转 90° 一次. `(h, w)` 变为 `(w, h)`.
fn rot90(channel: &Array2<f32>) -> Array2<f32> {
    channel.t().slice(s![..;-1, ..]).to_owned()
}

/// 随机旋转 0°/90°/180°/270° (逆时针).
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub struct RandomRotate90;

impl ChannelTransform for RandomRotate90 {
    fn apply(&self, channel: Array2<f32>, rng: &mut SampleRng) -> Array2<f32> {
        let k = rng.gen_range(0..4u8);
        (0..k).fold(channel, |c, _| rot90(&c))
    }
}

/// 随机仿射: 绕图像中心旋转 `[-degrees, degrees]` 并缩放 `[scale.0, scale.1]`.
///
/// 逆向映射, 最近邻采样, 图像外的像素填 0. 输出形状与输入相同.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct RandomAffine {
    degrees: f64,
    scale: (f64, f64),
}

impl RandomAffine {
    /// 新建. 要求 `degrees >= 0` 且 `0 < scale.0 <= scale.1`.
    pub fn new(degrees: f64, scale: (f64, f64)) -> Result<Self> {
        if !(degrees >= 0.0 && degrees.is_finite()) {
            return Err(ConfigurationError::InvalidArgument {
                name: "degrees",
                reason: format!("{degrees} is not a finite non-negative angle"),
            }
            .into());
        }
        if !(scale.0 > 0.0 && scale.0 <= scale.1 && scale.1.is_finite()) {
            return Err(ConfigurationError::InvalidArgument {
                name: "scale",
                reason: format!("{scale:?} is not an increasing positive range"),
            }
            .into());
        }
        Ok(Self { degrees, scale })
    }

    /// 只旋转.
    #[inline]
    pub fn rotation(degrees: f64) -> Result<Self> {
        Self::new(degrees, (1.0, 1.0))
    }
}

impl ChannelTransform for RandomAffine {
    fn apply(&self, channel: Array2<f32>, rng: &mut SampleRng) -> Array2<f32> {
        let angle = rng.gen_range(-self.degrees..=self.degrees).to_radians();
        let scale = rng.gen_range(self.scale.0..=self.scale.1);

        let (h, w) = channel.dim();
        let (cy, cx) = ((h as f64 - 1.0) / 2.0, (w as f64 - 1.0) / 2.0);
        let (sin, cos) = angle.sin_cos();
        Array2::from_shape_fn((h, w), |(y, x)| {
            let (dx, dy) = (x as f64 - cx, y as f64 - cy);
            // 逆旋转再逆缩放.
            let sx = (cos * dx + sin * dy) / scale + cx;
            let sy = (-sin * dx + cos * dy) / scale + cy;
            let (sx, sy) = (sx.round(), sy.round());
            if sx < 0.0 || sy < 0.0 || sx >= w as f64 || sy >= h as f64 {
                0.0
            } else {
                channel[[sy as usize, sx as usize]]
            }
        })
    }
}

/// 双线性缩放.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Resize {
    /// 缩放到精确的 `(高, 宽)`.
    Exact(usize, usize),
    /// 短边缩放到给定长度, 保持宽高比.
    ShorterSide(usize),
}

impl Resize {
    fn target(&self, (h, w): crate::Idx2d) -> crate::Idx2d {
        match *self {
            Self::Exact(th, tw) => (th, tw),
            Self::ShorterSide(n) if h <= w => (n, (w * n + h / 2) / h.max(1)),
            Self::ShorterSide(n) => ((h * n + w / 2) / w.max(1), n),
        }
    }
}

/// 输出坐标 `dst` 映射到输入轴上的两个邻点与权重.
#[inline]
fn neighbours(dst: usize, ratio: f64, len: usize) -> (usize, usize, f32) {
    let src = ((dst as f64 + 0.5) * ratio - 0.5).clamp(0.0, (len - 1) as f64);
    let lo = src.floor() as usize;
    let hi = (lo + 1).min(len - 1);
    (lo, hi, (src - lo as f64) as f32)
}

impl ChannelTransform for Resize {
    fn apply(&self, channel: Array2<f32>, _rng: &mut SampleRng) -> Array2<f32> {
        let (h, w) = channel.dim();
        let (th, tw) = self.target((h, w));
        if (th, tw) == (h, w) || h == 0 || w == 0 {
            return channel;
        }

        let (ry, rx) = (h as f64 / th as f64, w as f64 / tw as f64);
        Array2::from_shape_fn((th, tw), |(y, x)| {
            let (y0, y1, fy) = neighbours(y, ry, h);
            let (x0, x1, fx) = neighbours(x, rx, w);
            let top = channel[[y0, x0]] * (1.0 - fx) + channel[[y0, x1]] * fx;
            let bottom = channel[[y1, x0]] * (1.0 - fx) + channel[[y1, x1]] * fx;
            top * (1.0 - fy) + bottom * fy
        })
    }
}
