//! patch 策略: 居中、随机重叠、正常组织.
//!
//! 所有策略都建立在 [`crate::geometry`] 之上, 每个样本只求一次裁剪框,
//! 然后用同一个裁剪框截取所有通道.

use crate::consts::{
    label, DEFAULT_MAX_ABNORM_OVERLAP, DEFAULT_MAX_TRIES, DEFAULT_MIN_BREAST_OVERLAP,
    DEFAULT_MIN_OVERLAP,
};
use crate::error::{ConfigurationError, Result};
use crate::geometry::{centered_crop, find_window_for, Crop, PatchWindow};
use crate::{Provenance, RecordTransform, Sample, SampleRng};
use log::{debug, warn};
use rand::Rng;

/// 检查比例参数落在 `[0, 1]` 内.
fn check_fraction(name: &'static str, value: f64) -> Result<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigurationError::InvalidArgument {
            name,
            reason: format!("{value} is not in [0, 1]"),
        }
        .into())
    }
}

/// 检查 patch 尺寸非零.
fn check_size(patch_size: (usize, usize)) -> Result<(usize, usize)> {
    if patch_size.0 > 0 && patch_size.1 > 0 {
        Ok(patch_size)
    } else {
        Err(ConfigurationError::InvalidArgument {
            name: "patch_size",
            reason: format!("{patch_size:?} has a zero side"),
        }
        .into())
    }
}

/// 在窗口内均匀采样左上角, 两端都可取到.
#[inline]
fn draw(window: &PatchWindow, rng: &mut SampleRng) -> (usize, usize) {
    let x = rng.gen_range(window.min_x..=window.max_x);
    let y = rng.gen_range(window.min_y..=window.max_y);
    (x, y)
}

/// 用同一个裁剪框截取所有通道.
fn crop_all(mut sample: Sample, crop: Crop) -> Sample {
    debug!("crop {crop:?} for patient {}", sample.record.patient_id);
    sample.channels = sample.channels.iter().map(|c| crop.apply(c)).collect();
    sample
}

/// 正常组织 patch 的参数. 见 [`PatchStrategy::NormalTissue`].
#[derive(Clone, Debug, PartialEq)]
pub struct NormalTissue {
    inner: Box<PatchStrategy>,
    delegate_probability: f64,
    patch_size: (usize, usize),
    min_breast_overlap: f64,
    max_abnorm_overlap: f64,
    max_tries: u32,
}

impl NormalTissue {
    /// 以概率 `delegate_probability` 交给 `inner`, 否则尝试采正常组织.
    ///
    /// 其余参数取默认值: 乳房最小重叠 0.5, 病灶最大重叠 0.1, 最多 5 次尝试.
    pub fn new(
        inner: PatchStrategy,
        delegate_probability: f64,
        patch_size: (usize, usize),
    ) -> Result<Self> {
        Ok(Self {
            inner: Box::new(inner),
            delegate_probability: check_fraction("delegate_probability", delegate_probability)?,
            patch_size: check_size(patch_size)?,
            min_breast_overlap: DEFAULT_MIN_BREAST_OVERLAP,
            max_abnorm_overlap: DEFAULT_MAX_ABNORM_OVERLAP,
            max_tries: DEFAULT_MAX_TRIES,
        })
    }

    /// 设置 patch 与乳房区域的最小重叠比例.
    pub fn with_min_breast_overlap(mut self, fraction: f64) -> Result<Self> {
        self.min_breast_overlap = check_fraction("min_breast_overlap", fraction)?;
        Ok(self)
    }

    /// 设置 patch 与病灶的最大重叠比例.
    pub fn with_max_abnorm_overlap(mut self, fraction: f64) -> Result<Self> {
        self.max_abnorm_overlap = check_fraction("max_abnorm_overlap", fraction)?;
        Ok(self)
    }

    /// 设置最大尝试次数. 0 次等价于总是放弃.
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = max_tries;
        self
    }

    /// 被包装的策略.
    #[inline]
    pub fn inner(&self) -> &PatchStrategy {
        &self.inner
    }

    fn apply(&self, sample: Sample, rng: &mut SampleRng) -> Sample {
        if rng.gen_bool(self.delegate_probability) {
            return self.inner.apply(sample, rng);
        }

        let (Some(lesion), Some(breast)) = (sample.record.lesion_box(), sample.record.breast_box())
        else {
            warn!(
                "record of patient {} has an invalid box; using the wrapped strategy",
                sample.record.patient_id
            );
            return self.inner.apply(sample, rng);
        };

        let extent = sample.extent();
        let exclusion = find_window_for(&lesion, extent, self.patch_size, self.max_abnorm_overlap);
        let window = find_window_for(&breast, extent, self.patch_size, self.min_breast_overlap);

        for _ in 0..self.max_tries {
            let at = draw(&window, rng);
            if exclusion.contains(at.0, at.1) {
                continue;
            }
            let mut out = crop_all(sample, Crop::at(at, self.patch_size));
            out.record.pathology = label::NORMAL.to_owned();
            out.provenance = Provenance::NormalTissue;
            return out;
        }

        warn!(
            "giving up on a normal tissue patch for patient {} after {} tries",
            sample.record.patient_id, self.max_tries
        );
        let mut out = self.inner.apply(sample, rng);
        out.provenance = Provenance::NormalTissueGaveUp;
        out
    }
}

/// patch 策略.
///
/// 尺寸一律为 `(宽, 高)`.
#[derive(Clone, Debug, PartialEq)]
pub enum PatchStrategy {
    /// 以病灶中心为中心的确定性 patch. 越界时整体平移进图像,
    /// 见 [`crate::geometry::slide_into`].
    Centered {
        /// patch 尺寸.
        patch_size: (usize, usize),
    },

    /// 与病灶的重叠不少于 `min_overlap` 的随机 patch.
    RandomOverlap {
        /// patch 尺寸.
        patch_size: (usize, usize),
        /// 每个轴上的最小重叠比例.
        min_overlap: f64,
    },

    /// 包装另一个策略, 按概率改为采正常组织.
    ///
    /// 成功时样本病理被改写为 `NORMAL`; 尝试次数耗尽时退回被包装的策略.
    NormalTissue(NormalTissue),
}

impl PatchStrategy {
    /// 居中 patch.
    pub fn centered(patch_size: (usize, usize)) -> Result<Self> {
        Ok(Self::Centered {
            patch_size: check_size(patch_size)?,
        })
    }

    /// 随机重叠 patch.
    pub fn random(patch_size: (usize, usize), min_overlap: f64) -> Result<Self> {
        Ok(Self::RandomOverlap {
            patch_size: check_size(patch_size)?,
            min_overlap: check_fraction("min_overlap", min_overlap)?,
        })
    }

    /// 默认最小重叠 (0.9) 的随机 patch.
    #[inline]
    pub fn random_default(patch_size: (usize, usize)) -> Result<Self> {
        Self::random(patch_size, DEFAULT_MIN_OVERLAP)
    }

    /// 请求的 patch 尺寸.
    pub fn patch_size(&self) -> (usize, usize) {
        match self {
            Self::Centered { patch_size } | Self::RandomOverlap { patch_size, .. } => *patch_size,
            Self::NormalTissue(n) => n.patch_size,
        }
    }

    /// 是否可能产出正常组织 patch?
    pub fn yields_normal_tissue(&self) -> bool {
        matches!(self, Self::NormalTissue(_))
    }
}

impl From<NormalTissue> for PatchStrategy {
    #[inline]
    fn from(value: NormalTissue) -> Self {
        Self::NormalTissue(value)
    }
}

impl RecordTransform for PatchStrategy {
    fn apply(&self, sample: Sample, rng: &mut SampleRng) -> Sample {
        match self {
            Self::Centered { patch_size } => {
                let center = (sample.record.cx as f64, sample.record.cy as f64);
                let crop = centered_crop(center, sample.extent(), *patch_size);
                crop_all(sample, crop)
            }
            Self::RandomOverlap {
                patch_size,
                min_overlap,
            } => {
                let Some(lesion) = sample.record.lesion_box() else {
                    warn!(
                        "record of patient {} has an invalid lesion box; sample left uncropped",
                        sample.record.patient_id
                    );
                    return sample;
                };
                let window = find_window_for(&lesion, sample.extent(), *patch_size, *min_overlap);
                let at = draw(&window, rng);
                crop_all(sample, Crop::at(at, *patch_size))
            }
            Self::NormalTissue(n) => n.apply(sample, rng),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::record;
    use ndarray::Array2;
    use rand::SeedableRng;

    /// 像素值等于 `y * w + x` 的图像, 便于从裁剪结果反推左上角.
    fn ramp(h: usize, w: usize) -> Array2<f32> {
        Array2::from_shape_fn((h, w), |(y, x)| (y * w + x) as f32)
    }

    fn top_left(c: &Array2<f32>, w: usize) -> (usize, usize) {
        let v = c[[0, 0]] as usize;
        (v % w, v / w)
    }

    fn sample(h: usize, w: usize) -> Sample {
        let image = ramp(h, w);
        let mask = image.clone();
        Sample::new(vec![image, mask], record("P_001", "mass", "BENIGN"))
    }

    #[test]
    fn test_invalid_arguments() {
        assert!(PatchStrategy::centered((0, 10)).is_err());
        assert!(PatchStrategy::random((10, 10), 1.5).is_err());
        let inner = PatchStrategy::centered((8, 8)).unwrap();
        assert!(NormalTissue::new(inner, -0.1, (8, 8)).is_err());
    }

    #[test]
    fn test_centered_scenario() {
        let s = sample(1024, 1024);
        let p = PatchStrategy::centered((256, 256)).unwrap();
        let out = p.apply(s, &mut SampleRng::seed_from_u64(0));

        assert_eq!(out.channels[0].dim(), (256, 256));
        // 中心 (150, 100): 左/上越界, 平移到 0.
        assert_eq!(top_left(&out.channels[0], 1024), (22, 0));
        assert_eq!(out.channels[0], out.channels[1]);
    }

    #[test]
    fn test_centered_oversized_patch_is_cropped_to_image() {
        let s = sample(200, 300);
        let p = PatchStrategy::centered((512, 128)).unwrap();
        let out = p.apply(s, &mut SampleRng::seed_from_u64(0));
        assert_eq!(out.channels[0].dim(), (128, 300));
    }

    #[test]
    fn test_random_overlap_scenario() {
        let p = PatchStrategy::random_default((256, 256)).unwrap();
        let mut rng = SampleRng::seed_from_u64(7);
        for _ in 0..200 {
            let out = p.apply(sample(1024, 1024), &mut rng);
            assert_eq!(out.channels[0].dim(), (256, 256));
            assert_eq!(out.channels[0], out.channels[1]);

            // 窗口 x: [0, 155], y: [0, 105].
            let (x, y) = top_left(&out.channels[0], 1024);
            assert!(x <= 155 && y <= 105, "({x}, {y})");

            // 每个轴上与病灶的重叠至少 0.9 * 50.
            let ox = (x + 256).min(200) as f64 - x.max(100) as f64;
            let oy = (y + 256).min(150) as f64 - y.max(50) as f64;
            assert!(ox >= 45.0 && oy >= 45.0);
        }
    }

    #[test]
    fn test_random_overlap_is_reproducible() {
        let p = PatchStrategy::random((64, 64), 0.5).unwrap();
        let a = p.apply(sample(512, 512), &mut SampleRng::seed_from_u64(3));
        let b = p.apply(sample(512, 512), &mut SampleRng::seed_from_u64(3));
        assert_eq!(a, b);
    }

    #[test]
    fn test_normal_tissue_relabels() {
        let inner = PatchStrategy::random_default((64, 64)).unwrap();
        let p: PatchStrategy = NormalTissue::new(inner, 0.0, (64, 64))
            .unwrap()
            .with_max_tries(50)
            .into();
        assert!(p.yields_normal_tissue());

        let mut rng = SampleRng::seed_from_u64(11);
        for _ in 0..50 {
            let mut s = sample(512, 512);
            s.record.breast_maxx = 500;
            s.record.breast_maxy = 500;
            let out = p.apply(s, &mut rng);

            assert_eq!(out.provenance, Provenance::NormalTissue);
            assert!(out.record.is_normal());
            assert_eq!(out.channels[0].dim(), (64, 64));
            assert_eq!(out.channels[0], out.channels[1]);

            // 排除窗口 x: [91, 195], y: [41, 145].
            let (x, y) = top_left(&out.channels[0], 512);
            assert!(!((91..=195).contains(&x) && (41..=145).contains(&y)));
        }
    }

    #[test]
    fn test_normal_tissue_always_delegates() {
        let inner = PatchStrategy::centered((64, 64)).unwrap();
        let p: PatchStrategy = NormalTissue::new(inner, 1.0, (64, 64)).unwrap().into();
        let out = p.apply(sample(512, 512), &mut SampleRng::seed_from_u64(0));
        assert_eq!(out.provenance, Provenance::Lesion);
        assert_eq!(out.record.pathology, "BENIGN");
        assert_eq!(top_left(&out.channels[0], 512), (118, 68));
    }

    #[test]
    fn test_normal_tissue_gives_up() {
        // 乳房区域与病灶重合: 所有候选都落在排除窗口内.
        let inner = PatchStrategy::centered((64, 64)).unwrap();
        let p: PatchStrategy = NormalTissue::new(inner, 0.0, (64, 64)).unwrap().into();

        let mut s = sample(512, 512);
        s.record.breast_minx = 100;
        s.record.breast_maxx = 200;
        s.record.breast_miny = 50;
        s.record.breast_maxy = 150;
        let out = p.apply(s, &mut SampleRng::seed_from_u64(5));

        assert_eq!(out.provenance, Provenance::NormalTissueGaveUp);
        assert_eq!(out.record.pathology, "BENIGN");
        assert_eq!(top_left(&out.channels[0], 512), (118, 68));
    }

    #[test]
    fn test_describe_distinguishes_parameters() {
        let a = PatchStrategy::random((64, 64), 0.9).unwrap();
        let b = PatchStrategy::random((64, 64), 0.8).unwrap();
        assert_ne!(a.describe(), b.describe());
    }
}
