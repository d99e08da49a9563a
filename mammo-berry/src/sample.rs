//! 样本与记录级变换.

use crate::{Record, SampleRng};
use ndarray::Array2;
use std::fmt::Debug;

/// 样本中 patch 的来源.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
pub enum Provenance {
    /// 病灶 patch, 或者未经 patch 变换的整图.
    #[default]
    Lesion,
    /// 从乳房区域中采到的正常组织 patch, 病理已改写为 `NORMAL`.
    NormalTissue,
    /// 正常组织采样次数耗尽, 退回到被包装的病灶策略.
    NormalTissueGaveUp,
}

/// 一个样本: 通道 (图像, 可选掩码) 及其来源记录.
///
/// 样本是一次性的值, 对 `record` 的改写不会回写到记录集合.
#[derive(Clone, Debug, PartialEq)]
pub struct Sample {
    /// 通道列表, 第 0 个是图像, 第 1 个 (若有) 是掩码. 取值范围 `[0, 1]`.
    pub channels: Vec<Array2<f32>>,
    /// 来源记录.
    pub record: Record,
    /// patch 来源.
    pub provenance: Provenance,
}

impl Sample {
    /// 以病灶来源创建样本.
    #[inline]
    pub fn new(channels: Vec<Array2<f32>>, record: Record) -> Self {
        Self {
            channels,
            record,
            provenance: Provenance::Lesion,
        }
    }

    /// 图像形状 `(高, 宽)`. 没有通道时返回 `(0, 0)`.
    #[inline]
    pub fn extent(&self) -> crate::Idx2d {
        self.channels.first().map_or((0, 0), |c| c.dim())
    }

    /// 拆分为 `(通道, 记录)`.
    #[inline]
    pub fn into_parts(self) -> (Vec<Array2<f32>>, Record) {
        (self.channels, self.record)
    }
}

/// 记录级变换: 作用于整个样本 (所有通道和记录).
///
/// 实现者需要保证: 同一个样本的所有通道使用同一组随机参数.
pub trait RecordTransform: Debug + Send + Sync {
    /// 变换样本.
    fn apply(&self, sample: Sample, rng: &mut SampleRng) -> Sample;

    /// 变换的稳定文字描述, 参与缓存指纹的计算.
    ///
    /// 默认使用 `Debug` 输出. 参数不同的变换必须给出不同的描述.
    fn describe(&self) -> String {
        format!("{self:?}")
    }
}

/// 顺序执行的一组记录级变换.
pub(crate) fn apply_all(
    pipeline: &[std::sync::Arc<dyn RecordTransform>],
    sample: Sample,
    rng: &mut SampleRng,
) -> Sample {
    pipeline.iter().fold(sample, |s, t| t.apply(s, rng))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::record;
    use ndarray::Array2;
    use rand::SeedableRng;
    use std::sync::Arc;

    #[derive(Debug)]
    struct Halve;

    impl RecordTransform for Halve {
        fn apply(&self, mut sample: Sample, _rng: &mut SampleRng) -> Sample {
            for c in sample.channels.iter_mut() {
                c.mapv_inplace(|v| v / 2.0);
            }
            sample
        }
    }

    #[test]
    fn test_apply_all_in_order() {
        let s = Sample::new(vec![Array2::ones((2, 3))], record("P_001", "mass", "BENIGN"));
        assert_eq!(s.extent(), (2, 3));

        let pipeline: Vec<Arc<dyn RecordTransform>> = vec![Arc::new(Halve), Arc::new(Halve)];
        let mut rng = SampleRng::seed_from_u64(0);
        let out = apply_all(&pipeline, s, &mut rng);
        assert!(out.channels[0].iter().all(|&v| v == 0.25));
        assert_eq!(out.provenance, Provenance::Lesion);
    }

    #[test]
    fn test_describe_defaults_to_debug() {
        assert_eq!(Halve.describe(), "Halve");
    }
}
