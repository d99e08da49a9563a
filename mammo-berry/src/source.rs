//! 样本源: 按记录索引取样本.
//!
//! 取样本分三步:
//!
//! 1. 解码图像 (以及可选的掩码) 到 `[0, 1]` 的 `f32` 通道;
//! 2. 按顺序执行记录级流水线 (比如 patch 策略);
//! 3. 若当前模式配置了通道级流水线, 固定一个通道种子,
//!   每个通道都用由该种子新建的生成器执行一遍完整的流水线.
//!
//! # 随机数
//!
//! 不存在全局生成器. [`SampleSource::get`] 从源的基础种子与调用计数派生本次种子;
//! [`SampleSource::get_seeded`] 由调用方指定种子, 结果完全可复现.

use crate::augment::{ChannelPipeline, ChannelTransform};
use crate::consts::{U16_DIVISOR, U8_DIVISOR};
use crate::error::{ConfigurationError, DecodeError, Result};
use crate::sample::apply_all;
use crate::{Record, RecordSet, RecordTransform, Sample, SampleRng};
use log::debug;
use ndarray::Array2;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// 执行模式. 训练与测试互斥, 默认不设置.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Mode {
    /// 训练模式, 使用训练流水线.
    Train,
    /// 测试模式, 使用测试流水线.
    Test,
}

/// splitmix64 混合, 把相邻的整数打散成互不相关的种子.
#[inline]
pub(crate) fn mix_seed(base: u64, n: u64) -> u64 {
    let mut z = base.wrapping_add(n.wrapping_add(1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// 样本源的不可变配置, 由多个样本源共享.
#[derive(Clone, Debug, Default)]
pub struct SourceConfig {
    pipeline: Vec<Arc<dyn RecordTransform>>,
    train_pipeline: ChannelPipeline,
    test_pipeline: ChannelPipeline,
    masks: bool,
    seed: u64,
}

impl SourceConfig {
    /// 空配置: 无变换, 不加载掩码, 种子为 0.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加记录级变换.
    pub fn with_record_transform<T: RecordTransform + 'static>(mut self, transform: T) -> Self {
        self.pipeline.push(Arc::new(transform));
        self
    }

    /// 追加已共享的记录级变换.
    pub fn with_shared_record_transform(mut self, transform: Arc<dyn RecordTransform>) -> Self {
        self.pipeline.push(transform);
        self
    }

    /// 追加训练模式下的通道级变换.
    pub fn with_train_transform<T: ChannelTransform + 'static>(mut self, transform: T) -> Self {
        self.train_pipeline.push(transform);
        self
    }

    /// 追加测试模式下的通道级变换.
    pub fn with_test_transform<T: ChannelTransform + 'static>(mut self, transform: T) -> Self {
        self.test_pipeline.push(transform);
        self
    }

    /// 替换训练与测试流水线.
    pub fn with_channel_pipelines(mut self, train: ChannelPipeline, test: ChannelPipeline) -> Self {
        self.train_pipeline = train;
        self.test_pipeline = test;
        self
    }

    /// 是否加载掩码作为第二个通道.
    #[inline]
    pub fn with_masks(mut self, masks: bool) -> Self {
        self.masks = masks;
        self
    }

    /// 基础种子.
    #[inline]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 清空记录级流水线. 用于缓存物化之后.
    #[inline]
    pub(crate) fn without_record_transforms(mut self) -> Self {
        self.pipeline.clear();
        self
    }

    /// 记录级流水线.
    #[inline]
    pub fn record_pipeline(&self) -> &[Arc<dyn RecordTransform>] {
        &self.pipeline
    }

    /// 模式对应的通道级流水线.
    #[inline]
    pub fn channel_pipeline(&self, mode: Mode) -> &ChannelPipeline {
        match mode {
            Mode::Train => &self.train_pipeline,
            Mode::Test => &self.test_pipeline,
        }
    }

    /// 是否加载掩码?
    #[inline]
    pub fn masks(&self) -> bool {
        self.masks
    }

    /// 基础种子.
    #[inline]
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// 解码单个通道并归一化到 `[0, 1]`.
///
/// 每通道 16 bit 的图像除以 65535, 8 bit 的除以 255; 多通道图像先转为灰度.
pub fn decode_channel<P: AsRef<Path>>(path: P) -> std::result::Result<Array2<f32>, DecodeError> {
    let path = path.as_ref();
    if !path.is_file() {
        return Err(DecodeError::Missing(path.to_owned()));
    }
    let img = image::open(path).map_err(|source| DecodeError::Corrupt {
        path: path.to_owned(),
        source,
    })?;

    let color = img.color();
    let shape = (img.height() as usize, img.width() as usize);
    match color.bytes_per_pixel() / color.channel_count() {
        1 => {
            let luma = img.to_luma8();
            Ok(Array2::from_shape_fn(shape, |(y, x)| {
                luma.get_pixel(x as u32, y as u32)[0] as f32 / U8_DIVISOR
            }))
        }
        2 => {
            let luma = img.to_luma16();
            Ok(Array2::from_shape_fn(shape, |(y, x)| {
                luma.get_pixel(x as u32, y as u32)[0] as f32 / U16_DIVISOR
            }))
        }
        _ => Err(DecodeError::UnsupportedPixel {
            path: path.to_owned(),
            color,
        }),
    }
}

/// 按记录索引访问的样本源.
#[derive(Debug)]
pub struct SampleSource {
    records: RecordSet,
    root: PathBuf,
    config: Arc<SourceConfig>,
    mode: Option<Mode>,
    calls: AtomicU64,
}

impl SampleSource {
    /// 新建样本源. 路径字段相对于 `root`. 模式未设置.
    pub fn new<P: AsRef<Path>>(records: RecordSet, root: P, config: SourceConfig) -> Self {
        Self::shared(records, root.as_ref().to_owned(), Arc::new(config))
    }

    /// 共享配置新建样本源.
    pub(crate) fn shared(records: RecordSet, root: PathBuf, config: Arc<SourceConfig>) -> Self {
        Self {
            records,
            root,
            config,
            mode: None,
            calls: AtomicU64::new(0),
        }
    }

    /// 以相同的下载目录和配置, 包装另一组记录. 模式不继承.
    pub fn with_records(&self, records: RecordSet) -> Self {
        Self::shared(records, self.root.clone(), Arc::clone(&self.config))
    }

    /// 切换到训练模式.
    #[inline]
    pub fn train_mode(mut self) -> Self {
        self.mode = Some(Mode::Train);
        self
    }

    /// 切换到测试模式.
    #[inline]
    pub fn test_mode(mut self) -> Self {
        self.mode = Some(Mode::Test);
        self
    }

    /// 按标志设置模式. 两者同时为真时返回 [`ConfigurationError::ConflictingModes`],
    /// 都为假时清除模式.
    pub fn with_mode_flags(mut self, train: bool, test: bool) -> Result<Self> {
        self.mode = match (train, test) {
            (true, true) => return Err(ConfigurationError::ConflictingModes.into()),
            (true, false) => Some(Mode::Train),
            (false, true) => Some(Mode::Test),
            (false, false) => None,
        };
        Ok(self)
    }

    /// 当前模式.
    #[inline]
    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// 记录集合.
    #[inline]
    pub fn records(&self) -> &RecordSet {
        &self.records
    }

    /// 下载目录.
    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 共享配置.
    #[inline]
    pub fn config(&self) -> &Arc<SourceConfig> {
        &self.config
    }

    /// 样本数.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 取第 `index` 个样本, 种子由基础种子和调用计数派生.
    pub fn get(&self, index: usize) -> Result<Sample> {
        let n = self.calls.fetch_add(1, Ordering::Relaxed);
        self.get_seeded(index, mix_seed(self.config.seed, n))
    }

    /// 以给定种子取第 `index` 个样本. 相同的种子总是给出相同的样本.
    pub fn get_seeded(&self, index: usize, seed: u64) -> Result<Sample> {
        let pipeline = self.active_pipeline()?;
        let mut rng = SampleRng::seed_from_u64(seed);
        let mut sample = self.record_level(index, &mut rng)?;

        if let Some(p) = pipeline.filter(|p| !p.is_empty()) {
            let channel_seed: u64 = rng.gen();
            sample.channels = p.apply_synchronized(sample.channels, channel_seed);
        }
        Ok(sample)
    }

    /// 当前模式的通道级流水线. 未设置模式但配置了通道级流水线时报错.
    fn active_pipeline(&self) -> Result<Option<&ChannelPipeline>> {
        match self.mode {
            Some(m) => Ok(Some(self.config.channel_pipeline(m))),
            None if self.config.train_pipeline.is_empty() && self.config.test_pipeline.is_empty() => {
                Ok(None)
            }
            None => Err(ConfigurationError::ModeNotSet.into()),
        }
    }

    /// 解码并执行记录级流水线, 不涉及模式.
    pub(crate) fn record_level(&self, index: usize, rng: &mut SampleRng) -> Result<Sample> {
        let record = self.records.get(index).ok_or(DecodeError::OutOfRange {
            index,
            len: self.records.len(),
        })?;
        let channels = self.decode(index, record)?;
        debug!("decoded sample {index} ({})", record.image_path);
        Ok(apply_all(
            &self.config.pipeline,
            Sample::new(channels, record.clone()),
            rng,
        ))
    }

    fn decode(&self, index: usize, record: &Record) -> std::result::Result<Vec<Array2<f32>>, DecodeError> {
        let image = decode_channel(self.root.join(&record.image_path))?;
        if !self.config.masks {
            return Ok(vec![image]);
        }

        let mask_path = match &record.mask_path {
            Some(p) if !p.is_empty() => self.root.join(p),
            _ => return Err(DecodeError::NoMaskPath(index)),
        };
        let mask = decode_channel(&mask_path)?;
        if mask.dim() != image.dim() {
            return Err(DecodeError::ShapeMismatch {
                path: mask_path,
                image: image.dim(),
                mask: mask.dim(),
            });
        }
        Ok(vec![image, mask])
    }

    /// 顺序遍历所有样本. 迭代器可以通过 [`SampleIter::reset`] 重新开始.
    pub fn iter(&self) -> SampleIter<'_> {
        SampleIter::new(self)
    }
}

/// 样本源的顺序迭代器.
#[derive(Debug)]
pub struct SampleIter<'a> {
    source: &'a SampleSource,
    data_rev: Vec<usize>,
}

impl<'a> SampleIter<'a> {
    fn new(source: &'a SampleSource) -> Self {
        let mut it = Self {
            source,
            data_rev: Vec::with_capacity(source.len()),
        };
        it.reset();
        it
    }

    /// 回到第一个样本.
    pub fn reset(&mut self) {
        self.data_rev.clear();
        self.data_rev.extend((0..self.source.len()).rev());
    }
}

impl<'a> Iterator for SampleIter<'a> {
    type Item = (usize, Result<Sample>);

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.data_rev.pop()?;
        Some((idx, self.source.get(idx)))
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.data_rev.len(), Some(self.data_rev.len()))
    }
}

impl<'a> ExactSizeIterator for SampleIter<'a> {
    #[inline]
    fn len(&self) -> usize {
        self.data_rev.len()
    }
}
