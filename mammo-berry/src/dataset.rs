//! 数据集工厂.
//!
//! [`DatasetFactory`] 是按值消耗的构建器: 每个方法拿走 `self` 并返回新的工厂,
//! 所有设置只在 [`DatasetFactory::build`] 中一次性生效, 与调用顺序无关.
//!
//! ```no_run
//! use mammo_berry::dataset::{DatasetFactory, Splits};
//! use mammo_berry::config::DatasetConfig;
//!
//! let factory = DatasetFactory::new(&DatasetConfig::from_env_or_home()?)
//!     .lesion_patches_random((512, 512), 0.9, 0.2)?
//!     .split_train_val(0.2)
//!     .cache_here();
//! if let Splits::Holdout { train, val } = factory.create_classification("pathology")? {
//!     let (channels, label) = train.get(0)?;
//!     # let _ = (channels, label, val);
//! }
//! # Ok::<(), mammo_berry::Error>(())
//! ```

use crate::augment::{ChannelPipeline, ChannelTransform};
use crate::cache::{materialize, CacheReport};
use crate::config::DatasetConfig;
use crate::consts::label;
use crate::error::{ConfigurationError, Result};
use crate::patch::{NormalTissue, PatchStrategy};
use crate::{load_lesions, RecordFilter, RecordSet, SampleSource, SourceConfig, RECORD_ATTRIBUTES};
use log::info;
use ndarray::Array2;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// `show_counts` 统计的属性.
pub const COUNTED_ATTRIBUTES: [&str; 7] = [
    "lesion_type",
    "type1",
    "type2",
    "pathology",
    "assessment",
    "breast_density",
    "subtlety",
];

/// 工厂的产物: 单个样本源、留出法划分或 k 折划分.
#[derive(Debug)]
pub enum Splits<S> {
    /// 不划分. 样本源预设为训练模式.
    Single(S),
    /// 留出法.
    Holdout {
        /// 训练部分, 训练模式.
        train: S,
        /// 验证部分, 测试模式.
        val: S,
    },
    /// k 折, 每项为 `(训练, 验证)`.
    KFold(Vec<(S, S)>),
}

impl<S> Splits<S> {
    /// 逐个变换其中的样本源.
    pub fn map<T, F: FnMut(S) -> T>(self, mut f: F) -> Splits<T> {
        match self {
            Self::Single(s) => Splits::Single(f(s)),
            Self::Holdout { train, val } => Splits::Holdout {
                train: f(train),
                val: f(val),
            },
            Self::KFold(pairs) => Splits::KFold(pairs.into_iter().map(|(t, v)| (f(t), f(v))).collect()),
        }
    }

    /// 样本源的总个数.
    pub fn count(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Holdout { .. } => 2,
            Self::KFold(pairs) => pairs.len() * 2,
        }
    }
}

/// 样本源组成的产物.
pub type DatasetSplits = Splits<SampleSource>;

/// 带模式开关的通道级变换.
#[derive(Clone, Debug)]
struct ImageTransformEntry {
    transform: Arc<dyn ChannelTransform>,
    for_train: bool,
    for_val: bool,
}

#[derive(Copy, Clone, Debug, PartialEq)]
enum SplitPlan {
    None,
    Holdout(f64),
    KFold(usize),
}

/// 数据集工厂.
#[derive(Clone, Debug)]
pub struct DatasetFactory {
    root: PathBuf,
    include_train: bool,
    include_test: bool,
    filter: RecordFilter,
    patch: Option<PatchStrategy>,
    image_transforms: Vec<ImageTransformEntry>,
    split: SplitPlan,
    cache: bool,
    masks: bool,
    seed: u64,
    shuffle: bool,
}

impl DatasetFactory {
    /// 默认只加载训练表中的肿块病灶, 不划分, 不缓存, 不加载掩码, 划分时打乱.
    pub fn new(config: &DatasetConfig) -> Self {
        Self::at(&config.download_path)
    }

    /// 以下载目录新建, 见 [`DatasetFactory::new`].
    pub fn at<P: AsRef<Path>>(download_path: P) -> Self {
        Self {
            root: download_path.as_ref().to_owned(),
            include_train: true,
            include_test: false,
            filter: RecordFilter::lesions(true, false),
            patch: None,
            image_transforms: vec![],
            split: SplitPlan::None,
            cache: false,
            masks: false,
            seed: 0,
            shuffle: true,
        }
    }

    /// 从 JSON 配置文件新建.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::new(&DatasetConfig::from_json_file(path)?))
    }

    /// 选择加载训练表和/或测试表.
    pub fn include_sets(mut self, train: bool, test: bool) -> Self {
        self.include_train = train;
        self.include_test = test;
        self
    }

    /// 选择保留的病灶类型.
    pub fn lesion_types(mut self, masses: bool, calcifications: bool) -> Self {
        self.filter = self.filter.with_lesion_types(masses, calcifications);
        self
    }

    /// 丢弃 (清空) 属性.
    pub fn drop_attributes<'a, I: IntoIterator<Item = &'a str>>(mut self, attributes: I) -> Self {
        for a in attributes {
            self.filter = self.filter.drop_attribute(a);
        }
        self
    }

    /// 删除属性取值为 `values` 之一的记录.
    pub fn drop_attribute_values<'a, I: IntoIterator<Item = &'a str>>(mut self, attribute: &str, values: I) -> Self {
        self.filter = self.filter.exclude(attribute, values);
        self
    }

    /// 改写属性取值.
    pub fn map_attribute_value<'a, I: IntoIterator<Item = (&'a str, &'a str)>>(
        mut self,
        attribute: &str,
        mapping: I,
    ) -> Self {
        self.filter = self.filter.map_values(attribute, mapping);
        self
    }

    fn select_patch(mut self, patch: PatchStrategy) -> Result<Self> {
        if self.patch.is_some() {
            return Err(ConfigurationError::PatchAlreadySelected.into());
        }
        self.patch = Some(patch);
        Ok(self)
    }

    /// 以病灶为中心的 patch. 只能选择一次 patch 变换.
    pub fn lesion_patches_centered(self, patch_size: (usize, usize)) -> Result<Self> {
        let patch = PatchStrategy::centered(patch_size)?;
        self.select_patch(patch)
    }

    /// 与病灶重叠不少于 `min_overlap` 的随机 patch. 只能选择一次 patch 变换.
    ///
    /// `normal_probability > 0` 时以该概率改采正常组织, 此时正常组织 patch 与乳房区域的
    /// 最小重叠取 `1 - min_overlap`.
    pub fn lesion_patches_random(
        self,
        patch_size: (usize, usize),
        min_overlap: f64,
        normal_probability: f64,
    ) -> Result<Self> {
        let mut patch = PatchStrategy::random(patch_size, min_overlap)?;
        if normal_probability > 0.0 {
            if normal_probability > 1.0 {
                return Err(ConfigurationError::InvalidArgument {
                    name: "normal_probability",
                    reason: format!("{normal_probability} is not in [0, 1]"),
                }
                .into());
            }
            patch = NormalTissue::new(patch, 1.0 - normal_probability, patch_size)?
                .with_min_breast_overlap(1.0 - min_overlap)?
                .into();
        }
        self.select_patch(patch)
    }

    /// 追加通道级变换, 分别指定是否用于训练模式与测试模式.
    pub fn add_image_transforms<I>(mut self, transforms: I, for_train: bool, for_val: bool) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ChannelTransform>>,
    {
        self.image_transforms
            .extend(transforms.into_iter().map(|transform| ImageTransformEntry {
                transform,
                for_train,
                for_val,
            }));
        self
    }

    /// 留出法划分. 覆盖之前的划分设置.
    pub fn split_train_val(mut self, validation_fraction: f64) -> Self {
        self.split = SplitPlan::Holdout(validation_fraction);
        self
    }

    /// k 折划分. 覆盖之前的划分设置.
    pub fn split_cross_validation(mut self, k_folds: usize) -> Self {
        self.split = SplitPlan::KFold(k_folds);
        self
    }

    /// 将 patch 结果物化到下载目录下的缓存中.
    pub fn cache_here(mut self) -> Self {
        self.cache = true;
        self
    }

    /// 是否加载掩码作为第二个通道.
    pub fn masks(mut self, masks: bool) -> Self {
        self.masks = masks;
        self
    }

    /// 基础种子, 用于打乱、patch 与增强.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// 划分前是否打乱.
    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }

    /// 加载并过滤病灶表.
    pub fn records(&self) -> Result<RecordSet> {
        load_lesions(&self.root, self.include_train, self.include_test, &self.filter)
    }

    /// 统计常用属性的取值分布, 同时写入日志.
    pub fn show_counts(&self) -> Result<Vec<(&'static str, Vec<(String, usize)>)>> {
        let records = self.records()?;
        COUNTED_ATTRIBUTES
            .iter()
            .map(|&a| -> Result<(&'static str, Vec<(String, usize)>)> {
                let counts = records.value_counts(a)?;
                info!("{a}: {counts:?}");
                Ok((a, counts))
            })
            .collect()
    }

    fn channel_pipelines(&self) -> (ChannelPipeline, ChannelPipeline) {
        let pick = |keep: fn(&ImageTransformEntry) -> bool| {
            self.image_transforms
                .iter()
                .filter(|e| keep(e))
                .map(|e| Arc::clone(&e.transform))
                .collect::<ChannelPipeline>()
        };
        (pick(|e| e.for_train), pick(|e| e.for_val))
    }

    /// 构建样本源, 同时返回缓存报告 (若启用了缓存).
    pub fn build_with_report(&self) -> Result<(DatasetSplits, Option<CacheReport>)> {
        let records = self.records()?;
        let (train, test) = self.channel_pipelines();
        let mut config = SourceConfig::new()
            .with_masks(self.masks)
            .with_seed(self.seed)
            .with_channel_pipelines(train, test);

        let (records, root, report) = if self.cache {
            // 缓存总是连同掩码一起物化.
            let mut staging = SourceConfig::new().with_masks(true).with_seed(self.seed);
            if let Some(p) = &self.patch {
                staging = staging.with_record_transform(p.clone());
            }
            let (cached, report) = materialize(&SampleSource::new(records, &self.root, staging))?;
            (cached.records().clone(), cached.root().to_owned(), Some(report))
        } else {
            if let Some(p) = &self.patch {
                config = config.with_record_transform(p.clone());
            }
            (records, self.root.clone(), None)
        };

        let source = SampleSource::shared(records, root, Arc::new(config));
        let splits = match self.split {
            SplitPlan::None => Splits::Single(source.train_mode()),
            SplitPlan::Holdout(fraction) => {
                let (train, val) = source.split_holdout(fraction, self.shuffle, self.seed)?;
                Splits::Holdout { train, val }
            }
            SplitPlan::KFold(k) => Splits::KFold(source.split_kfold(k, self.shuffle, self.seed)?),
        };
        Ok((splits, report))
    }

    /// 构建样本源.
    #[inline]
    pub fn build(&self) -> Result<DatasetSplits> {
        Ok(self.build_with_report()?.0)
    }

    /// 构建分类数据集: 每个样本返回 `(通道, 标签序号)`.
    ///
    /// 标签表为 `attribute` 在记录集合中的去重取值 (按首次出现顺序);
    /// 若启用了正常组织 patch, 末尾追加 `NORMAL`.
    pub fn create_classification(&self, attribute: &str) -> Result<Splits<ClassificationSource>> {
        if !RECORD_ATTRIBUTES.contains(&attribute) {
            return Err(ConfigurationError::UnknownAttribute(attribute.to_owned()).into());
        }
        let splits = self.build()?;

        let mut labels: Vec<String> = vec![];
        let mut collect = |s: &SampleSource| -> Result<()> {
            for v in s.records().unique_values(attribute)? {
                if !labels.contains(&v) {
                    labels.push(v);
                }
            }
            Ok(())
        };
        match &splits {
            Splits::Single(s) => collect(s)?,
            Splits::Holdout { train, val } => {
                collect(train)?;
                collect(val)?;
            }
            Splits::KFold(pairs) => {
                for (t, v) in pairs {
                    collect(t)?;
                    collect(v)?;
                }
            }
        }
        let yields_normal = self.patch.as_ref().map_or(false, PatchStrategy::yields_normal_tissue);
        if yields_normal && !labels.iter().any(|l| label::is_normal(l)) {
            labels.push(label::NORMAL.to_owned());
        }
        info!("classification on `{attribute}` with labels {labels:?}");

        let labels = Arc::new(labels);
        let attribute: Arc<str> = attribute.into();
        Ok(splits.map(|source| ClassificationSource {
            source,
            attribute: Arc::clone(&attribute),
            labels: Arc::clone(&labels),
        }))
    }
}

/// 分类样本源: 把样本记录中的某个属性映射为标签序号.
#[derive(Debug)]
pub struct ClassificationSource {
    source: SampleSource,
    attribute: Arc<str>,
    labels: Arc<Vec<String>>,
}

impl ClassificationSource {
    /// 取第 `index` 个样本的 `(通道, 标签序号)`.
    ///
    /// 标签按 patch 变换之后的记录计算, 因此正常组织 patch 得到 `NORMAL` 的序号.
    pub fn get(&self, index: usize) -> Result<(Vec<Array2<f32>>, usize)> {
        let sample = self.source.get(index)?;
        let value = sample.record.get(&self.attribute).unwrap_or_default();
        let label = self
            .labels
            .iter()
            .position(|l| l == value)
            .ok_or_else(|| ConfigurationError::UnknownLabel(value.to_owned()))?;
        Ok((sample.channels, label))
    }

    /// 标签表.
    #[inline]
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// 底层样本源.
    #[inline]
    pub fn source(&self) -> &SampleSource {
        &self.source
    }

    /// 样本数.
    #[inline]
    pub fn len(&self) -> usize {
        self.source.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }
}
