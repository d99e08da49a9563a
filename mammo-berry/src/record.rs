//! 病灶表: 单条记录、记录集合、过滤器与加载器.
//!
//! 病灶表是下载目录中的 `lesions_train.csv` / `lesions_test.csv`, 每行描述一个病灶.
//! 读写通过 `csv` + `serde` 完成, 列名与 [`Record`] 的字段名一致;
//! 表中多余的列 (比如 pandas 写出的无名索引列) 会被忽略.

use crate::consts::{label, layout};
use crate::error::{CacheError, ConfigurationError, Result};
use crate::geometry::BoundingBox;
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// 可以按名字读写的记录属性. 几何字段不在其中, 它们不参与过滤与重映射.
pub const RECORD_ATTRIBUTES: [&str; 11] = [
    "patient_id",
    "breast_density",
    "left_right",
    "view",
    "lesion_type",
    "type1",
    "type2",
    "assessment",
    "pathology",
    "subtlety",
    "image_path",
];

/// 病灶表中的一行.
///
/// 除了被 [`crate::cache`] 改写的路径字段, 以及正常组织 patch 改写的
/// `pathology`, 其余字段对核心模块只读.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Record {
    /// 患者 ID.
    pub patient_id: String,
    /// 乳腺密度.
    pub breast_density: String,
    /// 左右侧.
    pub left_right: String,
    /// 投照体位 (CC / MLO).
    pub view: String,
    /// 病灶类型, [`label::MASS`] 或 [`label::CALCIFICATION`].
    pub lesion_type: String,
    /// 形态学分类 1.
    pub type1: String,
    /// 形态学分类 2.
    pub type2: String,
    /// BI-RADS 评估.
    pub assessment: String,
    /// 病理结果.
    pub pathology: String,
    /// 隐匿程度.
    pub subtlety: String,
    /// 全图路径, 相对下载目录.
    pub image_path: String,
    /// 裁剪图路径, 相对下载目录.
    #[serde(default)]
    pub patch_path: Option<String>,
    /// 掩码路径, 相对下载目录.
    #[serde(default)]
    pub mask_path: Option<String>,

    /// 病灶最小 x. 病灶包围盒四个端点均为闭区间.
    pub minx: u32,
    /// 病灶最大 x.
    pub maxx: u32,
    /// 病灶最小 y.
    pub miny: u32,
    /// 病灶最大 y.
    pub maxy: u32,
    /// 病灶中心 x.
    pub cx: u32,
    /// 病灶中心 y.
    pub cy: u32,

    /// 乳房最小 x.
    pub breast_minx: u32,
    /// 乳房最大 x.
    pub breast_maxx: u32,
    /// 乳房最小 y.
    pub breast_miny: u32,
    /// 乳房最大 y.
    pub breast_maxy: u32,
    /// 乳房中心 x.
    pub breast_cx: u32,
    /// 乳房中心 y.
    pub breast_cy: u32,
}

impl Record {
    /// 病灶包围盒. 若表中 `min > max` 则返回 `None`.
    #[inline]
    pub fn lesion_box(&self) -> Option<BoundingBox> {
        BoundingBox::new(self.minx, self.maxx, self.miny, self.maxy)
    }

    /// 乳房区域包围盒. 若表中 `min > max` 则返回 `None`.
    #[inline]
    pub fn breast_box(&self) -> Option<BoundingBox> {
        BoundingBox::new(
            self.breast_minx,
            self.breast_maxx,
            self.breast_miny,
            self.breast_maxy,
        )
    }

    /// 按名字读取属性, 见 [`RECORD_ATTRIBUTES`].
    pub fn get(&self, attribute: &str) -> Option<&str> {
        let value = match attribute {
            "patient_id" => &self.patient_id,
            "breast_density" => &self.breast_density,
            "left_right" => &self.left_right,
            "view" => &self.view,
            "lesion_type" => &self.lesion_type,
            "type1" => &self.type1,
            "type2" => &self.type2,
            "assessment" => &self.assessment,
            "pathology" => &self.pathology,
            "subtlety" => &self.subtlety,
            "image_path" => &self.image_path,
            _ => return None,
        };
        Some(value.as_str())
    }

    /// 按名字改写属性. 属性名未知时返回 `None`, 否则返回旧值.
    pub fn set(&mut self, attribute: &str, value: impl Into<String>) -> Option<String> {
        let slot = match attribute {
            "patient_id" => &mut self.patient_id,
            "breast_density" => &mut self.breast_density,
            "left_right" => &mut self.left_right,
            "view" => &mut self.view,
            "lesion_type" => &mut self.lesion_type,
            "type1" => &mut self.type1,
            "type2" => &mut self.type2,
            "assessment" => &mut self.assessment,
            "pathology" => &mut self.pathology,
            "subtlety" => &mut self.subtlety,
            "image_path" => &mut self.image_path,
            _ => return None,
        };
        Some(std::mem::replace(slot, value.into()))
    }

    /// 病理标签是否已被改写为正常组织.
    #[inline]
    pub fn is_normal(&self) -> bool {
        label::is_normal(&self.pathology)
    }
}

/// 有序的记录集合. 插入顺序决定 `索引 -> 记录` 映射.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordSet {
    records: Vec<Record>,
}

impl RecordSet {
    /// 从 csv 文件读取.
    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let table = |source| CacheError::Table {
            path: path.to_owned(),
            source,
        };

        let mut reader = csv::Reader::from_path(path).map_err(table)?;
        let records = reader
            .deserialize::<Record>()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(table)?;
        debug!("read {} records from {}", records.len(), path.display());
        Ok(Self { records })
    }

    /// 写出到 csv 文件. 相同的记录集合总是写出相同的字节.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let table = |source| CacheError::Table {
            path: path.to_owned(),
            source,
        };

        let mut writer = csv::Writer::from_path(path).map_err(table)?;
        for r in &self.records {
            writer.serialize(r).map_err(table)?;
        }
        writer
            .flush()
            .map_err(|e| CacheError::io(path, e))?;
        Ok(())
    }

    /// 记录数.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// 是否为空?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 第 `index` 条记录.
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Record> {
        self.records.get(index)
    }

    /// 按顺序遍历.
    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, Record> {
        self.records.iter()
    }

    /// 以切片形式访问.
    #[inline]
    pub fn as_slice(&self) -> &[Record] {
        &self.records
    }

    /// 追加一条记录.
    #[inline]
    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// 按给定索引顺序挑选出新的记录集合. 越界索引被忽略.
    pub fn select<I: IntoIterator<Item = usize>>(&self, indices: I) -> Self {
        indices
            .into_iter()
            .filter_map(|i| self.records.get(i).cloned())
            .collect()
    }

    /// 属性取值计数, 按次数降序; 次数相同时按取值升序.
    ///
    /// 属性名未知时返回 [`ConfigurationError::UnknownAttribute`].
    pub fn value_counts(&self, attribute: &str) -> Result<Vec<(String, usize)>> {
        if !RECORD_ATTRIBUTES.contains(&attribute) {
            return Err(ConfigurationError::UnknownAttribute(attribute.to_owned()).into());
        }
        let counts = self
            .records
            .iter()
            .filter_map(|r| r.get(attribute))
            .counts();
        Ok(counts
            .into_iter()
            .map(|(v, n)| (v.to_owned(), n))
            .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
            .collect())
    }

    /// 属性的去重取值, 按首次出现的顺序.
    pub fn unique_values(&self, attribute: &str) -> Result<Vec<String>> {
        if !RECORD_ATTRIBUTES.contains(&attribute) {
            return Err(ConfigurationError::UnknownAttribute(attribute.to_owned()).into());
        }
        Ok(self
            .records
            .iter()
            .filter_map(|r| r.get(attribute))
            .unique()
            .map(str::to_owned)
            .collect())
    }
}

impl From<Vec<Record>> for RecordSet {
    #[inline]
    fn from(records: Vec<Record>) -> Self {
        Self { records }
    }
}

impl FromIterator<Record> for RecordSet {
    fn from_iter<T: IntoIterator<Item = Record>>(iter: T) -> Self {
        Self {
            records: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for RecordSet {
    type Item = Record;
    type IntoIter = std::vec::IntoIter<Record>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.records.into_iter()
    }
}

impl<'a> IntoIterator for &'a RecordSet {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

/// 病灶表过滤器.
///
/// 按以下顺序生效:
///
/// 1. 清空被丢弃的属性 (置为空串);
/// 2. 删除属性取值落在排除集合中的记录;
/// 3. 按映射表改写属性取值.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct RecordFilter {
    dropped: BTreeSet<String>,
    excluded: BTreeMap<String, BTreeSet<String>>,
    mapped: BTreeMap<String, BTreeMap<String, String>>,
}

impl RecordFilter {
    /// 只保留选中的病灶类型.
    pub fn lesions(include_masses: bool, include_calcifications: bool) -> Self {
        Self::default().with_lesion_types(include_masses, include_calcifications)
    }

    /// 重新选择保留的病灶类型, 覆盖之前的选择.
    pub fn with_lesion_types(mut self, include_masses: bool, include_calcifications: bool) -> Self {
        let set = self.excluded.entry("lesion_type".to_owned()).or_default();
        for (kind, include) in [
            (label::MASS, include_masses),
            (label::CALCIFICATION, include_calcifications),
        ] {
            if include {
                set.remove(kind);
            } else {
                set.insert(kind.to_owned());
            }
        }
        self
    }

    /// 删除属性取值为 `values` 之一的记录. 可多次调用, 取并集.
    pub fn exclude<I, S>(mut self, attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded
            .entry(attribute.to_owned())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    /// 按映射改写属性取值. 可多次调用, 后者覆盖前者的同名键.
    pub fn map_values<I, K, V>(mut self, attribute: &str, mapping: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.mapped
            .entry(attribute.to_owned())
            .or_default()
            .extend(mapping.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// 丢弃属性: 所有记录中该属性被置为空串.
    pub fn drop_attribute(mut self, attribute: &str) -> Self {
        self.dropped.insert(attribute.to_owned());
        self
    }

    /// 检查所有属性名是否合法.
    fn validate(&self) -> Result<()> {
        let unknown = self
            .dropped
            .iter()
            .chain(self.excluded.keys())
            .chain(self.mapped.keys())
            .find(|a| !RECORD_ATTRIBUTES.contains(&a.as_str()));
        match unknown {
            Some(a) => Err(ConfigurationError::UnknownAttribute(a.clone()).into()),
            None => Ok(()),
        }
    }

    /// 对记录集合生效, 保持剩余记录的相对顺序.
    pub fn apply(&self, records: RecordSet) -> Result<RecordSet> {
        self.validate()?;

        let before = records.len();
        let out: RecordSet = records
            .into_iter()
            .filter_map(|mut r| {
                for a in &self.dropped {
                    r.set(a, String::new());
                }
                let excluded = self.excluded.iter().any(|(a, values)| {
                    r.get(a).map_or(false, |v| values.contains(v))
                });
                if excluded {
                    return None;
                }
                for (a, mapping) in &self.mapped {
                    if let Some(to) = r.get(a).and_then(|v| mapping.get(v)).cloned() {
                        r.set(a, to);
                    }
                }
                Some(r)
            })
            .collect();
        debug!("record filter kept {} of {before} records", out.len());
        Ok(out)
    }
}

/// 从下载目录加载病灶表并过滤.
///
/// 训练表在前, 测试表在后. 两者都不选时返回 [`ConfigurationError::InvalidArgument`].
pub fn load_lesions<P: AsRef<Path>>(
    root: P,
    include_train: bool,
    include_test: bool,
    filter: &RecordFilter,
) -> Result<RecordSet> {
    if !include_train && !include_test {
        return Err(ConfigurationError::InvalidArgument {
            name: "include_sets",
            reason: "at least one of the train/test tables must be selected".to_owned(),
        }
        .into());
    }

    let root = root.as_ref();
    let tables = [
        (include_train, layout::LESIONS_TRAIN_CSV),
        (include_test, layout::LESIONS_TEST_CSV),
    ];
    let mut all = RecordSet::default();
    for (_, name) in tables.iter().filter(|(on, _)| *on) {
        all.records.extend(RecordSet::read_csv(root.join(name))?);
    }
    let out = filter.apply(all)?;
    info!("loaded {} lesions from {}", out.len(), root.display());
    Ok(out)
}
