#![warn(missing_docs)] // <= 合适时移除它.
// #![warn(clippy::missing_docs_in_private_items)]  // <= too strict.

//! 核心库. 为 CBIS-DDSM 组织形式的乳腺钼靶数据提供病灶 patch 采样、
//! 多通道同步增强和基于内容指纹的变换缓存.
//!
//! 该 crate 只负责产出可以直接消费的样本, 不训练也不评估任何模型.
//!
//! # 注意
//!
//! 1. 原始数据的下载、DICOM 到 PNG 的转换都不在本 crate 的范围内.
//!   下载目录中需要已经存在 `lesions_train.csv` / `lesions_test.csv` 以及其引用的 PNG 文件.
//! 2. 图像形状沿用 `ndarray` 的 `(高, 宽)` 约定, 而病灶表中的坐标与 patch 尺寸沿用
//!   `(x, y)` / `(宽, 高)` 约定. 两者之间的转换只发生在 [`geometry`] 中.
//! 3. 不存在进程级的随机数生成器. 每次取样都会派生自己的种子, 见 [`source`].
//!
//! # 开发计划
//!
//! ### patch 放置窗口求解 ✅
//!
//! 给定区域、图像尺寸和重叠约束, 求 patch 左上角的合法取值窗口.
//!
//! 实现位于 `mammo-berry/src/geometry.rs`.
//!
//! ### 居中 / 随机重叠 / 正常组织 patch ✅
//!
//! 实现位于 `mammo-berry/src/patch.rs`.
//!
//! ### 训练 / 测试模式下的多通道同步增强 ✅
//!
//! 同一个样本的图像和掩码必须拿到完全相同的随机参数.
//!
//! 实现位于 `mammo-berry/src/source.rs` 与 `mammo-berry/src/augment.rs`.
//!
//! ### 留出法与 k 折划分 ✅
//!
//! 实现位于 `mammo-berry/src/split.rs`.
//!
//! ### 变换缓存 ✅
//!
//! 以 (病灶表, 变换序列) 的指纹为键, 将 patch 结果物化到磁盘.
//!
//! 实现位于 `mammo-berry/src/cache.rs`.
//!
//! ### 数据集工厂与分类标签 ✅
//!
//! 实现位于 `mammo-berry/src/dataset.rs`.
//!
//! ### 其他归一化方案 ⌛️
//!
//! 目前 16-bit 图像一律除以 65535. 按窗宽窗位归一化尚未实现.

/// 二维索引, 同时也可一定程度上用作非负整数向量. 语义为 `(高, 宽)`.
pub type Idx2d = (usize, usize);

/// 所有随机操作使用的生成器. 种子相同则输出序列相同, 与平台无关.
pub type SampleRng = rand_chacha::ChaCha8Rng;

pub mod consts;
pub mod error;
pub mod geometry;

mod record;

pub use record::{load_lesions, RecordFilter, RecordSet};
pub use record::{Record, RECORD_ATTRIBUTES};

pub mod sample;

pub use sample::{Provenance, RecordTransform, Sample};

pub mod augment;
pub mod patch;

pub mod source;

pub use source::{Mode, SampleIter, SampleSource, SourceConfig};

pub mod cache;
pub mod config;
pub mod dataset;
pub mod split;

pub use error::{CacheError, ConfigurationError, DecodeError, Error, Result};

pub mod prelude;
