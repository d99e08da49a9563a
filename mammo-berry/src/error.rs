//! 运行时错误.
//!
//! 几何警告 (patch 大于图像、退化采样窗口) 不是错误, 见 [`crate::geometry::GeometryWarning`];
//! 缓存命中/未命中也不是错误, 见 [`crate::cache::CacheReport`].

use std::path::PathBuf;
use thiserror::Error;

/// 配置错误. 一经发现立即返回, 不做恢复.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// 同时请求了训练模式和测试模式.
    #[error("train mode and test mode are mutually exclusive")]
    ConflictingModes,

    /// 配置了依赖模式的通道流水线, 但尚未设置模式.
    #[error("a mode-dependent image pipeline is configured but no train/test mode is set")]
    ModeNotSet,

    /// 已经选择过 patch 变换.
    #[error("patch transform already selected")]
    PatchAlreadySelected,

    /// 非法参数.
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument {
        /// 参数名.
        name: &'static str,
        /// 原因.
        reason: String,
    },

    /// 无法读取配置文件.
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// 配置文件路径.
        path: PathBuf,
        /// 底层 I/O 错误.
        #[source]
        source: std::io::Error,
    },

    /// 配置文件格式错误或缺少必要字段 (如 `download_path`).
    #[error("malformed config file {path}: {source}")]
    Malformed {
        /// 配置文件路径.
        path: PathBuf,
        /// 底层解析错误.
        #[source]
        source: serde_json::Error,
    },

    /// 无法定位下载目录.
    #[error("download directory cannot be determined (set $DDSM_DOWNLOAD_PATH)")]
    NoDownloadDir,

    /// 标签不在标签表中.
    #[error("label `{0}` is not in the label list")]
    UnknownLabel(String),

    /// 病灶表中不存在该属性.
    #[error("unknown record attribute `{0}`")]
    UnknownAttribute(String),
}

/// 图像解码错误. 直接访问单个样本时原样返回; 批处理时记录并跳过该样本.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// 文件不存在.
    #[error("image file {0} does not exist")]
    Missing(PathBuf),

    /// 文件损坏或格式无法识别.
    #[error("cannot decode {path}: {source}")]
    Corrupt {
        /// 图像路径.
        path: PathBuf,
        /// 底层解码错误.
        #[source]
        source: image::ImageError,
    },

    /// 像素格式不是 8-bit 或 16-bit 整数.
    #[error("unsupported pixel format {color:?} in {path}")]
    UnsupportedPixel {
        /// 图像路径.
        path: PathBuf,
        /// 实际像素格式.
        color: image::ColorType,
    },

    /// 图像与掩码尺寸不一致.
    #[error("mask {mask:?} does not match image {image:?} in {path}")]
    ShapeMismatch {
        /// 掩码路径.
        path: PathBuf,
        /// 图像形状 (高, 宽).
        image: (usize, usize),
        /// 掩码形状 (高, 宽).
        mask: (usize, usize),
    },

    /// 记录没有掩码路径, 但样本源要求加载掩码.
    #[error("record {0} has no mask path")]
    NoMaskPath(usize),

    /// 索引越界.
    #[error("index {index} out of range for {len} records")]
    OutOfRange {
        /// 请求的索引.
        index: usize,
        /// 记录数.
        len: usize,
    },
}

/// 缓存物化或病灶表读写错误.
#[derive(Debug, Error)]
pub enum CacheError {
    /// 文件系统错误.
    #[error("cache I/O error at {path}: {source}")]
    Io {
        /// 出错路径.
        path: PathBuf,
        /// 底层 I/O 错误.
        #[source]
        source: std::io::Error,
    },

    /// 病灶表读写错误.
    #[error("record table error at {path}: {source}")]
    Table {
        /// 表文件路径.
        path: PathBuf,
        /// 底层 csv 错误.
        #[source]
        source: csv::Error,
    },

    /// 记录序列化失败 (计算指纹时).
    #[error("cannot serialize record for fingerprinting: {0}")]
    Fingerprint(#[from] bincode::Error),

    /// 写出 PNG 失败.
    #[error("cannot encode {path}: {source}")]
    Encode {
        /// 目标路径.
        path: PathBuf,
        /// 底层编码错误.
        #[source]
        source: image::ImageError,
    },
}

impl CacheError {
    /// 以路径包装 I/O 错误.
    #[inline]
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// 本 crate 的统一错误.
#[derive(Debug, Error)]
pub enum Error {
    /// 配置错误.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// 解码错误.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// 缓存错误.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// 本 crate 的统一结果类型.
pub type Result<T> = std::result::Result<T, Error>;
