//! 数据集配置.

use crate::error::{ConfigurationError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 指定下载目录的环境变量.
pub const DOWNLOAD_PATH_ENV: &str = "DDSM_DOWNLOAD_PATH";

/// 获取 `{用户主目录}/dataset` 目录.
pub fn home_dataset_dir() -> Option<PathBuf> {
    let mut ans = dirs::home_dir()?;
    ans.push("dataset");
    Some(ans)
}

/// 获取 `{用户主目录}/dataset` 目录下给定继续项组成的全路径.
pub fn home_dataset_dir_with<P: AsRef<Path>, I: IntoIterator<Item = P>>(it: I) -> Option<PathBuf> {
    let mut ans = home_dataset_dir()?;
    ans.extend(it);
    Some(ans)
}

/// `config.json` 的内容.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// 下载目录, 病灶表与图像都在其下.
    pub download_path: PathBuf,
}

impl DatasetConfig {
    /// 直接指定下载目录.
    #[inline]
    pub fn new<P: Into<PathBuf>>(download_path: P) -> Self {
        Self {
            download_path: download_path.into(),
        }
    }

    /// 读取 JSON 配置文件. 缺少 `download_path` 时返回 [`ConfigurationError::Malformed`].
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_owned(),
            source,
        })?;
        let config = serde_json::from_str(&text).map_err(|source| ConfigurationError::Malformed {
            path: path.to_owned(),
            source,
        })?;
        Ok(config)
    }

    /// 依次尝试环境变量 `$DDSM_DOWNLOAD_PATH` 和 `~/dataset/CBIS-DDSM`.
    pub fn from_env_or_home() -> Result<Self> {
        if let Some(p) = std::env::var_os(DOWNLOAD_PATH_ENV).filter(|p| !p.is_empty()) {
            return Ok(Self::new(p));
        }
        home_dataset_dir_with(["CBIS-DDSM"])
            .map(Self::new)
            .ok_or_else(|| ConfigurationError::NoDownloadDir.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"download_path": "/data/ddsm", "extra": 1}"#).unwrap();
        assert_eq!(
            DatasetConfig::from_json_file(&path).unwrap(),
            DatasetConfig::new("/data/ddsm")
        );
    }

    #[test]
    fn test_missing_key_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"downloads": "/data"}"#).unwrap();
        assert!(matches!(
            DatasetConfig::from_json_file(&path),
            Err(Error::Configuration(ConfigurationError::Malformed { .. }))
        ));
        assert!(matches!(
            DatasetConfig::from_json_file(dir.path().join("nope.json")),
            Err(Error::Configuration(ConfigurationError::Read { .. }))
        ));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var(DOWNLOAD_PATH_ENV, "/tmp/ddsm-from-env");
        let c = DatasetConfig::from_env_or_home().unwrap();
        std::env::remove_var(DOWNLOAD_PATH_ENV);
        assert_eq!(c.download_path, PathBuf::from("/tmp/ddsm-from-env"));
    }
}
