//! 对 `mammo-berry::dataset` 的更一层封装. 提供更直接的数据集加载方式.

use mammo_berry::config::{DatasetConfig, DOWNLOAD_PATH_ENV};
use mammo_berry::dataset::DatasetFactory;
use std::path::{Path, PathBuf};

/// 获取 CBIS-DDSM 下载目录.
///
/// 1. 若给出了 `config.json` 路径, 则读取其中的 `download_path`;
/// 2. 否则若环境变量 `$DDSM_DOWNLOAD_PATH` 非空, 则返回其值;
/// 3. 否则, 返回 `$HOME/dataset/CBIS-DDSM`.
pub fn download_dir<P: AsRef<Path>>(config: Option<P>) -> mammo_berry::Result<PathBuf> {
    let config = match config {
        Some(p) => DatasetConfig::from_json_file(p)?,
        None => DatasetConfig::from_env_or_home()?,
    };
    Ok(config.download_path)
}

/// 从 `$DDSM_DOWNLOAD_PATH` 或者 `$HOME/dataset/CBIS-DDSM` 获取下载目录.
#[inline]
pub fn download_dir_from_env_or_home() -> mammo_berry::Result<PathBuf> {
    download_dir(None::<&Path>)
}

/// 以下载目录新建默认的数据集工厂.
pub fn factory<P: AsRef<Path>>(config: Option<P>) -> mammo_berry::Result<DatasetFactory> {
    let dir = download_dir(config)?;
    log::info!("download directory: {} (override with ${DOWNLOAD_PATH_ENV})", dir.display());
    Ok(DatasetFactory::at(dir))
}
