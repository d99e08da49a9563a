//! 物化 CBIS-DDSM 病灶 patch 缓存.
//!
//! 用法: `materialize [config.json]`.
//!
//! 未给出配置文件时, 从 `$DDSM_DOWNLOAD_PATH` 或 `$HOME/dataset/CBIS-DDSM` 定位下载目录.
//! 可用环境变量:
//!
//! - `PATCH_SIZE`: patch 边长, 默认 1024;
//! - `NORMAL_PROBABILITY`: 正常组织 patch 的概率, 默认 0;
//! - `SEED`: 基础种子, 默认 0.

mod result;
mod runner;

fn main() {
    simple_logger::init_with_level(log::Level::Info).expect("logger already initialized");

    let config = std::env::args_os().nth(1);
    match runner::run(config) {
        Ok(r) => r.analyze(),
        Err(e) => {
            log::error!("{e}");
            std::process::exit(1);
        }
    }
}
