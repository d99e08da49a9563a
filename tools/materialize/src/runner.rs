//! 程序运行函数.

use crate::result::MaterializeResult;
use mammo_berry::consts::{DEFAULT_MIN_OVERLAP, DEFAULT_PATCH_SIZE};
use mammo_berry::error::ConfigurationError;
use std::ffi::OsString;
use std::str::FromStr;
use utils::loader;

/// 读取环境变量, 不存在时取默认值.
fn env_or<T: FromStr>(name: &'static str, default: T) -> mammo_berry::Result<T> {
    match std::env::var(name) {
        Ok(v) => v.parse().map_err(|_| {
            ConfigurationError::InvalidArgument {
                name,
                reason: format!("cannot parse `{v}`"),
            }
            .into()
        }),
        Err(_) => Ok(default),
    }
}

/// 实际运行.
pub fn run(config: Option<OsString>) -> mammo_berry::Result<MaterializeResult> {
    let side = env_or("PATCH_SIZE", DEFAULT_PATCH_SIZE.0)?;
    let normal_probability = env_or("NORMAL_PROBABILITY", 0.0)?;
    let seed = env_or("SEED", 0u64)?;

    let factory = loader::factory(config)?
        .include_sets(true, true)
        .lesion_types(true, true)
        .masks(true)
        .seed(seed)
        .lesion_patches_random((side, side), DEFAULT_MIN_OVERLAP, normal_probability)?
        .cache_here();

    let counts = factory.show_counts()?;

    log::info!("Materializing {side}x{side} patches on {} cpus...", utils::cpus());
    let (splits, report) = factory.build_with_report()?;
    Ok(MaterializeResult::new(counts, splits, report))
}
