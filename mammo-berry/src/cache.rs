//! 基于内容指纹的变换缓存.
//!
//! 指纹覆盖记录集合的每一个字段 (与顺序相关)、记录级流水线中每个变换的描述,
//! 以及是否写出掩码.
//! 缓存目录布局:
//!
//! ```text
//! <下载目录>/cache/<指纹>/
//!     00000.png
//!     00000_mask.png
//!     ...
//!     dataframe.csv
//! ```
//!
//! 改写后的病灶表中, 路径字段相对于缓存目录, 于是缓存目录可以直接作为新的下载目录.
//!
//! # 一致性
//!
//! 物化总是在同级的临时目录中进行, 写完病灶表之后才整体改名为最终目录.
//! 因此读者要么看不到缓存, 要么看到完整的缓存. 病灶表存在即视为命中.

use crate::consts::layout::{image_name, mask_name, CACHE_DIR, CACHE_TABLE};
use crate::error::{CacheError, Error, Result};
use crate::source::mix_seed;
use crate::{Record, RecordSet, RecordTransform, Sample, SampleRng, SampleSource, SourceConfig};
use image::{ImageBuffer, Luma};
use log::{debug, error, info, warn};
use ndarray::Array2;
use rand::SeedableRng;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

cfg_if::cfg_if! {
    if #[cfg(feature = "rayon")] {
        use rayon::iter::{IntoParallelIterator, ParallelIterator};

        /// 借助 `rayon` 并行处理 `0..n`, 结果按索引顺序返回.
        fn for_each_index<T, F>(n: usize, op: F) -> Vec<T>
        where
            T: Send,
            F: Fn(usize) -> T + Send + Sync,
        {
            (0..n).into_par_iter().map(op).collect()
        }
    } else {
        /// 顺序处理 `0..n`.
        fn for_each_index<T, F>(n: usize, op: F) -> Vec<T>
        where
            F: Fn(usize) -> T,
        {
            (0..n).map(op).collect()
        }
    }
}

/// 一次物化的结果报告. 命中与否都不是错误.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CacheReport {
    /// 指纹 (SHA-256 十六进制).
    pub fingerprint: String,
    /// 缓存目录, 即新的下载目录.
    pub dir: PathBuf,
    /// 是否命中.
    pub hit: bool,
    /// 本次写入的样本数. 命中时为 0.
    pub written: usize,
    /// 因错误被排除的样本数. 命中时为 0.
    pub skipped: usize,
}

/// 计算 (记录集合, 记录级流水线, 是否含掩码) 的指纹.
pub fn fingerprint(
    records: &RecordSet,
    pipeline: &[Arc<dyn RecordTransform>],
    masks: bool,
) -> Result<String> {
    let mut hasher = Sha256::new();
    hasher.update((records.len() as u64).to_le_bytes());
    for r in records {
        let bytes = bincode::serialize(r).map_err(CacheError::from)?;
        hasher.update(bytes);
    }
    for t in pipeline {
        hasher.update(t.describe().as_bytes());
        hasher.update([0u8]);
    }
    hasher.update([masks as u8]);
    Ok(hex::encode(hasher.finalize()))
}

/// 指纹对应的缓存目录.
#[inline]
pub fn cache_dir<P: AsRef<Path>>(root: P, fingerprint: &str) -> PathBuf {
    root.as_ref().join(CACHE_DIR).join(fingerprint)
}

/// 把 `[0, 1]` 通道写成 8-bit 灰度 PNG (`value * 255`, 截断到 `[0, 255]`).
fn write_channel(channel: &Array2<f32>, path: &Path) -> std::result::Result<(), CacheError> {
    let (h, w) = channel.dim();
    let img = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
        Luma([(channel[[y as usize, x as usize]] * 255.0).clamp(0.0, 255.0) as u8])
    });
    img.save(path).map_err(|source| CacheError::Encode {
        path: path.to_owned(),
        source,
    })
}

/// 写出样本的通道, 返回改写了路径字段的记录.
fn write_sample(dir: &Path, index: usize, sample: Sample) -> std::result::Result<Record, CacheError> {
    let (channels, mut record) = sample.into_parts();
    if channels.len() > 2 {
        debug!("sample {index}: only the first two of {} channels are cached", channels.len());
    }

    let mut names = [image_name(index), mask_name(index)].into_iter();
    let mut written = Vec::with_capacity(2);
    for (channel, name) in channels.iter().zip(names.by_ref()) {
        write_channel(channel, &dir.join(&name))?;
        written.push(name);
    }

    let mut written = written.into_iter();
    if let Some(image) = written.next() {
        record.image_path = image;
    }
    record.mask_path = written.next();
    Ok(record)
}

/// 删除目录, 目录不存在不算错误.
fn remove_dir_if_exists(dir: &Path) -> std::result::Result<(), CacheError> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(CacheError::io(dir, e)),
        _ => Ok(()),
    }
}

/// 物化中的临时目录. 离开作用域时连同其内容一起删除; 改名成功后已不存在, 删除为空操作.
struct StagingDir(PathBuf);

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Err(e) = remove_dir_if_exists(&self.0) {
            warn!("cannot remove staging directory: {e}");
        }
    }
}

/// 物化样本源的记录级流水线.
///
/// 返回的新样本源以缓存目录为下载目录, 记录级流水线被清空, 通道级流水线、
/// 掩码设置、种子和模式保持不变.
///
/// 未命中时每个样本恰好经过一次记录级流水线, 种子由基础种子和样本索引派生,
/// 因此相同的输入总是物化出相同的缓存. 解码或编码失败的样本被记录、排除并计数.
pub fn materialize(source: &SampleSource) -> Result<(SampleSource, CacheReport)> {
    let config = source.config();
    let fp = fingerprint(source.records(), config.record_pipeline(), config.masks())?;
    let dir = cache_dir(source.root(), &fp);
    let table = dir.join(CACHE_TABLE);

    let rebase = |records: RecordSet| {
        let cached_config = Arc::new(SourceConfig::clone(config).without_record_transforms());
        let out = SampleSource::shared(records, dir.clone(), cached_config);
        match source.mode() {
            Some(crate::Mode::Train) => out.train_mode(),
            Some(crate::Mode::Test) => out.test_mode(),
            None => out,
        }
    };

    if table.is_file() {
        info!("cache hit: {}", dir.display());
        let records = RecordSet::read_csv(&table)?;
        let report = CacheReport {
            fingerprint: fp,
            dir: dir.clone(),
            hit: true,
            written: 0,
            skipped: 0,
        };
        return Ok((rebase(records), report));
    }

    if dir.exists() {
        warn!("removing incomplete cache directory {}", dir.display());
        remove_dir_if_exists(&dir)?;
    }
    let staging = StagingDir(dir.with_file_name(format!("{fp}.tmp-{}", std::process::id())));
    let tmp = staging.0.as_path();
    remove_dir_if_exists(tmp)?;
    fs::create_dir_all(tmp).map_err(|e| CacheError::io(tmp, e))?;

    info!("cache miss: materializing {} samples into {}", source.len(), dir.display());
    let seed = config.seed();
    let outcomes = for_each_index(source.len(), |i| {
        let mut rng = SampleRng::seed_from_u64(mix_seed(seed, i as u64));
        source
            .record_level(i, &mut rng)
            .and_then(|s| write_sample(tmp, i, s).map_err(Error::from))
            .map_err(|e| error!("sample {i} excluded from cache: {e}"))
            .ok()
    });

    let total = outcomes.len();
    let records: RecordSet = outcomes.into_iter().flatten().collect();
    let skipped = total - records.len();
    records.write_csv(tmp.join(CACHE_TABLE))?;

    if let Err(e) = fs::rename(tmp, &dir) {
        // 另一个写者已经完成了同一个指纹.
        if !table.is_file() {
            return Err(CacheError::io(&dir, e).into());
        }
        warn!("cache {} was completed concurrently; discarding this copy", dir.display());
        let records = RecordSet::read_csv(&table)?;
        let report = CacheReport {
            fingerprint: fp,
            dir: dir.clone(),
            hit: true,
            written: 0,
            skipped: 0,
        };
        return Ok((rebase(records), report));
    }

    info!("cache written: {} samples, {skipped} skipped", records.len());
    let report = CacheReport {
        fingerprint: fp,
        dir: dir.clone(),
        hit: false,
        written: records.len(),
        skipped,
    };
    Ok((rebase(records), report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PatchStrategy;
    use crate::source::tests::{fixture, Probe};
    use crate::Mode;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 统计被调用的次数, 原样返回样本.
    #[derive(Debug, Default)]
    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl RecordTransform for Counting {
        fn apply(&self, sample: Sample, _rng: &mut SampleRng) -> Sample {
            self.calls.fetch_add(1, Ordering::SeqCst);
            sample
        }

        fn describe(&self) -> String {
            "Counting".to_owned()
        }
    }

    fn counting_source(dir: &Path, n: usize) -> (SampleSource, Arc<AtomicUsize>) {
        let records = fixture(dir, n);
        let counting = Counting::default();
        let calls = Arc::clone(&counting.calls);
        let config = SourceConfig::new()
            .with_masks(true)
            .with_record_transform(counting)
            .with_record_transform(PatchStrategy::centered((64, 48)).unwrap());
        (SampleSource::new(records, dir, config), calls)
    }

    #[test]
    fn test_materialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (source, calls) = counting_source(dir.path(), 4);

        let (first, report) = materialize(&source).unwrap();
        assert!(!report.hit);
        assert_eq!((report.written, report.skipped), (4, 0));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        let table = report.dir.join(CACHE_TABLE);
        let bytes = fs::read(&table).unwrap();

        let (second, again) = materialize(&source).unwrap();
        assert!(again.hit);
        assert_eq!(again.fingerprint, report.fingerprint);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(fs::read(&table).unwrap(), bytes);
        assert_eq!(first.records(), second.records());
    }

    #[test]
    fn test_cached_source_serves_patches() {
        let dir = tempfile::tempdir().unwrap();
        let (source, _) = counting_source(dir.path(), 2);
        let (cached, report) = materialize(&source).unwrap();

        assert_eq!(cached.root(), report.dir.as_path());
        assert!(cached.config().record_pipeline().is_empty());
        let r = cached.records().get(1).unwrap();
        assert_eq!(r.image_path, "00001.png");
        assert_eq!(r.mask_path.as_deref(), Some("00001_mask.png"));
        assert_eq!(r.patient_id, "P_001");

        let s = cached.get(1).unwrap();
        assert_eq!(s.channels.len(), 2);
        assert_eq!(s.channels[0].dim(), (48, 64));
        assert!(s.channels[1].iter().all(|&v| v == 0.0 || v == 1.0));
        // 中心 (150, 100) 的 patch 完全落在病灶盒内.
        assert!(s.channels[1].iter().all(|&v| v == 1.0));
    }

    #[test]
    fn test_failed_samples_are_skipped() {
        let _ = simple_logger::init_with_level(log::Level::Debug);
        let dir = tempfile::tempdir().unwrap();
        let (source, _) = counting_source(dir.path(), 3);
        fs::remove_file(dir.path().join(&source.records().get(1).unwrap().image_path)).unwrap();

        let (cached, report) = materialize(&source).unwrap();
        assert_eq!((report.written, report.skipped), (2, 1));
        let names: Vec<_> = cached.records().iter().map(|r| r.image_path.as_str()).collect();
        assert_eq!(names, ["00000.png", "00002.png"]);
        assert!(!report.dir.join("00001.png").exists());
    }

    #[test]
    fn test_fingerprint_sensitivity() {
        let dir = tempfile::tempdir().unwrap();
        let records = fixture(dir.path(), 3);
        let a: Vec<Arc<dyn RecordTransform>> = vec![Arc::new(PatchStrategy::centered((64, 64)).unwrap())];
        let b: Vec<Arc<dyn RecordTransform>> = vec![Arc::new(PatchStrategy::centered((32, 64)).unwrap())];

        let base = fingerprint(&records, &a, true).unwrap();
        assert_eq!(base.len(), 64);
        assert_eq!(base, fingerprint(&records, &a, true).unwrap());
        assert_ne!(base, fingerprint(&records, &b, true).unwrap());
        assert_ne!(base, fingerprint(&records, &[], true).unwrap());
        assert_ne!(base, fingerprint(&records, &a, false).unwrap());

        let reversed: RecordSet = records.select((0..3).rev());
        assert_ne!(base, fingerprint(&reversed, &a, true).unwrap());
    }

    #[test]
    fn test_stale_directory_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let (source, calls) = counting_source(dir.path(), 2);
        let fp = fingerprint(source.records(), source.config().record_pipeline(), true).unwrap();
        let stale = cache_dir(dir.path(), &fp);
        fs::create_dir_all(&stale).unwrap();
        fs::write(stale.join("00000.png"), b"partial").unwrap();

        let (_, report) = materialize(&source).unwrap();
        assert!(!report.hit);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(report.dir.join(CACHE_TABLE).is_file());

        // 不残留临时目录.
        let leftovers = fs::read_dir(dir.path().join(CACHE_DIR)).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn test_mask_setting_selects_its_own_cache() {
        let dir = tempfile::tempdir().unwrap();
        let records = fixture(dir.path(), 2);
        let patch = || PatchStrategy::centered((64, 48)).unwrap();
        let bare = SourceConfig::new().with_record_transform(patch());
        let masked = SourceConfig::new().with_masks(true).with_record_transform(patch());

        let (plain, first) = materialize(&SampleSource::new(records.clone(), dir.path(), bare)).unwrap();
        assert!(!first.hit);
        assert!(plain.records().iter().all(|r| r.mask_path.is_none()));
        assert_eq!(plain.get(0).unwrap().channels.len(), 1);

        let (cached, second) = materialize(&SampleSource::new(records, dir.path(), masked)).unwrap();
        assert!(!second.hit);
        assert_ne!(second.fingerprint, first.fingerprint);
        let s = cached.get(0).unwrap();
        assert_eq!(s.channels.len(), 2);
        assert_eq!(s.channels[1].dim(), (48, 64));
    }

    /// 在每个临时目录中抢先建立与病灶表同名的目录, 使写表失败.
    #[derive(Debug)]
    struct BlockTable {
        cache: PathBuf,
    }

    impl RecordTransform for BlockTable {
        fn apply(&self, sample: Sample, _rng: &mut SampleRng) -> Sample {
            for entry in fs::read_dir(&self.cache).unwrap() {
                let path = entry.unwrap().path();
                if path.to_string_lossy().contains(".tmp-") {
                    fs::create_dir_all(path.join(CACHE_TABLE)).unwrap();
                }
            }
            sample
        }

        fn describe(&self) -> String {
            "BlockTable".to_owned()
        }
    }

    #[test]
    fn test_failed_build_leaves_no_staging_dir() {
        let dir = tempfile::tempdir().unwrap();
        let records = fixture(dir.path(), 2);
        let cache = dir.path().join(CACHE_DIR);
        let config = SourceConfig::new().with_record_transform(BlockTable { cache: cache.clone() });
        let source = SampleSource::new(records, dir.path(), config);

        assert!(materialize(&source).is_err());
        assert_eq!(fs::read_dir(&cache).unwrap().count(), 0);
    }

    #[test]
    fn test_mode_and_channel_pipelines_survive() {
        let dir = tempfile::tempdir().unwrap();
        let records = fixture(dir.path(), 1);
        let probe = Probe::default();
        let seen = Arc::clone(&probe.seen);
        let config = SourceConfig::new()
            .with_record_transform(PatchStrategy::centered((32, 32)).unwrap())
            .with_train_transform(probe);
        let source = SampleSource::new(records, dir.path(), config).train_mode();

        let (cached, _) = materialize(&source).unwrap();
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(cached.mode(), Some(Mode::Train));
        cached.get(0).unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
