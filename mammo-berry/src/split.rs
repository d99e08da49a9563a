//! 留出法与 k 折划分.
//!
//! 划分出的样本源共享原样本源的下载目录与配置 (`Arc<SourceConfig>`),
//! 训练部分预设为训练模式, 验证部分预设为测试模式.

use crate::error::{ConfigurationError, Result};
use crate::{SampleRng, SampleSource};
use either::Either;
use log::info;
use rand::seq::SliceRandom;
use rand::SeedableRng;

/// 记录的访问顺序: 可选的带种子随机置换.
fn order(n: usize, shuffle: bool, seed: u64) -> impl Iterator<Item = usize> {
    if shuffle {
        let mut v: Vec<usize> = (0..n).collect();
        v.shuffle(&mut SampleRng::seed_from_u64(seed));
        Either::Left(v.into_iter())
    } else {
        Either::Right(0..n)
    }
}

impl SampleSource {
    /// 留出法划分, 返回 `(训练, 验证)`.
    ///
    /// (可选地置换后) 前 `floor(n * fraction)` 条记录作为验证集, 其余作为训练集.
    pub fn split_holdout(&self, fraction: f64, shuffle: bool, seed: u64) -> Result<(Self, Self)> {
        if !(0.0..=1.0).contains(&fraction) {
            return Err(ConfigurationError::InvalidArgument {
                name: "fraction",
                reason: format!("{fraction} is not in [0, 1]"),
            }
            .into());
        }

        let n = self.len();
        let n_val = (n as f64 * fraction).floor() as usize;
        let order: Vec<usize> = order(n, shuffle, seed).collect();
        let (val, train) = order.split_at(n_val);

        info!("holdout split: {} train, {} validation", train.len(), val.len());
        let train = self.with_records(self.records().select(train.iter().copied()));
        let val = self.with_records(self.records().select(val.iter().copied()));
        Ok((train.train_mode(), val.test_mode()))
    }

    /// k 折划分, 返回 `k` 个 `(训练, 验证)`.
    ///
    /// (可选地置换后) 切成 `k` 个连续的折, 每折 `floor(n / k)` 条记录, 余数丢弃.
    /// 第 `i` 对以第 `i` 折为验证集, 其余折按顺序拼接为训练集.
    pub fn split_kfold(&self, k: usize, shuffle: bool, seed: u64) -> Result<Vec<(Self, Self)>> {
        let n = self.len();
        if k < 2 || k > n {
            return Err(ConfigurationError::InvalidArgument {
                name: "k",
                reason: format!("{k} folds cannot be made from {n} records"),
            }
            .into());
        }

        let per_fold = n / k;
        let order: Vec<usize> = order(n, shuffle, seed).take(per_fold * k).collect();
        let folds: Vec<&[usize]> = order.chunks(per_fold).collect();

        info!("{k}-fold split: {per_fold} records per fold, {} dropped", n - per_fold * k);
        let pairs = (0..k)
            .map(|i| {
                let train = folds
                    .iter()
                    .enumerate()
                    .filter(|(j, _)| *j != i)
                    .flat_map(|(_, f)| f.iter().copied());
                let train = self.with_records(self.records().select(train));
                let val = self.with_records(self.records().select(folds[i].iter().copied()));
                (train.train_mode(), val.test_mode())
            })
            .collect();
        Ok(pairs)
    }
}
