//! 物化结果.

use mammo_berry::cache::CacheReport;
use mammo_berry::dataset::{DatasetSplits, Splits};
use std::io::{self, Write};

/// 将缓存报告写进 `w` 中.
fn describe_into<W: Write>(r: &CacheReport, w: &mut W) -> io::Result<()> {
    const S4: &str = "    ";

    writeln!(w, "Cache `{}`:", r.fingerprint)?;
    writeln!(w, "{S4}Directory: {}", r.dir.display())?;
    writeln!(w, "{S4}Hit: {}", r.hit)?;
    writeln!(w, "{S4}Written samples: {}", r.written)?;
    write!(w, "{S4}Skipped samples: {}", r.skipped)?;
    Ok(())
}

/// 一次物化的最终结果.
pub struct MaterializeResult {
    counts: Vec<(&'static str, Vec<(String, usize)>)>,
    samples: usize,
    report: Option<CacheReport>,
}

impl MaterializeResult {
    pub fn new(
        counts: Vec<(&'static str, Vec<(String, usize)>)>,
        splits: DatasetSplits,
        report: Option<CacheReport>,
    ) -> Self {
        let samples = match &splits {
            Splits::Single(s) => s.len(),
            Splits::Holdout { train, val } => train.len() + val.len(),
            Splits::KFold(pairs) => pairs.first().map_or(0, |(t, v)| t.len() + v.len()),
        };
        Self {
            counts,
            samples,
            report,
        }
    }

    /// 输出运行结果.
    pub fn analyze(&self) {
        utils::sep();
        for (attribute, counts) in &self.counts {
            println!("{attribute}:");
            for (value, n) in counts {
                println!("    {value:<32}{n}");
            }
            utils::sep();
        }

        println!("Samples ready: {}", self.samples);
        if let Some(r) = &self.report {
            let mut buf = Vec::with_capacity(512);
            if describe_into(r, &mut buf).is_ok() {
                println!("{}", String::from_utf8_lossy(&buf));
            }
        }
        utils::sep();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_describe_into() {
        let r = CacheReport {
            fingerprint: "ab12".to_owned(),
            dir: PathBuf::from("/data/cache/ab12"),
            hit: false,
            written: 3,
            skipped: 1,
        };
        let mut buf = Vec::new();
        describe_into(&r, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("Cache `ab12`:"));
        assert!(text.ends_with("Skipped samples: 1"));
    }
}
