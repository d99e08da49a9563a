//! 几何求解: 计算 patch 的合法放置窗口.
//!
//! 所有函数都是纯函数, 不做 I/O. 坐标约定与 `ndarray` 一致: 图像形状为 `(高, 宽)`,
//! 而 patch 尺寸沿用病灶表的 `(宽, 高)` 约定. 水平方向记为 x, 垂直方向记为 y.
//!
//! # 宽松策略
//!
//! 图像过小时求解器 **总是** 返回一个窗口而不是报错: 退化的窗口会收缩成单点,
//! 大于图像的 patch 会得到比请求尺寸更小的裁剪框. 两种情况都会通过
//! `log::warn!` 报告; [`solve_window`] 则把它们作为 [`GeometryWarning`] 返回.

use crate::Idx2d;
use log::warn;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 轴对齐包围盒, 端点均为闭区间.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BoundingBox {
    /// 最小 x.
    pub min_x: u32,
    /// 最大 x.
    pub max_x: u32,
    /// 最小 y.
    pub min_y: u32,
    /// 最大 y.
    pub max_y: u32,
}

impl BoundingBox {
    /// 构建包围盒. 若 `min > max` 则返回 `None`.
    pub fn new(min_x: u32, max_x: u32, min_y: u32, max_y: u32) -> Option<Self> {
        (min_x <= max_x && min_y <= max_y).then_some(Self {
            min_x,
            max_x,
            min_y,
            max_y,
        })
    }

    /// 中心 `(x, y)`.
    #[inline]
    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x as f64 + self.max_x as f64) / 2.0,
            (self.min_y as f64 + self.max_y as f64) / 2.0,
        )
    }

    /// 半宽与半高 `(x, y)`.
    #[inline]
    pub fn half_extent(&self) -> (f64, f64) {
        (
            (self.max_x - self.min_x) as f64 / 2.0,
            (self.max_y - self.min_y) as f64 / 2.0,
        )
    }
}

/// patch 左上角坐标的合法取值窗口. 四个端点都是闭区间, 且 `min <= max`.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PatchWindow {
    /// 左上角 x 的最小值.
    pub min_x: usize,
    /// 左上角 x 的最大值.
    pub max_x: usize,
    /// 左上角 y 的最小值.
    pub min_y: usize,
    /// 左上角 y 的最大值.
    pub max_y: usize,
}

impl PatchWindow {
    /// 左上角 `(x, y)` 是否落在窗口内.
    #[inline]
    pub fn contains(&self, x: usize, y: usize) -> bool {
        (self.min_x..=self.max_x).contains(&x) && (self.min_y..=self.max_y).contains(&y)
    }

    /// 窗口是否只剩下一个点.
    #[inline]
    pub fn is_single_point(&self) -> bool {
        self.min_x == self.max_x && self.min_y == self.max_y
    }
}

/// 裁剪框: 左上角 `(x, y)` 与尺寸.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Crop {
    /// 左上角 x.
    pub x: usize,
    /// 左上角 y.
    pub y: usize,
    /// 宽.
    pub width: usize,
    /// 高.
    pub height: usize,
}

impl Crop {
    /// 以左上角和 patch 尺寸 `(宽, 高)` 构建.
    #[inline]
    pub fn at((x, y): (usize, usize), (width, height): (usize, usize)) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// 按裁剪框截取通道. 超出图像的部分被截掉, 因此结果可能比裁剪框小.
    pub fn apply(&self, channel: &Array2<f32>) -> Array2<f32> {
        let (h, w) = channel.dim();
        let y1 = (self.y + self.height).min(h);
        let x1 = (self.x + self.width).min(w);
        let y0 = self.y.min(y1);
        let x0 = self.x.min(x1);
        channel.slice(s![y0..y1, x0..x1]).to_owned()
    }
}

/// 几何警告. 不中断处理, 求解器照常返回尽力而为的窗口.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum GeometryWarning {
    /// patch 在某个轴上比图像长, 裁剪结果会比请求的小.
    #[error(
        "patch {axis}-dimension {patch} exceeds image {axis}-dimension {extent}; \
         the patch will be cropped to the image"
    )]
    PatchExceedsImage {
        /// `"x"` 或 `"y"`.
        axis: &'static str,
        /// patch 在该轴的长度.
        patch: usize,
        /// 图像在该轴的长度.
        extent: usize,
    },

    /// 夹取后上界小于下界, 窗口收缩成单点.
    #[error("degenerate {axis} sampling window [{lower}, {upper}] collapsed to {point}")]
    DegenerateWindow {
        /// `"x"` 或 `"y"`.
        axis: &'static str,
        /// 夹取前的下界.
        lower: i64,
        /// 夹取前的上界.
        upper: i64,
        /// 收缩后的单点.
        point: usize,
    },
}

/// 在一个轴上求左上角坐标的合法区间.
///
/// `center`, `half` 是区域在该轴上的中心与半长, `extent` 是图像在该轴的长度,
/// `patch` 是 patch 在该轴的长度.
fn axis_interval(
    axis: &'static str,
    center: f64,
    half: f64,
    extent: usize,
    patch: usize,
    min_overlap: f64,
    warnings: &mut Vec<GeometryWarning>,
) -> (usize, usize) {
    let patch_f = patch as f64;
    let (max_dim, min_dim) = (half.max(patch_f), half.min(patch_f));

    // 重叠量取整时向区间内收, 保证端点处的重叠不小于 `min_overlap * min_dim`.
    let lower = (center - max_dim + min_overlap * min_dim).ceil() as i64;
    let upper = (center + half - min_overlap * min_dim).floor() as i64;

    if patch > extent {
        warnings.push(GeometryWarning::PatchExceedsImage { axis, patch, extent });
    }
    let limit = (extent as i64 - patch as i64 - 1).max(0);
    let lo = lower.max(0);
    let hi = upper.min(limit);
    if hi < lo {
        // 上界被强制等于下界; 下界同时不能越过 `limit`, 否则 patch 会伸出图像.
        let point = lo.min(limit) as usize;
        warnings.push(GeometryWarning::DegenerateWindow {
            axis,
            lower,
            upper,
            point,
        });
        return (point, point);
    }
    (lo as usize, hi as usize)
}

/// 同 [`find_window`], 但不写日志, 而是把几何警告连同窗口一起返回.
pub fn solve_window(
    center_x: f64,
    center_y: f64,
    half_width: f64,
    half_height: f64,
    extent: Idx2d,
    patch_size: (usize, usize),
    min_overlap: f64,
) -> (PatchWindow, Vec<GeometryWarning>) {
    let (height, width) = extent;
    let (patch_w, patch_h) = patch_size;
    let mut warnings = Vec::new();
    let (min_x, max_x) =
        axis_interval("x", center_x, half_width, width, patch_w, min_overlap, &mut warnings);
    let (min_y, max_y) =
        axis_interval("y", center_y, half_height, height, patch_h, min_overlap, &mut warnings);
    let window = PatchWindow {
        min_x,
        max_x,
        min_y,
        max_y,
    };
    (window, warnings)
}

/// 求 patch 左上角的合法放置窗口.
///
/// 区域由中心 `(center_x, center_y)` 与半宽/半高描述, `extent` 是图像形状
/// `(高, 宽)`, `patch_size` 是 `(宽, 高)`. 窗口内任意一点作为左上角时,
/// patch 在每个轴上与区域的重叠都不少于 `min_overlap * min(区域半长, patch 边长)`.
///
/// 区间随后被夹到 `[0, extent - patch - 1]`; 夹取后若上界小于下界,
/// 则上界被强制等于下界 (单点窗口). 每个 [`GeometryWarning`] 都以 `warn!` 记录.
pub fn find_window(
    center_x: f64,
    center_y: f64,
    half_width: f64,
    half_height: f64,
    extent: Idx2d,
    patch_size: (usize, usize),
    min_overlap: f64,
) -> PatchWindow {
    let (window, warnings) = solve_window(
        center_x,
        center_y,
        half_width,
        half_height,
        extent,
        patch_size,
        min_overlap,
    );
    for w in &warnings {
        warn!("{w}");
    }
    window
}

/// 对包围盒求放置窗口. 见 [`find_window`].
#[inline]
pub fn find_window_for(
    region: &BoundingBox,
    extent: Idx2d,
    patch_size: (usize, usize),
    min_overlap: f64,
) -> PatchWindow {
    let (cx, cy) = region.center();
    let (hw, hh) = region.half_extent();
    find_window(cx, cy, hw, hh, extent, patch_size, min_overlap)
}

/// 将半开区间 `[naive_min, naive_max)` 平移进 `[0, extent)`.
///
/// 一侧越界时, 区间整体向图像内部平移: 左侧越界向右移, 右侧越界向左移,
/// 长度保持不变. 区间长度大于 `extent` 时无法平移, 返回整个 `[0, extent)`
/// (结果比请求的短) 并记录警告.
pub fn slide_into(axis: &'static str, naive_min: i64, naive_max: i64, extent: usize) -> (usize, usize) {
    debug_assert!(naive_min <= naive_max);
    let span = naive_max - naive_min;
    let extent_i = extent as i64;
    if span > extent_i {
        warn!(
            "patch size {span} bigger than image {axis}-dimension {extent}; \
             please select a smaller patch size"
        );
        return (0, extent);
    }
    if naive_min < 0 {
        (0, span as usize)
    } else if naive_max > extent_i {
        ((extent_i - span) as usize, extent)
    } else {
        (naive_min as usize, naive_max as usize)
    }
}

/// 以 `(center_x, center_y)` 为中心、尺寸为 `patch_size` `(宽, 高)` 的裁剪框,
/// 平移进形状为 `extent` `(高, 宽)` 的图像. 见 [`slide_into`].
pub fn centered_crop((center_x, center_y): (f64, f64), extent: Idx2d, patch_size: (usize, usize)) -> Crop {
    let (height, width) = extent;
    let (patch_w, patch_h) = patch_size;

    let naive_x = (center_x - patch_w as f64 / 2.0) as i64;
    let naive_y = (center_y - patch_h as f64 / 2.0) as i64;
    let (x0, x1) = slide_into("x", naive_x, naive_x + patch_w as i64, width);
    let (y0, y1) = slide_into("y", naive_y, naive_y + patch_h as i64, height);
    Crop {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lesion() -> BoundingBox {
        BoundingBox::new(100, 200, 50, 150).unwrap()
    }

    /// patch `[x, x + patch)` 与闭区间 `[lo, hi]` 的重叠长度.
    fn overlap(x: usize, patch: usize, lo: u32, hi: u32) -> f64 {
        let start = (x as f64).max(lo as f64);
        let end = ((x + patch) as f64).min(hi as f64);
        (end - start).max(0.0)
    }

    #[test]
    fn test_bounding_box_invalid() {
        assert!(BoundingBox::new(5, 4, 0, 0).is_none());
        assert!(BoundingBox::new(0, 0, 3, 2).is_none());
        assert_eq!(lesion().center(), (150.0, 100.0));
        assert_eq!(lesion().half_extent(), (50.0, 50.0));
    }

    #[test]
    fn test_window_scenario_1024() {
        let w = find_window_for(&lesion(), (1024, 1024), (256, 256), 0.9);
        // 150 - 256 + 45 < 0, 夹到 0; 150 + 50 - 45 = 155.
        assert_eq!((w.min_x, w.max_x), (0, 155));
        assert_eq!((w.min_y, w.max_y), (0, 105));
        for x in [w.min_x, w.max_x] {
            for y in [w.min_y, w.max_y] {
                let c = Crop::at((x, y), (256, 256));
                let img = Array2::<f32>::zeros((1024, 1024));
                assert_eq!(c.apply(&img).dim(), (256, 256));
            }
        }
    }

    #[test]
    fn test_window_inside_image() {
        let extent = (800, 600);
        for (cx, cy) in [(0u32, 0u32), (300, 400), (599, 799), (590, 10)] {
            let b = BoundingBox::new(cx.saturating_sub(20), cx, cy.saturating_sub(30), cy).unwrap();
            for patch in [(64, 64), (128, 256), (500, 700)] {
                let w = find_window_for(&b, extent, patch, 0.5);
                assert!(w.min_x <= w.max_x && w.min_y <= w.max_y);
                assert!(w.max_x + patch.0 < extent.1);
                assert!(w.max_y + patch.1 < extent.0);
            }
        }
    }

    #[test]
    fn test_window_overlap_guarantee() {
        let b = BoundingBox::new(400, 520, 300, 330).unwrap();
        let (hw, hh) = b.half_extent();
        for (patch, o) in [((256, 256), 0.9), ((32, 16), 0.5), ((100, 10), 1.0)] {
            let w = find_window_for(&b, (2048, 2048), patch, o);
            for x in [w.min_x, (w.min_x + w.max_x) / 2, w.max_x] {
                let need = o * hw.min(patch.0 as f64);
                assert!(overlap(x, patch.0, b.min_x, b.max_x) + 1e-9 >= need);
            }
            for y in [w.min_y, (w.min_y + w.max_y) / 2, w.max_y] {
                let need = o * hh.min(patch.1 as f64);
                assert!(overlap(y, patch.1, b.min_y, b.max_y) + 1e-9 >= need);
            }
        }
    }

    #[test]
    fn test_window_oversized_patch_is_single_point() {
        let w = find_window_for(&lesion(), (300, 300), (512, 512), 0.9);
        assert!(w.is_single_point());
        assert_eq!((w.min_x, w.min_y), (0, 0));
        let img = Array2::<f32>::zeros((300, 300));
        assert_eq!(Crop::at((0, 0), (512, 512)).apply(&img).dim(), (300, 300));
    }

    #[test]
    fn test_geometry_warnings_reported() {
        let (cx, cy) = lesion().center();
        let (hw, hh) = lesion().half_extent();

        let (_, quiet) = solve_window(cx, cy, hw, hh, (1024, 1024), (256, 256), 0.9);
        assert!(quiet.is_empty());

        let (w, oversized) = solve_window(cx, cy, hw, hh, (300, 300), (512, 512), 0.9);
        assert_eq!(w, find_window_for(&lesion(), (300, 300), (512, 512), 0.9));
        assert_eq!(
            oversized,
            [
                GeometryWarning::PatchExceedsImage {
                    axis: "x",
                    patch: 512,
                    extent: 300
                },
                GeometryWarning::PatchExceedsImage {
                    axis: "y",
                    patch: 512,
                    extent: 300
                },
            ]
        );

        // 950 - 256 + 45 = 739 > 512 - 256 - 1.
        let (w, degenerate) = solve_window(950.0, 150.0, 50.0, 50.0, (512, 512), (256, 256), 0.9);
        assert_eq!((w.min_x, w.max_x), (255, 255));
        assert_eq!(
            degenerate,
            [GeometryWarning::DegenerateWindow {
                axis: "x",
                lower: 739,
                upper: 955,
                point: 255
            }]
        );
        assert_eq!(
            degenerate[0].to_string(),
            "degenerate x sampling window [739, 955] collapsed to 255"
        );
    }

    #[test]
    fn test_window_near_border() {
        let b = BoundingBox::new(990, 1000, 990, 1000).unwrap();
        let w = find_window_for(&b, (1024, 1024), (256, 256), 0.9);
        assert_eq!((w.min_x, w.max_x), (744, 767));
        assert!(w.max_y + 256 < 1024);
    }

    #[test]
    fn test_window_degenerate_collapses_inside_image() {
        // 过期记录: 病灶位于图像之外, 下界超过上限.
        let b = BoundingBox::new(900, 1000, 100, 200).unwrap();
        let w = find_window_for(&b, (512, 512), (256, 256), 0.9);
        assert_eq!((w.min_x, w.max_x), (255, 255));
        assert!(w.min_y <= w.max_y);
    }

    #[test]
    fn test_slide_into() {
        assert_eq!(slide_into("x", 10, 20, 100), (10, 20));
        // 左侧越界: 向右移.
        assert_eq!(slide_into("x", -5, 15, 100), (0, 20));
        // 右侧越界: 向左移.
        assert_eq!(slide_into("x", 90, 110, 100), (80, 100));
        // 恰好贴边.
        assert_eq!(slide_into("x", 0, 100, 100), (0, 100));
        // 比图像更宽: 收缩为整幅图像.
        assert_eq!(slide_into("x", -10, 120, 100), (0, 100));
    }

    #[test]
    fn test_centered_crop() {
        let c = centered_crop((150.0, 100.0), (1024, 1024), (256, 256));
        assert_eq!(c, Crop::at((22, 0), (256, 256)));

        let c = centered_crop((1000.0, 1000.0), (1024, 2048), (256, 256));
        assert_eq!(c, Crop::at((872, 768), (256, 256)));

        let c = centered_crop((50.0, 50.0), (100, 300), (256, 64));
        assert_eq!(c, Crop::at((0, 18), (256, 64)));
        let c = centered_crop((50.0, 50.0), (100, 100), (256, 64));
        assert_eq!((c.x, c.width), (0, 100));
    }
}
