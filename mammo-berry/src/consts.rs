//! 通用常量.

/// 病灶表中的类别取值.
pub mod label {
    /// 正常组织 patch 被改写后的病理标签.
    pub const NORMAL: &str = "NORMAL";

    /// 肿块病灶.
    pub const MASS: &str = "mass";

    /// 钙化病灶.
    pub const CALCIFICATION: &str = "calcification";

    /// 病理标签是否是正常组织?
    #[inline]
    pub fn is_normal(pathology: &str) -> bool {
        pathology == NORMAL
    }
}

/// 磁盘布局.
pub mod layout {
    /// 训练集病灶表文件名.
    pub const LESIONS_TRAIN_CSV: &str = "lesions_train.csv";

    /// 测试集病灶表文件名.
    pub const LESIONS_TEST_CSV: &str = "lesions_test.csv";

    /// 缓存根目录名, 位于下载目录下.
    pub const CACHE_DIR: &str = "cache";

    /// 缓存目录中改写后的病灶表文件名.
    pub const CACHE_TABLE: &str = "dataframe.csv";

    /// 缓存文件序号的位宽.
    pub const INDEX_WIDTH: usize = 5;

    /// 第 `index` 个样本的图像文件名, 如 `00042.png`.
    #[inline]
    pub fn image_name(index: usize) -> String {
        format!("{index:0width$}.png", width = INDEX_WIDTH)
    }

    /// 第 `index` 个样本的掩码文件名, 如 `00042_mask.png`.
    #[inline]
    pub fn mask_name(index: usize) -> String {
        format!("{index:0width$}_mask.png", width = INDEX_WIDTH)
    }
}

/// 默认 patch 尺寸 (宽, 高).
pub const DEFAULT_PATCH_SIZE: (usize, usize) = (1024, 1024);

/// 随机 patch 与病灶的最小重叠比例.
pub const DEFAULT_MIN_OVERLAP: f64 = 0.9;

/// 正常组织 patch 与乳房区域的最小重叠比例.
pub const DEFAULT_MIN_BREAST_OVERLAP: f64 = 0.5;

/// 正常组织 patch 与病灶的最大重叠比例.
pub const DEFAULT_MAX_ABNORM_OVERLAP: f64 = 0.1;

/// 正常组织 patch 的最大采样次数.
pub const DEFAULT_MAX_TRIES: u32 = 5;

/// 8-bit 图像归一化除数.
pub const U8_DIVISOR: f32 = u8::MAX as f32;

/// 16-bit 图像归一化除数.
pub const U16_DIVISOR: f32 = u16::MAX as f32;
