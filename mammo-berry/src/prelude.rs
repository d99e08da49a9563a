//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx2d, SampleRng};

pub use crate::{load_lesions, Record, RecordFilter, RecordSet};
pub use crate::{Provenance, RecordTransform, Sample};
pub use crate::{Mode, SampleSource, SourceConfig};

pub use crate::augment::{
    ChannelPipeline, ChannelTransform, HorizontalFlip, RandomAffine, RandomRotate90, Resize,
    VerticalFlip,
};
pub use crate::geometry::{find_window, solve_window, BoundingBox, GeometryWarning, PatchWindow};
pub use crate::patch::{NormalTissue, PatchStrategy};

pub use crate::cache::{materialize, CacheReport};
pub use crate::config::DatasetConfig;
pub use crate::dataset::{ClassificationSource, DatasetFactory, DatasetSplits, Splits};

pub use crate::consts::label::NORMAL;
pub use crate::error::{Error, Result};
