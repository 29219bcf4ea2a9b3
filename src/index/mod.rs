//! Index structures
//!
//! - [`bitmap`]: per dimension-value row bitmaps with union/intersection,
//!   consumed by index-assisted filter evaluation
//! - [`grouping`]: the bounded, arena-backed grouping index that holds
//!   buffer-resident aggregation state per grouping key

pub mod bitmap;
pub mod grouping;

pub use bitmap::{BitmapIndexSelector, InMemoryBitmapIndex, RowBitmap};
pub use grouping::{GroupKey, GroupingIndex};
