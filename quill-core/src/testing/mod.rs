//! Testing utilities.
//!
//! [`FaultyStorage`] injects append failures into any
//! [`LogStorage`](crate::storage::LogStorage) so failure handling of the
//! appender and the log stream can be exercised deterministically.
//! [`corrupt_frame`] damages a committed dispatcher frame.

pub mod corrupt;
pub mod faulty;

pub use corrupt::corrupt_frame;
pub use faulty::{FaultPlan, FaultyStorage};
