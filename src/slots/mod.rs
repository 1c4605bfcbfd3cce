pub mod pool;
pub mod tracker;

pub use pool::{BundleKey, SlotPool};
pub use tracker::LocationTracker;

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::worker::WorkerId;

/// A unit of reservable capacity on one worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId {
    pub worker: WorkerId,
    pub index: u32,
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.worker, self.index)
    }
}
