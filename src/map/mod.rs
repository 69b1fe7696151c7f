//! Map module - KeyFrames, MapPoints and their associations.
//!
//! The map forms a bipartite graph:
//! - KeyFrames observe MapPoints (KF → MP via `map_point_ids`)
//! - MapPoints track their observers (MP → KF via `observations`)
//!
//! Matching only reads the map, except for fusion which may attach a
//! landmark to a free keypoint. Callers sharing a map between threads wrap
//! it in a [`SharedMap`] and hold the lock for the duration of a search.

use std::sync::Arc;

use parking_lot::RwLock;

pub mod keyframe;
#[allow(clippy::module_inception)]
pub mod map;
pub mod map_point;
pub mod types;

pub use keyframe::KeyFrame;
pub use map::Map;
pub use map_point::MapPoint;
pub use types::{KeyFrameId, MapPointId};

/// Thread-safe handle to a map shared between tracking and mapping threads.
pub type SharedMap = Arc<RwLock<Map>>;

/// Wrap a map for sharing.
pub fn shared(map: Map) -> SharedMap {
    Arc::new(RwLock::new(map))
}
