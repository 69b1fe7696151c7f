//! Synthetic scenes shared by the matcher tests.

use nalgebra::Vector3;

use crate::frame::{CameraModel, Descriptor, FeatureSet, Frame, KeyPoint, ScalePyramid};
use crate::geometry::SE3;
use crate::map::{KeyFrameId, Map, MapPointId};
use crate::vocabulary::FeatureVector;

pub fn camera() -> CameraModel {
    CameraModel::new(400.0, 400.0, 320.0, 240.0, 640.0, 480.0)
}

pub fn stereo_camera() -> CameraModel {
    camera().with_baseline(0.1)
}

/// Row `code` of the 256x256 Sylvester-Hadamard matrix as a descriptor.
///
/// Any two distinct codes are exactly 128 bits apart.
pub fn descriptor(code: usize) -> Descriptor {
    let mut d = [0u8; 32];
    for bit in 0..256usize {
        if (code & bit).count_ones() % 2 == 1 {
            d[bit / 8] |= 1 << (bit % 8);
        }
    }
    d
}

/// Flip the first `bits` bits of a descriptor.
pub fn perturb(d: &Descriptor, bits: usize) -> Descriptor {
    let mut out = *d;
    for bit in 0..bits.min(256) {
        out[bit / 8] ^= 1 << (bit % 8);
    }
    out
}

/// A 5-wide grid of points about 5 m in front of the origin.
///
/// Seen from the identity pose they land 40 px apart horizontally and
/// 32 px apart vertically.
pub fn scene_points(n: usize) -> Vec<Vector3<f64>> {
    (0..n)
        .map(|i| {
            let z = 5.0;
            Vector3::new(-1.0 + 0.5 * (i % 5) as f64, -0.6 + 0.4 * (i / 5) as f64, z)
        })
        .collect()
}

/// One level-0 keypoint per position, with descriptor `descriptor(i + 1)`.
pub fn observe(camera: &CameraModel, pose: &SE3, positions: &[Vector3<f64>], angle: f64) -> FeatureSet {
    let pose_cw = pose.inverse();
    let keypoints = positions
        .iter()
        .map(|p| {
            let (u, v) = camera
                .project(&pose_cw.transform_point(p))
                .expect("test point must be in front of the camera");
            KeyPoint::new(u, v, angle, 0)
        })
        .collect();
    let descriptors = (0..positions.len()).map(|i| descriptor(i + 1)).collect();
    FeatureSet::new(keypoints, descriptors)
}

/// Camera-frame points for a stereo view, so every keypoint has depth.
pub fn depths(pose: &SE3, positions: &[Vector3<f64>]) -> Vec<Option<Vector3<f64>>> {
    let pose_cw = pose.inverse();
    positions.iter().map(|p| Some(pose_cw.transform_point(p))).collect()
}

pub fn frame_observing(id: u64, pose: SE3, positions: &[Vector3<f64>]) -> Frame {
    let cam = camera();
    let features = observe(&cam, &pose, positions, 0.0);
    Frame::new(id, 0, cam, ScalePyramid::default(), features, vec![]).with_pose(pose)
}

/// A map holding one keyframe at `pose` and one landmark per position,
/// each observed by its keypoint with normal and distance range filled in.
pub fn map_with_keyframe(pose: SE3, positions: &[Vector3<f64>]) -> (Map, KeyFrameId, Vec<MapPointId>) {
    let mut map = Map::new();
    let cam = camera();
    let features = observe(&cam, &pose, positions, 0.0);
    let kf = map.create_keyframe(pose, cam, ScalePyramid::default(), features, vec![]);
    let ids = add_landmarks(&mut map, kf, positions);
    (map, kf, ids)
}

/// Create one landmark per position observed by keypoint `i` of `kf`.
pub fn add_landmarks(map: &mut Map, kf: KeyFrameId, positions: &[Vector3<f64>]) -> Vec<MapPointId> {
    positions
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let id = map.create_map_point(*p, descriptor(i + 1), kf);
            assert!(map.associate(kf, i, id));
            map.update_map_point_normal_and_depth(id);
            id
        })
        .collect()
}

/// Feature vector placing feature `i` under node `base + i`.
pub fn one_node_per_feature(n: usize, base: u32) -> FeatureVector {
    (0..n).map(|i| (base + i as u32, vec![i])).collect()
}
