//! 26-connected component labelling and per-component shape statistics.
//!
//! Labelling is a single raster scan that unions each foreground voxel
//! with its already-visited neighbours (13 of the 26), using
//! `petgraph`'s [`UnionFind`]. Labels are then renumbered `1..=count`
//! in scan order of each component's first voxel, so output is
//! deterministic.

use nalgebra::{Matrix3, SymmetricEigen, Vector3};
use petgraph::unionfind::UnionFind;

use crate::types::VesselComponentStats;
use crate::volume::{BinaryMask, Shape};

/// Neighbour offsets visited before the current voxel in raster order.
const BACKWARD_NEIGHBOURS: [[isize; 3]; 13] = [
    [-1, 0, 0],
    [-1, -1, 0],
    [0, -1, 0],
    [1, -1, 0],
    [-1, -1, -1],
    [0, -1, -1],
    [1, -1, -1],
    [-1, 0, -1],
    [0, 0, -1],
    [1, 0, -1],
    [-1, 1, -1],
    [0, 1, -1],
    [1, 1, -1],
];

/// Component labels of a mask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentLabels {
    shape: Shape,
    /// Per voxel: `0` for background, `1..=count` for components.
    labels: Vec<u32>,
    /// Voxel count per component; index `k` holds component `k + 1`.
    sizes: Vec<usize>,
}

impl ComponentLabels {
    /// Number of components.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sizes.len()
    }

    /// Label of every voxel.
    #[must_use]
    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Voxel count of every component, in label order.
    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.sizes
    }

    /// Grid the labels were computed on.
    #[must_use]
    pub const fn shape(&self) -> Shape {
        self.shape
    }
}

/// Label the 26-connected components of `mask`.
#[must_use]
pub fn label_components(mask: &BinaryMask) -> ComponentLabels {
    let shape = mask.shape();
    let n = shape.len();

    // Compact ids for foreground voxels keep the union-find small.
    let mut compact = vec![usize::MAX; n];
    let mut voxels = Vec::new();
    for i in 0..n {
        if mask.is_foreground(i) {
            compact[i] = voxels.len();
            voxels.push(i);
        }
    }

    let mut uf = UnionFind::<usize>::new(voxels.len());
    for (id, &i) in voxels.iter().enumerate() {
        let at = shape.coords(i);
        for offset in BACKWARD_NEIGHBOURS {
            if let Some(j) = shape.offset_index(at, offset)
                && compact[j] != usize::MAX
            {
                uf.union(id, compact[j]);
            }
        }
    }

    let mut labels = vec![0u32; n];
    let mut root_label = vec![0u32; voxels.len()];
    let mut sizes: Vec<usize> = Vec::new();
    for (id, &i) in voxels.iter().enumerate() {
        let root = uf.find_mut(id);
        if root_label[root] == 0 {
            sizes.push(0);
            #[allow(clippy::cast_possible_truncation)]
            let next = sizes.len() as u32;
            root_label[root] = next;
        }
        let label = root_label[root];
        labels[i] = label;
        sizes[label as usize - 1] += 1;
    }

    ComponentLabels {
        shape,
        labels,
        sizes,
    }
}

/// Zero out every component with fewer than `min_size` voxels.
///
/// Returns the filtered mask and the number of components removed.
#[must_use]
pub fn remove_small_components(mask: &BinaryMask, min_size: usize) -> (BinaryMask, usize) {
    let components = label_components(mask);
    let removed = components.sizes.iter().filter(|&&s| s < min_size).count();
    let mut out = mask.map(|_| 0u8);
    for (o, &label) in out.data_mut().iter_mut().zip(&components.labels) {
        if label != 0 && components.sizes[label as usize - 1] >= min_size {
            *o = 1;
        }
    }
    (out, removed)
}

/// Physical shape statistics of every 26-connected component.
///
/// Axis lengths come from the principal axes of each component's voxel
/// centres (in millimetres): the extent of the projections onto an axis,
/// plus the footprint of one voxel along that axis. The major axis is
/// the direction of largest variance; the minor axis is the smallest
/// extent over the three principal directions.
#[must_use]
pub fn component_stats(mask: &BinaryMask) -> Vec<VesselComponentStats> {
    let components = label_components(mask);
    let spacing = mask.header().spacing;
    let voxel_volume = mask.header().voxel_volume();

    let mut points: Vec<Vec<Vector3<f64>>> = vec![Vec::new(); components.count()];
    for (i, &label) in components.labels.iter().enumerate() {
        if label != 0 {
            let [x, y, z] = mask.shape().coords(i);
            #[allow(clippy::cast_precision_loss)]
            let p = Vector3::new(
                x as f64 * spacing[0],
                y as f64 * spacing[1],
                z as f64 * spacing[2],
            );
            points[label as usize - 1].push(p);
        }
    }

    points
        .iter()
        .map(|pts| {
            let (major_axis_mm, minor_axis_mm) = principal_extents(pts, spacing);
            #[allow(clippy::cast_precision_loss)]
            let volume_mm3 = pts.len() as f64 * voxel_volume;
            VesselComponentStats {
                voxel_count: pts.len(),
                volume_mm3,
                major_axis_mm,
                minor_axis_mm,
            }
        })
        .collect()
}

/// `(major, minor)` extents of a point cloud along its principal axes.
#[allow(clippy::cast_precision_loss)]
fn principal_extents(points: &[Vector3<f64>], spacing: [f64; 3]) -> (f64, f64) {
    if points.is_empty() {
        return (0.0, 0.0);
    }
    let n = points.len() as f64;
    let mean = points.iter().fold(Vector3::zeros(), |acc, p| acc + p) / n;
    let covariance = points.iter().fold(Matrix3::zeros(), |acc, p| {
        let d = p - mean;
        acc + d * d.transpose()
    }) / n;

    let eigen = SymmetricEigen::new(covariance);
    let voxel = Vector3::from(spacing);

    let mut extents = [0.0; 3];
    for (k, extent) in extents.iter_mut().enumerate() {
        let axis = eigen.eigenvectors.column(k);
        let (lo, hi) = points.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| {
            let t = axis.dot(p);
            (lo.min(t), hi.max(t))
        });
        let footprint = axis.abs().dot(&voxel);
        *extent = hi - lo + footprint;
    }

    let major = eigen
        .eigenvalues
        .iter()
        .enumerate()
        .fold((0, f64::NEG_INFINITY), |best, (k, &v)| {
            if v > best.1 { (k, v) } else { best }
        })
        .0;
    let minor = extents.iter().copied().fold(f64::INFINITY, f64::min);
    (extents[major], minor)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::volume::SpatialHeader;

    fn mask_with(shape: Shape, spacing: [f64; 3], voxels: &[[usize; 3]]) -> BinaryMask {
        let mut m = BinaryMask::filled(shape, SpatialHeader::with_spacing(spacing), 0);
        for &[x, y, z] in voxels {
            let i = shape.index(x, y, z);
            m.data_mut()[i] = 1;
        }
        m
    }

    #[test]
    fn empty_mask_has_no_components() {
        let m = mask_with(Shape::new(4, 4, 4), [1.0; 3], &[]);
        let c = label_components(&m);
        assert_eq!(c.count(), 0);
        assert!(c.labels().iter().all(|&l| l == 0));
    }

    #[test]
    fn diagonal_corner_neighbours_are_connected() {
        let m = mask_with(Shape::new(4, 4, 4), [1.0; 3], &[[0, 0, 0], [1, 1, 1], [2, 2, 2]]);
        let c = label_components(&m);
        assert_eq!(c.count(), 1);
        assert_eq!(c.sizes(), &[3]);
    }

    #[test]
    fn anti_diagonal_neighbour_is_connected() {
        // (2,0,1) is visited after (1,1,0); they touch through offset (1,-1,1).
        let m = mask_with(Shape::new(4, 4, 4), [1.0; 3], &[[1, 1, 0], [2, 0, 1]]);
        assert_eq!(label_components(&m).count(), 1);
    }

    #[test]
    fn separated_voxels_are_distinct_components() {
        let m = mask_with(Shape::new(6, 6, 6), [1.0; 3], &[[0, 0, 0], [2, 0, 0], [5, 5, 5]]);
        let c = label_components(&m);
        assert_eq!(c.count(), 3);
        // Labels follow scan order.
        assert_eq!(c.labels()[m.shape().index(0, 0, 0)], 1);
        assert_eq!(c.labels()[m.shape().index(2, 0, 0)], 2);
        assert_eq!(c.labels()[m.shape().index(5, 5, 5)], 3);
    }

    #[test]
    fn u_shape_merges_into_one_label() {
        // Two arms joined only at the far end: the scan meets them as
        // separate provisional components first.
        let mut voxels = Vec::new();
        for y in 0..5 {
            voxels.push([0, y, 0]);
            voxels.push([4, y, 0]);
        }
        for x in 0..5 {
            voxels.push([x, 4, 0]);
        }
        let m = mask_with(Shape::new(5, 5, 1), [1.0; 3], &voxels);
        let c = label_components(&m);
        assert_eq!(c.count(), 1);
        assert_eq!(c.sizes(), &[m.count_foreground()]);
    }

    #[test]
    fn remove_small_components_drops_only_small_ones() {
        let mut voxels = vec![[7, 7, 7]];
        for x in 0..5 {
            voxels.push([x, 0, 0]);
        }
        let m = mask_with(Shape::new(9, 9, 9), [1.0; 3], &voxels);
        let (filtered, removed) = remove_small_components(&m, 3);
        assert_eq!(removed, 1);
        assert_eq!(filtered.count_foreground(), 5);
        assert_eq!(*filtered.get(7, 7, 7).unwrap(), 0);
    }

    #[test]
    fn single_voxel_stats_use_spacing() {
        let m = mask_with(Shape::new(3, 3, 3), [0.5, 0.5, 2.0], &[[1, 1, 1]]);
        let stats = component_stats(&m);
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].voxel_count, 1);
        assert!((stats[0].volume_mm3 - 0.5).abs() < 1e-12);
        assert!((stats[0].minor_axis_mm - 0.5).abs() < 1e-9);
    }

    #[test]
    fn straight_tube_stats() {
        let voxels: Vec<[usize; 3]> = (0..10).map(|x| [x, 2, 2]).collect();
        let m = mask_with(Shape::new(10, 5, 5), [1.0; 3], &voxels);
        let stats = component_stats(&m);
        assert_eq!(stats.len(), 1);
        assert!((stats[0].volume_mm3 - 10.0).abs() < 1e-9);
        assert!((stats[0].major_axis_mm - 10.0).abs() < 1e-6);
        assert!(stats[0].minor_axis_mm >= 1.0 - 1e-9);
        assert!(stats[0].minor_axis_mm < 2.0);
    }
}
