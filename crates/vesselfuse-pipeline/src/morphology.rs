//! Binary morphology with isotropic structuring elements.
//!
//! [`Element::Ball`] of radius `r` (in voxels) contains every offset `o`
//! with `|o|² <= (r + 0.5)²`. For `r = 1` that is the 3×3×3
//! neighbourhood without its eight corners; larger radii approach a
//! sphere. Ball dilation and erosion are evaluated through the exact
//! distance transform ([`crate::distance`]), so cost does not grow with
//! the radius.
//!
//! [`Element::Cube`] of radius `r` is the `(2r + 1)³` box, applied as
//! three separable running-window passes. Every slice of a cube
//! perpendicular to an axis is the same square, so closing with it joins
//! two voxels `2` apart along an axis for every `r >= 1`; a ball never
//! does for `r = 1`.
//!
//! Border handling: dilation is clipped to the grid; erosion treats
//! voxels outside the grid as foreground, so objects touching the
//! border are not eaten away.

use crate::distance::squared_distance;
use crate::volume::BinaryMask;

/// Structuring element shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Element {
    /// Digital Euclidean ball.
    Ball,
    /// Axis-aligned box of side `2r + 1`.
    Cube,
}

/// Largest integer squared offset length inside the ball of `radius`.
const fn ball_limit(radius: usize) -> usize {
    radius * radius + radius
}

/// Binary dilation by `element` of `radius` voxels.
#[must_use = "returns the dilated mask"]
pub fn dilate(mask: &BinaryMask, radius: usize, element: Element) -> BinaryMask {
    if radius == 0 {
        return mask.clone();
    }
    match element {
        Element::Ball => {
            let dist = squared_distance(mask.shape(), [1.0; 3], |i| mask.is_foreground(i));
            threshold_distance(mask, &dist, radius, true)
        }
        Element::Cube => cube_filter(mask, radius, true),
    }
}

/// Binary erosion by `element` of `radius` voxels.
#[must_use = "returns the eroded mask"]
pub fn erode(mask: &BinaryMask, radius: usize, element: Element) -> BinaryMask {
    if radius == 0 {
        return mask.clone();
    }
    match element {
        Element::Ball => {
            let dist = squared_distance(mask.shape(), [1.0; 3], |i| !mask.is_foreground(i));
            threshold_distance(mask, &dist, radius, false)
        }
        Element::Cube => cube_filter(mask, radius, false),
    }
}

/// Dilation followed by erosion with the same element.
#[must_use = "returns the closed mask"]
pub fn close(mask: &BinaryMask, radius: usize, element: Element) -> BinaryMask {
    erode(&dilate(mask, radius, element), radius, element)
}

/// Gap-bridging pass applied to each rater before estimation: dilate,
/// then close, both with a ball of `radius`.
#[must_use = "returns the preprocessed mask"]
pub fn bridge_gaps(mask: &BinaryMask, radius: usize) -> BinaryMask {
    close(&dilate(mask, radius, Element::Ball), radius, Element::Ball)
}

/// Inside-ball test against a squared distance map.
///
/// For dilation a voxel is set when the nearest foreground voxel lies
/// inside the ball; for erosion it is kept when the nearest background
/// voxel lies outside it.
#[allow(clippy::cast_precision_loss)]
fn threshold_distance(mask: &BinaryMask, dist: &[f64], radius: usize, dilating: bool) -> BinaryMask {
    let limit = ball_limit(radius) as f64;
    let mut out = mask.map(|_| 0u8);
    for (o, &d) in out.data_mut().iter_mut().zip(dist) {
        let inside = d <= limit;
        *o = u8::from(if dilating { inside } else { !inside });
    }
    out
}

/// Separable box filter: one running-window pass per axis.
///
/// A window "hits" on foreground when dilating and on background when
/// eroding; prefix counts make each line linear in its length.
fn cube_filter(mask: &BinaryMask, radius: usize, dilating: bool) -> BinaryMask {
    let [nx, ny, nz] = mask.shape().as_array();
    let mut out = mask.clone();
    let mut prefix = Vec::new();
    for (len, stride) in [(nx, 1), (ny, nx), (nz, nx * ny)] {
        let data = out.data_mut();
        for start in (0..data.len()).filter(|&i| (i / stride) % len == 0) {
            prefix.clear();
            prefix.push(0usize);
            let mut hits = 0;
            for k in 0..len {
                hits += usize::from((data[start + k * stride] != 0) == dilating);
                prefix.push(hits);
            }
            for k in 0..len {
                let lo = k.saturating_sub(radius);
                let hi = (k + radius + 1).min(len);
                let window_hit = prefix[hi] > prefix[lo];
                data[start + k * stride] = u8::from(window_hit == dilating);
            }
        }
    }
    out
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::volume::{Shape, SpatialHeader};

    fn single_voxel(shape: Shape, at: [usize; 3]) -> BinaryMask {
        let mut m = BinaryMask::filled(shape, SpatialHeader::default(), 0);
        let i = shape.index(at[0], at[1], at[2]);
        m.data_mut()[i] = 1;
        m
    }

    #[test]
    fn radius_one_ball_has_nineteen_voxels() {
        let shape = Shape::new(5, 5, 5);
        let d = dilate(&single_voxel(shape, [2, 2, 2]), 1, Element::Ball);
        assert_eq!(d.count_foreground(), 19);
        // Face and edge neighbours are in, corners are out.
        assert_eq!(*d.get(3, 2, 2).unwrap(), 1);
        assert_eq!(*d.get(3, 3, 2).unwrap(), 1);
        assert_eq!(*d.get(3, 3, 3).unwrap(), 0);
    }

    #[test]
    fn dilation_is_clipped_at_border() {
        let shape = Shape::new(3, 3, 3);
        let d = dilate(&single_voxel(shape, [0, 0, 0]), 1, Element::Ball);
        // Offsets in the positive octant with |o|² <= 2.
        assert_eq!(d.count_foreground(), 7);
    }

    #[test]
    fn radius_zero_is_identity() {
        let shape = Shape::new(4, 4, 4);
        let m = single_voxel(shape, [1, 2, 3]);
        for element in [Element::Ball, Element::Cube] {
            assert_eq!(dilate(&m, 0, element), m);
            assert_eq!(erode(&m, 0, element), m);
        }
    }

    #[test]
    fn erosion_removes_isolated_voxel() {
        let shape = Shape::new(5, 5, 5);
        let e = erode(&single_voxel(shape, [2, 2, 2]), 1, Element::Ball);
        assert_eq!(e.count_foreground(), 0);
    }

    #[test]
    fn erosion_keeps_full_volume() {
        let shape = Shape::new(4, 4, 4);
        let full = BinaryMask::filled(shape, SpatialHeader::default(), 1);
        assert_eq!(erode(&full, 2, Element::Ball), full);
        assert_eq!(erode(&full, 2, Element::Cube), full);
    }

    #[test]
    fn erosion_undoes_dilation_of_single_voxel() {
        let shape = Shape::new(9, 9, 9);
        let m = single_voxel(shape, [4, 4, 4]);
        assert_eq!(close(&m, 2, Element::Ball), m);
        assert_eq!(close(&m, 2, Element::Cube), m);
    }

    #[test]
    fn closing_fills_one_voxel_gap_in_a_line() {
        let shape = Shape::new(11, 7, 7);
        let mut m = BinaryMask::filled(shape, SpatialHeader::default(), 0);
        for x in 1..10 {
            if x != 5 {
                let i = shape.index(x, 3, 3);
                m.data_mut()[i] = 1;
            }
        }
        // A radius-1 ball is too thin to bridge it: the off-axis edge
        // neighbours of the gap voxel are not covered by the dilation.
        assert_eq!(*close(&m, 1, Element::Ball).get(5, 3, 3).unwrap(), 0);

        let closed = close(&m, 2, Element::Ball);
        assert_eq!(*closed.get(5, 3, 3).unwrap(), 1);
        for x in 1..10 {
            assert_eq!(*closed.get(x, 3, 3).unwrap(), 1);
        }
    }

    #[test]
    fn bridge_gaps_is_superset_of_input() {
        let shape = Shape::new(8, 8, 8);
        let m = single_voxel(shape, [3, 4, 5]);
        let b = bridge_gaps(&m, 1);
        for i in 0..shape.len() {
            if m.is_foreground(i) {
                assert!(b.is_foreground(i));
            }
        }
        assert!(b.count_foreground() >= 19);
    }

    #[test]
    fn cube_dilation_fills_the_box() {
        let shape = Shape::new(7, 7, 7);
        let d = dilate(&single_voxel(shape, [3, 3, 3]), 2, Element::Cube);
        assert_eq!(d.count_foreground(), 125);
        assert_eq!(*d.get(1, 1, 1).unwrap(), 1);
        assert_eq!(*d.get(0, 3, 3).unwrap(), 0);

        let clipped = dilate(&single_voxel(shape, [0, 0, 6]), 1, Element::Cube);
        assert_eq!(clipped.count_foreground(), 8);
    }

    #[test]
    fn cube_erosion_shrinks_box_by_radius() {
        let shape = Shape::new(9, 9, 9);
        let mut m = BinaryMask::filled(shape, SpatialHeader::default(), 0);
        for z in 2..7 {
            for y in 2..7 {
                for x in 2..7 {
                    let i = shape.index(x, y, z);
                    m.data_mut()[i] = 1;
                }
            }
        }
        let e = erode(&m, 1, Element::Cube);
        assert_eq!(e.count_foreground(), 27);
        assert_eq!(*e.get(3, 3, 3).unwrap(), 1);
        assert_eq!(*e.get(2, 4, 4).unwrap(), 0);
    }

    #[test]
    fn cube_closing_joins_voxels_two_apart_at_every_radius() {
        let shape = Shape::new(15, 15, 15);
        for axis in 0..3 {
            let mut a = [7; 3];
            let mut b = [7; 3];
            a[axis] = 6;
            b[axis] = 8;
            let mut m = single_voxel(shape, a);
            let j = shape.index(b[0], b[1], b[2]);
            m.data_mut()[j] = 1;
            for radius in 1..=4 {
                let closed = close(&m, radius, Element::Cube);
                assert_eq!(*closed.get(7, 7, 7).unwrap(), 1, "axis {axis} radius {radius}");
            }
            // The corner-free ball leaves the gap open.
            assert_eq!(*close(&m, 1, Element::Ball).get(7, 7, 7).unwrap(), 0);
        }
    }
}
