//! Exact squared Euclidean distance transform.
//!
//! Separable lower-envelope algorithm (Felzenszwalb & Huttenlocher,
//! "Distance Transforms of Sampled Functions"): one 1D pass per axis,
//! each linear in the number of voxels. Axis weights let the same code
//! measure distance in voxel units (all weights 1) or in millimetres
//! (weights = spacing²).

use crate::volume::Shape;

/// Squared distance from every voxel to the nearest feature voxel.
///
/// `is_feature` selects the feature set. `weights[k]` scales squared
/// steps along axis `k`. Voxels with no feature anywhere in the volume
/// get `f64::INFINITY`.
#[must_use]
pub fn squared_distance(shape: Shape, weights: [f64; 3], is_feature: impl Fn(usize) -> bool) -> Vec<f64> {
    let mut dist: Vec<f64> = (0..shape.len())
        .map(|i| if is_feature(i) { 0.0 } else { f64::INFINITY })
        .collect();

    let dims = shape.as_array();
    let strides = [1, shape.nx, shape.nx * shape.ny];
    let longest = dims.iter().copied().max().unwrap_or(0);

    let mut line = vec![0.0; longest];
    let mut out = vec![0.0; longest];
    let mut envelope = Envelope::with_capacity(longest);

    for axis in 0..3 {
        let n = dims[axis];
        if n == 0 {
            return dist;
        }
        let stride = strides[axis];
        let (a, b) = other_axes(axis);
        for j in 0..dims[b] {
            for i in 0..dims[a] {
                let start = i * strides[a] + j * strides[b];
                for k in 0..n {
                    line[k] = dist[start + k * stride];
                }
                envelope.transform(&line[..n], weights[axis], &mut out[..n]);
                for k in 0..n {
                    dist[start + k * stride] = out[k];
                }
            }
        }
    }
    dist
}

/// The two axes other than `axis`, in increasing order.
const fn other_axes(axis: usize) -> (usize, usize) {
    match axis {
        0 => (1, 2),
        1 => (0, 2),
        _ => (0, 1),
    }
}

/// Scratch space for the 1D lower envelope of parabolas.
struct Envelope {
    /// Sites (indices) of the parabolas in the envelope.
    sites: Vec<usize>,
    /// Left boundary of each parabola's interval.
    bounds: Vec<f64>,
}

impl Envelope {
    fn with_capacity(n: usize) -> Self {
        Self {
            sites: Vec::with_capacity(n),
            bounds: Vec::with_capacity(n),
        }
    }

    /// `out[q] = min_p (w * (q - p)^2 + f[p])` over finite `f[p]`.
    #[allow(clippy::cast_precision_loss)]
    fn transform(&mut self, f: &[f64], w: f64, out: &mut [f64]) {
        self.sites.clear();
        self.bounds.clear();

        for q in 0..f.len() {
            if !f[q].is_finite() {
                continue;
            }
            loop {
                let Some(&p) = self.sites.last() else {
                    self.sites.push(q);
                    self.bounds.push(f64::NEG_INFINITY);
                    break;
                };
                let s = intersection(f, w, p, q);
                if self.bounds.last().is_some_and(|&b| s <= b) {
                    self.sites.pop();
                    self.bounds.pop();
                } else {
                    self.sites.push(q);
                    self.bounds.push(s);
                    break;
                }
            }
        }

        if self.sites.is_empty() {
            out.fill(f64::INFINITY);
            return;
        }

        let mut k = 0;
        for (q, o) in out.iter_mut().enumerate() {
            let qf = q as f64;
            while k + 1 < self.sites.len() && self.bounds[k + 1] < qf {
                k += 1;
            }
            let p = self.sites[k];
            let d = qf - p as f64;
            *o = (w * d).mul_add(d, f[p]);
        }
    }
}

/// Position where the parabolas rooted at `p < q` intersect.
#[allow(clippy::cast_precision_loss)]
fn intersection(f: &[f64], w: f64, p: usize, q: usize) -> f64 {
    let (pf, qf) = (p as f64, q as f64);
    ((w * qf).mul_add(qf, f[q]) - (w * pf).mul_add(pf, f[p])) / (2.0 * w * (qf - pf))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Brute-force reference implementation.
    #[allow(clippy::cast_precision_loss)]
    fn brute_force(shape: Shape, weights: [f64; 3], features: &[usize]) -> Vec<f64> {
        (0..shape.len())
            .map(|i| {
                let a = shape.coords(i);
                features
                    .iter()
                    .map(|&f| {
                        let b = shape.coords(f);
                        (0..3)
                            .map(|k| {
                                let d = a[k] as f64 - b[k] as f64;
                                weights[k] * d * d
                            })
                            .sum::<f64>()
                    })
                    .fold(f64::INFINITY, f64::min)
            })
            .collect()
    }

    #[test]
    fn matches_brute_force_isotropic() {
        let shape = Shape::new(7, 5, 6);
        let features = [shape.index(1, 1, 1), shape.index(5, 3, 4), shape.index(6, 0, 5)];
        let fast = squared_distance(shape, [1.0; 3], |i| features.contains(&i));
        let slow = brute_force(shape, [1.0; 3], &features);
        for (a, b) in fast.iter().zip(&slow) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn matches_brute_force_anisotropic() {
        let shape = Shape::new(6, 6, 4);
        let weights = [0.25, 1.0, 4.0];
        let features = [shape.index(0, 5, 0), shape.index(3, 2, 3)];
        let fast = squared_distance(shape, weights, |i| features.contains(&i));
        let slow = brute_force(shape, weights, &features);
        for (a, b) in fast.iter().zip(&slow) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
    }

    #[test]
    fn no_features_is_infinite() {
        let shape = Shape::new(3, 3, 3);
        let d = squared_distance(shape, [1.0; 3], |_| false);
        assert!(d.iter().all(|v| v.is_infinite()));
    }

    #[test]
    fn feature_voxels_are_zero() {
        let shape = Shape::new(4, 4, 4);
        let d = squared_distance(shape, [1.0; 3], |i| i % 5 == 0);
        for (i, v) in d.iter().enumerate() {
            if i % 5 == 0 {
                assert!(v.abs() < f64::EPSILON);
            }
        }
    }
}
