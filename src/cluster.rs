//! Feature projection and clustering for population ranking
//!
//! PCA keeps the leading axes that explain a given share of the variance
//! (same covariance + `SymmetricEigen` recipe as the intrinsic-dimension
//! estimate in the heuristics code), then k-means with k-means++ seeding
//! groups the projected points.

use nalgebra::{DMatrix, SymmetricEigen};
use rand::Rng;

/// Cap on Lloyd iterations
pub const MAX_KMEANS_ITER: usize = 100;

/// Project `rows` onto the principal axes explaining `variance_retained`
/// of the total variance. At least one axis is always kept.
pub fn pca_project(rows: &[Vec<f64>], variance_retained: f64) -> Vec<Vec<f64>> {
    let n = rows.len();
    let d = rows.first().map(|r| r.len()).unwrap_or(0);
    if n == 0 || d == 0 {
        return vec![vec![0.0]; n];
    }

    let mut mean = vec![0.0; d];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    for m in &mut mean {
        *m /= n as f64;
    }

    let centered = DMatrix::from_fn(n, d, |i, j| rows[i][j] - mean[j]);
    let cov = (centered.transpose() * &centered) / n as f64;
    let eigen = SymmetricEigen::new(cov);

    let mut order: Vec<usize> = (0..d).collect();
    order.sort_by(|&a, &b| {
        eigen.eigenvalues[b]
            .partial_cmp(&eigen.eigenvalues[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let total: f64 = eigen.eigenvalues.iter().map(|e| e.max(0.0)).sum();
    if total <= f64::EPSILON {
        // No spread at all: every point is the same
        return vec![vec![0.0]; n];
    }

    let mut kept = Vec::new();
    let mut cumsum = 0.0;
    for &axis in &order {
        kept.push(axis);
        cumsum += eigen.eigenvalues[axis].max(0.0) / total;
        if cumsum >= variance_retained {
            break;
        }
    }

    (0..n)
        .map(|i| {
            kept.iter()
                .map(|&axis| centered.row(i).dot(&eigen.eigenvectors.column(axis).transpose()))
                .collect()
        })
        .collect()
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}

fn nearest(point: &[f64], centroids: &[Vec<f64>]) -> (usize, f64) {
    let mut best = (0, f64::MAX);
    for (idx, c) in centroids.iter().enumerate() {
        let dist = squared_distance(point, c);
        if dist < best.1 {
            best = (idx, dist);
        }
    }
    best
}

/// k-means++ seeding
fn seed_centroids<R: Rng>(points: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<Vec<f64>> {
    let mut centroids = vec![points[rng.gen_range(0..points.len())].clone()];
    while centroids.len() < k {
        let weights: Vec<f64> = points.iter().map(|p| nearest(p, &centroids).1).collect();
        let total: f64 = weights.iter().sum();
        let idx = if total <= 0.0 {
            rng.gen_range(0..points.len())
        } else {
            let mut target = rng.gen::<f64>() * total;
            let mut chosen = points.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            chosen
        };
        centroids.push(points[idx].clone());
    }
    centroids
}

/// Cluster `points` into at most `k` groups; returns one label per point
pub fn kmeans<R: Rng>(points: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<usize> {
    if points.is_empty() || k == 0 {
        return vec![0; points.len()];
    }
    let k = k.min(points.len());
    let dim = points[0].len();
    let mut centroids = seed_centroids(points, k, rng);
    let mut labels: Vec<usize> = points.iter().map(|p| nearest(p, &centroids).0).collect();

    for _ in 0..MAX_KMEANS_ITER {
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (p, &label) in points.iter().zip(&labels) {
            counts[label] += 1;
            for (s, v) in sums[label].iter_mut().zip(p) {
                *s += v;
            }
        }
        for (c, (sum, &count)) in centroids.iter_mut().zip(sums.iter().zip(&counts)) {
            if count > 0 {
                *c = sum.iter().map(|s| s / count as f64).collect();
            }
        }

        let next: Vec<usize> = points.iter().map(|p| nearest(p, &centroids).0).collect();
        if next == labels {
            break;
        }
        labels = next;
    }
    labels
}
