//! Lloyd's k-means with k-means++ seeding, used for codebook learning.
//! Most users do not need to use this module directly.

use anyhow::{anyhow, Result};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const MAX_ITERATIONS: usize = 1000;
const CONVERGENCE_EPS: f32 = 1.0;
const NUM_RESTARTS: u64 = 3;

/// Clusters `points` into `k` centroids, returning the centroids of the
/// best of three seeded restarts. Given the same seed, the result is fully
/// reproducible.
///
/// # Errors
///
/// `anyhow::Error` will be returned when `points` does not have more
/// entries than `k`.
pub fn run(points: &[Vec<f32>], k: usize, seed: u64) -> Result<Vec<Vec<f32>>> {
    if points.len() <= k {
        return Err(anyhow!(
            "the number of points {} must be more than k = {}",
            points.len(),
            k
        ));
    }

    let mut best_inertia = f32::INFINITY;
    let mut best_centroids = Vec::new();

    for restart in 0..NUM_RESTARTS {
        let mut rng = StdRng::seed_from_u64(seed.wrapping_add(restart));
        let (inertia, centroids) = lloyd(points, k, &mut rng);
        if inertia < best_inertia {
            best_inertia = inertia;
            best_centroids = centroids;
        }
    }

    Ok(best_centroids)
}

fn lloyd(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> (f32, Vec<Vec<f32>>) {
    let dim = points[0].len();
    let mut centroids = seed_plus_plus(points, k, rng);
    let mut assign = vec![0; points.len()];

    for _ in 0..MAX_ITERATIONS {
        for (i, point) in points.iter().enumerate() {
            assign[i] = nearest(&centroids, point).0;
        }

        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (i, point) in points.iter().enumerate() {
            counts[assign[i]] += 1;
            for (s, &v) in sums[assign[i]].iter_mut().zip(point.iter()) {
                *s += v;
            }
        }

        let mut shift = 0.0;
        for c in 0..k {
            if counts[c] == 0 {
                continue;
            }
            let new: Vec<f32> = sums[c].iter().map(|&s| s / counts[c] as f32).collect();
            shift += l2sq(&new, &centroids[c]);
            centroids[c] = new;
        }

        // An empty cluster steals the point farthest from its centroid.
        for c in 0..k {
            if counts[c] == 0 {
                let farthest = farthest_point(points, &centroids, &assign);
                centroids[c] = points[farthest].clone();
                shift = f32::INFINITY;
            }
        }

        if shift < CONVERGENCE_EPS {
            break;
        }
    }

    let inertia = points
        .iter()
        .map(|point| nearest(&centroids, point).1)
        .sum();
    (inertia, centroids)
}

/// D^2-weighted seeding of the initial centroids.
fn seed_plus_plus(points: &[Vec<f32>], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids = Vec::with_capacity(k);
    centroids.push(points[rng.gen_range(0..points.len())].clone());

    let mut dists: Vec<f32> = points.iter().map(|p| l2sq(p, &centroids[0])).collect();

    while centroids.len() < k {
        let total: f32 = dists.iter().sum();
        let picked = if total > 0.0 {
            let mut target = rng.gen::<f32>() * total;
            let mut picked = points.len() - 1;
            for (i, &d) in dists.iter().enumerate() {
                if target <= d {
                    picked = i;
                    break;
                }
                target -= d;
            }
            picked
        } else {
            rng.gen_range(0..points.len())
        };

        centroids.push(points[picked].clone());
        let last = centroids.len() - 1;
        for (d, point) in dists.iter_mut().zip(points.iter()) {
            let to_new = l2sq(point, &centroids[last]);
            if to_new < *d {
                *d = to_new;
            }
        }
    }

    centroids
}

fn nearest(centroids: &[Vec<f32>], point: &[f32]) -> (usize, f32) {
    let mut min_c = 0;
    let mut min_dist = f32::INFINITY;
    for (c, centroid) in centroids.iter().enumerate() {
        let dist = l2sq(point, centroid);
        if dist < min_dist {
            min_dist = dist;
            min_c = c;
        }
    }
    (min_c, min_dist)
}

fn farthest_point(points: &[Vec<f32>], centroids: &[Vec<f32>], assign: &[usize]) -> usize {
    let mut max_i = 0;
    let mut max_dist = -1.0;
    for (i, point) in points.iter().enumerate() {
        let dist = l2sq(point, &centroids[assign[i]]);
        if max_dist < dist {
            max_dist = dist;
            max_i = i;
        }
    }
    max_i
}

pub(crate) fn l2sq(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum()
}
