//! K-means clustering over RGB samples, used for dominant colours.

use crate::config::ProcessingConfig;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// A point in RGB space.
pub type Point = [f32; 3];

/// Clustering parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansParams {
    /// Requested number of clusters. Capped at the number of points.
    pub k: usize,
    /// Iteration limit per attempt.
    pub max_iterations: u32,
    /// An attempt converges once no center moves further than this.
    pub epsilon: f32,
    /// Independent restarts; the most compact result wins.
    pub attempts: u32,
    /// Fixed seed for reproducible clustering.
    pub seed: Option<u64>,
}

impl From<&ProcessingConfig> for KMeansParams {
    fn from(config: &ProcessingConfig) -> Self {
        Self {
            k: config.dominant_colors,
            max_iterations: config.kmeans_max_iterations,
            epsilon: config.kmeans_epsilon,
            attempts: config.kmeans_attempts,
            seed: config.kmeans_seed,
        }
    }
}

/// Result of a clustering run.
#[derive(Debug, Clone)]
pub struct Clustering {
    pub centers: Vec<Point>,
    /// Cluster index per input point.
    pub labels: Vec<usize>,
    /// Sum of squared distances from each point to its center.
    pub compactness: f64,
}

/// Cluster `points`, returning `None` when there is nothing to cluster.
pub fn kmeans(points: &[Point], params: &KMeansParams) -> Option<Clustering> {
    let k = params.k.min(points.len());
    if k == 0 {
        return None;
    }

    let mut rng = match params.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::seed_from_u64(rand::random()),
    };

    let mut best: Option<Clustering> = None;
    for _ in 0..params.attempts.max(1) {
        let candidate = run_attempt(points, k, params, &mut rng);
        let better = best
            .as_ref()
            .map_or(true, |b| candidate.compactness < b.compactness);
        if better {
            best = Some(candidate);
        }
    }

    best
}

fn run_attempt(points: &[Point], k: usize, params: &KMeansParams, rng: &mut StdRng) -> Clustering {
    let mut centers: Vec<Point> = rand::seq::index::sample(rng, points.len(), k)
        .into_iter()
        .map(|i| points[i])
        .collect();
    let mut labels = vec![0usize; points.len()];
    let epsilon_sq = params.epsilon * params.epsilon;

    for _ in 0..params.max_iterations.max(1) {
        assign(points, &centers, &mut labels);

        let mut sums = vec![[0.0f64; 3]; k];
        let mut counts = vec![0usize; k];
        for (point, &cluster) in points.iter().zip(labels.iter()) {
            for (sum, value) in sums[cluster].iter_mut().zip(point.iter()) {
                *sum += *value as f64;
            }
            counts[cluster] += 1;
        }

        let mut max_shift = 0.0f32;
        for (cluster, center) in centers.iter_mut().enumerate() {
            let updated = if counts[cluster] > 0 {
                let n = counts[cluster] as f64;
                [
                    (sums[cluster][0] / n) as f32,
                    (sums[cluster][1] / n) as f32,
                    (sums[cluster][2] / n) as f32,
                ]
            } else {
                // Empty cluster: restart from a random point.
                points[rng.random_range(0..points.len())]
            };
            max_shift = max_shift.max(squared_distance(center, &updated));
            *center = updated;
        }

        if max_shift <= epsilon_sq {
            break;
        }
    }

    let compactness = assign(points, &centers, &mut labels);
    Clustering {
        centers,
        labels,
        compactness,
    }
}

/// Label each point with its nearest center and return the compactness.
fn assign(points: &[Point], centers: &[Point], labels: &mut [usize]) -> f64 {
    let mut compactness = 0.0f64;
    for (point, label) in points.iter().zip(labels.iter_mut()) {
        let mut nearest = 0;
        let mut nearest_dist = f32::INFINITY;
        for (i, center) in centers.iter().enumerate() {
            let dist = squared_distance(point, center);
            if dist < nearest_dist {
                nearest = i;
                nearest_dist = dist;
            }
        }
        *label = nearest;
        compactness += nearest_dist as f64;
    }
    compactness
}

fn squared_distance(a: &Point, b: &Point) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let diff = x - y;
            diff * diff
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: usize) -> KMeansParams {
        KMeansParams {
            k,
            max_iterations: 20,
            epsilon: 1.0,
            attempts: 10,
            seed: Some(7),
        }
    }

    fn two_blobs() -> Vec<Point> {
        let mut points = Vec::new();
        for i in 0..50 {
            let jitter = (i % 5) as f32;
            points.push([10.0 + jitter, 20.0, 30.0 - jitter]);
            points.push([200.0 - jitter, 180.0 + jitter, 40.0]);
        }
        points
    }

    #[test]
    fn test_separates_distinct_colors() {
        let clustering = kmeans(&two_blobs(), &params(2)).unwrap();

        let mut centers = clustering.centers.clone();
        centers.sort_by(|a, b| a[0].total_cmp(&b[0]));
        assert!((centers[0][0] - 12.0).abs() < 1.0);
        assert!((centers[1][0] - 198.0).abs() < 1.0);
        assert_eq!(clustering.labels.len(), 100);
    }

    #[test]
    fn test_k_capped_at_point_count() {
        let points = vec![[1.0, 2.0, 3.0], [250.0, 250.0, 250.0]];
        let clustering = kmeans(&points, &params(3)).unwrap();
        assert_eq!(clustering.centers.len(), 2);
        assert!(clustering.compactness < 1e-6);
    }

    #[test]
    fn test_nothing_to_cluster() {
        assert!(kmeans(&[], &params(3)).is_none());
        assert!(kmeans(&[[0.0; 3]], &params(0)).is_none());
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let points = two_blobs();
        let a = kmeans(&points, &params(3)).unwrap();
        let b = kmeans(&points, &params(3)).unwrap();
        assert_eq!(a.centers, b.centers);
        assert_eq!(a.labels, b.labels);
    }

    #[test]
    fn test_single_color_collapses() {
        let points = vec![[64.0, 128.0, 192.0]; 20];
        let clustering = kmeans(&points, &params(3)).unwrap();
        assert_eq!(clustering.centers.len(), 3);
        for center in &clustering.centers {
            assert_eq!(*center, [64.0, 128.0, 192.0]);
        }
        assert_eq!(clustering.compactness, 0.0);
    }
}
