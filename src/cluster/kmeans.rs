use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{
    ClusterError, ClusterExperiment, ExperimentRun, FitContext, FittedModel, nearest_centroid,
    quality, squared_distance,
};
use crate::table::FeatureTable;

pub const ALGORITHM: &str = "kmeans";

/// Training knobs shared by every restart.
#[derive(Debug, Clone, PartialEq)]
pub struct KMeansSettings {
    pub seed: u64,
    pub max_iterations: usize,
    /// Number of k-means++ restarts; the run with the lowest inertia wins.
    pub n_init: usize,
    /// Convergence threshold on the summed squared centroid shift.
    pub tolerance: f64,
}

impl Default for KMeansSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            max_iterations: 300,
            n_init: 10,
            tolerance: 1e-4,
        }
    }
}

/// Lloyd's k-means with k-means++ seeding over a dense matrix.
#[derive(Debug, Clone)]
pub struct KMeans {
    pub centroids: Array2<f64>,
    pub assignments: Vec<usize>,
    pub inertia: f64,
    pub iterations: usize,
}

impl KMeans {
    /// Fits `k` clusters. The same data, `k` and settings always produce the same result.
    pub fn fit(data: &Array2<f64>, k: usize, settings: &KMeansSettings) -> Result<Self, ClusterError> {
        let n = data.nrows();
        if n == 0 {
            return Err(ClusterError::EmptyFeatures);
        }
        if k == 0 || k > n {
            return Err(ClusterError::InvalidClusterCount { k, samples: n });
        }
        if data.iter().any(|v| !v.is_finite()) {
            return Err(ClusterError::FitFailure(
                "feature matrix contains non-finite values".to_string(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(settings.seed);
        let mut best: Option<Self> = None;
        for _ in 0..settings.n_init.max(1) {
            let run = Self::single_run(data, k, settings, &mut rng);
            if best.as_ref().is_none_or(|b| run.inertia < b.inertia) {
                best = Some(run);
            }
        }

        best.ok_or_else(|| ClusterError::FitFailure("no k-means restart completed".to_string()))
    }

    fn single_run(data: &Array2<f64>, k: usize, settings: &KMeansSettings, rng: &mut StdRng) -> Self {
        let n = data.nrows();
        let dim = data.ncols();
        let mut centroids = plus_plus_init(data, k, rng);
        let mut assignments = vec![0; n];
        let mut iterations = 0;

        while iterations < settings.max_iterations {
            iterations += 1;

            // E-step: nearest centroid for every point
            for (i, point) in data.rows().into_iter().enumerate() {
                assignments[i] = nearest_centroid(point, &centroids).0;
            }

            // M-step: recompute centroids
            let mut sums = Array2::<f64>::zeros((k, dim));
            let mut counts = vec![0_usize; k];
            for (point, &cluster) in data.rows().into_iter().zip(&assignments) {
                let mut sum = sums.row_mut(cluster);
                sum += &point;
                counts[cluster] += 1;
            }

            let mut updated = centroids.clone();
            let mut donors = if counts.contains(&0) {
                farthest_points(data, &centroids, &assignments)
            } else {
                Vec::new()
            }
            .into_iter();
            for j in 0..k {
                if counts[j] > 0 {
                    updated.row_mut(j).assign(&(&sums.row(j) / counts[j] as f64));
                } else if let Some(donor) = donors.next() {
                    // Empty cluster: move it onto the worst-served point
                    updated.row_mut(j).assign(&data.row(donor));
                }
            }

            let shift: f64 = centroids
                .rows()
                .into_iter()
                .zip(updated.rows())
                .map(|(old, new)| squared_distance(old, new))
                .sum();
            centroids = updated;
            if shift <= settings.tolerance {
                break;
            }
        }

        let mut inertia = 0.0;
        for (i, point) in data.rows().into_iter().enumerate() {
            let (label, dist) = nearest_centroid(point, &centroids);
            assignments[i] = label;
            inertia += dist;
        }

        Self {
            centroids,
            assignments,
            inertia,
            iterations,
        }
    }
}

/// k-means++ seeding: each next centroid is drawn with probability proportional
/// to its squared distance from the closest centroid chosen so far.
fn plus_plus_init(data: &Array2<f64>, k: usize, rng: &mut StdRng) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::<f64>::zeros((k, data.ncols()));

    let first = rng.random_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));
    let mut closest: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|point| squared_distance(point, data.row(first)))
        .collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let pick = if total > 0.0 {
            weighted_pick(&closest, rng.random::<f64>() * total)
        } else {
            rng.random_range(0..n)
        };
        centroids.row_mut(c).assign(&data.row(pick));

        let chosen: ArrayView1<f64> = centroids.row(c);
        for (slot, point) in closest.iter_mut().zip(data.rows()) {
            *slot = slot.min(squared_distance(point, chosen));
        }
    }

    centroids
}

fn weighted_pick(weights: &[f64], mut target: f64) -> usize {
    for (idx, weight) in weights.iter().enumerate() {
        if target < *weight {
            return idx;
        }
        target -= weight;
    }
    weights
        .iter()
        .rposition(|w| *w > 0.0)
        .unwrap_or(weights.len() - 1)
}

/// Point indices ordered from farthest to nearest to their assigned centroid.
fn farthest_points(data: &Array2<f64>, centroids: &Array2<f64>, assignments: &[usize]) -> Vec<usize> {
    let mut distances: Vec<(usize, f64)> = data
        .rows()
        .into_iter()
        .zip(assignments)
        .enumerate()
        .map(|(idx, (point, &cluster))| (idx, squared_distance(point, centroids.row(cluster))))
        .collect();
    distances.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    distances.into_iter().map(|(idx, _)| idx).collect()
}

/// Production experiment: fit context setup, seeded k-means, then quality metrics
/// on the training partition.
#[derive(Debug, Clone, Default)]
pub struct KMeansExperiment {
    settings: KMeansSettings,
}

impl KMeansExperiment {
    #[must_use]
    pub fn new(settings: KMeansSettings) -> Self {
        Self { settings }
    }
}

impl ClusterExperiment for KMeansExperiment {
    fn fit(&self, features: &FeatureTable, k: usize) -> Result<ExperimentRun, ClusterError> {
        let context = FitContext::setup(features, self.settings.seed)?;
        let prepared = context.prepare(features)?;
        let fitted = KMeans::fit(&prepared, k, &self.settings)?;
        let metrics = quality::evaluate(&prepared, &fitted.assignments);

        tracing::debug!(
            k,
            samples = prepared.nrows(),
            inertia = fitted.inertia,
            iterations = fitted.iterations,
            "k-means fit completed"
        );

        Ok(ExperimentRun {
            model: FittedModel {
                algorithm: ALGORITHM.to_string(),
                features: context.columns.clone(),
                centroids: fitted.centroids,
                inertia: fitted.inertia,
                iterations: fitted.iterations,
            },
            context,
            labels: fitted.assignments,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MetricName;
    use ndarray::array;

    fn blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.2, 0.1],
            [0.1, 0.3],
            [8.0, 8.0],
            [8.2, 7.9],
            [7.9, 8.1],
        ]
    }

    #[test]
    fn separates_obvious_groups() {
        let result = KMeans::fit(&blobs(), 2, &KMeansSettings::default()).unwrap();
        let a = result.assignments[0];
        assert!(result.assignments[..3].iter().all(|&l| l == a));
        assert!(result.assignments[3..].iter().all(|&l| l != a));
        assert_eq!(result.centroids.nrows(), 2);
    }

    #[test]
    fn same_seed_gives_same_model() {
        let settings = KMeansSettings {
            seed: 7,
            ..KMeansSettings::default()
        };
        let first = KMeans::fit(&blobs(), 3, &settings).unwrap();
        let second = KMeans::fit(&blobs(), 3, &settings).unwrap();
        assert_eq!(first.centroids, second.centroids);
        assert_eq!(first.assignments, second.assignments);
    }

    #[test]
    fn rejects_impossible_cluster_counts() {
        let settings = KMeansSettings::default();
        assert!(matches!(
            KMeans::fit(&blobs(), 0, &settings),
            Err(ClusterError::InvalidClusterCount { k: 0, samples: 6 })
        ));
        assert!(matches!(
            KMeans::fit(&blobs(), 7, &settings),
            Err(ClusterError::InvalidClusterCount { k: 7, samples: 6 })
        ));
    }

    #[test]
    fn rejects_infinite_values() {
        let data = array![[0.0], [f64::INFINITY], [1.0]];
        assert!(matches!(
            KMeans::fit(&data, 2, &KMeansSettings::default()),
            Err(ClusterError::FitFailure(_))
        ));
    }

    #[test]
    fn duplicate_points_do_not_panic() {
        let data = array![[1.0, 1.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]];
        let result = KMeans::fit(&data, 3, &KMeansSettings::default()).unwrap();
        assert_eq!(result.centroids.nrows(), 3);
        assert_eq!(result.assignments.len(), 4);
        assert!(result.inertia.abs() < 1e-12);
    }

    #[test]
    fn experiment_reports_metrics_and_context() {
        let features = FeatureTable::new(vec!["x".into(), "y".into()], blobs()).unwrap();
        let run = KMeansExperiment::default().fit(&features, 2).unwrap();

        assert_eq!(run.model.algorithm, ALGORITHM);
        assert_eq!(run.model.num_clusters(), 2);
        assert_eq!(run.context.columns, vec!["x".to_string(), "y".to_string()]);
        let metrics = run.metrics.unwrap();
        assert!(metrics.get(MetricName::Silhouette).unwrap() > 0.9);
    }

    #[test]
    fn experiment_assign_labels_every_row() {
        let features = FeatureTable::new(vec!["x".into(), "y".into()], blobs()).unwrap();
        let experiment = KMeansExperiment::default();
        let run = experiment.fit(&features, 2).unwrap();

        let labels = experiment.assign(&run.context, &run.model, &features).unwrap();
        assert_eq!(labels, run.labels);
    }
}
