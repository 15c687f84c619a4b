//! Internal cluster validity indices.
//!
//! Every index returns `None` when it is undefined for the given labelling.
//! That covers fewer than two populated clusters, every sample sitting in its
//! own cluster and, for Calinski-Harabasz, zero within-cluster dispersion.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1};

use super::{ClusterError, MetricName, QualityMetrics, squared_distance};

fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    squared_distance(a, b).sqrt()
}

/// Groups row indices by label, dropping labels with no rows.
fn members(labels: &[usize]) -> BTreeMap<usize, Vec<usize>> {
    let mut groups: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (row, &label) in labels.iter().enumerate() {
        groups.entry(label).or_default().push(row);
    }
    groups
}

fn centroid(data: &Array2<f64>, rows: &[usize]) -> Array1<f64> {
    let mut sum = Array1::<f64>::zeros(data.ncols());
    for &row in rows {
        sum += &data.row(row);
    }
    sum / rows.len() as f64
}

/// Mean silhouette coefficient. Singleton clusters contribute 0.
#[must_use]
pub fn silhouette(data: &Array2<f64>, labels: &[usize]) -> Option<f64> {
    let n = data.nrows();
    let groups = members(labels);
    if groups.len() < 2 || groups.len() >= n {
        return None;
    }

    let mut total = 0.0;
    for i in 0..n {
        let own = labels[i];
        let own_rows = &groups[&own];
        if own_rows.len() == 1 {
            continue;
        }

        let a = own_rows
            .iter()
            .filter(|&&j| j != i)
            .map(|&j| euclidean(data.row(i), data.row(j)))
            .sum::<f64>()
            / (own_rows.len() - 1) as f64;

        let b = groups
            .iter()
            .filter(|(label, _)| **label != own)
            .map(|(_, rows)| {
                rows.iter()
                    .map(|&j| euclidean(data.row(i), data.row(j)))
                    .sum::<f64>()
                    / rows.len() as f64
            })
            .fold(f64::INFINITY, f64::min);

        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }

    Some(total / n as f64)
}

/// Calinski-Harabasz variance ratio.
#[must_use]
pub fn calinski_harabasz(data: &Array2<f64>, labels: &[usize]) -> Option<f64> {
    let n = data.nrows();
    let groups = members(labels);
    let k = groups.len();
    if k < 2 || k >= n {
        return None;
    }

    let all_rows: Vec<usize> = (0..n).collect();
    let overall = centroid(data, &all_rows);

    let mut between = 0.0;
    let mut within = 0.0;
    for rows in groups.values() {
        let center = centroid(data, rows);
        between += rows.len() as f64 * squared_distance(center.view(), overall.view());
        within += rows
            .iter()
            .map(|&row| squared_distance(data.row(row), center.view()))
            .sum::<f64>();
    }

    if within == 0.0 {
        return None;
    }
    Some(between * (n - k) as f64 / (within * (k - 1) as f64))
}

/// Davies-Bouldin index. Coincident centroids do not contribute a ratio.
#[must_use]
pub fn davies_bouldin(data: &Array2<f64>, labels: &[usize]) -> Option<f64> {
    let groups = members(labels);
    let k = groups.len();
    if k < 2 || k >= data.nrows() {
        return None;
    }

    let centers: Vec<Array1<f64>> = groups.values().map(|rows| centroid(data, rows)).collect();
    let scatter: Vec<f64> = groups
        .values()
        .zip(&centers)
        .map(|(rows, center)| {
            rows.iter()
                .map(|&row| euclidean(data.row(row), center.view()))
                .sum::<f64>()
                / rows.len() as f64
        })
        .collect();

    let mut total = 0.0;
    for i in 0..k {
        let mut worst = 0.0_f64;
        for j in 0..k {
            if i == j {
                continue;
            }
            let separation = euclidean(centers[i].view(), centers[j].view());
            if separation > 0.0 {
                worst = worst.max((scatter[i] + scatter[j]) / separation);
            }
        }
        total += worst;
    }

    Some(total / k as f64)
}

/// Computes every defined metric for a labelling.
pub fn evaluate(data: &Array2<f64>, labels: &[usize]) -> Result<QualityMetrics, ClusterError> {
    if labels.len() != data.nrows() {
        return Err(ClusterError::MetricExtraction(format!(
            "{} labels for {} rows",
            labels.len(),
            data.nrows()
        )));
    }

    let mut metrics = QualityMetrics::new();
    let values = [
        (MetricName::Silhouette, silhouette(data, labels)),
        (MetricName::CalinskiHarabasz, calinski_harabasz(data, labels)),
        (MetricName::DaviesBouldin, davies_bouldin(data, labels)),
    ];
    for (name, value) in values {
        match value {
            Some(v) if v.is_finite() => metrics.insert(name, v),
            Some(v) => {
                return Err(ClusterError::MetricExtraction(format!("{name} evaluated to {v}")));
            }
            None => {}
        }
    }
    Ok(metrics)
}
