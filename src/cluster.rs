//! Clustering of activation and embedding vectors
//!
//! Ward agglomerative clustering (kodama) for ConceptX, k-means (linfa) for
//! the silhouette variant of input topic coherence.

use anyhow::{Context, Result};
use kodama::{linkage, Method};
use linfa::prelude::*;
use linfa_clustering::KMeans;
use ndarray::{Array2, ArrayView1};
use rand::rngs::StdRng;
use rand::SeedableRng;

fn euclidean(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

/// Pairwise distances in kodama's condensed order (i < j, row-major)
fn condensed_distances(points: &Array2<f64>) -> Vec<f64> {
    let n = points.nrows();
    let mut out = Vec::with_capacity(n * n.saturating_sub(1) / 2);
    for i in 0..n {
        for j in (i + 1)..n {
            out.push(euclidean(points.row(i), points.row(j)));
        }
    }
    out
}

fn find(parent: &mut [usize], mut x: usize) -> usize {
    while parent[x] != x {
        parent[x] = parent[parent[x]];
        x = parent[x];
    }
    x
}

/// Cut a Ward dendrogram into `k` flat clusters; labels are `0..k` in
/// order of first appearance.
pub fn ward_labels(points: &Array2<f64>, k: usize) -> Result<Vec<usize>> {
    let n = points.nrows();
    anyhow::ensure!(k > 0, "Number of clusters must be positive");
    anyhow::ensure!(n >= k, "Cannot form {k} clusters from {n} points");
    if n == 1 {
        return Ok(vec![0]);
    }

    let mut condensed = condensed_distances(points);
    let dendrogram = linkage(&mut condensed, n, Method::Ward);

    // step i of the dendrogram creates cluster n + i
    let mut parent: Vec<usize> = (0..2 * n - 1).collect();
    for (i, step) in dendrogram.steps().iter().take(n - k).enumerate() {
        parent[step.cluster1] = n + i;
        parent[step.cluster2] = n + i;
    }

    let mut relabel = std::collections::HashMap::new();
    let mut labels = Vec::with_capacity(n);
    for point in 0..n {
        let root = find(&mut parent, point);
        let next = relabel.len();
        labels.push(*relabel.entry(root).or_insert(next));
    }
    Ok(labels)
}

/// Seeded k-means labels
pub fn kmeans_labels(points: &Array2<f64>, k: usize, seed: u64) -> Result<Vec<usize>> {
    anyhow::ensure!(
        points.nrows() >= k,
        "Cannot form {k} clusters from {} points",
        points.nrows()
    );
    let dataset = DatasetBase::from(points.clone());
    let model = KMeans::params_with_rng(k, StdRng::seed_from_u64(seed))
        .max_n_iterations(300)
        .tolerance(1e-4)
        .fit(&dataset)
        .context("k-means failed")?;
    Ok(model.predict(points).to_vec())
}

/// Mean silhouette coefficient.
///
/// `None` unless there are between 2 and `n - 1` distinct labels.
/// Points alone in their cluster score 0.
pub fn silhouette_score(points: &Array2<f64>, labels: &[usize]) -> Option<f64> {
    let n = points.nrows();
    if n != labels.len() {
        return None;
    }
    let n_labels = labels.iter().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0usize; n_labels];
    for &l in labels {
        sizes[l] += 1;
    }
    let distinct = sizes.iter().filter(|&&s| s > 0).count();
    if distinct < 2 || distinct >= n {
        return None;
    }

    let mut total = 0.0;
    for i in 0..n {
        if sizes[labels[i]] == 1 {
            continue;
        }
        let mut sums = vec![0.0; n_labels];
        for j in 0..n {
            if i != j {
                sums[labels[j]] += euclidean(points.row(i), points.row(j));
            }
        }
        let a = sums[labels[i]] / (sizes[labels[i]] - 1) as f64;
        let b = (0..n_labels)
            .filter(|&l| l != labels[i] && sizes[l] > 0)
            .map(|l| sums[l] / sizes[l] as f64)
            .fold(f64::INFINITY, f64::min);
        let denom = a.max(b);
        if denom > 0.0 {
            total += (b - a) / denom;
        }
    }
    Some(total / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> Array2<f64> {
        array![
            [0.0, 0.0],
            [0.1, 0.0],
            [0.0, 0.1],
            [10.0, 10.0],
            [10.1, 10.0],
            [10.0, 10.1],
        ]
    }

    #[test]
    fn test_ward_separates_blobs() {
        let labels = ward_labels(&two_blobs(), 2).unwrap();
        assert_eq!(labels, vec![0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_ward_k_equals_n() {
        let labels = ward_labels(&two_blobs(), 6).unwrap();
        assert_eq!(labels, vec![0, 1, 2, 3, 4, 5]);
        assert!(ward_labels(&two_blobs(), 7).is_err());
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let labels = kmeans_labels(&two_blobs(), 2, 0).unwrap();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[3], labels[5]);
        assert_ne!(labels[0], labels[3]);
    }

    #[test]
    fn test_silhouette() {
        let score = silhouette_score(&two_blobs(), &[0, 0, 0, 1, 1, 1]).unwrap();
        assert!(score > 0.9 && score <= 1.0);

        assert!(silhouette_score(&two_blobs(), &[0; 6]).is_none());
        assert!(silhouette_score(&two_blobs(), &[0, 1, 2, 3, 4, 5]).is_none());
    }
}
