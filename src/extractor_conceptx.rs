//! ConceptX: Ward clustering of token representations
//!
//! Hidden states of the first `ConceptX_max_token` token positions are
//! clustered into `ConceptX_clusters` groups; each cluster centroid is a
//! concept and a token's activation is its projection on the centroid.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use candle_core::{Device, Tensor};
use ndarray::{Array2, Axis};
use tracing::info;

use crate::cluster::ward_labels;
use crate::config::Config;
use crate::dataloader::TokenLoader;
use crate::extractors::{
    collect_hidden, project, read_checkpoint, take_tensor, to_array2, Concept, ConceptExtractor,
};
use crate::hooks::HookPoint;
use crate::model::HookedModel;

pub struct ConceptX {
    hook: HookPoint,
    act_size: usize,
    max_tokens: usize,
    n_clusters: usize,
    concepts: Option<Tensor>,
}

impl ConceptX {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            hook: cfg.hook_point()?,
            act_size: cfg.act_size()?,
            max_tokens: cfg.conceptx_max_token,
            n_clusters: cfg.conceptx_clusters,
            concepts: None,
        })
    }

    pub fn load(dir: &Path, cfg: &Config, device: &Device) -> Result<Self> {
        let (meta, mut tensors) = read_checkpoint(dir, "conceptx", device)?;
        Ok(Self {
            hook: meta.act_name.parse()?,
            act_size: meta.act_size,
            max_tokens: cfg.conceptx_max_token,
            n_clusters: meta.n_concepts,
            concepts: Some(take_tensor(&mut tensors, "concepts")?),
        })
    }
}

/// Mean of the rows sharing each label, `[k, d]`
fn centroids(points: &Array2<f64>, labels: &[usize], k: usize) -> Result<Vec<f32>> {
    let d = points.ncols();
    let mut out = Vec::with_capacity(k * d);
    for cluster in 0..k {
        let members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, &l)| l == cluster)
            .map(|(i, _)| i)
            .collect();
        let mean = points
            .select(Axis(0), &members)
            .mean_axis(Axis(0))
            .ok_or_else(|| anyhow::anyhow!("Cluster {cluster} is empty"))?;
        out.extend(mean.iter().map(|&v| v as f32));
    }
    Ok(out)
}

impl ConceptExtractor for ConceptX {
    fn code(&self) -> &'static str {
        "conceptx"
    }

    fn hook(&self) -> &HookPoint {
        &self.hook
    }

    fn extract_concepts(&mut self, model: &HookedModel, loader: &mut TokenLoader) -> Result<()> {
        let (hidden, _) = collect_hidden(model, loader, &self.hook, self.max_tokens)?;
        let points = to_array2(&hidden)?;
        anyhow::ensure!(
            points.nrows() >= self.n_clusters,
            "Only {} token representations for {} clusters",
            points.nrows(),
            self.n_clusters
        );
        info!(
            "Clustering {} token representations into {} clusters",
            points.nrows(),
            self.n_clusters
        );

        let labels = ward_labels(&points, self.n_clusters)?;
        let flat = centroids(&points, &labels, self.n_clusters)?;
        self.concepts = Some(Tensor::from_vec(
            flat,
            (self.n_clusters, points.ncols()),
            model.device(),
        )?);
        Ok(())
    }

    fn concepts(&self) -> Result<Tensor> {
        self.concepts
            .clone()
            .ok_or_else(|| anyhow::anyhow!("ConceptX has no concepts yet, run extract_concepts"))
    }

    fn n_concepts(&self) -> usize {
        self.n_clusters
    }

    fn act_size(&self) -> usize {
        self.act_size
    }

    fn activations_from_hidden(&self, hidden: &Tensor, concept: &Concept) -> Result<Tensor> {
        project(hidden, &concept.vector)
    }

    fn tensors(&self) -> Result<HashMap<String, Tensor>> {
        Ok(HashMap::from([("concepts".to_string(), self.concepts()?)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_centroids() {
        let points = array![[0.0, 0.0], [2.0, 2.0], [10.0, 0.0]];
        let c = centroids(&points, &[0, 0, 1], 2).unwrap();
        assert_eq!(c, vec![1.0, 1.0, 10.0, 0.0]);
    }

    #[test]
    fn test_empty_cluster_is_error() {
        let points = array![[0.0, 0.0], [2.0, 2.0]];
        assert!(centroids(&points, &[0, 0], 2).is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let concepts = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        let x = ConceptX {
            hook: HookPoint::MlpPost(1),
            act_size: 2,
            max_tokens: 10,
            n_clusters: 2,
            concepts: Some(concepts),
        };
        x.save(dir.path()).unwrap();

        let loaded = ConceptX::load(dir.path(), &Config::default(), &Device::Cpu).unwrap();
        assert_eq!(loaded.n_concepts(), 2);
        assert_eq!(loaded.hook(), &HookPoint::MlpPost(1));
        let c = loaded.concept(1).unwrap();
        assert_eq!(c.vector.to_vec1::<f32>().unwrap(), vec![0.0, 1.0]);
    }
}
