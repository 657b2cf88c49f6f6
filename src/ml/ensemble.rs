//! Multi-class gradient-boosted decision trees.
//!
//! One regression tree per class per boosting round, fitted on the softmax
//! cross-entropy gradients with second-order (Newton) leaf values:
//!
//! - leaf value `-G / (H + lambda)`
//! - split gain `½ (G_L²/(H_L+λ) + G_R²/(H_R+λ) - G²/(H+λ)) - gamma`
//!
//! Split candidates come from per-feature histograms with at most
//! `max_bins` bins. A sample goes left when `x <= threshold`.

use crate::error::{AppError, Result};
use crate::ml::classifier::{ClassProbabilities, ClassifierOutput, DepthClassifier, ProbabilityCapability};
use crate::ml::models::{DepthClass, EnsembleParams, ModelType, Objective, TrainingDataset, NUM_CLASSES};
use ndarray::{Array2, ArrayView1, Axis};
use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

const MIN_HESSIAN: f64 = 1e-16;
const MIN_SPLIT_GAIN: f64 = 1e-12;
const MIN_PRIOR: f64 = 1e-12;

/// Node in a regression tree
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Feature index to split on (negative = leaf)
    pub feature: i32,
    /// Samples with `x[feature] <= threshold` go left
    pub threshold: f64,
    pub left: u32,
    pub right: u32,
    /// Leaf output (raw score before shrinkage)
    pub value: f64,
}

impl TreeNode {
    pub fn leaf(value: f64) -> Self {
        Self {
            feature: -1,
            threshold: 0.0,
            left: 0,
            right: 0,
            value,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.feature < 0
    }
}

/// Regression tree stored as a flat node array; node 0 is the root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<TreeNode>", into = "Vec<TreeNode>")]
pub struct RegressionTree {
    nodes: Vec<TreeNode>,
}

impl RegressionTree {
    /// Build from nodes; children must point forward so traversal terminates
    pub fn from_nodes(nodes: Vec<TreeNode>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(AppError::Model("regression tree has no nodes".to_string()));
        }
        for (i, node) in nodes.iter().enumerate() {
            if !node.value.is_finite() {
                return Err(AppError::Model(format!("node {} has a non-finite value", i)));
            }
            if node.is_leaf() {
                continue;
            }
            if !node.threshold.is_finite() {
                return Err(AppError::Model(format!("node {} has a non-finite threshold", i)));
            }
            for child in [node.left as usize, node.right as usize] {
                if child <= i || child >= nodes.len() {
                    return Err(AppError::Model(format!(
                        "node {} has invalid child index {}",
                        i, child
                    )));
                }
            }
        }
        Ok(Self { nodes })
    }

    pub fn nodes(&self) -> &[TreeNode] {
        &self.nodes
    }

    /// Largest feature index referenced by a split
    pub fn max_feature(&self) -> Option<usize> {
        self.nodes
            .iter()
            .filter(|n| !n.is_leaf())
            .map(|n| n.feature as usize)
            .max()
    }

    /// Raw leaf value for one sample
    pub fn predict(&self, x: ArrayView1<f64>) -> f64 {
        let mut idx = 0usize;
        loop {
            let node = &self.nodes[idx];
            if node.is_leaf() {
                return node.value;
            }
            idx = if x[node.feature as usize] <= node.threshold {
                node.left as usize
            } else {
                node.right as usize
            };
        }
    }
}

impl TryFrom<Vec<TreeNode>> for RegressionTree {
    type Error = AppError;

    fn try_from(nodes: Vec<TreeNode>) -> Result<Self> {
        Self::from_nodes(nodes)
    }
}

impl From<RegressionTree> for Vec<TreeNode> {
    fn from(tree: RegressionTree) -> Self {
        tree.nodes
    }
}

/// Column-major bin indices plus the cut points that define them.
/// Bin `b` of feature `f` holds values in `(cuts[f][b-1], cuts[f][b]]`.
struct BinnedMatrix {
    cuts: Vec<Vec<f64>>,
    bins: Vec<Vec<u16>>,
}

impl BinnedMatrix {
    fn new(features: &Array2<f64>, max_bins: usize) -> Self {
        let (cuts, bins) = features
            .axis_iter(Axis(1))
            .map(|column| {
                let cuts = bin_cuts(column, max_bins);
                let bins = column
                    .iter()
                    .map(|x| cuts.partition_point(|c| c < x) as u16)
                    .collect();
                (cuts, bins)
            })
            .unzip();
        Self { cuts, bins }
    }

    fn n_bins(&self, feature: usize) -> usize {
        self.cuts[feature].len() + 1
    }
}

fn bin_cuts(column: ArrayView1<f64>, max_bins: usize) -> Vec<f64> {
    let mut sorted = column.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut distinct = sorted.clone();
    distinct.dedup();
    if distinct.len() < 2 {
        return Vec::new();
    }

    if distinct.len() <= max_bins {
        return distinct.windows(2).map(|w| 0.5 * (w[0] + w[1])).collect();
    }

    let max = distinct[distinct.len() - 1];
    let mut cuts: Vec<f64> = (1..max_bins)
        .map(|k| sorted[k * sorted.len() / max_bins])
        .filter(|c| *c < max)
        .collect();
    cuts.dedup();
    cuts
}

#[derive(Debug, Clone, Copy)]
struct Split {
    feature: usize,
    bin: usize,
    gain: f64,
}

struct TreeBuilder<'a> {
    binned: &'a BinnedMatrix,
    grad: &'a [f64],
    hess: &'a [f64],
    columns: &'a [usize],
    params: &'a EnsembleParams,
    nodes: Vec<TreeNode>,
}

impl TreeBuilder<'_> {
    fn leaf_value(&self, g: f64, h: f64) -> f64 {
        -g / (h + self.params.lambda)
    }

    fn grow(&mut self, rows: &[usize], depth: usize) -> usize {
        let (g, h) = rows
            .iter()
            .fold((0.0, 0.0), |(g, h), &r| (g + self.grad[r], h + self.hess[r]));

        let index = self.nodes.len();
        self.nodes.push(TreeNode::leaf(self.leaf_value(g, h)));

        if depth >= self.params.max_depth || rows.len() < 2 {
            return index;
        }
        let Some(split) = self.best_split(rows, g, h) else {
            return index;
        };

        let column = &self.binned.bins[split.feature];
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .partition(|&&r| (column[r] as usize) <= split.bin);

        let left = self.grow(&left_rows, depth + 1);
        let right = self.grow(&right_rows, depth + 1);

        self.nodes[index] = TreeNode {
            feature: split.feature as i32,
            threshold: self.binned.cuts[split.feature][split.bin],
            left: left as u32,
            right: right as u32,
            value: self.nodes[index].value,
        };
        index
    }

    fn best_split(&self, rows: &[usize], g_total: f64, h_total: f64) -> Option<Split> {
        let lambda = self.params.lambda;
        let min_child_weight = self.params.min_child_weight;
        let parent = g_total * g_total / (h_total + lambda);
        let mut best: Option<Split> = None;

        for &feature in self.columns {
            let n_bins = self.binned.n_bins(feature);
            if n_bins < 2 {
                continue;
            }

            let column = &self.binned.bins[feature];
            let mut hist = vec![(0.0f64, 0.0f64, 0usize); n_bins];
            for &r in rows {
                let slot = &mut hist[column[r] as usize];
                slot.0 += self.grad[r];
                slot.1 += self.hess[r];
                slot.2 += 1;
            }

            let (mut gl, mut hl, mut nl) = (0.0, 0.0, 0usize);
            for (bin, (g, h, n)) in hist.iter().enumerate().take(n_bins - 1) {
                gl += g;
                hl += h;
                nl += n;
                let (gr, hr, nr) = (g_total - gl, h_total - hl, rows.len() - nl);
                if nl == 0 || nr == 0 || hl < min_child_weight || hr < min_child_weight {
                    continue;
                }

                let gain = 0.5 * (gl * gl / (hl + lambda) + gr * gr / (hr + lambda) - parent)
                    - self.params.gamma;
                if gain > MIN_SPLIT_GAIN && best.map_or(true, |s| gain > s.gain) {
                    best = Some(Split { feature, bin, gain });
                }
            }
        }

        best
    }
}

/// Trained multi-class boosted ensemble
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradientBoostedEnsemble {
    n_features: usize,
    learning_rate: f64,
    base_score: Vec<f64>,
    objective: Objective,
    /// `rounds[r][k]` is the class-`k` tree of round `r`
    rounds: Vec<Vec<RegressionTree>>,
}

impl GradientBoostedEnsemble {
    /// Assemble an ensemble from already-trained trees
    pub fn from_trees(
        n_features: usize,
        learning_rate: f64,
        base_score: Vec<f64>,
        objective: Objective,
        rounds: Vec<Vec<RegressionTree>>,
    ) -> Result<Self> {
        let ensemble = Self {
            n_features,
            learning_rate,
            base_score,
            objective,
            rounds,
        };
        ensemble.validate()?;
        Ok(ensemble)
    }

    fn validate(&self) -> Result<()> {
        if self.n_features == 0 {
            return Err(AppError::Model("ensemble has zero input features".to_string()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(AppError::Model(format!(
                "invalid learning rate {}",
                self.learning_rate
            )));
        }
        if self.base_score.len() != NUM_CLASSES || self.base_score.iter().any(|s| !s.is_finite()) {
            return Err(AppError::Model(format!(
                "base score must hold {} finite values",
                NUM_CLASSES
            )));
        }
        for (r, round) in self.rounds.iter().enumerate() {
            if round.len() != NUM_CLASSES {
                return Err(AppError::Model(format!(
                    "round {} has {} trees, expected {}",
                    r,
                    round.len(),
                    NUM_CLASSES
                )));
            }
            if let Some(f) = round.iter().filter_map(|t| t.max_feature()).max() {
                if f >= self.n_features {
                    return Err(AppError::Model(format!(
                        "round {} splits on feature {} of {}",
                        r, f, self.n_features
                    )));
                }
            }
        }
        Ok(())
    }

    /// Fit on a (scaled) training set using its sample weights
    pub fn fit(dataset: &TrainingDataset, params: &EnsembleParams, seed: u64) -> Result<Self> {
        let n = dataset.n_samples;
        let n_features = dataset.n_features;
        if n == 0 || n_features == 0 {
            return Err(AppError::Validation(
                "cannot fit an ensemble on an empty training set".to_string(),
            ));
        }
        if dataset.features.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Validation(
                "training features contain non-finite values".to_string(),
            ));
        }
        let weights = dataset.weights.to_vec();
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(AppError::Validation(
                "sample weights must be finite and non-negative".to_string(),
            ));
        }
        let total_weight: f64 = weights.iter().sum();
        if total_weight <= 0.0 {
            return Err(AppError::Validation("sample weights sum to zero".to_string()));
        }

        let labels: Vec<usize> = dataset.labels.iter().map(|c| c.index()).collect();

        let mut prior = [0.0; NUM_CLASSES];
        for (&y, &w) in labels.iter().zip(&weights) {
            prior[y] += w;
        }
        let base_score: Vec<f64> = prior
            .iter()
            .map(|p| (p / total_weight).max(MIN_PRIOR).ln())
            .collect();

        let binned = BinnedMatrix::new(&dataset.features, params.max_bins);
        let n_columns = ((params.colsample_bytree * n_features as f64).round() as usize)
            .clamp(1, n_features);

        let mut scores = Array2::from_shape_fn((n, NUM_CLASSES), |(_, k)| base_score[k]);
        let mut rounds = Vec::with_capacity(params.n_estimators);

        tracing::info!(
            n_samples = n,
            n_features,
            n_estimators = params.n_estimators,
            max_depth = params.max_depth,
            "Fitting gradient-boosted ensemble"
        );

        for round in 0..params.n_estimators {
            let probs = softmax_rows(&scores);

            let mut row_rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(round as u64));
            let mut rows: Vec<usize> = if params.subsample >= 1.0 {
                (0..n).collect()
            } else {
                (0..n).filter(|_| row_rng.gen_bool(params.subsample)).collect()
            };
            if rows.is_empty() {
                rows = (0..n).collect();
            }

            let trees: Vec<RegressionTree> = (0..NUM_CLASSES)
                .into_par_iter()
                .map(|k| {
                    let (grad, hess): (Vec<f64>, Vec<f64>) = (0..n)
                        .map(|i| {
                            let p = probs[[i, k]];
                            let y = if labels[i] == k { 1.0 } else { 0.0 };
                            let w = weights[i];
                            (w * (p - y), (w * p * (1.0 - p)).max(MIN_HESSIAN))
                        })
                        .unzip();

                    let stream = (round * NUM_CLASSES + k) as u64 + 1;
                    let mut col_rng = ChaCha8Rng::seed_from_u64(
                        seed ^ stream.wrapping_mul(0x9E37_79B9_7F4A_7C15),
                    );
                    let mut columns = index::sample(&mut col_rng, n_features, n_columns).into_vec();
                    columns.sort_unstable();

                    let mut builder = TreeBuilder {
                        binned: &binned,
                        grad: &grad,
                        hess: &hess,
                        columns: &columns,
                        params,
                        nodes: Vec::new(),
                    };
                    builder.grow(&rows, 0);
                    RegressionTree::from_nodes(builder.nodes)
                })
                .collect::<Result<_>>()?;

            for (k, tree) in trees.iter().enumerate() {
                for (i, row) in dataset.features.axis_iter(Axis(0)).enumerate() {
                    scores[[i, k]] += params.learning_rate * tree.predict(row);
                }
            }
            rounds.push(trees);

            if (round + 1) % 50 == 0 || round + 1 == params.n_estimators {
                tracing::debug!(
                    round = round + 1,
                    train_log_loss = weighted_log_loss(&scores, &labels, &weights, total_weight),
                    "Boosting progress"
                );
            }
        }

        Self::from_trees(n_features, params.learning_rate, base_score, params.objective, rounds)
    }

    /// Input dimensionality
    pub fn n_features(&self) -> usize {
        self.n_features
    }

    pub fn n_rounds(&self) -> usize {
        self.rounds.len()
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    /// Raw per-class scores (log-odds) for one sample
    pub fn raw_scores(&self, x: ArrayView1<f64>) -> Result<[f64; NUM_CLASSES]> {
        if x.len() != self.n_features {
            return Err(AppError::DimensionMismatch {
                expected: self.n_features,
                actual: x.len(),
            });
        }
        let mut scores = [0.0; NUM_CLASSES];
        scores.copy_from_slice(&self.base_score);
        for round in &self.rounds {
            for (score, tree) in scores.iter_mut().zip(round) {
                *score += self.learning_rate * tree.predict(x);
            }
        }
        Ok(scores)
    }

    /// Class distribution for one sample, regardless of declared objective
    pub fn predict_proba(&self, x: ArrayView1<f64>) -> Result<ClassProbabilities> {
        ClassProbabilities::from_logits(&self.raw_scores(x)?)
    }

    pub fn predict(&self, x: ArrayView1<f64>) -> Result<DepthClass> {
        self.predict_proba(x)?.argmax()
    }

    /// Number of splits per feature across all trees
    pub fn feature_split_counts(&self) -> Vec<usize> {
        let mut counts = vec![0usize; self.n_features];
        for tree in self.rounds.iter().flatten() {
            for node in tree.nodes().iter().filter(|n| !n.is_leaf()) {
                counts[node.feature as usize] += 1;
            }
        }
        counts
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Decode and re-validate a serialized ensemble
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let ensemble: Self = bincode::deserialize(bytes)?;
        ensemble.validate()?;
        Ok(ensemble)
    }
}

impl DepthClassifier for GradientBoostedEnsemble {
    fn classify(&self, scaled: ArrayView1<f64>) -> Result<ClassifierOutput> {
        let probabilities = self.predict_proba(scaled)?;
        match self.capability() {
            ProbabilityCapability::Probabilities => ClassifierOutput::from_probabilities(probabilities),
            ProbabilityCapability::LabelOnly => Ok(ClassifierOutput::label_only(probabilities.argmax()?)),
        }
    }

    fn capability(&self) -> ProbabilityCapability {
        match self.objective {
            Objective::SoftProb => ProbabilityCapability::Probabilities,
            Objective::Softmax => ProbabilityCapability::LabelOnly,
        }
    }

    fn model_type(&self) -> ModelType {
        ModelType::GradientBoosting
    }

    fn n_features(&self) -> usize {
        self.n_features
    }
}

fn softmax_rows(scores: &Array2<f64>) -> Array2<f64> {
    let mut probs = scores.clone();
    for mut row in probs.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        row.mapv_inplace(|s| (s - max).exp());
        let total = row.sum();
        row.mapv_inplace(|p| p / total);
    }
    probs
}

fn weighted_log_loss(scores: &Array2<f64>, labels: &[usize], weights: &[f64], total_weight: f64) -> f64 {
    let probs = softmax_rows(scores);
    labels
        .iter()
        .zip(weights)
        .enumerate()
        .map(|(i, (&y, &w))| -w * probs[[i, y]].max(MIN_PRIOR).ln())
        .sum::<f64>()
        / total_weight
}
