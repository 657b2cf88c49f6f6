//! Stacked-LSTM depth classifier.
//!
//! The standardized feature vector is fed as a short sequence, either one
//! step of N features or N steps of one feature. Architecture:
//! LSTM → dropout → LSTM (last state) → dropout → dense ReLU → dense (3).

use crate::error::{AppError, Result};
use crate::ml::classifier::{ClassProbabilities, ClassifierOutput, DepthClassifier, ProbabilityCapability};
use crate::ml::models::{ModelType, SequenceLayout, SequenceParams, TrainingDataset, NUM_CLASSES};
use candle_core::{DType, Device, Tensor, D};
use candle_nn::rnn::{lstm, LSTMConfig, LSTM, RNN};
use candle_nn::{linear, Linear, Module, Optimizer, VarBuilder, VarMap};
use ndarray::{Array2, ArrayView1};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const MIN_IMPROVEMENT: f64 = 1e-6;

/// Shape of the recurrent network, stored next to its weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceArchitecture {
    pub n_features: usize,
    pub layout: SequenceLayout,
    pub lstm1_units: usize,
    pub lstm2_units: usize,
    pub dense_units: usize,
    pub dropout: f32,
}

impl SequenceArchitecture {
    pub fn from_params(n_features: usize, params: &SequenceParams) -> Self {
        Self {
            n_features,
            layout: params.layout,
            lstm1_units: params.lstm1_units,
            lstm2_units: params.lstm2_units,
            dense_units: params.dense_units,
            dropout: params.dropout,
        }
    }

    /// (steps, features per step)
    pub fn input_shape(&self) -> (usize, usize) {
        match self.layout {
            SequenceLayout::SingleStep => (1, self.n_features),
            SequenceLayout::PerFeature => (self.n_features, 1),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.n_features == 0
            || self.lstm1_units == 0
            || self.lstm2_units == 0
            || self.dense_units == 0
        {
            return Err(AppError::Model(format!(
                "sequence architecture has a zero-sized layer: {:?}",
                self
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(AppError::Model(format!(
                "dropout {} must be in [0, 1)",
                self.dropout
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct SequenceNet {
    lstm1: LSTM,
    lstm2: LSTM,
    dense: Linear,
    output: Linear,
    dropout: f32,
}

impl SequenceNet {
    fn new(arch: &SequenceArchitecture, vb: VarBuilder) -> Result<Self> {
        let (_, step_features) = arch.input_shape();
        Ok(Self {
            lstm1: lstm(step_features, arch.lstm1_units, LSTMConfig::default(), vb.pp("lstm1"))?,
            lstm2: lstm(arch.lstm1_units, arch.lstm2_units, LSTMConfig::default(), vb.pp("lstm2"))?,
            dense: linear(arch.lstm2_units, arch.dense_units, vb.pp("dense"))?,
            output: linear(arch.dense_units, NUM_CLASSES, vb.pp("output"))?,
            dropout: arch.dropout,
        })
    }

    fn apply_dropout(&self, xs: Tensor, train: bool) -> Result<Tensor> {
        if train && self.dropout > 0.0 {
            Ok(candle_nn::ops::dropout(&xs, self.dropout)?)
        } else {
            Ok(xs)
        }
    }

    /// `xs`: (batch, steps, features per step) → logits (batch, 3)
    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let states = self.lstm1.seq(xs)?;
        let hidden = self.lstm1.states_to_tensor(&states)?;
        let hidden = self.apply_dropout(hidden, train)?;

        let states = self.lstm2.seq(&hidden)?;
        let last = states
            .last()
            .ok_or_else(|| AppError::Model("empty input sequence".to_string()))?
            .h()
            .clone();
        let last = self.apply_dropout(last, train)?;

        let dense = self.dense.forward(&last)?.relu()?;
        Ok(self.output.forward(&dense)?)
    }
}

/// Trained recurrent classifier; inference only
#[derive(Debug, Clone)]
pub struct SequenceClassifier {
    arch: SequenceArchitecture,
    net: SequenceNet,
    device: Device,
}

impl SequenceClassifier {
    /// Rebuild from the architecture and safetensors weight bytes
    pub fn from_safetensors(arch: SequenceArchitecture, weights: Vec<u8>) -> Result<Self> {
        arch.validate()?;
        let device = Device::Cpu;
        let vb = VarBuilder::from_buffered_safetensors(weights, DType::F32, &device)?;
        let net = SequenceNet::new(&arch, vb)?;
        Ok(Self { arch, net, device })
    }

    pub fn architecture(&self) -> &SequenceArchitecture {
        &self.arch
    }

    fn to_input(&self, rows: &[ArrayView1<f64>]) -> Result<Tensor> {
        let (steps, per_step) = self.arch.input_shape();
        let mut data = Vec::with_capacity(rows.len() * self.arch.n_features);
        for row in rows {
            if row.len() != self.arch.n_features {
                return Err(AppError::DimensionMismatch {
                    expected: self.arch.n_features,
                    actual: row.len(),
                });
            }
            data.extend(row.iter().map(|v| *v as f32));
        }
        Ok(Tensor::from_vec(data, (rows.len(), steps, per_step), &self.device)?)
    }

    fn probabilities_for(&self, rows: &[ArrayView1<f64>]) -> Result<Vec<ClassProbabilities>> {
        let logits = self.net.forward(&self.to_input(rows)?, false)?;
        let probs = candle_nn::ops::softmax(&logits, D::Minus1)?.to_vec2::<f32>()?;
        probs
            .into_iter()
            .map(|p| {
                let total: f64 = p.iter().map(|v| *v as f64).sum();
                let mut out = [0.0; NUM_CLASSES];
                for (o, v) in out.iter_mut().zip(&p) {
                    *o = *v as f64 / total;
                }
                ClassProbabilities::new(out)
            })
            .collect()
    }

    /// Class distribution for one standardized vector
    pub fn probabilities(&self, scaled: ArrayView1<f64>) -> Result<ClassProbabilities> {
        self.probabilities_for(&[scaled])?
            .pop()
            .ok_or_else(|| AppError::Internal("empty sequence model output".to_string()))
    }
}

impl DepthClassifier for SequenceClassifier {
    fn classify(&self, scaled: ArrayView1<f64>) -> Result<ClassifierOutput> {
        ClassifierOutput::from_probabilities(self.probabilities(scaled)?)
    }

    fn classify_batch(&self, scaled: &Array2<f64>) -> Result<Vec<ClassifierOutput>> {
        let rows: Vec<ArrayView1<f64>> = scaled.rows().into_iter().collect();
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        self.probabilities_for(&rows)?
            .into_iter()
            .map(ClassifierOutput::from_probabilities)
            .collect()
    }

    fn capability(&self) -> ProbabilityCapability {
        ProbabilityCapability::Probabilities
    }

    fn model_type(&self) -> ModelType {
        ModelType::SequenceModel
    }

    fn n_features(&self) -> usize {
        self.arch.n_features
    }
}

/// Result of a training run: the classifier plus its trainable variables
pub struct FittedSequenceModel {
    pub classifier: SequenceClassifier,
    pub epochs_run: usize,
    pub best_val_loss: f64,
    varmap: VarMap,
}

impl FittedSequenceModel {
    /// Write the weights as safetensors
    pub fn save_weights(&self, path: &Path) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }
}

struct Batch {
    inputs: Tensor,
    targets: Tensor,
    weights: Tensor,
}

fn make_batch(
    dataset: &TrainingDataset,
    indices: &[usize],
    arch: &SequenceArchitecture,
    device: &Device,
) -> Result<Batch> {
    let (steps, per_step) = arch.input_shape();
    let mut inputs = Vec::with_capacity(indices.len() * arch.n_features);
    for &i in indices {
        inputs.extend(dataset.features.row(i).iter().map(|v| *v as f32));
    }
    let targets: Vec<u32> = indices
        .iter()
        .map(|&i| dataset.labels[i].index() as u32)
        .collect();
    let weights: Vec<f32> = indices.iter().map(|&i| dataset.weights[i] as f32).collect();

    Ok(Batch {
        inputs: Tensor::from_vec(inputs, (indices.len(), steps, per_step), device)?,
        targets: Tensor::from_vec(targets, indices.len(), device)?,
        weights: Tensor::from_vec(weights, indices.len(), device)?,
    })
}

/// Sample-weighted mean cross entropy
fn weighted_cross_entropy(logits: &Tensor, targets: &Tensor, weights: &Tensor) -> Result<Tensor> {
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let total = (nll * weights)?.sum_all()?;
    Ok(total.broadcast_div(&weights.sum_all()?)?)
}

fn snapshot(varmap: &VarMap) -> Result<HashMap<String, Tensor>> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| AppError::Internal("variable map lock poisoned".to_string()))?;
    vars.iter()
        .map(|(name, var)| Ok((name.clone(), var.as_tensor().copy()?)))
        .collect()
}

fn restore(varmap: &VarMap, saved: &HashMap<String, Tensor>) -> Result<()> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| AppError::Internal("variable map lock poisoned".to_string()))?;
    for (name, var) in vars.iter() {
        if let Some(tensor) = saved.get(name) {
            var.set(tensor)?;
        }
    }
    Ok(())
}

/// Train on a (scaled) training set with early stopping on a held-out
/// validation slice; the best-scoring weights are kept.
pub fn fit(dataset: &TrainingDataset, params: &SequenceParams, seed: u64) -> Result<FittedSequenceModel> {
    if dataset.n_samples == 0 {
        return Err(AppError::Validation(
            "cannot fit a sequence model on an empty training set".to_string(),
        ));
    }

    let arch = SequenceArchitecture::from_params(dataset.n_features, params);
    arch.validate()?;
    let device = Device::Cpu;

    // stratified splitting needs two rows of every present class
    let splittable = dataset.class_counts().iter().all(|&n| n != 1);
    let (train, validation) = if params.validation_split > 0.0 && splittable {
        let (train, validation) = dataset.stratified_split(params.validation_split, seed)?;
        (train, Some(validation))
    } else {
        if params.validation_split > 0.0 {
            tracing::warn!(
                class_counts = ?dataset.class_counts(),
                "A class has a single row; training the sequence model without a validation split"
            );
        }
        (dataset.clone(), None)
    };
    if train.n_samples == 0 {
        return Err(AppError::Validation(
            "sequence model training split is empty".to_string(),
        ));
    }

    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
    let net = SequenceNet::new(&arch, vb)?;

    let mut optimizer = candle_nn::AdamW::new(
        varmap.all_vars(),
        candle_nn::ParamsAdamW {
            lr: params.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        },
    )?;

    let validation_batch = match &validation {
        Some(v) if v.n_samples > 0 => {
            let all: Vec<usize> = (0..v.n_samples).collect();
            Some(make_batch(v, &all, &arch, &device)?)
        }
        _ => None,
    };

    tracing::info!(
        train_samples = train.n_samples,
        validation_samples = validation.as_ref().map_or(0, |v| v.n_samples),
        layout = %arch.layout,
        epochs = params.epochs,
        "Fitting sequence model"
    );

    let mut order: Vec<usize> = (0..train.n_samples).collect();
    let mut best_val_loss = f64::MAX;
    let mut best_weights = None;
    let mut patience_counter = 0usize;
    let mut epochs_run = 0usize;

    for epoch in 0..params.epochs {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);

        let mut epoch_loss = 0.0;
        let mut batch_count = 0usize;
        for chunk in order.chunks(params.batch_size) {
            let batch = make_batch(&train, chunk, &arch, &device)?;
            let logits = net.forward(&batch.inputs, true)?;
            let loss = weighted_cross_entropy(&logits, &batch.targets, &batch.weights)?;
            optimizer.backward_step(&loss)?;

            epoch_loss += loss.to_scalar::<f32>()? as f64;
            batch_count += 1;
        }
        epochs_run = epoch + 1;
        let train_loss = epoch_loss / batch_count.max(1) as f64;

        let val_loss = match &validation_batch {
            Some(batch) => {
                let logits = net.forward(&batch.inputs, false)?;
                weighted_cross_entropy(&logits, &batch.targets, &batch.weights)?
                    .to_scalar::<f32>()? as f64
            }
            None => train_loss,
        };

        let improved = val_loss < best_val_loss - MIN_IMPROVEMENT;
        if improved {
            best_val_loss = val_loss;
            best_weights = Some(snapshot(&varmap)?);
            patience_counter = 0;
        } else {
            patience_counter += 1;
        }

        tracing::debug!(epoch = epochs_run, train_loss, val_loss, improved, "Sequence model epoch");

        if patience_counter >= params.patience {
            tracing::info!(
                epoch = epochs_run,
                patience = params.patience,
                "Early stopping sequence model"
            );
            break;
        }
    }

    if let Some(saved) = &best_weights {
        restore(&varmap, saved)?;
    }

    Ok(FittedSequenceModel {
        classifier: SequenceClassifier { arch, net, device },
        epochs_run,
        best_val_loss,
        varmap,
    })
}
