use crate::error::{AppError, Result};
use crate::ml::models::{DepthClass, FeatureSchema, TrainingDataset, NUM_CLASSES};
use ndarray::{Array1, Array2};
use ndarray_stats::QuantileExt;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use strum::IntoEnumIterator;

/// Pre-labelled class column (integer 0..=2)
pub const DEPTH_CLASS_COLUMN: &str = "depth_class";

/// Continuous hypocenter depth column in km
pub const DEPTH_COLUMN: &str = "depth";

/// Historical earthquake catalog loaded from CSV.
///
/// Every column is parsed as numeric; empty, non-numeric or non-finite
/// cells become `None`. Text columns (place names, timestamps) therefore
/// load fine and are simply unusable as features.
#[derive(Debug, Clone)]
pub struct HistoricalDataset {
    headers: Vec<String>,
    columns: Vec<Vec<Option<f64>>>,
    n_rows: usize,
}

impl HistoricalDataset {
    /// Load a CSV file with a header row
    pub fn from_csv(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(AppError::DatasetNotFound(path.to_path_buf()));
        }
        let file = std::fs::File::open(path)?;
        let dataset = Self::from_reader(file)?;
        tracing::info!(
            path = %path.display(),
            rows = dataset.n_rows,
            columns = dataset.headers.len(),
            "Loaded historical dataset"
        );
        Ok(dataset)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); headers.len()];
        let mut n_rows = 0usize;

        for record in reader.records() {
            let record = record?;
            for (column, cell) in columns.iter_mut().zip(record.iter()) {
                column.push(cell.parse::<f64>().ok().filter(|v| v.is_finite()));
            }
            n_rows += 1;
        }

        Ok(Self {
            headers,
            columns,
            n_rows,
        })
    }

    pub fn n_rows(&self) -> usize {
        self.n_rows
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }

    pub fn column(&self, name: &str) -> Option<&[Option<f64>]> {
        self.headers
            .iter()
            .position(|h| h == name)
            .map(|i| self.columns[i].as_slice())
    }

    /// Fail with every schema column the dataset lacks
    pub fn require_columns(&self, schema: &FeatureSchema) -> Result<()> {
        let missing: Vec<String> = schema
            .column_names()
            .into_iter()
            .filter(|name| !self.has_column(name))
            .map(str::to_string)
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(AppError::MissingColumns(missing))
        }
    }

    /// Per-row class: the label column wins over thresholding depth.
    /// Rows with an empty cell yield `None`.
    pub fn derive_labels(&self) -> Result<Vec<Option<DepthClass>>> {
        if let Some(labels) = self.column(DEPTH_CLASS_COLUMN) {
            return labels
                .iter()
                .enumerate()
                .map(|(row, cell)| match cell {
                    None => Ok(None),
                    Some(v) if v.fract() == 0.0 && (0.0..NUM_CLASSES as f64).contains(v) => {
                        DepthClass::from_index(*v as usize).map(Some)
                    }
                    Some(v) => Err(AppError::LabelDerivationError(format!(
                        "row {}: {} value {} is not a class index in 0..={}",
                        row + 1,
                        DEPTH_CLASS_COLUMN,
                        v,
                        NUM_CLASSES - 1
                    ))),
                })
                .collect();
        }

        if let Some(depths) = self.column(DEPTH_COLUMN) {
            return depths
                .iter()
                .map(|cell| cell.map(DepthClass::from_depth_km).transpose())
                .collect();
        }

        Err(AppError::LabelDerivationError(format!(
            "dataset has neither a '{}' nor a '{}' column",
            DEPTH_CLASS_COLUMN, DEPTH_COLUMN
        )))
    }

    /// Schema-ordered feature matrix with labels. Rows missing a feature or
    /// label are dropped; the dropped count is returned alongside.
    pub fn to_training_dataset(&self, schema: &FeatureSchema) -> Result<(TrainingDataset, usize)> {
        self.require_columns(schema)?;
        let labels = self.derive_labels()?;

        let feature_columns: Vec<&[Option<f64>]> = schema
            .column_names()
            .into_iter()
            .filter_map(|name| self.column(name))
            .collect();

        let mut values = Vec::with_capacity(self.n_rows * schema.len());
        let mut kept_labels = Vec::with_capacity(self.n_rows);
        let mut dropped = 0usize;

        for (row, label) in labels.iter().enumerate() {
            let features: Option<Vec<f64>> = feature_columns.iter().map(|c| c[row]).collect();
            match (features, label) {
                (Some(features), Some(label)) => {
                    values.extend(features);
                    kept_labels.push(*label);
                }
                _ => dropped += 1,
            }
        }

        if dropped > 0 {
            tracing::warn!(
                dropped,
                kept = kept_labels.len(),
                "Dropped rows with missing or non-numeric values"
            );
        }
        if kept_labels.is_empty() {
            return Err(AppError::Validation(
                "no usable rows remain after dropping incomplete records".to_string(),
            ));
        }

        let features = Array2::from_shape_vec((kept_labels.len(), schema.len()), values)
            .map_err(|e| AppError::Internal(format!("feature matrix shape: {}", e)))?;
        Ok((TrainingDataset::new(features, kept_labels)?, dropped))
    }

    /// Mean of the present values of each schema column, in schema order
    pub fn column_means(&self, schema: &FeatureSchema) -> Result<Vec<f64>> {
        self.require_columns(schema)?;
        schema
            .column_names()
            .into_iter()
            .map(|name| {
                let present = present_values(self.column(name).unwrap_or_default());
                present.mean().ok_or_else(|| {
                    AppError::Validation(format!("column '{}' has no numeric values", name))
                })
            })
            .collect()
    }

    /// `describe()`-style statistics for numeric columns plus class counts
    pub fn summary(&self) -> DatasetSummary {
        let columns = self
            .headers
            .iter()
            .zip(&self.columns)
            .filter_map(|(name, cells)| {
                let present = present_values(cells);
                let count = present.len();
                if count == 0 {
                    return None;
                }
                Some(ColumnSummary {
                    name: name.clone(),
                    count,
                    mean: present.mean().unwrap_or(f64::NAN),
                    std: if count > 1 { Some(present.std(1.0)) } else { None },
                    min: *present.min_skipnan(),
                    max: *present.max_skipnan(),
                })
            })
            .collect();

        let class_counts = self.derive_labels().ok().map(|labels| {
            let mut counts: BTreeMap<String, usize> = DepthClass::iter()
                .map(|c| (c.short_name().to_string(), 0))
                .collect();
            for label in labels.into_iter().flatten() {
                *counts.entry(label.short_name().to_string()).or_insert(0) += 1;
            }
            counts
        });

        DatasetSummary {
            n_rows: self.n_rows,
            columns,
            class_counts,
        }
    }
}

fn present_values(cells: &[Option<f64>]) -> Array1<f64> {
    cells.iter().flatten().copied().collect()
}

/// Per-column statistics
#[derive(Debug, Clone, Serialize)]
pub struct ColumnSummary {
    pub name: String,
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation (ddof = 1)
    pub std: Option<f64>,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub n_rows: usize,
    pub columns: Vec<ColumnSummary>,
    pub class_counts: Option<BTreeMap<String, usize>>,
}

impl std::fmt::Display for DatasetSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "rows: {}", self.n_rows)?;
        writeln!(
            f,
            "{:<18} {:>8} {:>12} {:>12} {:>12} {:>12}",
            "column", "count", "mean", "std", "min", "max"
        )?;
        for c in &self.columns {
            let std = c.std.map_or_else(|| "-".to_string(), |s| format!("{:.4}", s));
            writeln!(
                f,
                "{:<18} {:>8} {:>12.4} {:>12} {:>12.4} {:>12.4}",
                c.name, c.count, c.mean, std, c.min, c.max
            )?;
        }
        if let Some(counts) = &self.class_counts {
            writeln!(f, "depth classes:")?;
            for class in DepthClass::iter() {
                let n = counts.get(class.short_name()).copied().unwrap_or(0);
                writeln!(f, "  {:<26} {}", class.to_string(), n)?;
            }
        }
        Ok(())
    }
}
