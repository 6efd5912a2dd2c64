use kiosk_core::{Embedding, UserTemplate};
use ndarray::{Array1, ArrayView1};
use thiserror::Error;

use crate::store::{StoreError, TemplateStore};

#[derive(Error, Debug)]
pub enum EnrollError {
    #[error("no embedding samples were captured")]
    EmptySamples,
    #[error("user '{0}' is already enrolled")]
    DuplicateName(String),
    #[error("embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("invalid embedding sample (empty or NaN/Inf)")]
    InvalidEmbedding,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fail fast before any capture work if `name` is already enrolled.
pub fn check_available(store: &TemplateStore, name: &str) -> Result<(), EnrollError> {
    if store.name_exists(name) {
        return Err(EnrollError::DuplicateName(name.to_string()));
    }
    Ok(())
}

/// Dimension-wise arithmetic mean of the samples.
///
/// Uses a running mean so that N identical samples reproduce the sample exactly.
pub fn centroid(samples: &[Embedding]) -> Result<Embedding, EnrollError> {
    let first = samples.first().ok_or(EnrollError::EmptySamples)?;
    let dim = first.dim();

    let mut mean = Array1::<f32>::zeros(dim);
    for (i, sample) in samples.iter().enumerate() {
        if !sample.is_valid() {
            return Err(EnrollError::InvalidEmbedding);
        }
        if sample.dim() != dim {
            return Err(EnrollError::DimensionMismatch {
                expected: dim,
                got: sample.dim(),
            });
        }
        let k = (i + 1) as f32;
        let row = ArrayView1::from(sample.values.as_slice());
        mean.zip_mut_with(&row, |m, &x| *m += (x - *m) / k);
    }

    Ok(Embedding::new(mean.to_vec()))
}

/// Average the samples into a template for `name` and persist it.
///
/// All-or-nothing: if the store cannot be written the insert is rolled back.
pub fn enroll(
    store: &mut TemplateStore,
    name: &str,
    samples: &[Embedding],
) -> Result<UserTemplate, EnrollError> {
    if samples.is_empty() {
        return Err(EnrollError::EmptySamples);
    }
    check_available(store, name)?;

    let embedding = centroid(samples)?;
    let template = UserTemplate {
        key: store.algorithm().hash_name(name),
        name: name.to_string(),
        embedding,
    };

    let previous = store.insert(template.clone());
    if let Err(e) = store.save() {
        store.remove(&template.key);
        if let Some(previous) = previous {
            store.insert(previous);
        }
        tracing::error!(error = %e, name, "enroll: store write failed, rolled back");
        return Err(e.into());
    }

    tracing::info!(
        name,
        key = %template.key,
        samples = samples.len(),
        fingerprint = %store.algorithm().hash_embedding(&template.embedding),
        "enrolled successfully"
    );
    Ok(template)
}

/// Accumulates embeddings from intent-accepted frames until the target count.
#[derive(Debug)]
pub struct SampleBurst {
    target: usize,
    samples: Vec<Embedding>,
}

impl SampleBurst {
    pub fn new(target: usize) -> Self {
        let target = target.max(1);
        Self {
            target,
            samples: Vec::with_capacity(target),
        }
    }

    /// Add a sample. Returns true once the burst is complete; extra samples are ignored.
    pub fn push(&mut self, sample: Embedding) -> bool {
        if !self.is_complete() {
            self.samples.push(sample);
        }
        self.is_complete()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn is_complete(&self) -> bool {
        self.samples.len() >= self.target
    }

    pub fn samples(&self) -> &[Embedding] {
        &self.samples
    }
}
