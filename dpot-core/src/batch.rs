// MIT License
// Copyright 2023--present dpot developers

//! Configurations, batches, and the per-item messages exchanged in a round.
//!
//! A [`Batch`] is an ordered list of [`Configuration`]s sharing one
//! dimensionality. Order is semantically meaningful: every result handed back
//! to the caller is placed at the index of the configuration it came from.
//!
//! Inside a round, the partitioner wraps each input in a [`WorkItem`] carrying
//! its `original_index`, and each rank answers with an [`EvaluationResult`]
//! carrying the same index together with either a success [`Output`] or an
//! [`EvaluationError`].

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::error::{DpotError, Result};

/// One immutable point in configuration space.
///
/// Backed by a shared buffer so that handing a configuration to another rank
/// never copies coordinates.
#[derive(Clone, PartialEq)]
pub struct Configuration(Arc<[f64]>);

impl Configuration {
    pub fn new(coords: impl Into<Arc<[f64]>>) -> Self {
        Self(coords.into())
    }

    pub fn dim(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }
}

impl Deref for Configuration {
    type Target = [f64];

    fn deref(&self) -> &[f64] {
        &self.0
    }
}

impl From<Vec<f64>> for Configuration {
    fn from(coords: Vec<f64>) -> Self {
        Self(coords.into())
    }
}

impl From<&[f64]> for Configuration {
    fn from(coords: &[f64]) -> Self {
        Self(coords.into())
    }
}

impl fmt::Debug for Configuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.0.iter()).finish()
    }
}

/// An ordered sequence of configurations with a common dimensionality.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    dim: usize,
    configurations: Vec<Configuration>,
}

impl Batch {
    /// Build a batch, rejecting configurations whose length differs from `dim`.
    pub fn new(dim: usize, configurations: Vec<Configuration>) -> Result<Self> {
        if let Some((i, c)) = configurations
            .iter()
            .enumerate()
            .find(|(_, c)| c.dim() != dim)
        {
            return Err(DpotError::InvalidBatch(format!(
                "configuration {i} has {} coordinates, expected {dim}",
                c.dim()
            )));
        }
        Ok(Self {
            dim,
            configurations,
        })
    }

    /// Build a batch from rows; the dimensionality is taken from the first row.
    pub fn from_rows<R>(rows: impl IntoIterator<Item = R>) -> Result<Self>
    where
        R: Into<Configuration>,
    {
        let configurations: Vec<Configuration> = rows.into_iter().map(Into::into).collect();
        let dim = configurations.first().map_or(0, Configuration::dim);
        Self::new(dim, configurations)
    }

    /// Build a batch of `n` configurations from a flat row-major `[n, dim]`
    /// buffer. With `dim == 0` the buffer is empty and every configuration
    /// has no coordinates.
    pub fn from_flat(n: usize, dim: usize, data: &[f64]) -> Result<Self> {
        let expected = n.checked_mul(dim).ok_or_else(|| {
            DpotError::InvalidBatch(format!("[{n}, {dim}] overflows the address space"))
        })?;
        if data.len() != expected {
            return Err(DpotError::InvalidBatch(format!(
                "{} values do not fill a [{n}, {dim}] batch",
                data.len()
            )));
        }
        let configurations = if dim == 0 {
            (0..n).map(|_| Configuration::from(Vec::new())).collect()
        } else {
            data.chunks_exact(dim).map(Configuration::from).collect()
        };
        Ok(Self {
            dim,
            configurations,
        })
    }

    pub fn empty(dim: usize) -> Self {
        Self {
            dim,
            configurations: Vec::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn len(&self) -> usize {
        self.configurations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configurations.is_empty()
    }

    pub fn configurations(&self) -> &[Configuration] {
        &self.configurations
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Configuration> {
        self.configurations.iter()
    }

    /// Cut into contiguous groups of at most `group_size` configurations.
    pub fn chunks(&self, group_size: usize) -> Result<Vec<Batch>> {
        if group_size == 0 {
            return Err(DpotError::InvalidBatch("group size must be positive".into()));
        }
        Ok(self
            .configurations
            .chunks(group_size)
            .map(|group| Batch {
                dim: self.dim,
                configurations: group.to_vec(),
            })
            .collect())
    }
}

impl<'a> IntoIterator for &'a Batch {
    type Item = &'a Configuration;
    type IntoIter = std::slice::Iter<'a, Configuration>;

    fn into_iter(self) -> Self::IntoIter {
        self.configurations.iter()
    }
}

/// Energy and optional gradient for one configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub energy: f64,
    pub gradient: Option<Vec<f64>>,
}

impl Evaluation {
    pub fn energy(energy: f64) -> Self {
        Self {
            energy,
            gradient: None,
        }
    }

    pub fn with_gradient(energy: f64, gradient: Vec<f64>) -> Self {
        Self {
            energy,
            gradient: Some(gradient),
        }
    }
}

/// A failure confined to one work item.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("evaluation of item {original_index} failed: {message}")]
pub struct EvaluationError {
    pub original_index: usize,
    pub message: String,
}

/// What a work item asks a rank to evaluate.
#[derive(Debug, Clone)]
pub enum Payload {
    /// One configuration; the potential is called once for it.
    Single(Configuration),
    /// A group of configurations; the potential is called once for the group.
    Group(Batch),
}

#[derive(Debug, Clone)]
pub struct WorkItem {
    pub original_index: usize,
    pub payload: Payload,
}

/// Successful output for one work item, matching its [`Payload`] variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Single(Evaluation),
    Group(Vec<Evaluation>),
}

pub type ItemOutcome = std::result::Result<Output, EvaluationError>;

#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub original_index: usize,
    pub outcome: ItemOutcome,
}

/// Per-configuration result of a single-mode round.
pub type Outcome = std::result::Result<Evaluation, EvaluationError>;

/// Per-group result of a vectorized round.
pub type GroupOutcome = std::result::Result<Vec<Evaluation>, EvaluationError>;
