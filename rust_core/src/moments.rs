//! Moment vectors and the kinds of sufficient statistics nodes exchange.
//!
//! A moment vector is an ordered list of arrays. Array `i` has the node's
//! plate axes (possibly broadcast, possibly with missing leading axes)
//! followed by the variable-shape axes `dims[i]`.

use ndarray::{ArrayD, Axis, IxDyn};
use statrs::function::gamma::ln_gamma;

use crate::error::{Result, VmpError};

pub type Moments = Vec<ArrayD<f64>>;

/// Relative and absolute tolerances used when checking that
/// probabilities sum to one.
const SUM_RTOL: f64 = 1e-5;
const SUM_ATOL: f64 = 1e-8;

/// The kind of sufficient statistic a node provides to its children.
///
/// Parents are checked against the kind a child's distribution expects,
/// so a categorical node can only be attached to a Dirichlet-moment
/// parent with the same number of categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MomentsKind {
    /// `[alpha, ln Γ(Σα) − Σ ln Γ(α)]` of a fixed concentration vector.
    DirichletPrior { categories: usize },
    /// `[E ln p]` of a probability vector.
    Dirichlet { categories: usize },
    /// `[E x]` of a count vector.
    Multinomial { categories: usize },
    /// `[E one_hot(z)]` of a category index.
    Categorical { categories: usize },
    /// `[E one_hot(z_0), E Σ_t one_hot(z_t) one_hot(z_{t+1})ᵀ]` of a chain.
    CategoricalMarkovChain { states: usize, steps: usize },
}

impl MomentsKind {
    pub fn categories(&self) -> usize {
        match *self {
            Self::DirichletPrior { categories }
            | Self::Dirichlet { categories }
            | Self::Multinomial { categories }
            | Self::Categorical { categories } => categories,
            Self::CategoricalMarkovChain { states, .. } => states,
        }
    }

    /// Variable shapes of each moment array.
    pub fn dims(&self) -> Vec<Vec<usize>> {
        match *self {
            Self::DirichletPrior { categories } => vec![vec![categories], vec![]],
            Self::Dirichlet { categories }
            | Self::Multinomial { categories }
            | Self::Categorical { categories } => vec![vec![categories]],
            Self::CategoricalMarkovChain { states, steps } => {
                vec![vec![states], vec![steps.saturating_sub(1), states, states]]
            }
        }
    }

    /// Number of trailing axes of a fixed value that are not plates.
    pub fn value_ndim(&self) -> usize {
        match self {
            Self::Categorical { .. } => 0,
            _ => 1,
        }
    }

    /// Plate shape implied by a fixed value.
    pub fn value_plates(&self, value: &ArrayD<f64>) -> Result<Vec<usize>> {
        let nd = self.value_ndim();
        if value.ndim() < nd {
            return Err(VmpError::validation(
                self.label(),
                format!("value must have at least {} axes, got {}", nd, value.ndim()),
            ));
        }
        Ok(value.shape()[..value.ndim() - nd].to_vec())
    }

    /// Variable shapes derived from a concrete value.
    pub fn compute_dims_from_values(&self, value: &ArrayD<f64>) -> Result<Vec<Vec<usize>>> {
        match *self {
            Self::Categorical { categories } => Ok(vec![vec![categories]]),
            Self::CategoricalMarkovChain { states, .. } => {
                let steps = last_axis(self.label(), value)?;
                Self::CategoricalMarkovChain { states, steps }.checked_dims()
            }
            Self::DirichletPrior { .. } => {
                let d = last_axis(self.label(), value)?;
                Ok(vec![vec![d], vec![]])
            }
            Self::Dirichlet { .. } | Self::Multinomial { .. } => {
                let d = last_axis(self.label(), value)?;
                Ok(vec![vec![d]])
            }
        }
    }

    fn checked_dims(&self) -> Result<Vec<Vec<usize>>> {
        if let Self::CategoricalMarkovChain { steps: 0, .. } = self {
            return Err(VmpError::validation(self.label(), "chain must have at least one step"));
        }
        Ok(self.dims())
    }

    /// Map a fixed value to its sufficient statistics.
    pub fn compute_fixed_moments(&self, value: &ArrayD<f64>) -> Result<Moments> {
        let dims = self.compute_dims_from_values(value)?;
        if dims != self.dims() {
            return Err(VmpError::validation(
                self.label(),
                format!("value implies dimensions {:?}, expected {:?}", dims, self.dims()),
            ));
        }
        match *self {
            Self::DirichletPrior { .. } => {
                if value.iter().any(|&a| !(a > 0.0) || !a.is_finite()) {
                    return Err(VmpError::validation(
                        self.label(),
                        "concentrations must be positive and finite",
                    ));
                }
                let z = value.map_axis(Axis(value.ndim() - 1), |lane| {
                    ln_gamma(lane.sum()) - lane.iter().map(|&a| ln_gamma(a)).sum::<f64>()
                });
                Ok(vec![value.clone(), z])
            }
            Self::Dirichlet { .. } => {
                if value.iter().any(|&p| !(0.0..=1.0).contains(&p)) {
                    return Err(VmpError::validation(self.label(), "probabilities must be in [0, 1]"));
                }
                let last = Axis(value.ndim() - 1);
                for lane in value.lanes(last) {
                    let s = lane.sum();
                    if (s - 1.0).abs() > SUM_ATOL + SUM_RTOL {
                        return Err(VmpError::validation(
                            self.label(),
                            format!("probabilities must sum to one, got {}", s),
                        ));
                    }
                }
                let mut logp = value.clone();
                for mut lane in logp.lanes_mut(last) {
                    let s = lane.sum();
                    lane.mapv_inplace(|p| (p / s).ln());
                }
                Ok(vec![logp])
            }
            Self::Multinomial { .. } => {
                if value.iter().any(|&x| !is_count(x)) {
                    return Err(VmpError::validation(
                        self.label(),
                        "counts must be non-negative integers",
                    ));
                }
                Ok(vec![value.clone()])
            }
            Self::Categorical { categories } => Ok(vec![one_hot(self.label(), value, categories)?]),
            Self::CategoricalMarkovChain { states, steps } => {
                let plates = &value.shape()[..value.ndim() - 1];
                let n: usize = plates.iter().product();
                let flat: Vec<f64> = value.iter().cloned().collect();
                let mut u0 = vec![0.0; n * states];
                let mut u1 = vec![0.0; n * (steps - 1) * states * states];
                for (k, chain) in flat.chunks(steps).enumerate() {
                    let idx = checked_indices(self.label(), chain, states)?;
                    u0[k * states + idx[0]] = 1.0;
                    for t in 0..steps - 1 {
                        let off = ((k * (steps - 1) + t) * states + idx[t]) * states + idx[t + 1];
                        u1[off] = 1.0;
                    }
                }
                let mut s0 = plates.to_vec();
                s0.push(states);
                let mut s1 = plates.to_vec();
                s1.extend_from_slice(&[steps - 1, states, states]);
                Ok(vec![from_vec(s0, u0)?, from_vec(s1, u1)?])
            }
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            Self::DirichletPrior { .. } => "Dirichlet concentration",
            Self::Dirichlet { .. } => "Dirichlet value",
            Self::Multinomial { .. } => "multinomial value",
            Self::Categorical { .. } => "categorical value",
            Self::CategoricalMarkovChain { .. } => "Markov chain value",
        }
    }
}

fn last_axis(context: &str, value: &ArrayD<f64>) -> Result<usize> {
    value
        .shape()
        .last()
        .copied()
        .ok_or_else(|| VmpError::validation(context, "value must be at least one-dimensional"))
}

fn is_count(x: f64) -> bool {
    x.is_finite() && x >= 0.0 && x.fract() == 0.0
}

fn checked_indices(context: &str, values: &[f64], categories: usize) -> Result<Vec<usize>> {
    values
        .iter()
        .map(|&x| {
            if !is_count(x) {
                Err(VmpError::validation(context, format!("{} is not an integer index", x)))
            } else if x as usize >= categories {
                Err(VmpError::validation(
                    context,
                    format!("index {} out of range for {} categories", x, categories),
                ))
            } else {
                Ok(x as usize)
            }
        })
        .collect()
}

pub(crate) fn from_vec(shape: Vec<usize>, data: Vec<f64>) -> Result<ArrayD<f64>> {
    let got = vec![data.len()];
    ArrayD::from_shape_vec(IxDyn(&shape), data).map_err(|_| VmpError::shape("array assembly", &shape, &got))
}

/// One-hot encode integer indices along a new trailing axis.
pub(crate) fn one_hot(context: &str, value: &ArrayD<f64>, categories: usize) -> Result<ArrayD<f64>> {
    let flat: Vec<f64> = value.iter().cloned().collect();
    let idx = checked_indices(context, &flat, categories)?;
    let mut data = vec![0.0; idx.len() * categories];
    for (k, &i) in idx.iter().enumerate() {
        data[k * categories + i] = 1.0;
    }
    let mut shape = value.shape().to_vec();
    shape.push(categories);
    from_vec(shape, data)
}
