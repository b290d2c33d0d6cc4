//! Exponential-family strategies for the stochastic node families.
//!
//! Every family follows the same log-density convention
//! `log p(x) = u(x)·φ + g(φ) + f(x)`, where `u` are the moments, `φ` the
//! natural parameters, `g` the cumulant generating function and `f` the
//! base measure. A [`Distribution`] carries only structural data (category
//! counts, trials, chain length); all mutable state lives in the node.

use ndarray::{ArrayD, Axis, IxDyn, Zip};
use rand::Rng;
use statrs::function::gamma::{digamma, ln_gamma};

use crate::alpha_beta::{alpha_beta_recursion, log_sum_exp, sample_chain};
use crate::error::{Result, VmpError};
use crate::graph::{Model, NodeId};
use crate::moments::{from_vec, Moments, MomentsKind};
use crate::plates::{add_trailing_axes, any_to_shape, broadcast_to};
use crate::random::{self, categorical_index};

/// Closed set of families a stochastic node can follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    /// Probability vector with a fixed concentration parent.
    Dirichlet { categories: usize },
    /// Count vector of `trials` draws with a probability parent.
    Multinomial { categories: usize, trials: usize },
    /// Single category index with a probability parent.
    Categorical { categories: usize },
    /// Chain of `steps` category indices with an initial-state parent and a
    /// transition parent whose last two plate axes are `(steps - 1, states)`.
    CategoricalMarkovChain { states: usize, steps: usize },
}

impl Distribution {
    pub fn moments_kind(&self) -> MomentsKind {
        match *self {
            Self::Dirichlet { categories } => MomentsKind::Dirichlet { categories },
            Self::Multinomial { categories, .. } => MomentsKind::Multinomial { categories },
            Self::Categorical { categories } => MomentsKind::Categorical { categories },
            Self::CategoricalMarkovChain { states, steps } => {
                MomentsKind::CategoricalMarkovChain { states, steps }
            }
        }
    }

    /// Moments kind expected from each parent, in parent order.
    pub fn parent_kinds(&self) -> Vec<MomentsKind> {
        match *self {
            Self::Dirichlet { categories } => vec![MomentsKind::DirichletPrior { categories }],
            Self::Multinomial { categories, .. } | Self::Categorical { categories } => {
                vec![MomentsKind::Dirichlet { categories }]
            }
            Self::CategoricalMarkovChain { states, .. } => vec![
                MomentsKind::Dirichlet { categories: states },
                MomentsKind::Dirichlet { categories: states },
            ],
        }
    }

    pub fn dims(&self) -> Vec<Vec<usize>> {
        self.moments_kind().dims()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Dirichlet { .. } => "Dirichlet",
            Self::Multinomial { .. } => "multinomial",
            Self::Categorical { .. } => "categorical",
            Self::CategoricalMarkovChain { .. } => "categorical Markov chain",
        }
    }

    /// Plates this node presents to parent `index`.
    pub fn plates_to_parent(&self, index: usize, plates: &[usize]) -> Vec<usize> {
        match *self {
            Self::CategoricalMarkovChain { states, steps } if index == 1 => {
                let mut out = plates.to_vec();
                out.extend_from_slice(&[steps - 1, states]);
                out
            }
            _ => plates.to_vec(),
        }
    }

    /// Plates implied for this node by the plates of parent `index`.
    pub fn plates_from_parent(&self, index: usize, parent_plates: &[usize]) -> Result<Vec<usize>> {
        match *self {
            Self::CategoricalMarkovChain { states, steps } if index == 1 => {
                let n = parent_plates.len();
                let trailing = if n >= 2 { &parent_plates[n - 2..] } else { parent_plates };
                let ok = n >= 2
                    && (trailing[0] == steps - 1 || trailing[0] == 1)
                    && trailing[1] == states;
                if !ok {
                    return Err(VmpError::validation(
                        "transition probabilities",
                        format!(
                            "plates must end with ({}, {}), got {:?}",
                            steps - 1,
                            states,
                            parent_plates
                        ),
                    ));
                }
                Ok(parent_plates[..n - 2].to_vec())
            }
            _ => Ok(parent_plates.to_vec()),
        }
    }

    /// Natural parameters implied by the parents' moments.
    pub fn compute_phi_from_parents(&self, parents: &[&Moments]) -> Result<Moments> {
        self.check_parent_count(parents.len())?;
        match self {
            Self::Dirichlet { .. } | Self::Multinomial { .. } | Self::Categorical { .. } => {
                Ok(vec![parents[0][0].clone()])
            }
            Self::CategoricalMarkovChain { .. } => {
                Ok(vec![parents[0][0].clone(), parents[1][0].clone()])
            }
        }
    }

    /// Moments and cgf of the distribution with natural parameters `phi`.
    pub fn compute_moments_and_cgf(&self, phi: &Moments) -> Result<(Moments, ArrayD<f64>)> {
        match *self {
            Self::Dirichlet { .. } => {
                let alpha = &phi[0];
                let last = Axis(alpha.ndim() - 1);
                let total = alpha.sum_axis(last);
                let mut u = alpha.clone();
                Zip::from(u.lanes_mut(last))
                    .and(&total)
                    .for_each(|mut lane, &s| lane.mapv_inplace(|a| digamma(a) - digamma(s)));
                let g = alpha.map_axis(last, |lane| {
                    ln_gamma(lane.sum()) - lane.iter().map(|&a| ln_gamma(a)).sum::<f64>()
                });
                Ok((vec![u], g))
            }
            Self::Multinomial { trials, .. } => {
                let (u, g) = softmax_moments(&phi[0], trials as f64);
                Ok((vec![u], g))
            }
            Self::Categorical { .. } => {
                let (u, g) = softmax_moments(&phi[0], 1.0);
                Ok((vec![u], g))
            }
            Self::CategoricalMarkovChain { states, steps } => {
                let phi1 = &phi[1];
                if phi1.ndim() < 3 {
                    return Err(VmpError::shape(
                        "Markov chain transition parameters",
                        &[steps - 1, states, states],
                        phi1.shape(),
                    ));
                }
                let mut shape = phi1.shape()[..phi1.ndim() - 3].to_vec();
                shape.extend_from_slice(&[steps - 1, states, states]);
                let log_p = broadcast_to(phi1, &shape, "Markov chain transition parameters")?;
                let r = alpha_beta_recursion(&phi[0], &log_p)?;
                Ok((vec![r.z0, r.zz], r.g))
            }
        }
    }

    /// Expected cgf under the parents' current moments.
    pub fn compute_cgf_from_parents(&self, parents: &[&Moments]) -> Result<ArrayD<f64>> {
        self.check_parent_count(parents.len())?;
        match self {
            Self::Dirichlet { .. } => Ok(parents[0][1].clone()),
            // E[ln Σ p] = 0 for normalized probabilities
            _ => Ok(ArrayD::zeros(IxDyn(&[]))),
        }
    }

    /// Fixed moments of an observed value together with its base measure.
    pub fn compute_fixed_moments_and_f(&self, value: &ArrayD<f64>) -> Result<(Moments, ArrayD<f64>)> {
        let kind = self.moments_kind();
        let u = kind.compute_fixed_moments(value)?;
        if let Self::Multinomial { trials, .. } = *self {
            let n = trials as f64;
            for lane in value.lanes(Axis(value.ndim() - 1)) {
                if lane.sum() != n {
                    return Err(VmpError::validation(
                        kind.label(),
                        format!("counts must sum to {} trials, got {}", trials, lane.sum()),
                    ));
                }
            }
        }
        let f = self.compute_f_from_moments(&u);
        Ok((u, f))
    }

    /// Base measure per plate slice, recovered from the fixed moments of a
    /// value.
    pub fn compute_f_from_moments(&self, u: &Moments) -> ArrayD<f64> {
        let last = Axis(u[0].ndim() - 1);
        match *self {
            Self::Dirichlet { .. } => u[0].sum_axis(last).mapv(|s| -s),
            Self::Multinomial { trials, .. } => {
                let n = trials as f64;
                u[0].map_axis(last, |lane| {
                    ln_gamma(n + 1.0) - lane.iter().map(|&x| ln_gamma(x + 1.0)).sum::<f64>()
                })
            }
            Self::Categorical { .. } | Self::CategoricalMarkovChain { .. } => {
                ArrayD::zeros(IxDyn(&u[0].shape()[..u[0].ndim() - 1]))
            }
        }
    }

    /// Message from this node to parent `index`, before plate reduction.
    pub fn compute_message_to_parent(
        &self,
        index: usize,
        u_self: &Moments,
        parents: &[&Moments],
    ) -> Result<Moments> {
        self.check_parent_count(parents.len())?;
        match (*self, index) {
            (Self::Dirichlet { .. }, 0) => {
                let u = &u_self[0];
                let plates = &u.shape()[..u.ndim() - 1];
                Ok(vec![u.clone(), ArrayD::ones(IxDyn(plates))])
            }
            (Self::Multinomial { .. }, 0) | (Self::Categorical { .. }, 0) => {
                Ok(vec![u_self[0].clone()])
            }
            (Self::CategoricalMarkovChain { .. }, 0) => Ok(vec![u_self[0].clone()]),
            (Self::CategoricalMarkovChain { .. }, 1) => Ok(vec![u_self[1].clone()]),
            _ => Err(VmpError::validation(
                self.label(),
                format!("no parent at index {}", index),
            )),
        }
    }

    /// Lift a plate mask to the axes of parent `index` without reducing it.
    pub(crate) fn expand_mask(&self, index: usize, mask: &ArrayD<bool>) -> ArrayD<bool> {
        match self {
            Self::CategoricalMarkovChain { .. } if index == 1 => add_trailing_axes(mask.clone(), 2),
            _ => mask.clone(),
        }
    }

    /// Plate mask as seen from parent `index`: a parent slice is active if
    /// any child slice mapping to it is.
    pub fn compute_mask_to_parent(
        &self,
        index: usize,
        mask: &ArrayD<bool>,
        parent_plates: &[usize],
    ) -> Result<ArrayD<bool>> {
        any_to_shape(self.expand_mask(index, mask), parent_plates, "mask to parent")
    }

    /// Draw one value per plate from the distribution with parameters `phi`.
    pub fn random<R: Rng + ?Sized>(
        &self,
        phi: &Moments,
        plates: &[usize],
        rng: &mut R,
    ) -> Result<ArrayD<f64>> {
        match *self {
            Self::Dirichlet { .. } => random::dirichlet(&phi[0], Some(plates), rng),
            Self::Categorical { .. } => {
                let (p, _) = softmax_moments(&phi[0], 1.0);
                Ok(random::categorical(&p, Some(plates), rng)?.mapv(|k| k as f64))
            }
            Self::Multinomial { categories, trials } => {
                let (p, _) = softmax_moments(&phi[0], 1.0);
                let mut shape = plates.to_vec();
                shape.push(categories);
                let p = broadcast_to(&p, &shape, "multinomial probabilities")?;
                let mut counts = Vec::with_capacity(p.len());
                for lane in p.lanes(Axis(p.ndim() - 1)) {
                    let weights = lane.to_vec();
                    let mut c = vec![0.0; categories];
                    for _ in 0..trials {
                        c[categorical_index(&weights, rng)] += 1.0;
                    }
                    counts.extend(c);
                }
                from_vec(shape, counts)
            }
            Self::CategoricalMarkovChain { states, steps } => {
                let mut s0 = plates.to_vec();
                s0.push(states);
                let mut s1 = plates.to_vec();
                s1.extend_from_slice(&[steps - 1, states, states]);
                let logp0 = broadcast_to(&phi[0], &s0, "Markov chain initial state")?;
                let log_p = broadcast_to(&phi[1], &s1, "Markov chain transitions")?;
                sample_chain(&logp0, &log_p, rng)
            }
        }
    }

    fn check_parent_count(&self, n: usize) -> Result<()> {
        let expected = self.parent_kinds().len();
        if n != expected {
            return Err(VmpError::validation(
                self.label(),
                format!("expected {} parents, got {}", expected, n),
            ));
        }
        Ok(())
    }
}

/// `N · softmax(φ)` along the last axis and `g = −N · logsumexp(φ)`.
///
/// Each lane is shifted by its log-sum-exp before exponentiating. A lane
/// without any finite entry is spread uniformly.
fn softmax_moments(phi: &ArrayD<f64>, trials: f64) -> (ArrayD<f64>, ArrayD<f64>) {
    let last = Axis(phi.ndim() - 1);
    let lse = phi.map_axis(last, |lane| log_sum_exp(&lane.to_vec()));
    let mut u = phi.clone();
    Zip::from(u.lanes_mut(last)).and(&lse).for_each(|mut lane, &l| {
        if l.is_finite() {
            lane.mapv_inplace(|v| trials * (v - l).exp());
        } else {
            let k = lane.len() as f64;
            lane.fill(trials / k);
        }
    });
    let g = lse.mapv(|l| -trials * l);
    (u, g)
}

// ── Model constructors ─────────────────────────────────────────────

impl Model {
    /// Dirichlet-distributed probability vectors with concentration `alpha`.
    pub fn dirichlet(&mut self, name: &str, alpha: NodeId, plates: Option<&[usize]>) -> Result<NodeId> {
        let categories = self.moments_kind(alpha)?.categories();
        self.add_stochastic(name, Distribution::Dirichlet { categories }, vec![alpha], plates)
    }

    /// Category indices drawn from probability vectors `p`.
    pub fn categorical(&mut self, name: &str, p: NodeId, plates: Option<&[usize]>) -> Result<NodeId> {
        let categories = self.moments_kind(p)?.categories();
        self.add_stochastic(name, Distribution::Categorical { categories }, vec![p], plates)
    }

    pub fn multinomial(
        &mut self,
        name: &str,
        trials: usize,
        p: NodeId,
        plates: Option<&[usize]>,
    ) -> Result<NodeId> {
        let categories = self.moments_kind(p)?.categories();
        self.add_stochastic(
            name,
            Distribution::Multinomial { categories, trials },
            vec![p],
            plates,
        )
    }

    /// Markov chain of length `steps`. `transitions` must carry the plate
    /// axes `(steps - 1, states)` (or `(1, states)` for a shared matrix)
    /// after the chain's own plates.
    pub fn categorical_markov_chain(
        &mut self,
        name: &str,
        p0: NodeId,
        transitions: NodeId,
        steps: usize,
        plates: Option<&[usize]>,
    ) -> Result<NodeId> {
        if steps == 0 {
            return Err(VmpError::validation(
                "categorical Markov chain",
                "chain must have at least one step",
            ));
        }
        let states = self.moments_kind(p0)?.categories();
        self.add_stochastic(
            name,
            Distribution::CategoricalMarkovChain { states, steps },
            vec![p0, transitions],
            plates,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_categorical_moments_are_normalized() {
        let dist = Distribution::Categorical { categories: 3 };
        let phi = vec![arr2(&[[1000.0, 1000.0, 0.0], [-1e5, 0.0, -1e5]]).into_dyn()];
        let (u, g) = dist.compute_moments_and_cgf(&phi).unwrap();
        assert_abs_diff_eq!(u[0][[0, 0]], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(u[0][[1, 1]], 1.0, epsilon = 1e-12);
        assert!(g.iter().all(|v| v.is_finite()), "g = {:?}", g);
        assert_abs_diff_eq!(g[[0]], -(1000.0 + 2f64.ln()), epsilon = 1e-9);
    }

    #[test]
    fn test_multinomial_scales_by_trials() {
        let dist = Distribution::Multinomial { categories: 2, trials: 4 };
        let phi = vec![arr1(&[0.0, 0.0]).into_dyn()];
        let (u, g) = dist.compute_moments_and_cgf(&phi).unwrap();
        assert_abs_diff_eq!(u[0][[0]], 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(g.sum(), -4.0 * 2f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn test_multinomial_base_measure() {
        let dist = Distribution::Multinomial { categories: 3, trials: 3 };
        let (_, f) = dist
            .compute_fixed_moments_and_f(&arr1(&[1.0, 2.0, 0.0]).into_dyn())
            .unwrap();
        // ln 3! − ln 1! − ln 2! = ln 3
        assert_abs_diff_eq!(f.sum(), 3f64.ln(), epsilon = 1e-10);
        assert!(dist
            .compute_fixed_moments_and_f(&arr1(&[1.0, 1.0, 0.0]).into_dyn())
            .is_err());
    }

    #[test]
    fn test_dirichlet_moments_and_cgf() {
        let dist = Distribution::Dirichlet { categories: 2 };
        let phi = vec![arr1(&[1.0, 1.0]).into_dyn()];
        let (u, g) = dist.compute_moments_and_cgf(&phi).unwrap();
        // E[ln p] under Beta(1, 1) is ψ(1) − ψ(2) = −1
        assert_abs_diff_eq!(u[0][[0]], -1.0, epsilon = 1e-10);
        assert_abs_diff_eq!(g.sum(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn test_chain_plates_to_and_from_transitions() {
        let dist = Distribution::CategoricalMarkovChain { states: 3, steps: 5 };
        assert_eq!(dist.plates_to_parent(1, &[2]), vec![2, 4, 3]);
        assert_eq!(dist.plates_to_parent(0, &[2]), vec![2]);
        assert_eq!(dist.plates_from_parent(1, &[2, 4, 3]).unwrap(), vec![2]);
        assert_eq!(dist.plates_from_parent(1, &[1, 3]).unwrap(), Vec::<usize>::new());
        assert!(dist.plates_from_parent(1, &[3]).is_err());
        assert!(dist.plates_from_parent(1, &[2, 3]).is_err());
    }

    #[test]
    fn test_chain_mask_to_transition_parent() {
        let dist = Distribution::CategoricalMarkovChain { states: 2, steps: 3 };
        let mask = arr1(&[true, false, false]).into_dyn();
        let m = dist.compute_mask_to_parent(1, &mask, &[1, 2]).unwrap();
        assert_eq!(m.shape(), &[1, 1]);
        assert!(m.iter().all(|&b| b));
        let m = dist.compute_mask_to_parent(0, &mask, &[3]).unwrap();
        assert_eq!(m, mask);
    }

    #[test]
    fn test_dirichlet_message_to_prior() {
        let dist = Distribution::Dirichlet { categories: 2 };
        let u = vec![arr2(&[[-1.0, -2.0], [-3.0, -4.0]]).into_dyn()];
        let prior = vec![arr1(&[1.0, 1.0]).into_dyn(), ArrayD::zeros(IxDyn(&[]))];
        let m = dist.compute_message_to_parent(0, &u, &[&prior]).unwrap();
        assert_eq!(m[1].shape(), &[2]);
        assert!(dist.compute_message_to_parent(1, &u, &[&prior]).is_err());
    }

    #[test]
    fn test_random_categorical_follows_phi() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let dist = Distribution::Categorical { categories: 3 };
        let phi = vec![arr1(&[f64::NEG_INFINITY, 0.0, f64::NEG_INFINITY]).into_dyn()];
        let x = dist.random(&phi, &[5], &mut rng).unwrap();
        assert_eq!(x.into_raw_vec(), vec![1.0; 5]);
    }

    #[test]
    fn test_random_multinomial_counts_sum_to_trials() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let dist = Distribution::Multinomial { categories: 3, trials: 6 };
        let phi = vec![arr1(&[0.0, 1.0, 2.0]).into_dyn()];
        let x = dist.random(&phi, &[4], &mut rng).unwrap();
        for lane in x.lanes(Axis(1)) {
            assert_abs_diff_eq!(lane.sum(), 6.0);
        }
    }
}
