use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::error::Result;
use crate::graph::{Model, NodeId, NodeKind};

/// Configuration for the VMP iteration loop.
#[derive(Debug, Clone)]
pub struct VmpConfig {
    pub max_iterations: usize,
    /// Stop when the lower bound changes by less than this, relative to its
    /// magnitude.
    pub tolerance: f64,
    /// When set, the scheduled nodes are initialized from random draws of
    /// their priors before the first iteration. Needed to break symmetry in
    /// mixture models.
    pub seed: Option<u64>,
}

impl Default for VmpConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            tolerance: 1e-6,
            seed: None,
        }
    }
}

/// Outcome of [`run`].
#[derive(Debug, Clone)]
pub struct VmpResult {
    /// Lower bound after each iteration.
    pub lower_bounds: Vec<f64>,
    pub iterations: usize,
    pub converged: bool,
}

impl VmpResult {
    pub fn final_lower_bound(&self) -> Option<f64> {
        self.lower_bounds.last().copied()
    }
}

/// All latent stochastic nodes in insertion order, which is topological.
pub fn update_order(model: &Model) -> Vec<NodeId> {
    model
        .nodes()
        .filter(|n| match n.kind() {
            NodeKind::Stochastic(state) => !state.is_fully_observed(),
            _ => false,
        })
        .map(|n| n.id)
        .collect()
}

/// Update the nodes of `order` in turn until the lower bound converges or
/// `max_iterations` is reached.
pub fn run(model: &mut Model, order: &[NodeId], config: &VmpConfig) -> Result<VmpResult> {
    if let Some(seed) = config.seed {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        for &id in order {
            model.initialize_from_random(id, &mut rng)?;
        }
    }

    let mut lower_bounds = Vec::with_capacity(config.max_iterations);
    let mut converged = false;
    for iteration in 0..config.max_iterations {
        for &id in order {
            model.update(id)?;
        }
        let lb = model.lower_bound()?;
        match lower_bounds.last().copied() {
            Some(prev) => {
                let delta = lb - prev;
                info!(iteration, lower_bound = lb, delta, "VMP iteration");
                let scale = config.tolerance * lb.abs().max(1.0);
                if delta < -scale {
                    warn!(iteration, delta, "lower bound decreased");
                }
                lower_bounds.push(lb);
                if delta.abs() < scale {
                    converged = true;
                    info!(iteration, lower_bound = lb, "converged");
                    break;
                }
            }
            None => {
                info!(iteration, lower_bound = lb, "VMP iteration");
                lower_bounds.push(lb);
            }
        }
    }

    Ok(VmpResult {
        iterations: lower_bounds.len(),
        lower_bounds,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn observed_beta() -> (Model, NodeId) {
        let mut model = Model::new();
        let alpha = model
            .dirichlet_concentration("alpha", arr1(&[1.0, 1.0]).into_dyn())
            .unwrap();
        let p = model.dirichlet("p", alpha, None).unwrap();
        let z = model.categorical("z", p, Some(&[6])).unwrap();
        model
            .observe(z, &arr1(&[0.0, 1.0, 1.0, 1.0, 0.0, 1.0]).into_dyn(), None)
            .unwrap();
        (model, p)
    }

    #[test]
    fn test_update_order_skips_observed() {
        let (model, p) = observed_beta();
        assert_eq!(update_order(&model), vec![p]);
    }

    #[test]
    fn test_conjugate_model_converges_immediately() {
        let (mut model, p) = observed_beta();
        let config = VmpConfig::default();
        let result = run(&mut model, &[p], &config).unwrap();
        assert!(result.converged);
        assert_eq!(result.iterations, 2);
        // Beta(1, 1) prior with 2 + 4 counts: log evidence is ln B(3, 5) − ln B(1, 1) = ln(Γ(3) Γ(5) / Γ(8))
        let expected = (2.0f64 * 24.0 / 5040.0).ln();
        let lb = result.final_lower_bound().unwrap();
        assert!((lb - expected).abs() < 1e-9, "lower bound {} vs {}", lb, expected);
    }

    #[test]
    fn test_default_config() {
        let config = VmpConfig::default();
        assert_eq!(config.max_iterations, 100);
        assert!(config.seed.is_none());
    }
}
