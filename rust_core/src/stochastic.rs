//! Stochastic nodes: variational parameters, the update rule, observations
//! and the lower-bound contribution.
//!
//! `u` and `phi` are stored at the node's full shape (plates followed by
//! dims) so every plate slice can be masked independently. Observed slices
//! are protected by a masked select: only slices whose `observed` flag is
//! false are ever written by `update` or the initializers.

use ndarray::{ArrayD, IxDyn, Zip};
use rand::Rng;
use tracing::debug;

use crate::distributions::Distribution;
use crate::error::{Result, VmpError};
use crate::graph::{Model, Node, NodeId, NodeKind};
use crate::moments::Moments;
use crate::plates::{
    add_trailing_axes, broadcast_shapes_checked, broadcast_to, broadcasts_to, masked_select,
    sum_trailing, total_plates,
};

/// Variational state of a stochastic node.
#[derive(Debug, Clone)]
pub struct StochasticState {
    pub distribution: Distribution,
    pub(crate) phi: Moments,
    pub(crate) u: Moments,
    /// Cumulant generating function per plate slice.
    pub(crate) g: ArrayD<f64>,
    /// Base measure of the observed value per plate slice.
    pub(crate) f: ArrayD<f64>,
    pub(crate) observed: ArrayD<bool>,
}

impl StochasticState {
    pub fn phi(&self) -> &Moments {
        &self.phi
    }

    pub fn u(&self) -> &Moments {
        &self.u
    }

    pub fn g(&self) -> &ArrayD<f64> {
        &self.g
    }

    pub fn observed(&self) -> &ArrayD<bool> {
        &self.observed
    }

    pub fn is_fully_observed(&self) -> bool {
        self.observed.iter().all(|&b| b)
    }
}

fn full_shapes(plates: &[usize], dims: &[Vec<usize>]) -> Vec<Vec<usize>> {
    dims.iter()
        .map(|d| {
            let mut s = plates.to_vec();
            s.extend_from_slice(d);
            s
        })
        .collect()
}

/// `mask ? new : old` for every moment array, lifting the plate mask over
/// the variable dimensions.
fn select_moments(
    mask: &ArrayD<bool>,
    new: &Moments,
    old: &Moments,
    plates: &[usize],
    dims: &[Vec<usize>],
    context: &str,
) -> Result<Moments> {
    full_shapes(plates, dims)
        .iter()
        .zip(dims)
        .enumerate()
        .map(|(i, (shape, d))| {
            let m = add_trailing_axes(mask.clone(), d.len());
            masked_select(&m, &new[i], &old[i], shape, context)
        })
        .collect()
}

/// Element-wise `a * u`, with zero wherever `u` is zero so that infinite
/// natural parameters of impossible states do not leak NaNs.
fn weighted_by_moments(a: &ArrayD<f64>, u: &ArrayD<f64>) -> ArrayD<f64> {
    let mut out = u.clone();
    Zip::from(&mut out).and(a).for_each(|o, &a| {
        if *o != 0.0 {
            *o *= a;
        }
    });
    out
}

fn stochastic_state<'a>(node: &'a Node, operation: &str) -> Result<&'a StochasticState> {
    match &node.kind {
        NodeKind::Stochastic(state) => Ok(state),
        _ => Err(VmpError::validation(
            operation,
            format!("{} is not a stochastic node", node.name),
        )),
    }
}

fn stochastic_state_mut<'a>(node: &'a mut Node, operation: &str) -> Result<&'a mut StochasticState> {
    match &mut node.kind {
        NodeKind::Stochastic(state) => Ok(state),
        _ => Err(VmpError::validation(
            operation,
            format!("{} is not a stochastic node", node.name),
        )),
    }
}

impl Model {
    /// Add a stochastic node following `distribution`, initialized from its
    /// prior. Plates default to the broadcast of the parents' plates; an
    /// explicit `plates` must absorb them.
    pub fn add_stochastic(
        &mut self,
        name: &str,
        distribution: Distribution,
        parents: Vec<NodeId>,
        plates: Option<&[usize]>,
    ) -> Result<NodeId> {
        let context = distribution.label();
        let expected = distribution.parent_kinds();
        if parents.len() != expected.len() {
            return Err(VmpError::validation(
                context,
                format!("expected {} parents, got {}", expected.len(), parents.len()),
            ));
        }
        let mut from_parents = Vec::new();
        for (i, (&p, kind)) in parents.iter().zip(&expected).enumerate() {
            let parent = self.node(p)?;
            if parent.moments_kind != *kind {
                return Err(VmpError::validation(
                    context,
                    format!(
                        "parent {} provides {:?} moments, expected {:?}",
                        parent.name, parent.moments_kind, kind
                    ),
                ));
            }
            let pp = distribution.plates_from_parent(i, &parent.plates)?;
            from_parents = broadcast_shapes_checked(context, &from_parents, &pp)?;
        }
        let plates = total_plates(context, plates, &from_parents)?;
        let dims = distribution.dims();

        let phi = self.phi_from_parents(distribution, &parents, &full_shapes(&plates, &dims))?;
        let (u, g) = distribution.compute_moments_and_cgf(&phi)?;
        let g = broadcast_to(&g, &plates, context)?;
        let state = StochasticState {
            distribution,
            phi,
            u,
            g,
            f: ArrayD::zeros(IxDyn(&plates)),
            observed: ArrayD::from_elem(IxDyn(&plates), false),
        };
        let id = self.add_node(
            name,
            plates,
            dims,
            distribution.moments_kind(),
            parents.clone(),
            NodeKind::Stochastic(state),
        )?;
        for (i, p) in parents.into_iter().enumerate() {
            self.attach_child(p, id, i)?;
        }
        debug!(node = %self.name(id)?, family = context, "added stochastic node");
        Ok(id)
    }

    pub fn state(&self, id: NodeId) -> Result<&StochasticState> {
        stochastic_state(self.node(id)?, "state")
    }

    /// Natural parameters from the parents, broadcast to `shapes`.
    fn phi_from_parents(
        &self,
        distribution: Distribution,
        parents: &[NodeId],
        shapes: &[Vec<usize>],
    ) -> Result<Moments> {
        let u: Vec<Moments> = parents
            .iter()
            .map(|&p| self.get_moments(p))
            .collect::<Result<_>>()?;
        let refs: Vec<&Moments> = u.iter().collect();
        let phi = distribution.compute_phi_from_parents(&refs)?;
        phi.iter()
            .zip(shapes)
            .map(|(p, s)| broadcast_to(p, s, "natural parameters from parents"))
            .collect()
    }

    /// Write `phi`, `u` and `g` into the latent (unobserved) slices.
    fn set_latent(&mut self, id: NodeId, phi: Moments, u: Moments, g: ArrayD<f64>) -> Result<()> {
        let node = self.node_mut(id)?;
        let plates = node.plates.clone();
        let dims = node.dims.clone();
        let context = format!("update of {}", node.name);
        let state = stochastic_state_mut(node, "update")?;
        let latent = state.observed.mapv(|b| !b);
        state.u = select_moments(&latent, &u, &state.u, &plates, &dims, &context)?;
        state.phi = select_moments(&latent, &phi, &state.phi, &plates, &dims, &context)?;
        state.g = masked_select(&latent, &g, &state.g, &plates, &context)?;
        Ok(())
    }

    /// One variational update: `phi = phi_parents + Σ messages from
    /// children`, then moments and cgf from `phi`. Observed slices are left
    /// untouched; a fully observed node is a no-op.
    pub fn update(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let state = stochastic_state(node, "update")?;
        if state.is_fully_observed() {
            return Ok(());
        }
        let distribution = state.distribution;
        let shapes = full_shapes(&node.plates, &node.dims);
        let phi_p = self.phi_from_parents(distribution, &node.parents, &shapes)?;
        let messages = self.message_from_children(id)?;
        let phi: Moments = phi_p.into_iter().zip(messages).map(|(p, m)| p + m).collect();
        let (u, g) = distribution.compute_moments_and_cgf(&phi)?;
        let g = broadcast_to(&g, &node.plates, "cgf")?;
        debug!(node = %node.name, plates = ?node.plates, "update");
        self.set_latent(id, phi, u, g)
    }

    /// Fix the slices selected by `mask` (all slices when `None`) to
    /// `value`. The new mask replaces any previous observation mask.
    pub fn observe(&mut self, id: NodeId, value: &ArrayD<f64>, mask: Option<&ArrayD<bool>>) -> Result<()> {
        let node = self.node(id)?;
        let state = stochastic_state(node, "observe")?;
        let context = format!("observation of {}", node.name);
        let (u, f) = state.distribution.compute_fixed_moments_and_f(value)?;
        let plates = node.plates.clone();
        let dims = node.dims.clone();
        for (ui, shape) in u.iter().zip(full_shapes(&plates, &dims)) {
            if !broadcasts_to(ui.shape(), &shape) {
                return Err(VmpError::validation(
                    context,
                    format!("value shape {:?} does not broadcast to plates {:?}", value.shape(), plates),
                ));
            }
        }
        let observed = match mask {
            None => ArrayD::from_elem(IxDyn(&plates), true),
            Some(m) if broadcasts_to(m.shape(), &plates) => broadcast_to(m, &plates, &context)?,
            Some(m) => {
                return Err(VmpError::validation(
                    context,
                    format!("mask shape {:?} does not broadcast to plates {:?}", m.shape(), plates),
                ))
            }
        };

        let node = self.node_mut(id)?;
        debug!(
            node = %node.name,
            observed = observed.iter().filter(|&&b| b).count(),
            "observe"
        );
        let state = stochastic_state_mut(node, "observe")?;
        state.u = select_moments(&observed, &u, &state.u, &plates, &dims, &context)?;
        state.f = masked_select(&observed, &f, &state.f, &plates, &context)?;
        state.observed = observed;
        self.update_mask(id)
    }

    /// Mark every slice latent again. Moments keep their current values
    /// until the next update.
    pub fn unobserve(&mut self, id: NodeId) -> Result<()> {
        let node = self.node_mut(id)?;
        debug!(node = %node.name, "unobserve");
        let state = stochastic_state_mut(node, "unobserve")?;
        state.observed.fill(false);
        state.f.fill(0.0);
        self.update_mask(id)
    }

    /// Reset the latent slices to the distribution given by the parents.
    pub fn initialize_from_prior(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let distribution = stochastic_state(node, "initialize")?.distribution;
        let shapes = full_shapes(&node.plates, &node.dims);
        let phi = self.phi_from_parents(distribution, &node.parents, &shapes)?;
        let (u, g) = distribution.compute_moments_and_cgf(&phi)?;
        let g = broadcast_to(&g, &node.plates, "cgf")?;
        self.set_latent(id, phi, u, g)
    }

    /// Set the moments of the latent slices to those of a fixed value
    /// without observing it.
    ///
    /// Only `u` changes: `phi` and `g` keep describing the previous
    /// distribution until the next [`update`](Model::update), so
    /// [`random`](Model::random) still draws from it and the lower bound
    /// mixes the two states. Call this before the first update of an
    /// iteration schedule, never between an update and a lower-bound
    /// evaluation.
    pub fn initialize_from_value(&mut self, id: NodeId, value: &ArrayD<f64>) -> Result<()> {
        let node = self.node(id)?;
        let state = stochastic_state(node, "initialize")?;
        let (u, _) = state.distribution.compute_fixed_moments_and_f(value)?;
        let plates = node.plates.clone();
        let dims = node.dims.clone();
        let context = format!("initialization of {}", node.name);
        let node = self.node_mut(id)?;
        let state = stochastic_state_mut(node, "initialize")?;
        let latent = state.observed.mapv(|b| !b);
        state.u = select_moments(&latent, &u, &state.u, &plates, &dims, &context)?;
        Ok(())
    }

    /// Initialize the latent slices from a draw of the current distribution.
    /// Like [`initialize_from_value`](Model::initialize_from_value), only
    /// the moments change.
    pub fn initialize_from_random<R: Rng + ?Sized>(&mut self, id: NodeId, rng: &mut R) -> Result<()> {
        let x = self.random(id, rng)?;
        self.initialize_from_value(id, &x)
    }

    /// One draw per plate from the node's current natural parameters.
    pub fn random<R: Rng + ?Sized>(&self, id: NodeId, rng: &mut R) -> Result<ArrayD<f64>> {
        let node = self.node(id)?;
        let state = stochastic_state(node, "random")?;
        state.distribution.random(&state.phi, &node.plates, rng)
    }

    /// Contribution of one stochastic node to the lower bound.
    ///
    /// Latent slices add `g_p − g + Σ (φ_p − φ)·u`, observed slices
    /// `g_p + f + Σ φ_p·u`. Only active slices count, each once per plate
    /// element.
    pub fn lower_bound_contribution(&self, id: NodeId) -> Result<f64> {
        let node = self.node(id)?;
        let state = stochastic_state(node, "lower bound")?;
        let distribution = state.distribution;
        let shapes = full_shapes(&node.plates, &node.dims);
        let phi_p = self.phi_from_parents(distribution, &node.parents, &shapes)?;
        let u_parents = self.parent_moments(id)?;
        let refs: Vec<&Moments> = u_parents.iter().collect();
        let g_p = distribution.compute_cgf_from_parents(&refs)?;
        let g_p = broadcast_to(&g_p, &node.plates, "lower bound")?;

        let mut latent = &g_p - &state.g;
        let mut observed = &g_p + &state.f;
        for (i, d) in node.dims.iter().enumerate() {
            let diff = &phi_p[i] - &state.phi[i];
            latent += &sum_trailing(weighted_by_moments(&diff, &state.u[i]), d.len());
            observed += &sum_trailing(weighted_by_moments(&phi_p[i], &state.u[i]), d.len());
        }

        let mut total = 0.0;
        Zip::from(&node.mask)
            .and(&state.observed)
            .and(&latent)
            .and(&observed)
            .for_each(|&active, &obs, &l, &o| {
                if active {
                    total += if obs { o } else { l };
                }
            });
        Ok(total)
    }
}
