use std::collections::HashMap;

use ndarray::{ArrayD, IxDyn, Zip};
use tracing::debug;

use crate::deterministic::DeterministicOp;
use crate::error::{Result, VmpError};
use crate::moments::{Moments, MomentsKind};
use crate::plates::{add_trailing_axes, broadcast_to, broadcast_view, sum_to_shape};
use crate::stochastic::StochasticState;

/// Unique identifier for a node in the model arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub usize);

/// What a node computes its moments from.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Fixed moments of a constant value (prior hyperparameters).
    Constant { u: Moments },
    Stochastic(StochasticState),
    /// Pure function of the parents' moments, recomputed on every pull.
    Deterministic(DeterministicOp),
}

/// A single node in the model.
///
/// Parent and child links are indices into the owning [`Model`]; a child
/// entry `(c, i)` means this node is parent number `i` of node `c`.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub(crate) plates: Vec<usize>,
    pub(crate) dims: Vec<Vec<usize>>,
    pub(crate) moments_kind: MomentsKind,
    pub(crate) parents: Vec<NodeId>,
    pub(crate) children: Vec<(NodeId, usize)>,
    pub(crate) mask: ArrayD<bool>,
    pub(crate) kind: NodeKind,
}

impl Node {
    pub fn plates(&self) -> &[usize] {
        &self.plates
    }

    pub fn dims(&self) -> &[Vec<usize>] {
        &self.dims
    }

    pub fn parents(&self) -> &[NodeId] {
        &self.parents
    }

    pub fn children(&self) -> &[(NodeId, usize)] {
        &self.children
    }

    /// Active plate slices: observed here or below.
    pub fn mask(&self) -> &ArrayD<bool> {
        &self.mask
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_stochastic(&self) -> bool {
        matches!(self.kind, NodeKind::Stochastic(_))
    }

    /// Plates followed by the variable dimensions of moment `i`.
    pub(crate) fn full_shape(&self, i: usize) -> Vec<usize> {
        let mut shape = self.plates.clone();
        shape.extend_from_slice(&self.dims[i]);
        shape
    }
}

/// Arena of nodes forming a directed graphical model.
///
/// Nodes are appended in topological order (parents always exist before
/// their children), so insertion order is a valid update schedule.
#[derive(Debug, Clone)]
pub struct Model {
    nodes: Vec<Node>,
    name_to_node: HashMap<String, NodeId>,
}

impl Model {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            name_to_node: HashMap::new(),
        }
    }

    /// Insert a node. An empty `name` gets a generated one.
    pub(crate) fn add_node(
        &mut self,
        name: &str,
        plates: Vec<usize>,
        dims: Vec<Vec<usize>>,
        moments_kind: MomentsKind,
        parents: Vec<NodeId>,
        kind: NodeKind,
    ) -> Result<NodeId> {
        let id = NodeId(self.nodes.len());
        let name = if name.is_empty() {
            let prefix = match kind {
                NodeKind::Constant { .. } => "constant",
                NodeKind::Stochastic(_) => "stochastic",
                NodeKind::Deterministic(_) => "deterministic",
            };
            format!("{}_{}", prefix, id.0)
        } else {
            name.to_string()
        };
        if self.name_to_node.contains_key(&name) {
            return Err(VmpError::validation(
                "node name",
                format!("{} is already used in this model", name),
            ));
        }
        for p in &parents {
            self.node(*p)?;
        }
        let mask = ArrayD::from_elem(IxDyn(&plates), false);
        self.name_to_node.insert(name.clone(), id);
        self.nodes.push(Node {
            id,
            name,
            plates,
            dims,
            moments_kind,
            parents,
            children: Vec::new(),
            mask,
            kind,
        });
        Ok(id)
    }

    /// Constant Dirichlet concentration `alpha`, shape `(plates.., K)`.
    pub fn dirichlet_concentration(&mut self, name: &str, alpha: ArrayD<f64>) -> Result<NodeId> {
        let categories = categories_of("Dirichlet concentration", &alpha)?;
        self.add_constant(name, MomentsKind::DirichletPrior { categories }, &alpha)
    }

    /// Constant probability vectors `p`, shape `(plates.., K)`, each
    /// summing to one.
    pub fn probabilities(&mut self, name: &str, p: ArrayD<f64>) -> Result<NodeId> {
        let categories = categories_of("probabilities", &p)?;
        self.add_constant(name, MomentsKind::Dirichlet { categories }, &p)
    }

    fn add_constant(&mut self, name: &str, kind: MomentsKind, value: &ArrayD<f64>) -> Result<NodeId> {
        let u = kind.compute_fixed_moments(value)?;
        let plates = kind.value_plates(value)?;
        self.add_node(name, plates, kind.dims(), kind, Vec::new(), NodeKind::Constant { u })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn node(&self, id: NodeId) -> Result<&Node> {
        self.nodes
            .get(id.0)
            .ok_or_else(|| VmpError::UnknownNode(format!("#{}", id.0)))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes
            .get_mut(id.0)
            .ok_or_else(|| VmpError::UnknownNode(format!("#{}", id.0)))
    }

    pub fn node_by_name(&self, name: &str) -> Result<NodeId> {
        self.name_to_node
            .get(name)
            .copied()
            .ok_or_else(|| VmpError::UnknownNode(name.to_string()))
    }

    pub fn name(&self, id: NodeId) -> Result<&str> {
        Ok(&self.node(id)?.name)
    }

    pub fn plates(&self, id: NodeId) -> Result<&[usize]> {
        Ok(&self.node(id)?.plates)
    }

    pub fn dims(&self, id: NodeId) -> Result<&[Vec<usize>]> {
        Ok(&self.node(id)?.dims)
    }

    pub fn mask(&self, id: NodeId) -> Result<&ArrayD<bool>> {
        Ok(&self.node(id)?.mask)
    }

    pub fn moments_kind(&self, id: NodeId) -> Result<MomentsKind> {
        Ok(self.node(id)?.moments_kind)
    }

    /// Current moments of a node. Deterministic nodes recompute theirs from
    /// the parents on every call.
    pub fn get_moments(&self, id: NodeId) -> Result<Moments> {
        let node = self.node(id)?;
        match &node.kind {
            NodeKind::Constant { u } => Ok(u.clone()),
            NodeKind::Stochastic(state) => Ok(state.u.clone()),
            NodeKind::Deterministic(op) => {
                let parents = self.parent_moments(id)?;
                op.compute_moments(&parents[0], &node.dims)
            }
        }
    }

    pub(crate) fn parent_moments(&self, id: NodeId) -> Result<Vec<Moments>> {
        self.node(id)?
            .parents
            .iter()
            .map(|&p| self.get_moments(p))
            .collect()
    }

    /// Register `child` as a child of `parent` at argument `index`.
    ///
    /// A deterministic parent only becomes visible to its own parents once
    /// it has a child, so the first attachment propagates upwards.
    pub(crate) fn attach_child(&mut self, parent: NodeId, child: NodeId, index: usize) -> Result<()> {
        let node = self.node_mut(parent)?;
        node.children.push((child, index));
        if node.children.len() == 1 {
            if let NodeKind::Deterministic(_) = node.kind {
                debug!(node = %node.name, "deterministic node attaching to its parents");
                let grandparents = node.parents.clone();
                for (i, p) in grandparents.into_iter().enumerate() {
                    self.attach_child(p, parent, i)?;
                }
            }
        }
        Ok(())
    }

    pub(crate) fn detach_child(&mut self, parent: NodeId, child: NodeId, index: usize) -> Result<()> {
        let node = self.node_mut(parent)?;
        let before = node.children.len();
        node.children.retain(|&(c, i)| !(c == child && i == index));
        if before > 0 && node.children.is_empty() {
            if let NodeKind::Deterministic(_) = node.kind {
                debug!(node = %node.name, "deterministic node lost its last child, detaching");
                let grandparents = node.parents.clone();
                for (i, p) in grandparents.into_iter().enumerate() {
                    self.detach_child(p, parent, i)?;
                }
            }
        }
        Ok(())
    }

    /// Remove a node from its parents' child lists. The node stays in the
    /// arena and can still read its parents, but no longer sends messages.
    pub fn disconnect(&mut self, id: NodeId) -> Result<()> {
        let parents = self.node(id)?.parents.clone();
        for (i, &p) in parents.iter().enumerate() {
            self.detach_child(p, id, i)?;
        }
        for p in parents {
            self.update_mask(p)?;
        }
        Ok(())
    }

    /// Recompute the mask of `id` from its observations and its children,
    /// then push the change up to the parents.
    pub(crate) fn update_mask(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        let mut mask = match &node.kind {
            NodeKind::Constant { .. } => return Ok(()),
            NodeKind::Stochastic(state) => state.observed.clone(),
            NodeKind::Deterministic(_) => ArrayD::from_elem(IxDyn(&node.plates), false),
        };
        let shape = node.plates.clone();
        for &(child, index) in &node.children {
            let m = self.mask_to_parent(child, index)?;
            let m = broadcast_view(&m, &shape, "mask from children")?;
            Zip::from(&mut mask).and(&m).for_each(|a, &b| *a |= b);
        }
        let parents = node.parents.clone();
        let node = self.node_mut(id)?;
        if node.mask != mask {
            debug!(
                node = %node.name,
                active = mask.iter().filter(|&&b| b).count(),
                "mask changed"
            );
            node.mask = mask;
        }
        for p in parents {
            self.update_mask(p)?;
        }
        Ok(())
    }

    /// Mask of `child` reduced to the plates of its parent at `index`.
    fn mask_to_parent(&self, child: NodeId, index: usize) -> Result<ArrayD<bool>> {
        let c = self.node(child)?;
        let parent = self.node(c.parents[index])?;
        match &c.kind {
            NodeKind::Stochastic(state) => {
                state
                    .distribution
                    .compute_mask_to_parent(index, &c.mask, &parent.plates)
            }
            NodeKind::Deterministic(op) => op.compute_mask_to_parent(&c.mask, &c.plates, &parent.plates),
            NodeKind::Constant { .. } => Ok(ArrayD::from_elem(IxDyn(&parent.plates), false)),
        }
    }

    /// Message from `child` to its parent at `index`, already reduced to the
    /// parent's plates and dims. Inactive child slices contribute nothing;
    /// child plates that broadcast a parent plate are summed with their full
    /// multiplicity.
    pub(crate) fn message_to_parent(&self, child: NodeId, index: usize) -> Result<Moments> {
        let c = self.node(child)?;
        let parent = self.node(c.parents[index])?;
        match &c.kind {
            NodeKind::Stochastic(state) => {
                let u_parents = self.parent_moments(child)?;
                let refs: Vec<&Moments> = u_parents.iter().collect();
                let m = state
                    .distribution
                    .compute_message_to_parent(index, &state.u, &refs)?;
                let plates = state.distribution.plates_to_parent(index, &c.plates);
                let mask = state.distribution.expand_mask(index, &c.mask);
                let context = format!("message from {} to {}", c.name, parent.name);
                m.into_iter()
                    .zip(parent.dims.iter())
                    .map(|(mi, dims)| {
                        let mut full = plates.clone();
                        full.extend_from_slice(dims);
                        let mut mi = broadcast_to(&mi, &full, &context)?;
                        let weight = add_trailing_axes(mask.clone(), dims.len());
                        let weight = broadcast_view(&weight, &full, &context)?;
                        Zip::from(&mut mi).and(&weight).for_each(|v, &on| {
                            if !on {
                                *v = 0.0;
                            }
                        });
                        let mut target = parent.plates.clone();
                        target.extend_from_slice(dims);
                        sum_to_shape(mi, &target, &context)
                    })
                    .collect()
            }
            NodeKind::Deterministic(op) => {
                let m = self.message_from_children(child)?;
                op.compute_message_to_parent(m, &c.plates, &c.dims, &parent.plates)
            }
            NodeKind::Constant { .. } => Err(VmpError::validation(
                "message passing",
                format!("constant {} has no parents", c.name),
            )),
        }
    }

    /// Sum of the messages from all children, at the node's full shape.
    pub(crate) fn message_from_children(&self, id: NodeId) -> Result<Moments> {
        let node = self.node(id)?;
        let mut total: Moments = (0..node.dims.len())
            .map(|i| ArrayD::zeros(IxDyn(&node.full_shape(i))))
            .collect();
        for &(child, index) in &node.children {
            let m = self.message_to_parent(child, index)?;
            let context = format!("messages to {}", node.name);
            for (t, mi) in total.iter_mut().zip(m) {
                let shape = t.shape().to_vec();
                let mi = broadcast_view(&mi, &shape, &context)?;
                *t += &mi;
            }
        }
        Ok(total)
    }

    /// Variational lower bound summed over all stochastic nodes.
    pub fn lower_bound(&self) -> Result<f64> {
        let mut total = 0.0;
        for node in &self.nodes {
            if node.is_stochastic() {
                total += self.lower_bound_contribution(node.id)?;
            }
        }
        Ok(total)
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}

fn categories_of(context: &str, value: &ArrayD<f64>) -> Result<usize> {
    match value.shape().last() {
        Some(&k) if k > 0 => Ok(k),
        Some(_) => Err(VmpError::validation(context, "need at least one category")),
        None => Err(VmpError::validation(context, "value must be at least one-dimensional")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_names_are_unique_and_generated() {
        let mut model = Model::new();
        let a = model.dirichlet_concentration("alpha", arr1(&[1.0, 1.0]).into_dyn()).unwrap();
        assert_eq!(model.node_by_name("alpha").unwrap(), a);
        assert!(model
            .dirichlet_concentration("alpha", arr1(&[1.0, 1.0]).into_dyn())
            .is_err());
        let b = model.dirichlet_concentration("", arr1(&[2.0, 1.0]).into_dyn()).unwrap();
        assert_eq!(model.name(b).unwrap(), "constant_1");
        assert!(matches!(model.node_by_name("beta"), Err(VmpError::UnknownNode(_))));
    }

    #[test]
    fn test_constant_plates_and_validation() {
        let mut model = Model::new();
        let p = model
            .probabilities("p", arr2(&[[0.5, 0.5], [0.1, 0.9], [1.0, 0.0]]).into_dyn())
            .unwrap();
        assert_eq!(model.plates(p).unwrap(), &[3]);
        assert_eq!(model.dims(p).unwrap(), &[vec![2]]);
        assert!(model.probabilities("q", arr1(&[0.5, 0.6]).into_dyn()).is_err());
        assert!(model
            .dirichlet_concentration("a", ArrayD::zeros(IxDyn(&[0])))
            .is_err());
    }

    #[test]
    fn test_deterministic_attaches_only_with_children() {
        let mut model = Model::new();
        let p = model.probabilities("p", arr1(&[0.3, 0.7]).into_dyn()).unwrap();
        let t = model.tile("t", p, &[4]).unwrap();
        assert!(model.node(p).unwrap().children().is_empty());

        let z = model.categorical("z", t, None).unwrap();
        assert_eq!(model.node(t).unwrap().children(), &[(z, 0)]);
        assert_eq!(model.node(p).unwrap().children(), &[(t, 0)]);

        model.disconnect(z).unwrap();
        assert!(model.node(t).unwrap().children().is_empty());
        assert!(model.node(p).unwrap().children().is_empty());
    }

    #[test]
    fn test_mask_propagates_to_parents() {
        let mut model = Model::new();
        let alpha = model.dirichlet_concentration("alpha", arr1(&[1.0, 1.0]).into_dyn()).unwrap();
        let p = model.dirichlet("p", alpha, None).unwrap();
        let z = model.categorical("z", p, Some(&[3])).unwrap();
        assert!(!model.mask(p).unwrap().iter().any(|&b| b));

        let mask = arr1(&[false, true, false]).into_dyn();
        model
            .observe(z, &arr1(&[0.0, 1.0, 0.0]).into_dyn(), Some(&mask))
            .unwrap();
        assert_eq!(model.mask(z).unwrap(), &mask);
        assert!(model.mask(p).unwrap().iter().all(|&b| b));

        model.unobserve(z).unwrap();
        assert!(!model.mask(p).unwrap().iter().any(|&b| b));
    }

    #[test]
    fn test_incompatible_message_plates_are_structural() {
        let mut model = Model::new();
        let alpha = model.dirichlet_concentration("alpha", arr1(&[1.0, 1.0]).into_dyn()).unwrap();
        let p = model.dirichlet("p", alpha, None).unwrap();
        let z = model.categorical("z", p, Some(&[3])).unwrap();
        model
            .observe(z, &arr1(&[0.0, 1.0, 1.0]).into_dyn(), None)
            .unwrap();
        // p now claims 5 plates that z's 3 cannot broadcast onto
        model.node_mut(p).unwrap().plates = vec![5];

        let err = model.message_from_children(p).unwrap_err();
        assert!(err.is_structural(), "expected a shape error, got {}", err);
        let err = model.update(p).unwrap_err();
        assert!(err.is_structural(), "expected a shape error, got {}", err);
    }
}
