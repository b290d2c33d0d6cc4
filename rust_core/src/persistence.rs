//! Save and restore the variational state of stochastic nodes.
//!
//! A snapshot stores, per stochastic node name, the moment arrays under
//! keys `u0`, `u1`, ..., the natural parameters under `phi0`, `phi1`, ...,
//! the cgf `g` and the observation mask `observed`. The base measure of
//! observed slices is recomputed from the moments on load. Model
//! structure is not stored: a snapshot is loaded into a model built by the
//! same construction code.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, VmpError};
use crate::graph::{Model, Node, NodeKind};
use crate::plates::masked_select;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub moments: BTreeMap<String, ArrayD<f64>>,
    pub phi: BTreeMap<String, ArrayD<f64>>,
    pub g: ArrayD<f64>,
    pub observed: ArrayD<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub nodes: BTreeMap<String, NodeSnapshot>,
}

impl Model {
    pub fn save(&self) -> ModelSnapshot {
        let mut nodes = BTreeMap::new();
        for node in self.nodes() {
            if let NodeKind::Stochastic(state) = node.kind() {
                nodes.insert(
                    node.name.clone(),
                    NodeSnapshot {
                        moments: keyed("u", &state.u),
                        phi: keyed("phi", &state.phi),
                        g: state.g.clone(),
                        observed: state.observed.clone(),
                    },
                );
            }
        }
        ModelSnapshot { nodes }
    }

    /// Restore the variational state, recompute the base measure of the
    /// observed slices and re-derive the active masks. Every shape is
    /// checked before anything is written.
    pub fn load(&mut self, snapshot: &ModelSnapshot) -> Result<()> {
        let mut checked = Vec::with_capacity(snapshot.nodes.len());
        for (name, snap) in &snapshot.nodes {
            let id = self.node_by_name(name)?;
            let node = self.node(id)?;
            if !node.is_stochastic() {
                return Err(VmpError::Persistence(format!("{} is not a stochastic node", name)));
            }
            let context = format!("restoring {}", name);
            if snap.observed.shape() != node.plates() {
                return Err(VmpError::shape(context, node.plates(), snap.observed.shape()));
            }
            if snap.g.shape() != node.plates() {
                return Err(VmpError::shape(context, node.plates(), snap.g.shape()));
            }
            let u = unkeyed(name, "u", &snap.moments, node, &context)?;
            let phi = unkeyed(name, "phi", &snap.phi, node, &context)?;
            checked.push((id, u, phi, snap.g.clone(), snap.observed.clone()));
        }

        for (id, u, phi, g, observed) in checked {
            let node = self.node_mut(id)?;
            let plates = node.plates.clone();
            let context = format!("restoring {}", node.name);
            if let NodeKind::Stochastic(state) = &mut node.kind {
                let f = state.distribution.compute_f_from_moments(&u);
                let zeros = ArrayD::zeros(IxDyn(&plates));
                state.f = masked_select(&observed, &f, &zeros, &plates, &context)?;
                state.u = u;
                state.phi = phi;
                state.g = g;
                state.observed = observed;
            }
            self.update_mask(id)?;
        }
        debug!(nodes = snapshot.nodes.len(), "loaded snapshot");
        Ok(())
    }

    pub fn save_json<W: Write>(&self, writer: W) -> Result<()> {
        serde_json::to_writer(writer, &self.save())?;
        Ok(())
    }

    pub fn load_json<R: Read>(&mut self, reader: R) -> Result<()> {
        let snapshot: ModelSnapshot = serde_json::from_reader(reader)?;
        self.load(&snapshot)
    }
}

fn keyed(prefix: &str, arrays: &[ArrayD<f64>]) -> BTreeMap<String, ArrayD<f64>> {
    arrays
        .iter()
        .enumerate()
        .map(|(i, a)| (format!("{}{}", prefix, i), a.clone()))
        .collect()
}

/// Arrays `prefix0..` of a snapshot entry, checked against the node's
/// full moment shapes.
fn unkeyed(
    name: &str,
    prefix: &str,
    arrays: &BTreeMap<String, ArrayD<f64>>,
    node: &Node,
    context: &str,
) -> Result<Vec<ArrayD<f64>>> {
    (0..node.dims().len())
        .map(|i| {
            let key = format!("{}{}", prefix, i);
            let arr = arrays
                .get(&key)
                .ok_or_else(|| VmpError::Persistence(format!("{} is missing {}", name, key)))?;
            let expected = node.full_shape(i);
            if arr.shape() != expected.as_slice() {
                return Err(VmpError::shape(context, &expected, arr.shape()));
            }
            Ok(arr.clone())
        })
        .collect()
}
