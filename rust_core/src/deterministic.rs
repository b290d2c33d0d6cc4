//! Deterministic nodes. Their moments are a pure function of the parents'
//! moments and they hold no variational parameters, so their lower-bound
//! contribution is zero.

use ndarray::{concatenate, ArrayD, Axis, IxDyn};

use crate::error::{Result, VmpError};
use crate::graph::{Model, NodeId, NodeKind};
use crate::moments::Moments;
use crate::plates::{make_equal_length, squeeze_to_dim};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeterministicOp {
    /// Repeat the parent's plates, right-aligned like `numpy.tile`:
    /// `[a, b, c]` tiled by `2` is `[a, b, c, a, b, c]`.
    Tile { tiles: Vec<usize> },
}

impl DeterministicOp {
    pub fn plates_from_parent(&self, parent_plates: &[usize]) -> Vec<usize> {
        match self {
            Self::Tile { tiles } => {
                let eq = make_equal_length(&[parent_plates, tiles.as_slice()]);
                eq[0].iter().zip(&eq[1]).map(|(p, t)| p * t).collect()
            }
        }
    }

    pub fn plates_to_parent(&self, plates: &[usize]) -> Vec<usize> {
        match self {
            Self::Tile { tiles } => {
                let mut out = plates.to_vec();
                let n = out.len();
                for (k, &t) in tiles.iter().rev().enumerate() {
                    if k < n {
                        out[n - 1 - k] /= t;
                    }
                }
                out
            }
        }
    }

    /// Moments of the tiled node. Unit and missing leading plate axes are
    /// not materialized since they broadcast anyway.
    pub fn compute_moments(&self, u: &Moments, dims: &[Vec<usize>]) -> Result<Moments> {
        let Self::Tile { tiles } = self;
        u.iter()
            .zip(dims)
            .map(|(ui, d)| {
                let n_plates = ui.ndim().saturating_sub(d.len());
                let mut out = ui.clone();
                for (k, &t) in tiles.iter().rev().enumerate() {
                    if t == 1 || k >= n_plates {
                        continue;
                    }
                    let ax = Axis(n_plates - 1 - k);
                    if out.shape()[ax.index()] == 1 {
                        continue;
                    }
                    out = {
                        let views = vec![out.view(); t];
                        concatenate(ax, &views)
                    }
                    .map_err(|_| VmpError::shape("tiling moments", tiles, ui.shape()))?;
                }
                Ok(out)
            })
            .collect()
    }

    /// Undo the tiling on a message from this node's children by summing
    /// the replicas, then drop leading unit axes down to the parent's rank.
    pub fn compute_message_to_parent(
        &self,
        m: Moments,
        plates: &[usize],
        dims: &[Vec<usize>],
        parent_plates: &[usize],
    ) -> Result<Moments> {
        let plates_parent = self.plates_to_parent(plates);
        m.into_iter()
            .zip(dims)
            .map(|(mi, d)| {
                let mut shape = plates_parent.clone();
                shape.extend_from_slice(d);
                let (arr, r) = self.untile(mi, &shape, d.len(), 0.0, |a, b| a + b)?;
                let arr = if r > 1 { arr.mapv(|v| v * r as f64) } else { arr };
                squeeze_to_dim(arr, parent_plates.len() + d.len(), "tile message to parent")
            })
            .collect()
    }

    /// Logical-OR counterpart of the message reduction for plate masks.
    pub fn compute_mask_to_parent(
        &self,
        mask: &ArrayD<bool>,
        plates: &[usize],
        parent_plates: &[usize],
    ) -> Result<ArrayD<bool>> {
        let shape = self.plates_to_parent(plates);
        let (arr, _) = self.untile(mask.clone(), &shape, 0, false, |a, b| *a || *b)?;
        squeeze_to_dim(arr, parent_plates.len(), "tile mask to parent")
    }

    /// Reshape `arr` into interleaved `(tile, parent)` axis pairs and fold
    /// every tile axis. Axes where `arr` is already broadcast (size 1) are
    /// not folded; their replica count is returned as a multiplier.
    fn untile<T, F>(
        &self,
        arr: ArrayD<T>,
        parent_shape: &[usize],
        ndim_dims: usize,
        init: T,
        f: F,
    ) -> Result<(ArrayD<T>, usize)>
    where
        T: Clone,
        F: Fn(&T, &T) -> T,
    {
        let Self::Tile { tiles } = self;
        let mut tiles_ind = tiles.clone();
        tiles_ind.extend(std::iter::repeat(1).take(ndim_dims));
        let shape_m = arr.shape().to_vec();
        let eq = make_equal_length(&[tiles_ind.as_slice(), parent_shape, shape_m.as_slice()]);
        let (mut tiles_ind, mut shape, shape_m) = (eq[0].clone(), eq[1].clone(), eq[2].clone());

        let mut r = 1;
        for j in 0..shape.len() {
            if shape_m[j] == 1 {
                r *= tiles_ind[j];
                shape[j] = 1;
                tiles_ind[j] = 1;
            }
        }
        let interleaved: Vec<usize> = tiles_ind
            .iter()
            .zip(&shape)
            .flat_map(|(&t, &s)| [t, s])
            .collect();

        let arr = arr
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&interleaved))
            .map_err(|_| VmpError::shape("tile reduction", &interleaved, &shape_m))?;
        let mut arr = arr;
        for ax in (0..interleaved.len()).step_by(2).rev() {
            arr = arr.fold_axis(Axis(ax), init.clone(), |acc, x| f(acc, x));
        }
        Ok((arr, r))
    }
}

impl Model {
    /// Deterministic node tiling the plates of `x`. Attaches to `x` only
    /// once it gets a child of its own.
    pub fn tile(&mut self, name: &str, x: NodeId, tiles: &[usize]) -> Result<NodeId> {
        if tiles.iter().any(|&t| t == 0) {
            return Err(VmpError::validation("tile", "tile counts must be positive"));
        }
        let parent = self.node(x)?;
        let op = DeterministicOp::Tile {
            tiles: tiles.to_vec(),
        };
        let plates = op.plates_from_parent(&parent.plates);
        let dims = parent.dims.clone();
        let kind = parent.moments_kind;
        self.add_node(name, plates, dims, kind, vec![x], NodeKind::Deterministic(op))
    }
}
