//! Sampling primitives with broadcasting over plates.
//!
//! Distributions are parametrized along the last axis; all leading axes are
//! plates. An explicit `size` must be a shape the parameter plates broadcast
//! to, mirroring how node plates relate to their parents' plates.

use ndarray::{ArrayD, Axis, IxDyn};
use rand::Rng;
use rand_distr::{Distribution, Gamma};

use crate::error::{Result, VmpError};
use crate::moments::from_vec;
use crate::plates::{broadcast_to, broadcasts_to};

/// Index drawn proportionally to non-negative `weights` with positive sum.
pub(crate) fn categorical_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().sum();
    let u = rng.gen::<f64>() * total;
    let mut cum = 0.0;
    for (i, &w) in weights.iter().enumerate() {
        cum += w;
        if cum > u {
            return i;
        }
    }
    // rounding left u at the very top: take the last index with mass
    weights.iter().rposition(|&w| w > 0.0).unwrap_or(0)
}

fn output_plates(context: &str, param: &ArrayD<f64>, size: Option<&[usize]>) -> Result<Vec<usize>> {
    if param.ndim() < 1 {
        return Err(VmpError::validation(context, "parameters must be at least one-dimensional"));
    }
    let plates = &param.shape()[..param.ndim() - 1];
    match size {
        None => Ok(plates.to_vec()),
        Some(size) if broadcasts_to(plates, size) => Ok(size.to_vec()),
        Some(size) => Err(VmpError::validation(
            context,
            format!("size {:?} does not match parameter plates {:?}", size, plates),
        )),
    }
}

fn expand(param: &ArrayD<f64>, plates: &[usize], context: &str) -> Result<ArrayD<f64>> {
    let mut shape = plates.to_vec();
    shape.push(param.shape()[param.ndim() - 1]);
    broadcast_to(param, &shape, context)
}

/// Draw category indices from (possibly unnormalized) probabilities.
pub fn categorical<R: Rng + ?Sized>(
    p: &ArrayD<f64>,
    size: Option<&[usize]>,
    rng: &mut R,
) -> Result<ArrayD<usize>> {
    let context = "categorical probabilities";
    let plates = output_plates(context, p, size)?;
    if p.iter().any(|&v| !(v >= 0.0) || !v.is_finite()) {
        return Err(VmpError::validation(context, "probabilities must be non-negative and finite"));
    }
    let p = expand(p, &plates, context)?;
    let mut out = Vec::with_capacity(plates.iter().product());
    for lane in p.lanes(Axis(p.ndim() - 1)) {
        let weights: Vec<f64> = lane.to_vec();
        if !(weights.iter().sum::<f64>() > 0.0) {
            return Err(VmpError::validation(context, "probabilities have no mass"));
        }
        out.push(categorical_index(&weights, rng));
    }
    ArrayD::from_shape_vec(IxDyn(&plates), out)
        .map_err(|_| VmpError::shape("categorical sample", &plates, &[]))
}

/// Draw probability vectors from Dirichlet distributions via normalized
/// gamma variates.
pub fn dirichlet<R: Rng + ?Sized>(
    alpha: &ArrayD<f64>,
    size: Option<&[usize]>,
    rng: &mut R,
) -> Result<ArrayD<f64>> {
    let context = "Dirichlet concentration";
    let plates = output_plates(context, alpha, size)?;
    if alpha.iter().any(|&a| !(a > 0.0) || !a.is_finite()) {
        return Err(VmpError::validation(context, "concentrations must be positive and finite"));
    }
    let alpha = expand(alpha, &plates, context)?;
    let d = alpha.shape()[alpha.ndim() - 1];
    let mut out = Vec::with_capacity(alpha.len());
    for lane in alpha.lanes(Axis(alpha.ndim() - 1)) {
        let mut draws = Vec::with_capacity(d);
        for &a in lane.iter() {
            let gamma = Gamma::new(a, 1.0)
                .map_err(|e| VmpError::validation(context, e.to_string()))?;
            draws.push(gamma.sample(rng));
        }
        let total: f64 = draws.iter().sum();
        if total > 0.0 && total.is_finite() {
            out.extend(draws.iter().map(|x| x / total));
        } else {
            // every variate underflowed: all mass sits on one coordinate
            let k = categorical_index(&lane.to_vec(), rng);
            out.extend((0..d).map(|i| if i == k { 1.0 } else { 0.0 }));
        }
    }
    from_vec(alpha.shape().to_vec(), out)
}
