//! Forward–backward (alpha–beta) recursion for categorical Markov chains.
//!
//! Inputs are log-space: `logp0` with shape `(plates.., S)` and `log_p` with
//! shape `(plates.., T-1, S, S)`. The two plate shapes broadcast against
//! each other; every resulting plate slice is an independent chain and is
//! processed on the rayon pool.
//!
//! Forward and backward messages are accumulated with log-sum-exp. Before
//! anything is exponentiated, each block (the initial marginal, or one
//! pairwise marginal) is shifted by its own maximum and renormalized, so
//! the linear-space values are always in `[0, 1]` no matter how extreme the
//! inputs are.

use ndarray::ArrayD;
use rand::Rng;
use rayon::prelude::*;

use crate::error::{Result, VmpError};
use crate::moments::from_vec;
use crate::plates::{broadcast_shapes_checked, broadcast_to};
use crate::random::categorical_index;

/// Marginals of a chain and its cumulant generating function.
#[derive(Debug, Clone)]
pub struct ChainMarginals {
    /// `p(z_0)`, shape `(plates.., S)`.
    pub z0: ArrayD<f64>,
    /// `p(z_t, z_{t+1})`, shape `(plates.., T-1, S, S)`.
    pub zz: ArrayD<f64>,
    /// `-ln Z`, shape `(plates..)`.
    pub g: ArrayD<f64>,
}

struct ChainShape {
    plates: Vec<usize>,
    states: usize,
    transitions: usize,
}

fn chain_shape(logp0: &ArrayD<f64>, log_p: &ArrayD<f64>) -> Result<ChainShape> {
    if logp0.ndim() < 1 || log_p.ndim() < 3 {
        return Err(VmpError::shape(
            "forward-backward inputs",
            &[0, 0, 0],
            log_p.shape(),
        ));
    }
    let states = logp0.shape()[logp0.ndim() - 1];
    let p_shape = log_p.shape();
    let n = p_shape.len();
    if p_shape[n - 1] != states || p_shape[n - 2] != states {
        return Err(VmpError::shape(
            "forward-backward transition matrix",
            &[p_shape[n - 3], states, states],
            &p_shape[n - 3..],
        ));
    }
    let plates = broadcast_shapes_checked(
        "forward-backward plates",
        &logp0.shape()[..logp0.ndim() - 1],
        &p_shape[..n - 3],
    )?;
    Ok(ChainShape {
        plates,
        states,
        transitions: p_shape[n - 3],
    })
}

/// Flatten both inputs to row-major buffers broadcast over `shape.plates`.
fn flat_inputs(
    logp0: &ArrayD<f64>,
    log_p: &ArrayD<f64>,
    shape: &ChainShape,
) -> Result<(Vec<f64>, Vec<f64>)> {
    let mut s0 = shape.plates.clone();
    s0.push(shape.states);
    let mut s1 = shape.plates.clone();
    s1.extend_from_slice(&[shape.transitions, shape.states, shape.states]);
    let p0 = broadcast_to(logp0, &s0, "forward-backward initial state")?;
    let p = broadcast_to(log_p, &s1, "forward-backward transitions")?;
    Ok((p0.iter().cloned().collect(), p.iter().cloned().collect()))
}

/// Compute `z0`, `zz` and `g` for every plate slice.
pub fn alpha_beta_recursion(logp0: &ArrayD<f64>, log_p: &ArrayD<f64>) -> Result<ChainMarginals> {
    let shape = chain_shape(logp0, log_p)?;
    let (p0, p) = flat_inputs(logp0, log_p, &shape)?;
    let (s, t1) = (shape.states, shape.transitions);
    let n: usize = shape.plates.iter().product();

    let slices: Vec<(Vec<f64>, Vec<f64>, f64)> = (0..n)
        .into_par_iter()
        .map(|k| {
            let chain = Chain {
                logp0: &p0[k * s..(k + 1) * s],
                log_p: &p[k * t1 * s * s..(k + 1) * t1 * s * s],
                states: s,
                transitions: t1,
            };
            chain.marginals()
        })
        .collect();

    let mut z0 = Vec::with_capacity(n * s);
    let mut zz = Vec::with_capacity(n * t1 * s * s);
    let mut g = Vec::with_capacity(n);
    for (a, b, c) in slices {
        z0.extend(a);
        zz.extend(b);
        g.push(c);
    }

    let mut s0 = shape.plates.clone();
    s0.push(s);
    let mut s1 = shape.plates.clone();
    s1.extend_from_slice(&[t1, s, s]);
    Ok(ChainMarginals {
        z0: from_vec(s0, z0)?,
        zz: from_vec(s1, zz)?,
        g: from_vec(shape.plates, g)?,
    })
}

/// Draw one state sequence per plate slice from the chain defined by the
/// (possibly unnormalized) log-potentials. Result shape `(plates.., T)`.
pub fn sample_chain<R: Rng + ?Sized>(
    logp0: &ArrayD<f64>,
    log_p: &ArrayD<f64>,
    rng: &mut R,
) -> Result<ArrayD<f64>> {
    let shape = chain_shape(logp0, log_p)?;
    let (p0, p) = flat_inputs(logp0, log_p, &shape)?;
    let (s, t1) = (shape.states, shape.transitions);
    let n: usize = shape.plates.iter().product();

    let mut out = Vec::with_capacity(n * (t1 + 1));
    for k in 0..n {
        let chain = Chain {
            logp0: &p0[k * s..(k + 1) * s],
            log_p: &p[k * t1 * s * s..(k + 1) * t1 * s * s],
            states: s,
            transitions: t1,
        };
        out.extend(chain.sample(rng).into_iter().map(|z| z as f64));
    }
    let mut shape_out = shape.plates;
    shape_out.push(t1 + 1);
    from_vec(shape_out, out)
}

pub(crate) fn log_sum_exp(values: &[f64]) -> f64 {
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !max.is_finite() {
        return max;
    }
    max + values.iter().map(|&v| (v - max).exp()).sum::<f64>().ln()
}

/// Exponentiate a block of log-weights after shifting by its maximum and
/// normalize it to sum to one. A block with no mass becomes uniform.
fn normalized_exp(block: &mut [f64]) {
    let max = block.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max.is_nan() {
        let u = 1.0 / block.len() as f64;
        block.iter_mut().for_each(|v| *v = u);
        return;
    }
    let mut total = 0.0;
    for v in block.iter_mut() {
        *v = (*v - max).exp();
        total += *v;
    }
    block.iter_mut().for_each(|v| *v /= total);
}

/// One plate slice of the recursion.
struct Chain<'a> {
    logp0: &'a [f64],
    log_p: &'a [f64],
    states: usize,
    transitions: usize,
}

impl<'a> Chain<'a> {
    #[inline]
    fn transition(&self, t: usize, i: usize, j: usize) -> f64 {
        self.log_p[(t * self.states + i) * self.states + j]
    }

    fn forward(&self) -> Vec<Vec<f64>> {
        let s = self.states;
        let mut alpha = Vec::with_capacity(self.transitions + 1);
        alpha.push(self.logp0.to_vec());
        let mut buf = vec![0.0; s];
        for t in 0..self.transitions {
            let next: Vec<f64> = (0..s)
                .map(|j| {
                    for i in 0..s {
                        buf[i] = alpha[t][i] + self.transition(t, i, j);
                    }
                    log_sum_exp(&buf)
                })
                .collect();
            alpha.push(next);
        }
        alpha
    }

    fn backward(&self) -> Vec<Vec<f64>> {
        let s = self.states;
        let mut beta = vec![vec![0.0; s]; self.transitions + 1];
        let mut buf = vec![0.0; s];
        for t in (0..self.transitions).rev() {
            for i in 0..s {
                for j in 0..s {
                    buf[j] = self.transition(t, i, j) + beta[t + 1][j];
                }
                beta[t][i] = log_sum_exp(&buf);
            }
        }
        beta
    }

    fn marginals(&self) -> (Vec<f64>, Vec<f64>, f64) {
        let s = self.states;
        let alpha = self.forward();
        let beta = self.backward();

        let mut z0: Vec<f64> = (0..s).map(|i| self.logp0[i] + beta[0][i]).collect();
        let log_z = log_sum_exp(&z0);
        normalized_exp(&mut z0);

        let mut zz = vec![0.0; self.transitions * s * s];
        for (t, block) in zz.chunks_mut(s * s).enumerate() {
            for i in 0..s {
                for j in 0..s {
                    block[i * s + j] = alpha[t][i] + self.transition(t, i, j) + beta[t + 1][j];
                }
            }
            normalized_exp(block);
        }

        (z0, zz, -log_z)
    }

    /// Backward messages, then sample forward through the conditionals.
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<usize> {
        let s = self.states;
        let beta = self.backward();
        let mut weights: Vec<f64> = (0..s).map(|i| self.logp0[i] + beta[0][i]).collect();
        normalized_exp(&mut weights);
        let mut z = Vec::with_capacity(self.transitions + 1);
        z.push(categorical_index(&weights, rng));
        for t in 0..self.transitions {
            let prev = z[t];
            for j in 0..s {
                weights[j] = self.transition(t, prev, j) + beta[t + 1][j];
            }
            normalized_exp(&mut weights);
            z.push(categorical_index(&weights, rng));
        }
        z
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, arr3, Array3, IxDyn};
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn ln(a: ArrayD<f64>) -> ArrayD<f64> {
        a.mapv(f64::ln)
    }

    fn repeat3(m: [[f64; 2]; 2], t: usize) -> ArrayD<f64> {
        let mut a = Array3::<f64>::zeros((t, 2, 2));
        for k in 0..t {
            for i in 0..2 {
                for j in 0..2 {
                    a[[k, i, j]] = m[i][j];
                }
            }
        }
        a.into_dyn()
    }

    /// Enumerate every path and accumulate unnormalized pairwise masses.
    fn brute_force(p0: &[f64], p: &[Vec<Vec<f64>>]) -> (Vec<f64>, Vec<Vec<Vec<f64>>>, f64) {
        let s = p0.len();
        let t1 = p.len();
        let mut z0 = vec![0.0; s];
        let mut zz = vec![vec![vec![0.0; s]; s]; t1];
        let mut total = 0.0;
        let paths = s.pow((t1 + 1) as u32);
        for code in 0..paths {
            let mut path = Vec::with_capacity(t1 + 1);
            let mut c = code;
            for _ in 0..=t1 {
                path.push(c % s);
                c /= s;
            }
            let mut w = p0[path[0]];
            for t in 0..t1 {
                w *= p[t][path[t]][path[t + 1]];
            }
            total += w;
            z0[path[0]] += w;
            for t in 0..t1 {
                zz[t][path[t]][path[t + 1]] += w;
            }
        }
        (z0, zz, total)
    }

    #[test]
    fn test_deterministic_oscillator() {
        let p0 = arr1(&[1.0, 0.0]).into_dyn();
        let p = repeat3([[0.0, 1.0], [1.0, 0.0]], 3);
        let r = alpha_beta_recursion(&ln(p0), &ln(p)).unwrap();
        assert_eq!(r.z0.shape(), &[2]);
        assert_abs_diff_eq!(r.z0[[0]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r.z0[[1]], 0.0, epsilon = 1e-12);
        let expected = [[[0.0, 1.0], [0.0, 0.0]], [[0.0, 0.0], [1.0, 0.0]], [[0.0, 1.0], [0.0, 0.0]]];
        for t in 0..3 {
            for i in 0..2 {
                for j in 0..2 {
                    assert_abs_diff_eq!(r.zz[[t, i, j]], expected[t][i][j], epsilon = 1e-12);
                }
            }
        }
        // the single path has weight one
        assert_abs_diff_eq!(r.g.sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_uniform_transitions() {
        let p0 = arr1(&[0.5, 0.5]).into_dyn();
        let p = repeat3([[0.5, 0.5], [0.5, 0.5]], 3);
        let r = alpha_beta_recursion(&ln(p0), &ln(p)).unwrap();
        assert_abs_diff_eq!(r.z0[[0]], 0.5, epsilon = 1e-12);
        for v in r.zz.iter() {
            assert_abs_diff_eq!(*v, 0.25, epsilon = 1e-12);
        }
        assert_abs_diff_eq!(r.g.sum(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_unnormalized_potentials() {
        let p0 = [2.0, 6.0];
        let p = vec![
            vec![vec![0.0, 3.0], vec![4.0, 1.0]],
            vec![vec![3.0, 5.0], vec![6.0, 4.0]],
            vec![vec![9.0, 2.0], vec![8.0, 1.0]],
        ];
        let lp = arr3(&[
            [[0.0, 3.0], [4.0, 1.0]],
            [[3.0, 5.0], [6.0, 4.0]],
            [[9.0, 2.0], [8.0, 1.0]],
        ])
        .into_dyn();
        let r = alpha_beta_recursion(&ln(arr1(&p0).into_dyn()), &ln(lp)).unwrap();
        let (z0, zz, total) = brute_force(&p0, &p);
        for i in 0..2 {
            assert_abs_diff_eq!(r.z0[[i]], z0[i] / total, epsilon = 1e-10);
        }
        for t in 0..3 {
            for i in 0..2 {
                for j in 0..2 {
                    assert_abs_diff_eq!(r.zz[[t, i, j]], zz[t][i][j] / total, epsilon = 1e-10);
                }
            }
        }
        assert_abs_diff_eq!(r.g.sum(), -total.ln(), epsilon = 1e-10);
    }

    #[test]
    fn test_plates_are_independent_chains() {
        let p0 = arr2(&[[1.0, 0.0], [0.5, 0.5]]).into_dyn();
        let mut p = ArrayD::<f64>::zeros(IxDyn(&[2, 1, 2, 2]));
        p[[0, 0, 0, 1]] = 1.0;
        p[[0, 0, 1, 0]] = 1.0;
        for i in 0..2 {
            for j in 0..2 {
                p[[1, 0, i, j]] = 0.5;
            }
        }
        let r = alpha_beta_recursion(&ln(p0), &ln(p)).unwrap();
        assert_eq!(r.zz.shape(), &[2, 1, 2, 2]);
        assert_eq!(r.g.shape(), &[2]);
        assert_abs_diff_eq!(r.zz[[0, 0, 0, 1]], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r.zz[[1, 0, 1, 0]], 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(r.z0[[1, 0]], 0.5, epsilon = 1e-12);
        // second chain: mass 0.5*0.5*2*2 = 1
        assert_abs_diff_eq!(r.g[[1]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_broadcast_transitions_over_plates() {
        let p0 = arr2(&[[0.2, 0.8], [0.9, 0.1], [0.5, 0.5]]).into_dyn();
        let p = repeat3([[0.7, 0.3], [0.4, 0.6]], 2);
        let r = alpha_beta_recursion(&ln(p0), &ln(p)).unwrap();
        assert_eq!(r.z0.shape(), &[3, 2]);
        assert_eq!(r.zz.shape(), &[3, 2, 2, 2]);
        // normalized transitions leave the initial marginal unchanged
        assert_abs_diff_eq!(r.z0[[1, 0]], 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(r.g[[2]], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_overflow_and_underflow() {
        for sign in [1.0, -1.0] {
            let logp0 = arr1(&[sign * 1e5, f64::NEG_INFINITY]).into_dyn();
            let log_p = arr3(&[[
                [f64::NEG_INFINITY, sign * 1e5],
                [f64::NEG_INFINITY, sign * 1e5],
            ]])
            .into_dyn();
            let r = alpha_beta_recursion(&logp0, &log_p).unwrap();
            assert_abs_diff_eq!(r.z0[[0]], 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(r.z0[[1]], 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(r.zz[[0, 0, 1]], 1.0, epsilon = 1e-12);
            assert_abs_diff_eq!(r.zz[[0, 1, 0]], 0.0, epsilon = 1e-12);
            assert_abs_diff_eq!(r.g.sum(), -2.0 * sign * 1e5, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_long_chain_is_stable() {
        for scale in [1e5, 1e20] {
            for steps in 1..=10 {
                let logp0 = arr1(&[-scale, f64::NEG_INFINITY]).into_dyn();
                let block = [[f64::NEG_INFINITY, scale], [1.0, f64::NEG_INFINITY]];
                let log_p = repeat3(block, steps);
                let r = alpha_beta_recursion(&logp0, &log_p).unwrap();
                assert!(r.z0.iter().all(|v| v.is_finite()), "z0 not finite: {:?}", r.z0);
                assert!(r.zz.iter().all(|v| v.is_finite()), "zz not finite at {} steps", steps);
                assert!(r.g.iter().all(|v| v.is_finite()), "g not finite: {:?}", r.g);
                for block in r.zz.as_slice().unwrap().chunks(4) {
                    assert_abs_diff_eq!(block.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_single_state_chain_without_transitions() {
        let logp0 = arr1(&[0.3_f64.ln(), 0.1_f64.ln()]).into_dyn();
        let log_p = ArrayD::<f64>::zeros(IxDyn(&[0, 2, 2]));
        let r = alpha_beta_recursion(&logp0, &log_p).unwrap();
        assert_abs_diff_eq!(r.z0[[0]], 0.75, epsilon = 1e-12);
        assert_abs_diff_eq!(r.g.sum(), -(0.4_f64.ln()), epsilon = 1e-12);
        assert_eq!(r.zz.len(), 0);
    }

    #[test]
    fn test_rejects_mismatched_states() {
        let logp0 = ArrayD::<f64>::zeros(IxDyn(&[3]));
        let log_p = ArrayD::<f64>::zeros(IxDyn(&[2, 2, 2]));
        let err = alpha_beta_recursion(&logp0, &log_p).unwrap_err();
        assert!(err.is_structural());
    }

    #[test]
    fn test_sample_chain_follows_deterministic_transitions() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let logp0 = ln(arr1(&[0.0, 1.0]).into_dyn());
        let log_p = ln(repeat3([[0.0, 1.0], [1.0, 0.0]], 4));
        let z = sample_chain(&logp0, &log_p, &mut rng).unwrap();
        assert_eq!(z.into_raw_vec(), vec![1.0, 0.0, 1.0, 0.0, 1.0]);
    }

    fn small_chain() -> impl Strategy<Value = (Vec<f64>, Vec<Vec<Vec<f64>>>)> {
        (1usize..=3, 1usize..=3).prop_flat_map(|(s, t1)| {
            (
                proptest::collection::vec(0.05f64..5.0, s),
                proptest::collection::vec(
                    proptest::collection::vec(proptest::collection::vec(0.05f64..5.0, s), s),
                    t1,
                ),
            )
        })
    }

    proptest! {
        #[test]
        fn prop_matches_brute_force((p0, p) in small_chain()) {
            let s = p0.len();
            let t1 = p.len();
            let logp0 = ArrayD::from_shape_vec(IxDyn(&[s]), p0.iter().map(|v| v.ln()).collect()).unwrap();
            let flat: Vec<f64> = p.iter().flatten().flatten().map(|v| v.ln()).collect();
            let log_p = ArrayD::from_shape_vec(IxDyn(&[t1, s, s]), flat).unwrap();
            let r = alpha_beta_recursion(&logp0, &log_p).unwrap();
            let (z0, zz, total) = brute_force(&p0, &p);
            for i in 0..s {
                prop_assert!((r.z0[[i]] - z0[i] / total).abs() < 1e-9);
            }
            for t in 0..t1 {
                for i in 0..s {
                    for j in 0..s {
                        prop_assert!((r.zz[[t, i, j]] - zz[t][i][j] / total).abs() < 1e-9);
                    }
                }
            }
            prop_assert!((r.g.sum() + total.ln()).abs() < 1e-9);
        }
    }
}
