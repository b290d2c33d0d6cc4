//! Plate shape algebra: broadcasting, reductions onto a parent's plates,
//! and the masked select used to protect observed slices.
//!
//! Shapes are aligned from the right like array broadcasting: a missing
//! leading axis or an axis of size 1 broadcasts against anything.

use ndarray::{ArrayD, ArrayViewD, Axis, IxDyn, Zip};

use crate::error::{Result, VmpError};

/// Broadcast two shapes, or `None` when some axis pair is incompatible.
pub fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let n = a.len().max(b.len());
    let mut out = vec![1; n];
    for i in 0..n {
        let da = if i < n - a.len() { 1 } else { a[i - (n - a.len())] };
        let db = if i < n - b.len() { 1 } else { b[i - (n - b.len())] };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

pub fn broadcast_shapes_checked(context: &str, a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    broadcast_shapes(a, b).ok_or_else(|| VmpError::shape(context, a, b))
}

/// True when an array of shape `from` broadcasts to exactly `to`.
pub fn broadcasts_to(from: &[usize], to: &[usize]) -> bool {
    broadcast_shapes(from, to).map_or(false, |s| s == to)
}

/// Prepend unit axes so every shape has the same rank.
pub fn make_equal_length(shapes: &[&[usize]]) -> Vec<Vec<usize>> {
    let n = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    shapes
        .iter()
        .map(|s| {
            let mut padded = vec![1; n - s.len()];
            padded.extend_from_slice(s);
            padded
        })
        .collect()
}

/// Plates of a node: an explicit override must absorb the parents' plates.
pub fn total_plates(
    context: &str,
    explicit: Option<&[usize]>,
    from_parents: &[usize],
) -> Result<Vec<usize>> {
    match explicit {
        None => Ok(from_parents.to_vec()),
        Some(plates) => {
            if broadcasts_to(from_parents, plates) {
                Ok(plates.to_vec())
            } else {
                Err(VmpError::shape(context, plates, from_parents))
            }
        }
    }
}

pub fn broadcast_view<'a, T>(
    arr: &'a ArrayD<T>,
    shape: &[usize],
    context: &str,
) -> Result<ArrayViewD<'a, T>> {
    arr.broadcast(IxDyn(shape))
        .ok_or_else(|| VmpError::shape(context, shape, arr.shape()))
}

pub fn broadcast_to<T: Clone>(arr: &ArrayD<T>, shape: &[usize], context: &str) -> Result<ArrayD<T>> {
    Ok(broadcast_view(arr, shape, context)?.to_owned())
}

/// Append `n` unit axes, e.g. to lift a plate mask over variable dimensions.
pub fn add_trailing_axes<T>(mut arr: ArrayD<T>, n: usize) -> ArrayD<T> {
    for _ in 0..n {
        let last = arr.ndim();
        arr = arr.insert_axis(Axis(last));
    }
    arr
}

/// Drop leading unit axes until the array has rank `ndim`.
pub fn squeeze_to_dim<T>(mut arr: ArrayD<T>, ndim: usize, context: &str) -> Result<ArrayD<T>> {
    while arr.ndim() > ndim {
        if arr.shape()[0] != 1 {
            return Err(VmpError::shape(context, &vec![1; arr.ndim() - ndim], arr.shape()));
        }
        arr = arr.index_axis_move(Axis(0), 0);
    }
    Ok(arr)
}

fn reduce_to_shape<T, F>(arr: ArrayD<T>, target: &[usize], context: &str, init: T, f: F) -> Result<ArrayD<T>>
where
    T: Clone,
    F: Fn(&T, &T) -> T,
{
    let mut arr = arr;
    while arr.ndim() > target.len() {
        arr = arr.fold_axis(Axis(0), init.clone(), |acc, x| f(acc, x));
    }
    let offset = target.len() - arr.ndim();
    for ax in 0..arr.ndim() {
        let have = arr.shape()[ax];
        let want = target[ax + offset];
        if have == want || have == 1 {
            continue;
        }
        if want != 1 {
            return Err(VmpError::shape(context, target, arr.shape()));
        }
        arr = arr
            .fold_axis(Axis(ax), init.clone(), |acc, x| f(acc, x))
            .insert_axis(Axis(ax));
    }
    Ok(arr)
}

/// Sum over the axes that `target` does not have (missing leading axes and
/// axes where `target` is 1). Axes already of size 1 are left alone.
pub fn sum_to_shape(arr: ArrayD<f64>, target: &[usize], context: &str) -> Result<ArrayD<f64>> {
    reduce_to_shape(arr, target, context, 0.0, |a, b| a + b)
}

/// Logical-OR counterpart of [`sum_to_shape`] for plate masks.
pub fn any_to_shape(mask: ArrayD<bool>, target: &[usize], context: &str) -> Result<ArrayD<bool>> {
    reduce_to_shape(mask, target, context, false, |a, b| *a || *b)
}

/// Sum over the last `n` axes.
pub fn sum_trailing(mut arr: ArrayD<f64>, n: usize) -> ArrayD<f64> {
    for _ in 0..n {
        let last = arr.ndim() - 1;
        arr = arr.sum_axis(Axis(last));
    }
    arr
}

/// Element-wise `mask ? new : old` over the broadcast `shape`.
///
/// This is the only way moments of a stochastic node are overwritten, so
/// slices with a false mask keep their previous value bit for bit.
pub(crate) fn masked_select(
    mask: &ArrayD<bool>,
    new: &ArrayD<f64>,
    old: &ArrayD<f64>,
    shape: &[usize],
    context: &str,
) -> Result<ArrayD<f64>> {
    let mask = broadcast_view(mask, shape, context)?;
    let new = broadcast_view(new, shape, context)?;
    let mut out = broadcast_to(old, shape, context)?;
    Zip::from(&mut out)
        .and(&mask)
        .and(&new)
        .for_each(|o, &m, &n| {
            if m {
                *o = n;
            }
        });
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, ArrayD};

    #[test]
    fn test_broadcast_shapes() {
        assert_eq!(broadcast_shapes(&[3, 1], &[4]), Some(vec![3, 4]));
        assert_eq!(broadcast_shapes(&[], &[2, 5]), Some(vec![2, 5]));
        assert_eq!(broadcast_shapes(&[3], &[4]), None);
        assert!(broadcasts_to(&[1, 4], &[3, 4]));
        assert!(!broadcasts_to(&[3, 4], &[1, 4]));
    }

    #[test]
    fn test_total_plates_override() {
        assert_eq!(total_plates("x", Some(&[5, 3]), &[3]).unwrap(), vec![5, 3]);
        assert_eq!(total_plates("x", None, &[3]).unwrap(), vec![3]);
        assert!(total_plates("x", Some(&[4]), &[3]).is_err());
    }

    #[test]
    fn test_sum_to_shape_collapses_broadcast_axes() {
        let m = arr2(&[[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]).into_dyn();
        let s = sum_to_shape(m.clone(), &[2], "t").unwrap();
        assert_eq!(s, arr1(&[9.0, 12.0]).into_dyn());
        let s = sum_to_shape(m.clone(), &[1, 2], "t").unwrap();
        assert_eq!(s.shape(), &[1, 2]);
        let s = sum_to_shape(m, &[3, 1], "t").unwrap();
        assert_eq!(s.into_raw_vec(), vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_sum_to_shape_rejects_mismatch() {
        let m = ArrayD::<f64>::zeros(IxDyn(&[3, 2]));
        assert!(sum_to_shape(m, &[4, 2], "t").is_err());
    }

    #[test]
    fn test_any_to_shape_is_or() {
        let mask = arr2(&[[true, false], [false, false]]).into_dyn();
        let r = any_to_shape(mask, &[2], "t").unwrap();
        assert_eq!(r, arr1(&[true, false]).into_dyn());
    }

    #[test]
    fn test_masked_select_keeps_unmasked() {
        let mask = arr1(&[true, false]).into_dyn();
        let mask = add_trailing_axes(mask, 1);
        let new = ArrayD::from_elem(IxDyn(&[2, 3]), 7.0);
        let old = ArrayD::from_elem(IxDyn(&[1, 3]), -1.0);
        let out = masked_select(&mask, &new, &old, &[2, 3], "t").unwrap();
        assert_eq!(out.into_raw_vec(), vec![7.0, 7.0, 7.0, -1.0, -1.0, -1.0]);
    }

    #[test]
    fn test_squeeze_to_dim() {
        let a = ArrayD::<f64>::zeros(IxDyn(&[1, 1, 3]));
        assert_eq!(squeeze_to_dim(a, 1, "t").unwrap().shape(), &[3]);
        let b = ArrayD::<f64>::zeros(IxDyn(&[2, 3]));
        assert!(squeeze_to_dim(b, 1, "t").is_err());
    }
}
