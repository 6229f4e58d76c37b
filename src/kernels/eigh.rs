//! Batched symmetric eigendecomposition kernel.
//!
//! Cyclic Jacobi with a relative off-diagonal convergence threshold. Reads
//! the lower triangle of each input matrix (the upper is mirrored, matching
//! the usual symmetric-storage convention), writes eigenvalues in ascending
//! order and, when the variant asks for them, orthonormal eigenvectors as
//! matrix columns. `info[i]` is 0 on convergence and 1 when the sweep limit
//! was reached — a recoverable outcome reported in the output, not through
//! the status channel.
//!
//! Workspace: an `n × n` packed working copy per matrix, plus a second
//! `n × n` block for vector accumulation when vectors are requested. Sized by
//! [`required_workspace`] and supplied by the caller as the trailing output.

use crate::descriptor::{AlgorithmVariant, DType, FactorDescriptor};
use crate::dispatch::DispatchContext;
use crate::error::{DespacharError, Result};
use crate::pool::DeviceKey;
use crate::status::StatusSlot;

use super::{
    check_len, elems, elems_mut, expect_inputs, expect_outputs, report, split_scratch, two, Real,
};

const KERNEL: &str = "eigh";

/// Jacobi sweep cap; convergence is quadratic so this is generous
const MAX_SWEEPS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    ValuesOnly,
    WithVectors,
}

impl Job {
    fn from_variant(variant: AlgorithmVariant) -> Result<Self> {
        match variant.0 {
            0 => Ok(Self::ValuesOnly),
            1 => Ok(Self::WithVectors),
            other => Err(DespacharError::DescriptorMalformed {
                reason: format!("eigh variant {other} is not values-only (0) or vectors (1)"),
            }),
        }
    }
}

/// Scratch bytes the kernel needs for a given descriptor
#[must_use]
pub fn required_workspace(desc: &FactorDescriptor) -> usize {
    let blocks = if desc.variant.0 == 1 { 2 } else { 1 };
    blocks * desc.rows * desc.rows * desc.dtype.size_of()
}

/// Entry point conforming to [`crate::KernelFn`]
pub(crate) fn kernel(
    ctx: &DispatchContext,
    device: DeviceKey,
    descriptor: &[u8],
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
    status: &mut StatusSlot,
) {
    let desc = match FactorDescriptor::decode(descriptor) {
        Ok(desc) => desc,
        Err(err) => {
            status.write_error(err.status_code(), err.to_string());
            return;
        }
    };
    report(status, run(ctx, device, &desc, inputs, outputs));
}

fn run(
    ctx: &DispatchContext,
    device: DeviceKey,
    desc: &FactorDescriptor,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
) -> Result<()> {
    let job = Job::from_variant(desc.variant)?;
    if desc.rows != desc.cols {
        return Err(DespacharError::DescriptorMalformed {
            reason: format!("eigh needs a square matrix, got {}x{}", desc.rows, desc.cols),
        });
    }
    if desc.workspace_bytes < required_workspace(desc) {
        return Err(DespacharError::BufferMismatch {
            kernel: KERNEL,
            buffer: "scratch",
            expected: required_workspace(desc),
            actual: desc.workspace_bytes,
        });
    }

    let _handle = ctx.pool().acquire(device)?;

    expect_inputs(KERNEL, inputs, 1)?;
    let (outputs, scratch) = split_scratch(KERNEL, outputs, desc.workspace_bytes)?;
    let scratch = scratch.ok_or_else(|| DespacharError::internal("eigh scratch vanished"))?;
    // Trim over-provisioned scratch so the element cast sees a whole number
    // of elements.
    let scratch = &mut scratch[..required_workspace(desc)];
    let expected_outputs = match job {
        Job::ValuesOnly => 2,
        Job::WithVectors => 3,
    };
    expect_outputs(KERNEL, outputs.len(), expected_outputs)?;

    let n = desc.rows;
    let elem = desc.dtype.size_of();
    check_len(KERNEL, "a", inputs[0], desc.matrix_bytes())?;
    check_len(KERNEL, "w", &outputs[0], desc.batch * n * elem)?;
    if job == Job::WithVectors {
        check_len(KERNEL, "v", &outputs[1], desc.batch * n * n * elem)?;
    }
    check_len(KERNEL, "info", &outputs[expected_outputs - 1], desc.batch * 4)?;

    match desc.dtype {
        DType::F32 => solve_batch::<f32>(desc, job, inputs, outputs, scratch),
        DType::F64 => solve_batch::<f64>(desc, job, inputs, outputs, scratch),
    }
}

fn solve_batch<T: Real>(
    desc: &FactorDescriptor,
    job: Job,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
    scratch: &mut [u8],
) -> Result<()> {
    let n = desc.rows;
    let a: &[T] = elems(KERNEL, "a", T::NAME, inputs[0])?;

    let (w_bytes, rest) = outputs
        .split_first_mut()
        .ok_or_else(|| DespacharError::internal("eigh output list empty"))?;
    let w: &mut [T] = elems_mut(KERNEL, "w", T::NAME, w_bytes)?;

    let (v_bytes, info_bytes) = match job {
        Job::WithVectors => {
            let (v, rest2) = rest
                .split_first_mut()
                .ok_or_else(|| DespacharError::internal("eigh output list short"))?;
            (Some(v), rest2)
        }
        Job::ValuesOnly => (None, rest),
    };
    let info: &mut [i32] = elems_mut(
        KERNEL,
        "info",
        "i32",
        info_bytes
            .first_mut()
            .ok_or_else(|| DespacharError::internal("eigh info buffer missing"))?,
    )?;
    let mut v_elems: Option<&mut [T]> = match v_bytes {
        Some(bytes) => Some(elems_mut(KERNEL, "v", T::NAME, bytes)?),
        None => None,
    };

    // Scratch: packed working copy, then the rotation accumulator.
    let scratch_elems: &mut [T] = elems_mut(KERNEL, "scratch", T::NAME, scratch)?;
    let (work, vwork_all) = scratch_elems.split_at_mut(n * n);

    let stride = desc.matrix_elems();
    let mut order: Vec<usize> = Vec::with_capacity(n);
    for b in 0..desc.batch {
        load_symmetric(&a[b * stride..(b + 1) * stride], work, n, desc.lead_dim);
        info[b] = match job {
            Job::WithVectors => {
                let vwork = &mut vwork_all[..n * n];
                identity(vwork, n);
                jacobi(work, Some(vwork), n)
            }
            Job::ValuesOnly => jacobi(work, None, n),
        };

        // Ascending eigenvalue order, vectors permuted to match.
        order.clear();
        order.extend(0..n);
        order.sort_by(|&i, &j| {
            work[i * n + i]
                .partial_cmp(&work[j * n + j])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (out_idx, &src_idx) in order.iter().enumerate() {
            w[b * n + out_idx] = work[src_idx * n + src_idx];
        }
        if job == Job::WithVectors {
            let v_out = v_elems
                .as_deref_mut()
                .ok_or_else(|| DespacharError::internal("eigh vector output missing"))?;
            let vwork = &vwork_all[..n * n];
            for (out_idx, &src_idx) in order.iter().enumerate() {
                for k in 0..n {
                    v_out[b * n * n + k * n + out_idx] = vwork[k * n + src_idx];
                }
            }
        }
    }
    Ok(())
}

/// Mirror the lower triangle into a packed symmetric working copy
fn load_symmetric<T: Real>(src: &[T], work: &mut [T], n: usize, ld: usize) {
    for i in 0..n {
        for j in 0..=i {
            let value = src[i * ld + j];
            work[i * n + j] = value;
            work[j * n + i] = value;
        }
    }
}

fn identity<T: Real>(m: &mut [T], n: usize) {
    m.fill(T::zero());
    for i in 0..n {
        m[i * n + i] = T::one();
    }
}

/// Cyclic Jacobi on a packed symmetric matrix; diagonal converges to the
/// eigenvalues, `v` (when present) accumulates the rotations column-wise.
/// Returns 0 on convergence, 1 when the sweep cap was hit.
fn jacobi<T: Real>(work: &mut [T], mut v: Option<&mut [T]>, n: usize) -> i32 {
    if n == 1 {
        return 0;
    }
    // Rotations introduce O(eps · norm) of rounding per sweep, so the floor
    // the off-norm can reach scales with n; a bare eps·norm threshold would
    // spin against that floor on larger matrices.
    let norm = frobenius(work);
    let dim = T::from(n).unwrap_or_else(T::one);
    let tol = T::epsilon() * norm.max(T::min_positive_value()) * dim;

    for _sweep in 0..MAX_SWEEPS {
        if off_diagonal_norm(work, n) <= tol {
            return 0;
        }
        for p in 0..n - 1 {
            for q in p + 1..n {
                let apq = work[p * n + q];
                if apq == T::zero() {
                    continue;
                }
                let app = work[p * n + p];
                let aqq = work[q * n + q];
                let theta = (aqq - app) / (two::<T>() * apq);
                let t = if theta >= T::zero() {
                    T::one() / (theta + (theta * theta + T::one()).sqrt())
                } else {
                    T::one() / (theta - (theta * theta + T::one()).sqrt())
                };
                let c = T::one() / (t * t + T::one()).sqrt();
                let s = t * c;

                for k in 0..n {
                    let akp = work[k * n + p];
                    let akq = work[k * n + q];
                    work[k * n + p] = c * akp - s * akq;
                    work[k * n + q] = s * akp + c * akq;
                }
                for k in 0..n {
                    let apk = work[p * n + k];
                    let aqk = work[q * n + k];
                    work[p * n + k] = c * apk - s * aqk;
                    work[q * n + k] = s * apk + c * aqk;
                }
                if let Some(v) = v.as_deref_mut() {
                    for k in 0..n {
                        let vkp = v[k * n + p];
                        let vkq = v[k * n + q];
                        v[k * n + p] = c * vkp - s * vkq;
                        v[k * n + q] = s * vkp + c * vkq;
                    }
                }
            }
        }
    }
    i32::from(off_diagonal_norm(work, n) > tol)
}

fn frobenius<T: Real>(m: &[T]) -> T {
    m.iter().fold(T::zero(), |acc, &x| acc + x * x).sqrt()
}

fn off_diagonal_norm<T: Real>(m: &[T], n: usize) -> T {
    let mut acc = T::zero();
    for p in 0..n {
        for q in 0..n {
            if p != q {
                acc = acc + m[p * n + q] * m[p * n + q];
            }
        }
    }
    acc.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn symmetric_3x3() -> Vec<f64> {
        vec![
            2.0, 1.0, 0.0, //
            1.0, 3.0, 1.0, //
            0.0, 1.0, 2.0,
        ]
    }

    #[test]
    fn test_jacobi_diagonal_input_is_fixed_point() {
        let mut work: Vec<f64> = vec![
            3.0, 0.0, //
            0.0, -1.0,
        ];
        let info = jacobi(&mut work, None, 2);
        assert_eq!(info, 0);
        assert!((work[0] - 3.0).abs() < 1e-14);
        assert!((work[3] + 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_jacobi_known_eigenvalues() {
        // det(A - xI) = (2-x)(x-1)(x-4), so the spectrum is {1, 2, 4}.
        let mut work = symmetric_3x3();
        let info = jacobi(&mut work, None, 3);
        assert_eq!(info, 0);
        let mut eigs = vec![work[0], work[4], work[8]];
        eigs.sort_by(|a, b| a.partial_cmp(b).expect("finite"));
        assert!((eigs[0] - 1.0).abs() < 1e-10);
        assert!((eigs[1] - 2.0).abs() < 1e-10);
        assert!((eigs[2] - 4.0).abs() < 1e-10);
    }

    #[test]
    fn test_jacobi_vectors_reconstruct() {
        let a = symmetric_3x3();
        let n = 3;
        let mut work = a.clone();
        let mut v = vec![0.0; n * n];
        identity(&mut v, n);
        let info = jacobi(&mut work, Some(&mut v), n);
        assert_eq!(info, 0);

        // V · diag(w) · Vᵀ == A within tolerance.
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += v[i * n + k] * work[k * n + k] * v[j * n + k];
                }
                assert!(
                    (sum - a[i * n + j]).abs() < 1e-10,
                    "entry ({i},{j}): {sum} vs {}",
                    a[i * n + j]
                );
            }
        }
    }

    #[test]
    fn test_jacobi_vectors_are_orthonormal() {
        let n = 3;
        let mut work = symmetric_3x3();
        let mut v = vec![0.0; n * n];
        identity(&mut v, n);
        jacobi(&mut work, Some(&mut v), n);
        for c1 in 0..n {
            for c2 in 0..n {
                let mut dot = 0.0;
                for k in 0..n {
                    dot += v[k * n + c1] * v[k * n + c2];
                }
                let want = if c1 == c2 { 1.0 } else { 0.0 };
                assert!((dot - want).abs() < 1e-10);
            }
        }
    }

    #[test]
    fn test_load_symmetric_mirrors_lower() {
        // Upper entries deliberately poisoned; only the lower triangle counts.
        let src = vec![
            1.0, 999.0, //
            5.0, 2.0,
        ];
        let mut work = vec![0.0; 4];
        load_symmetric(&src, &mut work, 2, 2);
        assert_eq!(work, vec![1.0, 5.0, 5.0, 2.0]);
    }

    #[test]
    fn test_required_workspace_doubles_for_vectors() {
        use crate::descriptor::{AlgorithmVariant, DType, FactorDescriptor};
        let mut desc = FactorDescriptor {
            dtype: DType::F64,
            variant: AlgorithmVariant(0),
            batch: 2,
            rows: 4,
            cols: 4,
            lead_dim: 4,
            workspace_bytes: 0,
        };
        assert_eq!(required_workspace(&desc), 4 * 4 * 8);
        desc.variant = AlgorithmVariant(1);
        assert_eq!(required_workspace(&desc), 2 * 4 * 4 * 8);
    }

    #[test]
    fn test_variant_decoding() {
        assert_eq!(
            Job::from_variant(AlgorithmVariant(0)).expect("values"),
            Job::ValuesOnly
        );
        assert_eq!(
            Job::from_variant(AlgorithmVariant(1)).expect("vectors"),
            Job::WithVectors
        );
        assert!(Job::from_variant(AlgorithmVariant(2)).is_err());
    }
}
