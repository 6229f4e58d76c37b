//! Batched singular value decomposition kernel.
//!
//! One-sided Jacobi (Hestenes): plane rotations orthogonalize the columns of
//! a working copy of `A`; column norms converge to the singular values, the
//! normalized columns to `U`, and the accumulated rotations to `V`. Singular
//! values are written in descending order. The variant selects values-only
//! versus the full thin factorization `U·diag(s)·Vᵀ` with `U` of shape
//! `rows × cols` and `Vᵀ` of shape `cols × cols`.
//!
//! This slice factors tall or square matrices (`rows >= cols`); a wide input
//! is an invalid argument — call sites transpose first. `info[i]` is 0 on
//! convergence, 1 at the sweep cap.

use crate::descriptor::{AlgorithmVariant, DType, FactorDescriptor};
use crate::dispatch::DispatchContext;
use crate::error::{DespacharError, Result};
use crate::pool::DeviceKey;
use crate::status::StatusSlot;

use super::{
    check_len, elems, elems_mut, expect_inputs, expect_outputs, report, split_scratch, two, Real,
};

const KERNEL: &str = "svd";

const MAX_SWEEPS: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Job {
    ValuesOnly,
    Full,
}

impl Job {
    fn from_variant(variant: AlgorithmVariant) -> Result<Self> {
        match variant.0 {
            0 => Ok(Self::ValuesOnly),
            1 => Ok(Self::Full),
            other => Err(DespacharError::DescriptorMalformed {
                reason: format!("svd variant {other} is not values-only (0) or full (1)"),
            }),
        }
    }
}

/// Scratch bytes the kernel needs: a packed `rows × cols` working copy, plus
/// a `cols × cols` rotation accumulator for the full factorization
#[must_use]
pub fn required_workspace(desc: &FactorDescriptor) -> usize {
    let mut elems = desc.rows * desc.cols;
    if desc.variant.0 == 1 {
        elems += desc.cols * desc.cols;
    }
    elems * desc.dtype.size_of()
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
    if desc.rows < desc.cols {
        return Err(DespacharError::DescriptorMalformed {
            reason: format!(
                "svd factors tall or square matrices, got {}x{}",
                desc.rows, desc.cols
            ),
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
    let scratch = scratch.ok_or_else(|| DespacharError::internal("svd scratch vanished"))?;
    let scratch = &mut scratch[..required_workspace(desc)];
    let expected_outputs = match job {
        Job::ValuesOnly => 2,
        Job::Full => 4,
    };
    expect_outputs(KERNEL, outputs.len(), expected_outputs)?;

    let (m, n) = (desc.rows, desc.cols);
    let elem = desc.dtype.size_of();
    check_len(KERNEL, "a", inputs[0], desc.matrix_bytes())?;
    check_len(KERNEL, "s", &outputs[0], desc.batch * n * elem)?;
    if job == Job::Full {
        check_len(KERNEL, "u", &outputs[1], desc.batch * m * n * elem)?;
        check_len(KERNEL, "vt", &outputs[2], desc.batch * n * n * elem)?;
    }
    check_len(
        KERNEL,
        "info",
        &outputs[expected_outputs - 1],
        desc.batch * 4,
    )?;

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
    let (m, n) = (desc.rows, desc.cols);
    let a: &[T] = elems(KERNEL, "a", T::NAME, inputs[0])?;

    // Output list: s [, u, vt], info — peeled front to back.
    let (s_bytes, rest) = outputs
        .split_first_mut()
        .ok_or_else(|| DespacharError::internal("svd output list empty"))?;
    let s_out: &mut [T] = elems_mut(KERNEL, "s", T::NAME, s_bytes)?;
    let (mut u_out, mut vt_out, info_bytes) = match job {
        Job::Full => {
            let (u, rest2) = rest
                .split_first_mut()
                .ok_or_else(|| DespacharError::internal("svd output list short"))?;
            let (vt, rest3) = rest2
                .split_first_mut()
                .ok_or_else(|| DespacharError::internal("svd output list short"))?;
            let u: &mut [T] = elems_mut(KERNEL, "u", T::NAME, u)?;
            let vt: &mut [T] = elems_mut(KERNEL, "vt", T::NAME, vt)?;
            (Some(u), Some(vt), rest3)
        }
        Job::ValuesOnly => (None, None, rest),
    };
    let info: &mut [i32] = elems_mut(
        KERNEL,
        "info",
        "i32",
        info_bytes
            .first_mut()
            .ok_or_else(|| DespacharError::internal("svd info buffer missing"))?,
    )?;

    let scratch_elems: &mut [T] = elems_mut(KERNEL, "scratch", T::NAME, scratch)?;
    let (work, vwork_all) = scratch_elems.split_at_mut(m * n);

    let stride = desc.matrix_elems();
    let mut order: Vec<usize> = Vec::with_capacity(n);
    let mut norms: Vec<T> = vec![T::zero(); n];
    for b in 0..desc.batch {
        // Strided input → packed working copy.
        let src = &a[b * stride..(b + 1) * stride];
        for i in 0..m {
            work[i * n..i * n + n].copy_from_slice(&src[i * desc.lead_dim..i * desc.lead_dim + n]);
        }
        let vwork = match job {
            Job::Full => {
                let block = &mut vwork_all[..n * n];
                identity(block, n);
                Some(block)
            }
            Job::ValuesOnly => None,
        };
        info[b] = hestenes(work, vwork, m, n);

        for (j, norm) in norms.iter_mut().enumerate() {
            *norm = column_norm(work, m, n, j);
        }
        order.clear();
        order.extend(0..n);
        order.sort_by(|&i, &j| {
            norms[j]
                .partial_cmp(&norms[i])
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        for (out_idx, &src_idx) in order.iter().enumerate() {
            s_out[b * n + out_idx] = norms[src_idx];
        }
        if job == Job::Full {
            let u_out = u_out
                .as_deref_mut()
                .ok_or_else(|| DespacharError::internal("svd u output missing"))?;
            let vt_out = vt_out
                .as_deref_mut()
                .ok_or_else(|| DespacharError::internal("svd vt output missing"))?;
            let vwork = &vwork_all[..n * n];
            for (out_idx, &src_idx) in order.iter().enumerate() {
                let sigma = norms[src_idx];
                for k in 0..m {
                    let raw = work[k * n + src_idx];
                    u_out[b * m * n + k * n + out_idx] = if sigma > T::zero() {
                        raw / sigma
                    } else {
                        T::zero()
                    };
                }
                for k in 0..n {
                    vt_out[b * n * n + out_idx * n + k] = vwork[k * n + src_idx];
                }
            }
        }
    }
    Ok(())
}

fn identity<T: Real>(m: &mut [T], n: usize) {
    m.fill(T::zero());
    for i in 0..n {
        m[i * n + i] = T::one();
    }
}

fn column_norm<T: Real>(w: &[T], m: usize, n: usize, j: usize) -> T {
    let mut acc = T::zero();
    for k in 0..m {
        acc = acc + w[k * n + j] * w[k * n + j];
    }
    acc.sqrt()
}

/// One-sided Jacobi column orthogonalization.
///
/// Rotates column pairs of the `m × n` working copy until all pairs are
/// numerically orthogonal; `v` (when present) accumulates the right-hand
/// rotations. Returns 0 on convergence, 1 at the sweep cap.
fn hestenes<T: Real>(work: &mut [T], mut v: Option<&mut [T]>, m: usize, n: usize) -> i32 {
    if n < 2 {
        return 0;
    }
    for _sweep in 0..MAX_SWEEPS {
        let mut rotated = false;
        for p in 0..n - 1 {
            for q in p + 1..n {
                let mut alpha = T::zero();
                let mut beta = T::zero();
                let mut gamma = T::zero();
                for k in 0..m {
                    let wp = work[k * n + p];
                    let wq = work[k * n + q];
                    alpha = alpha + wp * wp;
                    beta = beta + wq * wq;
                    gamma = gamma + wp * wq;
                }
                if gamma.abs() <= T::epsilon() * (alpha * beta).sqrt() {
                    continue;
                }
                rotated = true;
                let zeta = (beta - alpha) / (two::<T>() * gamma);
                let t = if zeta >= T::zero() {
                    T::one() / (zeta + (zeta * zeta + T::one()).sqrt())
                } else {
                    T::one() / (zeta - (zeta * zeta + T::one()).sqrt())
                };
                let c = T::one() / (t * t + T::one()).sqrt();
                let s = c * t;
                for k in 0..m {
                    let wp = work[k * n + p];
                    let wq = work[k * n + q];
                    work[k * n + p] = c * wp - s * wq;
                    work[k * n + q] = s * wp + c * wq;
                }
                if let Some(v) = v.as_deref_mut() {
                    for k in 0..n {
                        let vp = v[k * n + p];
                        let vq = v[k * n + q];
                        v[k * n + p] = c * vp - s * vq;
                        v[k * n + q] = s * vp + c * vq;
                    }
                }
            }
        }
        if !rotated {
            return 0;
        }
    }
    1
}
