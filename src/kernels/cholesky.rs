//! Batched Cholesky factorization kernel.
//!
//! Factors each symmetric positive-definite matrix in the batch as `L·Lᵀ`
//! (variant 0) or `Uᵀ·U` (variant 1), reading only the selected triangle of
//! the input. The factor is written to the first output with the opposite
//! triangle cleared; the second output is the per-matrix `info` array:
//! `info[i] == 0` on success, `k > 0` when the k-th leading minor is not
//! positive definite. Non-positive-definite input is an expected, recoverable
//! outcome — it travels through `info`, not the status channel.

use crate::descriptor::{AlgorithmVariant, DType, FactorDescriptor};
use crate::dispatch::DispatchContext;
use crate::error::{DespacharError, Result};
use crate::pool::DeviceKey;
use crate::status::StatusSlot;

use super::{check_len, elems, elems_mut, expect_inputs, expect_outputs, report, split_scratch, Real};

const KERNEL: &str = "cholesky";

/// Triangle selector decoded from the descriptor's variant byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Uplo {
    Lower,
    Upper,
}

impl Uplo {
    fn from_variant(variant: AlgorithmVariant) -> Result<Self> {
        match variant.0 {
            0 => Ok(Self::Lower),
            1 => Ok(Self::Upper),
            other => Err(DespacharError::DescriptorMalformed {
                reason: format!("cholesky variant {other} is not lower (0) or upper (1)"),
            }),
        }
    }
}

/// Scratch bytes the kernel needs for a given descriptor: none
#[must_use]
pub fn required_workspace(_desc: &FactorDescriptor) -> usize {
    0
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
    let uplo = Uplo::from_variant(desc.variant)?;
    if desc.rows != desc.cols {
        return Err(DespacharError::DescriptorMalformed {
            reason: format!(
                "cholesky needs a square matrix, got {}x{}",
                desc.rows, desc.cols
            ),
        });
    }

    let _handle = ctx.pool().acquire(device)?;

    expect_inputs(KERNEL, inputs, 1)?;
    let (outputs, _scratch) = split_scratch(KERNEL, outputs, desc.workspace_bytes)?;
    expect_outputs(KERNEL, outputs.len(), 2)?;

    check_len(KERNEL, "a", inputs[0], desc.matrix_bytes())?;
    check_len(KERNEL, "factor", &outputs[0], desc.matrix_bytes())?;
    check_len(KERNEL, "info", &outputs[1], desc.batch * 4)?;

    match desc.dtype {
        DType::F32 => factor_batch::<f32>(desc, uplo, inputs, outputs),
        DType::F64 => factor_batch::<f64>(desc, uplo, inputs, outputs),
    }
}

fn factor_batch<T: Real>(
    desc: &FactorDescriptor,
    uplo: Uplo,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
) -> Result<()> {
    let a: &[T] = elems(KERNEL, "a", T::NAME, inputs[0])?;
    let (factor_bytes, rest) = outputs.split_first_mut().ok_or_else(internal_shape)?;
    let (info_bytes, _) = rest.split_first_mut().ok_or_else(internal_shape)?;
    let factor: &mut [T] = elems_mut(KERNEL, "factor", T::NAME, factor_bytes)?;
    let info: &mut [i32] = elems_mut(KERNEL, "info", "i32", info_bytes)?;

    let stride = desc.matrix_elems();
    for b in 0..desc.batch {
        let src = &a[b * stride..(b + 1) * stride];
        let dst = &mut factor[b * stride..(b + 1) * stride];
        dst.copy_from_slice(src);
        info[b] = match uplo {
            Uplo::Lower => potrf_lower(dst, desc.rows, desc.lead_dim),
            Uplo::Upper => potrf_upper(dst, desc.rows, desc.lead_dim),
        };
    }
    Ok(())
}

fn internal_shape() -> DespacharError {
    DespacharError::internal("cholesky output list changed shape mid-kernel")
}

/// In-place lower Cholesky, row-major with row stride `ld`.
///
/// Returns 0 on success or `j+1` when the j-th pivot is non-positive,
/// leaving the factor partial exactly as the standard routine does. The
/// strictly upper triangle is cleared as columns complete.
fn potrf_lower<T: Real>(m: &mut [T], n: usize, ld: usize) -> i32 {
    for j in 0..n {
        let mut d = m[j * ld + j];
        for k in 0..j {
            d = d - m[j * ld + k] * m[j * ld + k];
        }
        if d <= T::zero() {
            return (j + 1) as i32;
        }
        let d = d.sqrt();
        m[j * ld + j] = d;
        for i in (j + 1)..n {
            let mut s = m[i * ld + j];
            for k in 0..j {
                s = s - m[i * ld + k] * m[j * ld + k];
            }
            m[i * ld + j] = s / d;
        }
        for i in 0..j {
            m[i * ld + j] = T::zero();
        }
    }
    0
}

/// In-place upper Cholesky (`A = Uᵀ·U`), row-major with row stride `ld`
fn potrf_upper<T: Real>(m: &mut [T], n: usize, ld: usize) -> i32 {
    for j in 0..n {
        let mut d = m[j * ld + j];
        for k in 0..j {
            d = d - m[k * ld + j] * m[k * ld + j];
        }
        if d <= T::zero() {
            return (j + 1) as i32;
        }
        let d = d.sqrt();
        m[j * ld + j] = d;
        for i in (j + 1)..n {
            let mut s = m[j * ld + i];
            for k in 0..j {
                s = s - m[k * ld + j] * m[k * ld + i];
            }
            m[j * ld + i] = s / d;
        }
        for i in (j + 1)..n {
            m[i * ld + j] = T::zero();
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spd_3x3() -> Vec<f64> {
        // A = B·Bᵀ + I for B = [[1,2,0],[0,1,1],[1,0,1]] is well conditioned.
        vec![
            6.0, 2.0, 1.0, //
            2.0, 3.0, 1.0, //
            1.0, 1.0, 3.0,
        ]
    }

    fn reconstruct_lower(l: &[f64], n: usize) -> Vec<f64> {
        let mut out = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                let mut sum = 0.0;
                for k in 0..n {
                    sum += l[i * n + k] * l[j * n + k];
                }
                out[i * n + j] = sum;
            }
        }
        out
    }

    #[test]
    fn test_potrf_lower_reconstructs() {
        let mut m = spd_3x3();
        let info = potrf_lower(&mut m, 3, 3);
        assert_eq!(info, 0);
        let back = reconstruct_lower(&m, 3);
        for (got, want) in back.iter().zip(spd_3x3().iter()) {
            assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
        }
        // Strict upper cleared.
        assert_eq!(m[1], 0.0);
        assert_eq!(m[2], 0.0);
        assert_eq!(m[5], 0.0);
    }

    #[test]
    fn test_potrf_upper_reconstructs() {
        let mut m = spd_3x3();
        let info = potrf_upper(&mut m, 3, 3);
        assert_eq!(info, 0);
        // A = Uᵀ·U.
        let mut back = vec![0.0; 9];
        for i in 0..3 {
            for j in 0..3 {
                let mut sum = 0.0;
                for k in 0..3 {
                    sum += m[k * 3 + i] * m[k * 3 + j];
                }
                back[i * 3 + j] = sum;
            }
        }
        for (got, want) in back.iter().zip(spd_3x3().iter()) {
            assert!((got - want).abs() < 1e-12);
        }
        // Strict lower cleared.
        assert_eq!(m[3], 0.0);
        assert_eq!(m[6], 0.0);
        assert_eq!(m[7], 0.0);
    }

    #[test]
    fn test_potrf_reports_indefinite_pivot() {
        // Second leading minor is negative definite.
        let mut m = vec![
            1.0, 0.0, //
            0.0, -4.0,
        ];
        let info = potrf_lower(&mut m, 2, 2);
        assert_eq!(info, 2);
    }

    #[test]
    fn test_potrf_respects_lead_dim() {
        // 2x2 matrix padded to row stride 3; padding must be untouched.
        let mut m: Vec<f64> = vec![
            4.0, 2.0, 99.0, //
            2.0, 5.0, 99.0,
        ];
        let info = potrf_lower(&mut m, 2, 3);
        assert_eq!(info, 0);
        assert_eq!(m[2], 99.0);
        assert_eq!(m[5], 99.0);
        assert!((m[0] - 2.0).abs() < 1e-12);
        assert!((m[3] - 1.0).abs() < 1e-12);
        assert!((m[4] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_variant_decoding() {
        assert_eq!(
            Uplo::from_variant(AlgorithmVariant(0)).expect("lower"),
            Uplo::Lower
        );
        assert_eq!(
            Uplo::from_variant(AlgorithmVariant(1)).expect("upper"),
            Uplo::Upper
        );
        assert!(Uplo::from_variant(AlgorithmVariant(7)).is_err());
    }
}
