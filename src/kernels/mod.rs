//! Builtin kernel implementations and their shared scaffolding.
//!
//! Every kernel follows the same shape: decode the descriptor (failure maps
//! to an invalid-argument status before the body runs), borrow a device
//! handle through a scoped guard, re-check the caller's buffer sizes against
//! what the descriptor implies, run the numerical routine in place, and write
//! status. The helpers here keep those steps identical across kernels.
//!
//! Buffers cross the ABI as raw byte slices; the checked `bytemuck` casts
//! below are the only place they become typed element views, so a misaligned
//! or odd-length buffer is an invalid-argument status rather than undefined
//! behavior.

pub mod cholesky;
pub mod eigh;
pub mod fft;
pub mod svd;

use bytemuck::Pod;
use num_traits::Float;

use crate::dispatch::KernelRegistry;
use crate::error::{DespacharError, Result};
use crate::status::StatusSlot;

/// Register the builtin kernel set under their stable dispatch names.
///
/// # Errors
///
/// Returns a duplicate-name error if any builtin name is already taken,
/// which is startup-fatal for the host.
pub fn register_builtin_kernels(registry: &mut KernelRegistry) -> Result<()> {
    registry.register("cholesky", cholesky::kernel)?;
    registry.register("eigh", eigh::kernel)?;
    registry.register("svd", svd::kernel)?;
    registry.register("fft", fft::kernel)?;
    Ok(())
}

/// Real element type the factor kernels are generic over
pub(crate) trait Real: Float + Pod + Send + Sync + std::fmt::Debug + 'static {
    /// Type name used in buffer-cast diagnostics
    const NAME: &'static str;
}

impl Real for f32 {
    const NAME: &'static str = "f32";
}

impl Real for f64 {
    const NAME: &'static str = "f64";
}

/// The constant 2, which `num_traits::Float` does not provide directly
pub(crate) fn two<T: Float>() -> T {
    T::one() + T::one()
}

/// Write a kernel-body result into the status slot
pub(crate) fn report(status: &mut StatusSlot, result: Result<()>) {
    match result {
        Ok(()) => status.write_ok(),
        Err(err) => status.write_error(err.status_code(), err.to_string()),
    }
}

/// Checked immutable element view of a byte buffer
pub(crate) fn elems<'a, T: Pod>(
    kernel: &'static str,
    buffer: &'static str,
    dtype: &'static str,
    bytes: &'a [u8],
) -> Result<&'a [T]> {
    bytemuck::try_cast_slice(bytes).map_err(|_| DespacharError::BufferCast {
        kernel,
        buffer,
        dtype,
    })
}

/// Checked mutable element view of a byte buffer
pub(crate) fn elems_mut<'a, T: Pod>(
    kernel: &'static str,
    buffer: &'static str,
    dtype: &'static str,
    bytes: &'a mut [u8],
) -> Result<&'a mut [T]> {
    bytemuck::try_cast_slice_mut(bytes).map_err(|_| DespacharError::BufferCast {
        kernel,
        buffer,
        dtype,
    })
}

/// Defensive re-check of one buffer's byte length against the descriptor
pub(crate) fn check_len(
    kernel: &'static str,
    buffer: &'static str,
    bytes: &[u8],
    expected: usize,
) -> Result<()> {
    if bytes.len() != expected {
        return Err(DespacharError::BufferMismatch {
            kernel,
            buffer,
            expected,
            actual: bytes.len(),
        });
    }
    Ok(())
}

/// Exact input-buffer count check
pub(crate) fn expect_inputs(
    kernel: &'static str,
    inputs: &[&[u8]],
    expected: usize,
) -> Result<()> {
    if inputs.len() != expected {
        return Err(DespacharError::BufferCount {
            kernel,
            role: "input",
            expected,
            actual: inputs.len(),
        });
    }
    Ok(())
}

/// Exact output-buffer count check (`expected` excludes the trailing scratch
/// buffer, which [`split_scratch`] has already peeled off)
pub(crate) fn expect_outputs(
    kernel: &'static str,
    actual: usize,
    expected: usize,
) -> Result<()> {
    if actual != expected {
        return Err(DespacharError::BufferCount {
            kernel,
            role: "output",
            expected,
            actual,
        });
    }
    Ok(())
}

/// Peel the trailing scratch buffer off the output list when the descriptor
/// promises one, verifying it is at least as large as promised.
#[allow(clippy::type_complexity)]
pub(crate) fn split_scratch<'a, 'o>(
    kernel: &'static str,
    outputs: &'a mut [&'o mut [u8]],
    workspace_bytes: usize,
) -> Result<(&'a mut [&'o mut [u8]], Option<&'a mut [u8]>)> {
    if workspace_bytes == 0 {
        return Ok((outputs, None));
    }
    let (scratch, rest) = outputs
        .split_last_mut()
        .ok_or(DespacharError::BufferCount {
            kernel,
            role: "output",
            expected: 1,
            actual: 0,
        })?;
    if scratch.len() < workspace_bytes {
        return Err(DespacharError::BufferMismatch {
            kernel,
            buffer: "scratch",
            expected: workspace_bytes,
            actual: scratch.len(),
        });
    }
    Ok((rest, Some(&mut **scratch)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elems_roundtrip() {
        let values = [1.0f64, 2.0, 3.0];
        let bytes: &[u8] = bytemuck::cast_slice(&values);
        let back: &[f64] = elems("test", "a", "f64", bytes).expect("cast");
        assert_eq!(back, &values);
    }

    #[test]
    fn test_elems_rejects_ragged_length() {
        let bytes = [0u8; 10];
        let result: Result<&[f64]> = elems("test", "a", "f64", &bytes);
        assert!(result.is_err());
    }

    #[test]
    fn test_check_len() {
        let bytes = [0u8; 16];
        assert!(check_len("test", "a", &bytes, 16).is_ok());
        let err = check_len("test", "a", &bytes, 8).expect_err("mismatch");
        assert!(matches!(err, DespacharError::BufferMismatch { .. }));
    }

    #[test]
    fn test_split_scratch_none_when_no_workspace() {
        let mut a = vec![0u8; 4];
        let mut outputs: Vec<&mut [u8]> = vec![&mut a];
        let (rest, scratch) = split_scratch("test", &mut outputs, 0).expect("split");
        assert_eq!(rest.len(), 1);
        assert!(scratch.is_none());
    }

    #[test]
    fn test_split_scratch_peels_trailing_buffer() {
        let mut a = vec![0u8; 4];
        let mut s = vec![0u8; 32];
        let mut outputs: Vec<&mut [u8]> = vec![&mut a, &mut s];
        let (rest, scratch) = split_scratch("test", &mut outputs, 16).expect("split");
        assert_eq!(rest.len(), 1);
        assert_eq!(scratch.expect("scratch").len(), 32);
    }

    #[test]
    fn test_split_scratch_rejects_short_buffer() {
        let mut s = vec![0u8; 8];
        let mut outputs: Vec<&mut [u8]> = vec![&mut s];
        assert!(split_scratch("test", &mut outputs, 16).is_err());
    }

    #[test]
    fn test_two() {
        assert!((two::<f64>() - 2.0).abs() < 1e-15);
    }
}
