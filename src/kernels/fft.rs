//! Batched fast Fourier transform kernel.
//!
//! The transform applies along the last descriptor axis; leading axes form
//! the batch. Four variants: complex-to-complex forward/inverse, and the
//! half-spectrum real pair (r2c forward, c2r inverse). Inverse transforms are
//! scaled by `1/n`, matching the usual convention where forward-then-inverse
//! is the identity.
//!
//! Plans come from the pooled handle's planner, so repeated dispatches of a
//! transform length on one device reuse cached plans. The planner is the one
//! underlying library observed to raise on bad internal state, so every
//! engine call sits inside its own failure boundary that converts a panic
//! into an internal status instead of letting it unwind toward dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use num_complex::Complex;
use rustfft::{Fft, FftNum, FftPlanner};

use crate::descriptor::{DType, FftDescriptor, FftKind};
use crate::dispatch::DispatchContext;
use crate::error::{DespacharError, Result};
use crate::pool::{DeviceHandle, DeviceKey};
use crate::status::StatusSlot;

use super::{check_len, elems, elems_mut, expect_inputs, expect_outputs, report, split_scratch, Real};

const KERNEL: &str = "fft";

/// Element precision the transform kernels are generic over, tied to the
/// matching planner inside a pooled handle
pub(crate) trait FftElement: Real + FftNum {
    /// The handle's plan cache for this precision
    fn planner(handle: &mut DeviceHandle) -> &mut FftPlanner<Self>;
}

impl FftElement for f32 {
    fn planner(handle: &mut DeviceHandle) -> &mut FftPlanner<Self> {
        handle.planner_f32()
    }
}

impl FftElement for f64 {
    fn planner(handle: &mut DeviceHandle) -> &mut FftPlanner<Self> {
        handle.planner_f64()
    }
}

/// Scratch bytes the kernel wants for a given descriptor.
///
/// Complex transforms run with a scratch region the size of one transform
/// row; the real variants need a second row to widen into. The kernel treats
/// c2c scratch as optional (falling back to the engine's internal
/// allocation), but the real variants require theirs.
#[must_use]
pub fn required_workspace(desc: &FftDescriptor) -> usize {
    let row = desc.transform_len() * desc.dtype.complex_size_of();
    match desc.kind {
        FftKind::Forward | FftKind::Inverse => row,
        FftKind::RealForward | FftKind::RealInverse => 2 * row,
    }
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
    let desc = match FftDescriptor::decode(descriptor) {
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
    desc: &FftDescriptor,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
) -> Result<()> {
    let is_real = matches!(desc.kind, FftKind::RealForward | FftKind::RealInverse);
    if is_real && desc.workspace_bytes < required_workspace(desc) {
        return Err(DespacharError::BufferMismatch {
            kernel: KERNEL,
            buffer: "scratch",
            expected: required_workspace(desc),
            actual: desc.workspace_bytes,
        });
    }

    let mut handle = ctx.pool().acquire(device)?;

    expect_inputs(KERNEL, inputs, 1)?;
    let (outputs, scratch) = split_scratch(KERNEL, outputs, desc.workspace_bytes)?;
    expect_outputs(KERNEL, outputs.len(), 1)?;

    match desc.dtype {
        DType::F32 => transform::<f32>(desc, &mut handle, inputs, outputs, scratch),
        DType::F64 => transform::<f64>(desc, &mut handle, inputs, outputs, scratch),
    }
}

fn transform<T: FftElement>(
    desc: &FftDescriptor,
    handle: &mut DeviceHandle,
    inputs: &[&[u8]],
    outputs: &mut [&mut [u8]],
    scratch: Option<&mut [u8]>,
) -> Result<()> {
    let n = desc.transform_len();
    let batch = desc.batch()?;
    let half = n / 2 + 1;
    let csize = desc.dtype.complex_size_of();
    let rsize = desc.dtype.size_of();

    let (in_bytes, out_bytes) = match desc.kind {
        FftKind::Forward | FftKind::Inverse => (batch * n * csize, batch * n * csize),
        FftKind::RealForward => (batch * n * rsize, batch * half * csize),
        FftKind::RealInverse => (batch * half * csize, batch * n * rsize),
    };
    check_len(KERNEL, "x", inputs[0], in_bytes)?;
    check_len(KERNEL, "y", &outputs[0], out_bytes)?;
    let x_bytes = inputs[0];
    let (y_first, _) = outputs
        .split_first_mut()
        .ok_or_else(|| DespacharError::internal("fft output list empty"))?;
    let y_bytes: &mut [u8] = y_first;

    // Whole complex elements only; a ragged tail would skew the row split.
    let scratch_c: Option<&mut [Complex<T>]> = match scratch {
        Some(bytes) => Some(elems_mut(
            KERNEL,
            "scratch",
            "complex",
            trim_to_whole_elems(bytes, csize),
        )?),
        None => None,
    };

    let plan = match desc.kind {
        FftKind::Forward | FftKind::RealForward => T::planner(handle).plan_fft_forward(n),
        FftKind::Inverse | FftKind::RealInverse => T::planner(handle).plan_fft_inverse(n),
    };

    match desc.kind {
        FftKind::Forward | FftKind::Inverse => {
            c2c(desc, &plan, x_bytes, y_bytes, scratch_c, batch, n)
        }
        FftKind::RealForward => r2c(&plan, x_bytes, y_bytes, scratch_c, batch, n),
        FftKind::RealInverse => c2r(&plan, x_bytes, y_bytes, scratch_c, batch, n),
    }
}

/// Drop a ragged tail so the byte region divides into whole complex elements
fn trim_to_whole_elems(bytes: &mut [u8], csize: usize) -> &mut [u8] {
    let usable = bytes.len() - bytes.len() % csize;
    &mut bytes[..usable]
}

/// Run one engine call inside a failure boundary. The transform engine may
/// panic; that must become an internal status, never an unwind.
fn guarded<R>(op: impl FnOnce() -> R) -> Result<R> {
    catch_unwind(AssertUnwindSafe(op)).map_err(|_| {
        log::error!("transform engine panicked mid-kernel");
        DespacharError::internal("transform engine panicked")
    })
}

/// Split a scratch region into the engine's per-call scratch, when it is
/// large enough to satisfy the plan; otherwise the engine allocates its own.
fn engine_scratch<'a, T: FftNum>(
    plan: &Arc<dyn Fft<T>>,
    scratch: Option<&'a mut [Complex<T>]>,
) -> Option<&'a mut [Complex<T>]> {
    let need = plan.get_inplace_scratch_len();
    scratch.filter(|s| s.len() >= need)
}

fn c2c<T: FftElement>(
    desc: &FftDescriptor,
    plan: &Arc<dyn Fft<T>>,
    x_bytes: &[u8],
    y_bytes: &mut [u8],
    scratch: Option<&mut [Complex<T>]>,
    batch: usize,
    n: usize,
) -> Result<()> {
    let x: &[Complex<T>] = elems(KERNEL, "x", "complex", x_bytes)?;
    let y: &mut [Complex<T>] = elems_mut(KERNEL, "y", "complex", y_bytes)?;
    y.copy_from_slice(x);

    let mut engine = engine_scratch(plan, scratch);
    for row in y.chunks_exact_mut(n) {
        match engine.as_deref_mut() {
            Some(s) => guarded(|| plan.process_with_scratch(row, s))?,
            None => guarded(|| plan.process(row))?,
        }
    }
    if desc.kind == FftKind::Inverse {
        scale_rows(y, batch, n);
    }
    Ok(())
}

fn r2c<T: FftElement>(
    plan: &Arc<dyn Fft<T>>,
    x_bytes: &[u8],
    y_bytes: &mut [u8],
    scratch: Option<&mut [Complex<T>]>,
    batch: usize,
    n: usize,
) -> Result<()> {
    let half = n / 2 + 1;
    let x: &[T] = elems(KERNEL, "x", T::NAME, x_bytes)?;
    let y: &mut [Complex<T>] = elems_mut(KERNEL, "y", "complex", y_bytes)?;
    let scratch =
        scratch.ok_or_else(|| DespacharError::internal("real transform scratch vanished"))?;
    let (row, rest) = scratch.split_at_mut(n);

    let mut engine: Option<&mut [Complex<T>]> = {
        let need = plan.get_inplace_scratch_len();
        if rest.len() >= need {
            Some(rest)
        } else {
            None
        }
    };
    for b in 0..batch {
        for (dst, src) in row.iter_mut().zip(&x[b * n..(b + 1) * n]) {
            *dst = Complex::new(*src, T::zero());
        }
        match engine.as_deref_mut() {
            Some(s) => guarded(|| plan.process_with_scratch(&mut *row, s))?,
            None => guarded(|| plan.process(&mut *row))?,
        }
        y[b * half..(b + 1) * half].copy_from_slice(&row[..half]);
    }
    Ok(())
}

fn c2r<T: FftElement>(
    plan: &Arc<dyn Fft<T>>,
    x_bytes: &[u8],
    y_bytes: &mut [u8],
    scratch: Option<&mut [Complex<T>]>,
    batch: usize,
    n: usize,
) -> Result<()> {
    let half = n / 2 + 1;
    let x: &[Complex<T>] = elems(KERNEL, "x", "complex", x_bytes)?;
    let y: &mut [T] = elems_mut(KERNEL, "y", T::NAME, y_bytes)?;
    let scratch =
        scratch.ok_or_else(|| DespacharError::internal("real transform scratch vanished"))?;
    let (row, rest) = scratch.split_at_mut(n);

    let scale = T::from(n)
        .map(|len| T::one() / len)
        .ok_or_else(|| DespacharError::internal("transform length not representable"))?;

    let mut engine: Option<&mut [Complex<T>]> = {
        let need = plan.get_inplace_scratch_len();
        if rest.len() >= need {
            Some(rest)
        } else {
            None
        }
    };
    for b in 0..batch {
        let spectrum = &x[b * half..(b + 1) * half];
        row[..half].copy_from_slice(spectrum);
        // Hermitian extension: the upper half mirrors the conjugated lower.
        for k in 1..half {
            if n - k >= half {
                row[n - k] = spectrum[k].conj();
            }
        }
        match engine.as_deref_mut() {
            Some(s) => guarded(|| plan.process_with_scratch(&mut *row, s))?,
            None => guarded(|| plan.process(&mut *row))?,
        }
        for (dst, src) in y[b * n..(b + 1) * n].iter_mut().zip(row.iter()) {
            *dst = src.re * scale;
        }
    }
    Ok(())
}

/// Apply the 1/n inverse normalization in place
fn scale_rows<T: FftElement>(y: &mut [Complex<T>], batch: usize, n: usize) {
    if let Some(scale) = T::from(n).map(|len| T::one() / len) {
        for value in y.iter_mut().take(batch * n) {
            *value = *value * scale;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_forward(n: usize) -> Arc<dyn Fft<f64>> {
        FftPlanner::new().plan_fft_forward(n)
    }

    #[test]
    fn test_required_workspace_by_kind() {
        let mut desc = FftDescriptor {
            dtype: DType::F64,
            kind: FftKind::Forward,
            extents: vec![8],
            workspace_bytes: 0,
        };
        assert_eq!(required_workspace(&desc), 8 * 16);
        desc.kind = FftKind::RealForward;
        assert_eq!(required_workspace(&desc), 2 * 8 * 16);
    }

    #[test]
    fn test_engine_scratch_rejects_short_region() {
        let plan = plan_forward(64);
        let need = plan.get_inplace_scratch_len();
        if need > 0 {
            let mut short: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); need - 1];
            assert!(engine_scratch(&plan, Some(&mut short)).is_none());
        }
        let mut enough: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); need];
        assert!(engine_scratch(&plan, Some(&mut enough)).is_some());
        assert!(engine_scratch(&plan, None).is_none());
    }

    #[test]
    fn test_guarded_converts_panic() {
        let err = guarded(|| panic!("engine fault")).expect_err("intercepted");
        assert!(matches!(err, DespacharError::Internal { .. }));
        let ok = guarded(|| 7).expect("passthrough");
        assert_eq!(ok, 7);
    }

    #[test]
    fn test_forward_impulse_is_flat_spectrum() {
        // FFT of a unit impulse is all-ones; checked through the plan the
        // kernel itself would use.
        let n = 8;
        let plan = plan_forward(n);
        let mut row: Vec<Complex<f64>> = vec![Complex::new(0.0, 0.0); n];
        row[0] = Complex::new(1.0, 0.0);
        plan.process(&mut row);
        for value in &row {
            assert!((value.re - 1.0).abs() < 1e-12);
            assert!(value.im.abs() < 1e-12);
        }
    }
}
