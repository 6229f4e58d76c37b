//! Binary descriptor codec for kernel call parameters.
//!
//! A descriptor captures everything a kernel needs to know about one call
//! site: shapes, strides, algorithm variant, and required scratch size. It is
//! encoded once at compile time and decoded once per dispatch, so the wire
//! form is a flat sequence of fixed-width little-endian fields with no string
//! parsing and (for the factor family) no allocation on the decode path.
//!
//! ## Wire layouts (version 1)
//!
//! ```text
//! Factor family (28 bytes, fixed):
//! ┌─────┬────────┬───────┬─────────┬───────┬──────┬──────┬──────────┬───────────┐
//! │ ver │ family │ dtype │ variant │ batch │ rows │ cols │ lead_dim │ workspace │
//! │ u8  │ u8=1   │ u8    │ u8      │ u32   │ u32  │ u32  │ u32      │ u64       │
//! └─────┴────────┴───────┴─────────┴───────┴──────┴──────┴──────────┴───────────┘
//!
//! FFT family (16 + 4·rank bytes):
//! ┌─────┬────────┬───────┬──────┬──────┬───────────┬────────────────┐
//! │ ver │ family │ dtype │ kind │ rank │ workspace │ extent × rank  │
//! │ u8  │ u8=2   │ u8    │ u8   │ u32  │ u64       │ u32 each       │
//! └─────┴────────┴───────┴──────┴──────┴───────────┴────────────────┘
//! ```
//!
//! Field order is part of the format. Any reordering or width change is a
//! breaking format change and bumps [`DESCRIPTOR_VERSION`].

use std::io::{Cursor, Read};

use crate::error::{DespacharError, Result};

/// Wire-format version tag, first byte of every descriptor
pub const DESCRIPTOR_VERSION: u8 = 1;

/// Family tag for decomposition descriptors
pub const FAMILY_FACTOR: u8 = 1;
/// Family tag for transform descriptors
pub const FAMILY_FFT: u8 = 2;

/// Fixed wire size of a factor-family descriptor in bytes
pub const FACTOR_DESCRIPTOR_LEN: usize = 28;
/// Wire size of an FFT-family descriptor header, before the extent list
pub const FFT_DESCRIPTOR_HEADER_LEN: usize = 16;

/// Element type of the buffers a kernel operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// 32-bit IEEE float
    F32,
    /// 64-bit IEEE float
    F64,
}

impl DType {
    /// Stable wire discriminant
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::F32 => 0,
            Self::F64 => 1,
        }
    }

    /// Decode a wire discriminant
    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::F32),
            1 => Ok(Self::F64),
            other => Err(DespacharError::DescriptorMalformed {
                reason: format!("unknown dtype discriminant {other}"),
            }),
        }
    }

    /// Size of one real element in bytes
    #[must_use]
    pub fn size_of(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Size of one complex element (re + im) in bytes
    #[must_use]
    pub fn complex_size_of(self) -> usize {
        2 * self.size_of()
    }
}

/// Opaque algorithm-variant selector for the factor family.
///
/// The byte's meaning is scoped to the kernel the descriptor is dispatched
/// to: the Cholesky kernel reads it as a triangle selector, the eigen and SVD
/// kernels as a values-only/with-factors switch. Kernels reject selectors
/// outside their own range with an invalid-argument status; the codec only
/// round-trips the byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AlgorithmVariant(
    /// Raw selector byte, interpreted by the dispatched kernel
    pub u8,
);

/// Transform selector for the FFT family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FftKind {
    /// Complex-to-complex, forward
    Forward,
    /// Complex-to-complex, inverse (scaled by 1/n)
    Inverse,
    /// Real-to-complex forward; output is the n/2+1 half spectrum
    RealForward,
    /// Complex-to-real inverse from a half spectrum (scaled by 1/n)
    RealInverse,
}

impl FftKind {
    /// Stable wire discriminant
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Self::Forward => 0,
            Self::Inverse => 1,
            Self::RealForward => 2,
            Self::RealInverse => 3,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Forward),
            1 => Ok(Self::Inverse),
            2 => Ok(Self::RealForward),
            3 => Ok(Self::RealInverse),
            other => Err(DespacharError::DescriptorMalformed {
                reason: format!("unknown fft kind discriminant {other}"),
            }),
        }
    }
}

/// Call parameters for the decomposition kernels (cholesky, eigh, svd).
///
/// Matrices are row-major. `lead_dim` is the row stride in elements and must
/// be at least `cols`; each batched matrix occupies `rows * lead_dim`
/// elements. `workspace_bytes` is the scratch the call site promises to
/// supply as the trailing output buffer (zero means no scratch buffer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactorDescriptor {
    /// Element type of all numeric buffers
    pub dtype: DType,
    /// Kernel-scoped algorithm selector
    pub variant: AlgorithmVariant,
    /// Number of independent matrices in the batch
    pub batch: usize,
    /// Rows per matrix
    pub rows: usize,
    /// Columns per matrix
    pub cols: usize,
    /// Row stride in elements, `>= cols`
    pub lead_dim: usize,
    /// Scratch bytes the caller supplies as the final output buffer
    pub workspace_bytes: usize,
}

impl FactorDescriptor {
    /// Encode into the fixed 28-byte wire form.
    ///
    /// Deterministic and injective. Fails only when a field overflows its
    /// fixed-width encoding; that is a build-time error at the call site,
    /// never a dispatch-time one.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FACTOR_DESCRIPTOR_LEN);
        buf.push(DESCRIPTOR_VERSION);
        buf.push(FAMILY_FACTOR);
        buf.push(self.dtype.code());
        buf.push(self.variant.0);
        push_u32(&mut buf, "batch", self.batch)?;
        push_u32(&mut buf, "rows", self.rows)?;
        push_u32(&mut buf, "cols", self.cols)?;
        push_u32(&mut buf, "lead_dim", self.lead_dim)?;
        push_u64(&mut buf, "workspace_bytes", self.workspace_bytes);
        Ok(buf)
    }

    /// Decode from wire form.
    ///
    /// Pure and allocation-free. Rejects length mismatches, unknown
    /// version/family/dtype tags, non-positive extents, and `lead_dim < cols`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != FACTOR_DESCRIPTOR_LEN {
            return Err(DespacharError::DescriptorMalformed {
                reason: format!(
                    "factor descriptor is {FACTOR_DESCRIPTOR_LEN} bytes, got {}",
                    bytes.len()
                ),
            });
        }
        let mut cursor = Cursor::new(bytes);
        check_header(&mut cursor, FAMILY_FACTOR)?;
        let dtype = DType::from_code(read_u8(&mut cursor, "dtype")?)?;
        let variant = AlgorithmVariant(read_u8(&mut cursor, "variant")?);
        let batch = read_extent(&mut cursor, "batch")?;
        let rows = read_extent(&mut cursor, "rows")?;
        let cols = read_extent(&mut cursor, "cols")?;
        let lead_dim = read_extent(&mut cursor, "lead_dim")?;
        let workspace_bytes = read_u64(&mut cursor, "workspace_bytes")? as usize;
        if lead_dim < cols {
            return Err(DespacharError::DescriptorMalformed {
                reason: format!("lead_dim {lead_dim} is smaller than cols {cols}"),
            });
        }
        Ok(Self {
            dtype,
            variant,
            batch,
            rows,
            cols,
            lead_dim,
            workspace_bytes,
        })
    }

    /// Elements occupied by one batched matrix, stride included
    #[must_use]
    pub fn matrix_elems(&self) -> usize {
        self.rows * self.lead_dim
    }

    /// Byte length the descriptor implies for the input matrix buffer
    #[must_use]
    pub fn matrix_bytes(&self) -> usize {
        self.batch * self.matrix_elems() * self.dtype.size_of()
    }
}

/// Call parameters for the transform kernels.
///
/// The transform applies along the last axis; the leading axes form the
/// batch. `extents` must be non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FftDescriptor {
    /// Base precision of the elements (complex for c2c, real side of r2c/c2r)
    pub dtype: DType,
    /// Which transform to run
    pub kind: FftKind,
    /// Per-axis extents, outermost first
    pub extents: Vec<usize>,
    /// Scratch bytes the caller supplies as the final output buffer
    pub workspace_bytes: usize,
}

impl FftDescriptor {
    /// Encode into the wire form (`16 + 4·rank` bytes).
    ///
    /// Fails only on fixed-width overflow of the rank or an extent.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(FFT_DESCRIPTOR_HEADER_LEN + 4 * self.extents.len());
        buf.push(DESCRIPTOR_VERSION);
        buf.push(FAMILY_FFT);
        buf.push(self.dtype.code());
        buf.push(self.kind.code());
        push_u32(&mut buf, "rank", self.extents.len())?;
        push_u64(&mut buf, "workspace_bytes", self.workspace_bytes);
        for extent in &self.extents {
            push_u32(&mut buf, "extent", *extent)?;
        }
        Ok(buf)
    }

    /// Decode from wire form.
    ///
    /// The byte length must be exactly `16 + 4·rank` for the declared rank;
    /// anything else is an invalid argument. The only allocation is the
    /// extent vector.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FFT_DESCRIPTOR_HEADER_LEN {
            return Err(DespacharError::DescriptorMalformed {
                reason: format!(
                    "fft descriptor header is {FFT_DESCRIPTOR_HEADER_LEN} bytes, got {}",
                    bytes.len()
                ),
            });
        }
        let mut cursor = Cursor::new(bytes);
        check_header(&mut cursor, FAMILY_FFT)?;
        let dtype = DType::from_code(read_u8(&mut cursor, "dtype")?)?;
        let kind = FftKind::from_code(read_u8(&mut cursor, "kind")?)?;
        let rank = read_extent(&mut cursor, "rank")?;
        let workspace_bytes = read_u64(&mut cursor, "workspace_bytes")? as usize;
        let expected_len = FFT_DESCRIPTOR_HEADER_LEN + 4 * rank;
        if bytes.len() != expected_len {
            return Err(DespacharError::DescriptorMalformed {
                reason: format!(
                    "fft descriptor with rank {rank} is {expected_len} bytes, got {}",
                    bytes.len()
                ),
            });
        }
        let mut extents = Vec::with_capacity(rank);
        for _ in 0..rank {
            extents.push(read_extent(&mut cursor, "extent")?);
        }
        Ok(Self {
            dtype,
            kind,
            extents,
            workspace_bytes,
        })
    }

    /// Length of the transformed (last) axis
    #[must_use]
    pub fn transform_len(&self) -> usize {
        *self.extents.last().unwrap_or(&0)
    }

    /// Product of the leading axes; number of independent transforms
    pub fn batch(&self) -> Result<usize> {
        let leading = &self.extents[..self.extents.len().saturating_sub(1)];
        leading
            .iter()
            .try_fold(1usize, |acc, &e| acc.checked_mul(e))
            .ok_or_else(|| DespacharError::DescriptorMalformed {
                reason: "batch extent product overflows usize".to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Wire primitives
// ---------------------------------------------------------------------------

fn check_header(cursor: &mut Cursor<&[u8]>, family: u8) -> Result<()> {
    let version = read_u8(cursor, "version")?;
    if version != DESCRIPTOR_VERSION {
        return Err(DespacharError::DescriptorMalformed {
            reason: format!("descriptor version {version}, this build reads {DESCRIPTOR_VERSION}"),
        });
    }
    let tag = read_u8(cursor, "family")?;
    if tag != family {
        return Err(DespacharError::DescriptorMalformed {
            reason: format!("family tag {tag} does not match expected {family}"),
        });
    }
    Ok(())
}

fn push_u32(buf: &mut Vec<u8>, field: &'static str, value: usize) -> Result<()> {
    let wire = u32::try_from(value).map_err(|_| DespacharError::DescriptorOverflow {
        field,
        value,
        width: 32,
    })?;
    buf.extend_from_slice(&wire.to_le_bytes());
    Ok(())
}

fn push_u64(buf: &mut Vec<u8>, _field: &'static str, value: usize) {
    buf.extend_from_slice(&(value as u64).to_le_bytes());
}

fn read_u8(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<u8> {
    let mut buf = [0u8; 1];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| DespacharError::DescriptorMalformed {
            reason: format!("truncated at field `{field}`"),
        })?;
    Ok(buf[0])
}

fn read_u32(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<u32> {
    let mut buf = [0u8; 4];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| DespacharError::DescriptorMalformed {
            reason: format!("truncated at field `{field}`"),
        })?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<u64> {
    let mut buf = [0u8; 8];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| DespacharError::DescriptorMalformed {
            reason: format!("truncated at field `{field}`"),
        })?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a u32 field that must be strictly positive (an extent or count).
fn read_extent(cursor: &mut Cursor<&[u8]>, field: &'static str) -> Result<usize> {
    let value = read_u32(cursor, field)?;
    if value == 0 {
        return Err(DespacharError::DescriptorMalformed {
            reason: format!("field `{field}` must be positive"),
        });
    }
    Ok(value as usize)
}
