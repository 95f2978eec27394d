//! Dense tensor buffers with accountant-registered storage.
//!
//! A `Tensor` owns an `Arc` of a typed contiguous buffer. Cloning or
//! reshaping produces a view that shares the buffer without re-registering
//! bytes; the buffer deregisters from its accountant exactly once, when the
//! last owner drops. Mutation is only permitted while no other view exists.

use half::f16;
use rand::Rng;
use std::sync::Arc;

use nanotune_core::{NanoTuneError, Result};

use crate::memory::{MemoryAccountant, MemoryCategory};

/// Element type of a tensor buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    F16,
    I8,
    /// Packed 4-bit codes, two per byte, low nibble first.
    Nf4,
}

impl DType {
    /// Bytes needed to store `count` elements of this type.
    pub fn byte_count(&self, count: usize) -> usize {
        match self {
            DType::F32 => count * 4,
            DType::F16 => count * 2,
            DType::I8 => count,
            DType::Nf4 => count.div_ceil(2),
        }
    }
}

/// Typed contiguous storage.
#[derive(Debug)]
pub enum TensorData {
    F32(Vec<f32>),
    F16(Vec<f16>),
    I8(Vec<i8>),
    Nf4(Vec<u8>),
}

impl TensorData {
    fn dtype(&self) -> DType {
        match self {
            TensorData::F32(_) => DType::F32,
            TensorData::F16(_) => DType::F16,
            TensorData::I8(_) => DType::I8,
            TensorData::Nf4(_) => DType::Nf4,
        }
    }

    fn buffer_len(&self) -> usize {
        match self {
            TensorData::F32(v) => v.len(),
            TensorData::F16(v) => v.len(),
            TensorData::I8(v) => v.len(),
            TensorData::Nf4(v) => v.len(),
        }
    }
}

/// Registered storage; deregisters its bytes on drop.
#[derive(Debug)]
struct TensorBuf {
    data: TensorData,
    bytes: u64,
    category: MemoryCategory,
    accountant: Arc<MemoryAccountant>,
}

impl Drop for TensorBuf {
    fn drop(&mut self) {
        self.accountant.unregister(self.category, self.bytes);
    }
}

/// A dense tensor: shared storage plus a shape descriptor.
///
/// `clone()` produces a view over the same storage.
#[derive(Debug, Clone)]
pub struct Tensor {
    buf: Arc<TensorBuf>,
    shape: Vec<usize>,
}

fn numel(shape: &[usize]) -> usize {
    shape.iter().product()
}

fn check_shape(shape: &[usize]) -> Result<()> {
    if shape.is_empty() || shape.contains(&0) {
        return Err(NanoTuneError::shape("tensor shape", &[1], shape));
    }
    Ok(())
}

impl Tensor {
    fn alloc(
        data: TensorData,
        shape: Vec<usize>,
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(&shape)?;
        let count = numel(&shape);
        let min_len = match data.dtype() {
            DType::Nf4 => count.div_ceil(2),
            _ => count,
        };
        if data.buffer_len() < min_len {
            return Err(NanoTuneError::shape(
                "tensor buffer length",
                &[min_len],
                &[data.buffer_len()],
            ));
        }
        let bytes = data.dtype().byte_count(count) as u64;
        accountant.register(category, bytes)?;
        Ok(Self {
            buf: Arc::new(TensorBuf {
                data,
                bytes,
                category,
                accountant: Arc::clone(accountant),
            }),
            shape,
        })
    }

    /// Zero-filled f32 tensor.
    pub fn zeros(
        shape: &[usize],
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(shape)?;
        Self::alloc(
            TensorData::F32(vec![0.0; numel(shape)]),
            shape.to_vec(),
            category,
            accountant,
        )
    }

    /// One-filled f32 tensor.
    pub fn ones(
        shape: &[usize],
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(shape)?;
        Self::alloc(
            TensorData::F32(vec![1.0; numel(shape)]),
            shape.to_vec(),
            category,
            accountant,
        )
    }

    /// Standard-normal f32 tensor scaled by `std`, via the Box–Muller
    /// transform over uniform draws from `rng`.
    pub fn randn(
        shape: &[usize],
        std: f32,
        rng: &mut impl Rng,
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(shape)?;
        let count = numel(shape);
        let mut data = Vec::with_capacity(count);
        while data.len() < count {
            let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
            let u2: f32 = rng.gen::<f32>();
            let r = (-2.0 * u1.ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * u2;
            data.push(r * theta.cos() * std);
            if data.len() < count {
                data.push(r * theta.sin() * std);
            }
        }
        Self::alloc(TensorData::F32(data), shape.to_vec(), category, accountant)
    }

    /// f32 tensor from an existing buffer.
    pub fn from_vec(
        data: Vec<f32>,
        shape: &[usize],
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(shape)?;
        if data.len() != numel(shape) {
            return Err(NanoTuneError::shape(
                "from_vec",
                &[numel(shape)],
                &[data.len()],
            ));
        }
        Self::alloc(TensorData::F32(data), shape.to_vec(), category, accountant)
    }

    /// f16 tensor from an existing buffer.
    pub fn from_f16(
        data: Vec<f16>,
        shape: &[usize],
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(shape)?;
        if data.len() != numel(shape) {
            return Err(NanoTuneError::shape(
                "from_f16",
                &[numel(shape)],
                &[data.len()],
            ));
        }
        Self::alloc(TensorData::F16(data), shape.to_vec(), category, accountant)
    }

    /// i8 tensor from an existing buffer.
    pub fn from_i8(
        data: Vec<i8>,
        shape: &[usize],
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(shape)?;
        if data.len() != numel(shape) {
            return Err(NanoTuneError::shape(
                "from_i8",
                &[numel(shape)],
                &[data.len()],
            ));
        }
        Self::alloc(TensorData::I8(data), shape.to_vec(), category, accountant)
    }

    /// Packed-nf4 tensor over `shape` logical elements.
    pub fn from_nf4_bytes(
        packed: Vec<u8>,
        shape: &[usize],
        category: MemoryCategory,
        accountant: &Arc<MemoryAccountant>,
    ) -> Result<Self> {
        check_shape(shape)?;
        Self::alloc(TensorData::Nf4(packed), shape.to_vec(), category, accountant)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn numel(&self) -> usize {
        numel(&self.shape)
    }

    pub fn dtype(&self) -> DType {
        self.buf.data.dtype()
    }

    pub fn category(&self) -> MemoryCategory {
        self.buf.category
    }

    pub fn byte_count(&self) -> u64 {
        self.buf.bytes
    }

    /// The accountant this tensor's storage is registered with.
    pub fn accountant(&self) -> &Arc<MemoryAccountant> {
        &self.buf.accountant
    }

    /// Whether other views share this tensor's storage.
    pub fn is_aliased(&self) -> bool {
        Arc::strong_count(&self.buf) > 1
    }

    /// Read access to f32 storage.
    pub fn data_f32(&self) -> Result<&[f32]> {
        match &self.buf.data {
            TensorData::F32(v) => Ok(v),
            other => Err(NanoTuneError::Other(format!(
                "expected f32 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }

    /// Read access to f16 storage.
    pub fn data_f16(&self) -> Result<&[f16]> {
        match &self.buf.data {
            TensorData::F16(v) => Ok(v),
            other => Err(NanoTuneError::Other(format!(
                "expected f16 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }

    /// Read access to the packed byte payload of an nf4 tensor.
    pub fn data_nf4(&self) -> Result<&[u8]> {
        match &self.buf.data {
            TensorData::Nf4(v) => Ok(v),
            other => Err(NanoTuneError::Other(format!(
                "expected nf4 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }

    /// Mutable access to f32 storage. Refused while any other view exists:
    /// views are shared-read aliases.
    pub fn data_f32_mut(&mut self) -> Result<&mut [f32]> {
        let buf = Arc::get_mut(&mut self.buf).ok_or_else(|| {
            NanoTuneError::Other("cannot mutate tensor while views are outstanding".into())
        })?;
        match &mut buf.data {
            TensorData::F32(v) => Ok(v),
            other => Err(NanoTuneError::Other(format!(
                "expected f32 tensor, got {:?}",
                other.dtype()
            ))),
        }
    }

    /// View with a new shape over the same storage. Element count must be
    /// preserved; no bytes are re-registered.
    pub fn reshape(&self, new_shape: &[usize]) -> Result<Tensor> {
        check_shape(new_shape)?;
        if numel(new_shape) != self.numel() {
            return Err(NanoTuneError::shape("reshape", &self.shape, new_shape));
        }
        Ok(Tensor {
            buf: Arc::clone(&self.buf),
            shape: new_shape.to_vec(),
        })
    }

    /// Deep copy under a (possibly different) category.
    pub fn duplicate(&self, category: MemoryCategory) -> Result<Tensor> {
        let data = match &self.buf.data {
            TensorData::F32(v) => TensorData::F32(v.clone()),
            TensorData::F16(v) => TensorData::F16(v.clone()),
            TensorData::I8(v) => TensorData::I8(v.clone()),
            TensorData::Nf4(v) => TensorData::Nf4(v.clone()),
        };
        Self::alloc(data, self.shape.clone(), category, &self.buf.accountant)
    }
}
