use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use smallvec::SmallVec;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    Cpu,
    Cuda { device_id: u32 },
}

impl Device {
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "CPU"),
            Device::Cuda { device_id } => write!(f, "cuda:{device_id}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F16,
    F32,
    F64,
}

impl DType {
    pub fn byte_size(self) -> usize {
        match self {
            DType::Bool | DType::U8 | DType::I8 => 1,
            DType::U16 | DType::I16 | DType::F16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
        }
    }

    /// Name used by model configurations, without the `TYPE_` prefix.
    pub fn as_str(self) -> &'static str {
        match self {
            DType::Bool => "BOOL",
            DType::U8 => "UINT8",
            DType::U16 => "UINT16",
            DType::U32 => "UINT32",
            DType::U64 => "UINT64",
            DType::I8 => "INT8",
            DType::I16 => "INT16",
            DType::I32 => "INT32",
            DType::I64 => "INT64",
            DType::F16 => "FP16",
            DType::F32 => "FP32",
            DType::F64 => "FP64",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DType {
    type Err = anyhow::Error;

    /// Accepts both `TYPE_FP32` and `FP32` spellings.
    fn from_str(raw: &str) -> anyhow::Result<Self> {
        let name = raw.strip_prefix("TYPE_").unwrap_or(raw);
        Ok(match name {
            "BOOL" => DType::Bool,
            "UINT8" => DType::U8,
            "UINT16" => DType::U16,
            "UINT32" => DType::U32,
            "UINT64" => DType::U64,
            "INT8" => DType::I8,
            "INT16" => DType::I16,
            "INT32" => DType::I32,
            "INT64" => DType::I64,
            "FP16" => DType::F16,
            "FP32" => DType::F32,
            "FP64" => DType::F64,
            _ => anyhow::bail!("unsupported datatype '{raw}'"),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Shape(pub SmallVec<[usize; 6]>);

impl Shape {
    pub fn from_slice(d: &[usize]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn rank(&self) -> usize {
        self.0.len()
    }
    /// Element count; a rank-0 shape holds one element.
    pub fn numel(&self) -> usize {
        self.0.iter().product::<usize>()
    }
    /// Element count, `None` when it does not fit in `usize`.
    pub fn checked_numel(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, d| acc.checked_mul(*d))
    }
    /// Bytes a `dtype` tensor of this shape occupies, `None` on overflow.
    pub fn checked_byte_size(&self, dtype: DType) -> Option<usize> {
        self.checked_numel()?.checked_mul(dtype.byte_size())
    }
    pub fn dims(&self) -> &[usize] {
        &self.0
    }
    pub fn leading(&self) -> Option<usize> {
        self.0.first().copied()
    }
    /// Same shape with the leading dimension replaced.
    pub fn with_leading(&self, batch: usize) -> Self {
        let mut dims = self.0.clone();
        if let Some(first) = dims.first_mut() {
            *first = batch;
        }
        Self(dims)
    }
    /// Signed form used by the serving framework.
    pub fn to_signed(&self) -> Vec<i64> {
        self.0.iter().map(|d| *d as i64).collect()
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0.as_slice())
    }
}

/// Where a request buffer lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryType {
    Cpu,
    CpuPinned,
    Gpu { device_id: u32 },
}

#[derive(Clone, Debug)]
pub struct TensorDesc {
    pub dtype: DType,
    pub shape: Shape,
    pub device: Device,
}

#[derive(Clone, Debug)]
pub struct PinnedBuf {
    pub bytes: Bytes,
}

#[derive(Clone, Debug)]
pub struct CudaBuf {
    pub device_id: u32,
    pub bytes: Bytes, // host mirror; the engine never reads it
}

/// Storage for a framework-side tensor.
#[derive(Clone, Debug)]
pub enum TensorStorage {
    CpuBytes(Bytes),
    CpuPinned(PinnedBuf),
    CudaDevice(CudaBuf),
}

impl TensorStorage {
    pub fn memory_type(&self) -> MemoryType {
        match self {
            TensorStorage::CpuBytes(_) => MemoryType::Cpu,
            TensorStorage::CpuPinned(_) => MemoryType::CpuPinned,
            TensorStorage::CudaDevice(buf) => MemoryType::Gpu {
                device_id: buf.device_id,
            },
        }
    }

    /// Host-readable bytes, or `None` for device-resident storage.
    pub fn cpu_bytes(&self) -> Option<&Bytes> {
        match self {
            TensorStorage::CpuBytes(bytes) => Some(bytes),
            TensorStorage::CpuPinned(p) => Some(&p.bytes),
            TensorStorage::CudaDevice(_) => None,
        }
    }
}

/// A tensor as handed over by the serving framework.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub desc: TensorDesc,
    pub storage: TensorStorage,
    pub byte_len: usize,
}

impl Tensor {
    pub fn from_cpu_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        let byte_len = bytes.len();
        Self {
            desc: TensorDesc {
                dtype,
                shape,
                device: Device::Cpu,
            },
            storage: TensorStorage::CpuBytes(bytes),
            byte_len,
        }
    }

    pub fn from_pinned_bytes(dtype: DType, shape: Shape, bytes: Bytes) -> Self {
        let byte_len = bytes.len();
        Self {
            desc: TensorDesc {
                dtype,
                shape,
                device: Device::Cpu,
            },
            storage: TensorStorage::CpuPinned(PinnedBuf { bytes }),
            byte_len,
        }
    }

    pub fn from_cuda_bytes(dtype: DType, shape: Shape, device_id: u32, bytes: Bytes) -> Self {
        let byte_len = bytes.len();
        Self {
            desc: TensorDesc {
                dtype,
                shape,
                device: Device::Cuda { device_id },
            },
            storage: TensorStorage::CudaDevice(CudaBuf { device_id, bytes }),
            byte_len,
        }
    }

    pub fn from_f32(shape: &[usize], values: &[f32]) -> Self {
        Self::from_cpu_bytes(DType::F32, Shape::from_slice(shape), f32_to_bytes(values))
    }

    pub fn memory_type(&self) -> MemoryType {
        self.storage.memory_type()
    }
}

/// Engine-owned contiguous tensor, the type bound inside an infer request.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineTensor {
    pub dtype: DType,
    pub shape: Shape,
    pub data: Vec<u8>,
}

impl EngineTensor {
    pub fn zeros(dtype: DType, shape: Shape) -> Self {
        let len = shape.numel() * dtype.byte_size();
        Self {
            dtype,
            shape,
            data: vec![0; len],
        }
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

/// Non-owning tensor over an external buffer.
#[derive(Clone, Debug)]
pub struct TensorView<'a> {
    pub dtype: DType,
    pub shape: Shape,
    pub data: &'a [u8],
}

impl TensorView<'_> {
    pub fn byte_size(&self) -> usize {
        self.data.len()
    }
}

pub fn f32_to_bytes(values: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Bytes::from(out)
}

pub fn bytes_to_f32(bytes: &[u8]) -> anyhow::Result<Vec<f32>> {
    anyhow::ensure!(bytes.len() % 4 == 0, "f32 buffer has invalid byte length");
    Ok(bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}
