//! N-dimensional tensor over shared, allocator-backed storage.
//!
//! Layout conventions (same as the layer protocol):
//! - sequences are 2-D: `w` = feature count, `h` = timesteps
//! - hidden state is 2-D: `w` = hidden units, `h` = directions
//! - raw weights are 3-D: one channel per direction
//!
//! Storage is reference counted. Cloning a `Tensor` shares the buffer;
//! `make_unique` (called by every `*_mut` accessor) copies on write.

use std::sync::Arc;

use half::{bf16, f16};

use gru_core::{GruError, Result};

use crate::aligned::{system, Allocator, AlignedVec, Zeroable};
use crate::codec::{ElemType, Element};

/// Typed backing buffer.
#[derive(Debug)]
pub enum Storage {
    F32(AlignedVec<f32>),
    F16(AlignedVec<f16>),
    Bf16(AlignedVec<bf16>),
    I8(AlignedVec<i8>),
}

impl Storage {
    fn zeroed(elem: ElemType, len: usize, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        Ok(match elem {
            ElemType::F32 => Storage::F32(AlignedVec::try_zeroed(len, alloc)?),
            ElemType::F16 => Storage::F16(AlignedVec::try_zeroed(len, alloc)?),
            ElemType::Bf16 => Storage::Bf16(AlignedVec::try_zeroed(len, alloc)?),
            ElemType::I8 => Storage::I8(AlignedVec::try_zeroed(len, alloc)?),
        })
    }

    fn try_clone(&self) -> Result<Self> {
        Ok(match self {
            Storage::F32(v) => Storage::F32(v.try_clone()?),
            Storage::F16(v) => Storage::F16(v.try_clone()?),
            Storage::Bf16(v) => Storage::Bf16(v.try_clone()?),
            Storage::I8(v) => Storage::I8(v.try_clone()?),
        })
    }

    fn len(&self) -> usize {
        match self {
            Storage::F32(v) => v.len(),
            Storage::F16(v) => v.len(),
            Storage::Bf16(v) => v.len(),
            Storage::I8(v) => v.len(),
        }
    }

    fn elem(&self) -> ElemType {
        match self {
            Storage::F32(_) => ElemType::F32,
            Storage::F16(_) => ElemType::F16,
            Storage::Bf16(_) => ElemType::Bf16,
            Storage::I8(_) => ElemType::I8,
        }
    }
}

/// Element types that can live in a `Storage`.
pub trait Storable: Zeroable {
    const ELEM: ElemType;
    fn view(storage: &Storage) -> Option<&[Self]>;
    fn view_mut(storage: &mut Storage) -> Option<&mut [Self]>;
}

macro_rules! impl_storable {
    ($ty:ty, $variant:ident) => {
        impl Storable for $ty {
            const ELEM: ElemType = ElemType::$variant;

            fn view(storage: &Storage) -> Option<&[Self]> {
                match storage {
                    Storage::$variant(v) => Some(&v[..]),
                    _ => None,
                }
            }

            fn view_mut(storage: &mut Storage) -> Option<&mut [Self]> {
                match storage {
                    Storage::$variant(v) => Some(&mut v[..]),
                    _ => None,
                }
            }
        }
    };
}

impl_storable!(f32, F32);
impl_storable!(f16, F16);
impl_storable!(bf16, Bf16);
impl_storable!(i8, I8);

/// Shape + element tag + shared buffer.
#[derive(Debug, Clone)]
pub struct Tensor {
    dims: usize,
    w: usize,
    h: usize,
    d: usize,
    c: usize,
    elem: ElemType,
    elempack: usize,
    data: Option<Arc<Storage>>,
}

impl Default for Tensor {
    fn default() -> Self {
        Self::empty()
    }
}

impl Tensor {
    /// A tensor with no storage.
    pub fn empty() -> Self {
        Self {
            dims: 0,
            w: 0,
            h: 0,
            d: 0,
            c: 0,
            elem: ElemType::F32,
            elempack: 1,
            data: None,
        }
    }

    fn alloc(
        dims: usize,
        [w, h, d, c]: [usize; 4],
        elem: ElemType,
        alloc: &Arc<dyn Allocator>,
    ) -> Result<Self> {
        let total = w
            .checked_mul(h)
            .and_then(|n| n.checked_mul(d))
            .and_then(|n| n.checked_mul(c))
            .ok_or(GruError::OutOfMemory { bytes: usize::MAX })?;
        let storage = Storage::zeroed(elem, total, alloc)?;
        Ok(Self {
            dims,
            w,
            h,
            d,
            c,
            elem,
            elempack: 1,
            data: Some(Arc::new(storage)),
        })
    }

    pub fn new_1d_in(w: usize, elem: ElemType, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        Self::alloc(1, [w, 1, 1, 1], elem, alloc)
    }

    pub fn new_2d_in(w: usize, h: usize, elem: ElemType, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        Self::alloc(2, [w, h, 1, 1], elem, alloc)
    }

    pub fn new_3d_in(
        w: usize,
        h: usize,
        c: usize,
        elem: ElemType,
        alloc: &Arc<dyn Allocator>,
    ) -> Result<Self> {
        Self::alloc(3, [w, h, 1, c], elem, alloc)
    }

    /// 2-D f32 tensor from row-major values, on the system heap.
    pub fn from_f32_2d(w: usize, h: usize, values: &[f32]) -> Result<Self> {
        Self::from_values_2d::<f32>(w, h, values)
    }

    /// 3-D f32 tensor (`c` channels of `h` rows of `w`), on the system heap.
    pub fn from_f32_3d(w: usize, h: usize, c: usize, values: &[f32]) -> Result<Self> {
        let expected = w * h * c;
        if values.len() != expected {
            return Err(GruError::shape(&[expected], &[values.len()]));
        }
        let mut t = Self::new_3d_in(w, h, c, ElemType::F32, &system())?;
        t.data_mut::<f32>()?.copy_from_slice(values);
        Ok(t)
    }

    /// 2-D tensor of `E` from f32 values, encoding through the codec.
    pub fn from_values_2d<E: Element + Storable>(w: usize, h: usize, values: &[f32]) -> Result<Self> {
        if values.len() != w * h {
            return Err(GruError::shape(&[w * h], &[values.len()]));
        }
        let mut t = Self::new_2d_in(w, h, <E as Storable>::ELEM, &system())?;
        E::encode_from(values, t.data_mut::<E>()?);
        Ok(t)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn w(&self) -> usize {
        self.w
    }

    pub fn h(&self) -> usize {
        self.h
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn c(&self) -> usize {
        self.c
    }

    pub fn elem(&self) -> ElemType {
        self.elem
    }

    /// Bytes per scalar element. `elempack` does not change it.
    pub fn elemsize(&self) -> usize {
        self.elem.elemsize()
    }

    pub fn elempack(&self) -> usize {
        self.elempack
    }

    /// Tag the tensor as holding `pack` interleaved lanes per storage unit.
    /// The logical element count must be a multiple of the pack factor.
    pub fn with_elempack(mut self, pack: usize) -> Result<Self> {
        if pack == 0 || self.total() % pack != 0 {
            return Err(GruError::InvalidConfig(format!(
                "elempack {} does not divide {} elements",
                pack,
                self.total()
            )));
        }
        self.elempack = pack;
        Ok(self)
    }

    /// Logical scalar element count.
    pub fn total(&self) -> usize {
        if self.data.is_none() {
            return 0;
        }
        self.w * self.h * self.d * self.c
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }

    /// Shape as a vector, outermost last. 3-D tensors report `[w, h, c]`.
    pub fn shape(&self) -> Vec<usize> {
        match self.dims {
            1 => vec![self.w],
            2 => vec![self.w, self.h],
            3 => vec![self.w, self.h, self.c],
            4 => vec![self.w, self.h, self.d, self.c],
            _ => Vec::new(),
        }
    }

    /// Number of live handles on the backing storage.
    pub fn ref_count(&self) -> usize {
        self.data.as_ref().map(Arc::strong_count).unwrap_or(0)
    }

    /// Drop this handle's reference; storage is freed with the last one.
    pub fn release(&mut self) {
        *self = Self::empty();
    }

    /// Shared typed view.
    pub fn data<T: Storable>(&self) -> Result<&[T]> {
        let storage = self.data.as_deref().ok_or(GruError::Other("tensor is empty".into()))?;
        T::view(storage).ok_or_else(|| {
            GruError::Unsupported(format!(
                "tensor holds {} but {} was requested",
                storage.elem(),
                T::ELEM
            ))
        })
    }

    /// Unique typed view, copying shared storage first.
    pub fn data_mut<T: Storable>(&mut self) -> Result<&mut [T]> {
        self.make_unique()?;
        let storage = self
            .data
            .as_mut()
            .and_then(Arc::get_mut)
            .ok_or(GruError::Other("tensor is empty".into()))?;
        let elem = storage.elem();
        T::view_mut(storage).ok_or_else(|| {
            GruError::Unsupported(format!("tensor holds {} but {} was requested", elem, T::ELEM))
        })
    }

    /// Ensure this handle is the only owner of its storage.
    pub fn make_unique(&mut self) -> Result<()> {
        if let Some(arc) = &self.data {
            if Arc::strong_count(arc) > 1 {
                let copy = arc.try_clone()?;
                debug_assert_eq!(copy.len(), arc.len());
                self.data = Some(Arc::new(copy));
            }
        }
        Ok(())
    }

    /// Row `y` of a 2-D tensor.
    pub fn row<T: Storable>(&self, y: usize) -> Result<&[T]> {
        let w = self.w;
        let data = self.data::<T>()?;
        data.get(y * w..(y + 1) * w)
            .ok_or_else(|| GruError::shape(&[self.h], &[y + 1]))
    }

    /// Channel `q` of a 3-D tensor.
    pub fn channel<T: Storable>(&self, q: usize) -> Result<&[T]> {
        let step = self.w * self.h * self.d;
        let data = self.data::<T>()?;
        data.get(q * step..(q + 1) * step)
            .ok_or_else(|| GruError::shape(&[self.c], &[q + 1]))
    }

    /// Decode every element to f32 (float formats only).
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        Ok(match self.elem {
            ElemType::F32 => self.data::<f32>()?.to_vec(),
            ElemType::F16 => crate::codec::decode_vec(self.data::<f16>()?),
            ElemType::Bf16 => crate::codec::decode_vec(self.data::<bf16>()?),
            ElemType::I8 => {
                return Err(GruError::Unsupported(
                    "i8 tensors need a descale table to decode".into(),
                ))
            }
        })
    }

    /// Re-encode a float tensor into another float format.
    pub fn cast(&self, elem: ElemType, alloc: &Arc<dyn Allocator>) -> Result<Self> {
        let values = self.to_f32_vec()?;
        let mut out = Self::alloc(self.dims, [self.w, self.h, self.d, self.c], elem, alloc)?;
        match elem {
            ElemType::F32 => out.data_mut::<f32>()?.copy_from_slice(&values),
            ElemType::F16 => f16::encode_from(&values, out.data_mut::<f16>()?),
            ElemType::Bf16 => bf16::encode_from(&values, out.data_mut::<bf16>()?),
            ElemType::I8 => {
                return Err(GruError::Unsupported("cast to i8 needs quantization".into()))
            }
        }
        Ok(out)
    }
}
