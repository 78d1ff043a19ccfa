//! Linear memory, memory ranges, and the allocator contract.
//!
//! A [`Memory`] is a cheap-clone handle over a [`RawMemory`] backend, which
//! owns the bytes and the allocator. [`MemoryRange`] and
//! [`ReadonlyMemoryRange`] address a `[ptr, ptr + size)` window inside a
//! memory; every access through a range is bounds-checked against the window
//! and alignment-checked against the natural alignment of `ptr`.

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use super::buffer::{align_to, ensure_little_endian, natural_alignment, read_slice, write_slice};
use super::Trap;
use crate::logging::trace;

/// Backend of a [`Memory`]: a byte store plus an allocator.
pub trait RawMemory: Send + Sync {
    /// Stable identifier of this memory.
    fn id(&self) -> &str;

    /// Current size of the memory in bytes.
    fn byte_length(&self) -> usize;

    /// Copy `dst.len()` bytes starting at `ptr` into `dst`.
    fn read(&self, ptr: u32, dst: &mut [u8]) -> Result<(), Trap>;

    /// Copy `src` into the memory starting at `ptr`.
    fn write(&self, ptr: u32, src: &[u8]) -> Result<(), Trap>;

    /// Allocate `size` bytes aligned to `align`.
    fn alloc(&self, align: u32, size: u32) -> Result<u32, Trap> {
        self.realloc(0, 0, align, size)
    }

    /// Reallocate with `cabi_realloc` semantics.
    fn realloc(&self, old_ptr: u32, old_size: u32, align: u32, new_size: u32)
    -> Result<u32, Trap>;

    /// Release an allocation. Bump allocators ignore this.
    fn free(&self, _ptr: u32, _size: u32, _align: u32) -> Result<(), Trap> {
        Ok(())
    }
}

/// Shared handle to a linear memory.
#[derive(Clone)]
pub struct Memory {
    raw: Arc<dyn RawMemory>,
}

impl fmt::Debug for Memory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memory")
            .field("id", &self.id())
            .field("byte_length", &self.byte_length())
            .finish()
    }
}

impl Memory {
    /// Wrap a backend. Fails on big-endian hosts.
    pub fn new(raw: impl RawMemory + 'static) -> Result<Self, Trap> {
        Self::from_arc(Arc::new(raw))
    }

    /// Wrap an already shared backend. Fails on big-endian hosts.
    pub fn from_arc(raw: Arc<dyn RawMemory>) -> Result<Self, Trap> {
        ensure_little_endian()?;
        Ok(Self { raw })
    }

    /// A zero-capacity memory that rejects every operation.
    pub fn null() -> Self {
        Self {
            raw: Arc::new(NullMemory),
        }
    }

    pub fn id(&self) -> &str {
        self.raw.id()
    }

    pub fn byte_length(&self) -> usize {
        self.raw.byte_length()
    }

    /// Returns `true` if both handles refer to the same backend.
    pub fn same(&self, other: &Memory) -> bool {
        Arc::ptr_eq(&self.raw, &other.raw)
    }

    pub(crate) fn raw(&self) -> &dyn RawMemory {
        self.raw.as_ref()
    }

    /// Allocate a fresh range of `size` bytes aligned to `align`.
    pub fn alloc(&self, align: u32, size: u32) -> Result<MemoryRange, Trap> {
        let ptr = self.raw.alloc(align, size)?;
        if ptr % align != 0 {
            return Err(Trap::MisalignedAllocation {
                ptr,
                size,
                alignment: align,
            });
        }
        trace!(memory = self.id(), ptr, size, align, "alloc");
        Ok(MemoryRange::new(self.clone(), ptr, size))
    }

    /// Grow or shrink `range` to `new_size`, possibly moving it.
    pub fn realloc(&self, range: &MemoryRange, new_size: u32) -> Result<MemoryRange, Trap> {
        let align = range.alignment();
        let ptr = self.raw.realloc(range.ptr(), range.size(), align, new_size)?;
        if ptr % align != 0 {
            return Err(Trap::MisalignedAllocation {
                ptr,
                size: new_size,
                alignment: align,
            });
        }
        Ok(MemoryRange::new(self.clone(), ptr, new_size))
    }

    /// Wrap a range the caller already allocated.
    pub fn pre_allocated(&self, ptr: u32, size: u32) -> Result<MemoryRange, Trap> {
        self.check_window(ptr, size)?;
        Ok(MemoryRange::new(self.clone(), ptr, size))
    }

    /// A read-only view of `[ptr, ptr + size)`.
    pub fn readonly(&self, ptr: u32, size: u32) -> Result<ReadonlyMemoryRange, Trap> {
        self.check_window(ptr, size)?;
        Ok(ReadonlyMemoryRange::new(self.clone(), ptr, size))
    }

    pub fn free(&self, range: MemoryRange) -> Result<(), Trap> {
        self.raw.free(range.ptr(), range.size(), range.alignment())
    }

    fn check_window(&self, ptr: u32, size: u32) -> Result<(), Trap> {
        let memory_size = self.byte_length();
        if u64::from(ptr) + u64::from(size) > memory_size as u64 {
            return Err(Trap::InvalidMemoryPointer {
                ptr,
                len: size,
                memory_size,
            });
        }
        Ok(())
    }
}

struct NullMemory;

impl RawMemory for NullMemory {
    fn id(&self) -> &str {
        "null"
    }

    fn byte_length(&self) -> usize {
        0
    }

    fn read(&self, _ptr: u32, _dst: &mut [u8]) -> Result<(), Trap> {
        Err(Trap::NullMemory("read"))
    }

    fn write(&self, _ptr: u32, _src: &[u8]) -> Result<(), Trap> {
        Err(Trap::NullMemory("write"))
    }

    fn alloc(&self, _align: u32, _size: u32) -> Result<u32, Trap> {
        Err(Trap::NullMemory("alloc"))
    }

    fn realloc(&self, _: u32, _: u32, _: u32, _: u32) -> Result<u32, Trap> {
        Err(Trap::NullMemory("realloc"))
    }

    fn free(&self, _ptr: u32, _size: u32, _align: u32) -> Result<(), Trap> {
        Err(Trap::NullMemory("free"))
    }
}

/// Read access shared by both range kinds.
pub trait MemoryView {
    fn memory(&self) -> &Memory;
    fn ptr(&self) -> u32;
    fn size(&self) -> u32;

    /// Natural alignment of the range: the largest of 8, 4, 2, 1 dividing `ptr`.
    fn alignment(&self) -> u32 {
        natural_alignment(self.ptr())
    }

    /// Trap unless `offset` is a multiple of `alignment` and `alignment`
    /// does not exceed the range's own alignment.
    fn assert_alignment(&self, offset: u32, alignment: u32) -> Result<(), Trap> {
        let range_alignment = self.alignment();
        if alignment > range_alignment || offset % alignment != 0 {
            return Err(Trap::Misaligned {
                offset,
                alignment,
                range_alignment,
            });
        }
        Ok(())
    }

    /// Translate a window inside the range to an absolute pointer.
    fn absolute(&self, offset: u32, len: u32) -> Result<u32, Trap> {
        let end = u64::from(offset) + u64::from(len);
        if end > u64::from(self.size()) {
            return Err(Trap::OutOfBounds {
                offset: u64::from(offset),
                len: u64::from(len),
                size: self.size(),
            });
        }
        Ok(self.ptr() + offset)
    }

    fn get_bytes(&self, offset: u32, len: u32) -> Result<Vec<u8>, Trap> {
        let ptr = self.absolute(offset, len)?;
        let mut bytes = vec![0u8; len as usize];
        self.memory().raw().read(ptr, &mut bytes)?;
        Ok(bytes)
    }

    fn get_array<const N: usize>(&self, offset: u32) -> Result<[u8; N], Trap> {
        if N > 1 {
            self.assert_alignment(offset, N as u32)?;
        }
        let ptr = self.absolute(offset, N as u32)?;
        let mut bytes = [0u8; N];
        self.memory().raw().read(ptr, &mut bytes)?;
        Ok(bytes)
    }

    fn get_u8(&self, offset: u32) -> Result<u8, Trap> {
        self.get_array::<1>(offset).map(u8::from_le_bytes)
    }

    fn get_i8(&self, offset: u32) -> Result<i8, Trap> {
        self.get_array::<1>(offset).map(i8::from_le_bytes)
    }

    fn get_u16(&self, offset: u32) -> Result<u16, Trap> {
        self.get_array::<2>(offset).map(u16::from_le_bytes)
    }

    fn get_i16(&self, offset: u32) -> Result<i16, Trap> {
        self.get_array::<2>(offset).map(i16::from_le_bytes)
    }

    fn get_u32(&self, offset: u32) -> Result<u32, Trap> {
        self.get_array::<4>(offset).map(u32::from_le_bytes)
    }

    fn get_i32(&self, offset: u32) -> Result<i32, Trap> {
        self.get_array::<4>(offset).map(i32::from_le_bytes)
    }

    fn get_u64(&self, offset: u32) -> Result<u64, Trap> {
        self.get_array::<8>(offset).map(u64::from_le_bytes)
    }

    fn get_i64(&self, offset: u32) -> Result<i64, Trap> {
        self.get_array::<8>(offset).map(i64::from_le_bytes)
    }

    fn get_f32(&self, offset: u32) -> Result<f32, Trap> {
        self.get_array::<4>(offset).map(f32::from_le_bytes)
    }

    fn get_f64(&self, offset: u32) -> Result<f64, Trap> {
        self.get_array::<8>(offset).map(f64::from_le_bytes)
    }

    /// Copy `len` bytes from this range into `dest`. This is the single
    /// relocation primitive behind every `copy`/`copy_flat` operation.
    fn copy_bytes(
        &self,
        offset: u32,
        len: u32,
        dest: &MemoryRange,
        dest_offset: u32,
    ) -> Result<(), Trap> {
        let bytes = self.get_bytes(offset, len)?;
        dest.set_bytes(dest_offset, &bytes)
    }
}

/// A read-only window into a [`Memory`].
#[derive(Clone, Debug)]
pub struct ReadonlyMemoryRange {
    memory: Memory,
    ptr: u32,
    size: u32,
}

impl ReadonlyMemoryRange {
    fn new(memory: Memory, ptr: u32, size: u32) -> Self {
        Self { memory, ptr, size }
    }
}

impl MemoryView for ReadonlyMemoryRange {
    fn memory(&self) -> &Memory {
        &self.memory
    }

    fn ptr(&self) -> u32 {
        self.ptr
    }

    fn size(&self) -> u32 {
        self.size
    }
}

/// A read-write window into a [`Memory`].
#[derive(Clone, Debug)]
pub struct MemoryRange {
    memory: Memory,
    ptr: u32,
    size: u32,
}

impl MemoryView for MemoryRange {
    fn memory(&self) -> &Memory {
        &self.memory
    }

    fn ptr(&self) -> u32 {
        self.ptr
    }

    fn size(&self) -> u32 {
        self.size
    }
}

impl MemoryRange {
    fn new(memory: Memory, ptr: u32, size: u32) -> Self {
        Self { memory, ptr, size }
    }

    /// A read-only view of the same window.
    pub fn as_readonly(&self) -> ReadonlyMemoryRange {
        ReadonlyMemoryRange::new(self.memory.clone(), self.ptr, self.size)
    }

    pub fn set_bytes(&self, offset: u32, bytes: &[u8]) -> Result<(), Trap> {
        let ptr = self.absolute(offset, bytes.len() as u32)?;
        self.memory.raw().write(ptr, bytes)
    }

    fn set_array<const N: usize>(&self, offset: u32, bytes: [u8; N]) -> Result<(), Trap> {
        if N > 1 {
            self.assert_alignment(offset, N as u32)?;
        }
        self.set_bytes(offset, &bytes)
    }

    pub fn set_u8(&self, offset: u32, value: u8) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_i8(&self, offset: u32, value: i8) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_u16(&self, offset: u32, value: u16) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_i16(&self, offset: u32, value: i16) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_u32(&self, offset: u32, value: u32) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_i32(&self, offset: u32, value: i32) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_u64(&self, offset: u32, value: u64) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_i64(&self, offset: u32, value: i64) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_f32(&self, offset: u32, value: f32) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }

    pub fn set_f64(&self, offset: u32, value: f64) -> Result<(), Trap> {
        self.set_array(offset, value.to_le_bytes())
    }
}

/// A growable byte buffer shared between the host and a module instance.
///
/// Cloning shares the same bytes.
///
/// # Example
///
/// ```ignore
/// use wit_bridge::LinearMemory;
///
/// let mem = LinearMemory::with_size(1024);
/// mem.write(16, b"hello")?;
/// let bytes = mem.to_vec();
/// ```
#[derive(Default, Clone)]
pub struct LinearMemory {
    data: Arc<RwLock<Vec<u8>>>,
}

impl fmt::Debug for LinearMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearMemory")
            .field("len", &self.len())
            .finish()
    }
}

impl LinearMemory {
    /// Create a new empty linear memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero-filled linear memory of `size` bytes.
    pub fn with_size(size: usize) -> Self {
        Self::from_bytes(vec![0; size])
    }

    /// Create a linear memory from existing bytes.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// Returns the length of the memory in bytes.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if the memory holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Grow the memory so it is at least `size` bytes long.
    pub fn ensure_len(&self, size: usize) {
        let mut data = self.data.write();
        if data.len() < size {
            data.resize(size, 0);
        }
    }

    /// Read bytes from a specific offset in memory.
    pub fn read(&self, ptr: u32, dst: &mut [u8]) -> Result<(), Trap> {
        let data = self.data.read();
        dst.copy_from_slice(read_slice(&data, ptr, dst.len() as u32)?);
        Ok(())
    }

    /// Write bytes at a specific offset in memory.
    pub fn write(&self, ptr: u32, src: &[u8]) -> Result<(), Trap> {
        write_slice(&mut self.data.write(), ptr, src)
    }

    /// Copy the current contents out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Returns `true` if both handles share the same bytes.
    pub fn same(&self, other: &LinearMemory) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl From<Vec<u8>> for LinearMemory {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(data)
    }
}

impl From<&[u8]> for LinearMemory {
    fn from(data: &[u8]) -> Self {
        Self::from_bytes(data.to_vec())
    }
}

/// A host-side memory with its own bump allocator.
///
/// Offset 0 is reserved so no allocation ever returns a null pointer.
/// Reallocation in place only happens when shrinking.
pub struct BumpMemory {
    id: String,
    buffer: LinearMemory,
    next: Mutex<u32>,
}

impl Default for BumpMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl BumpMemory {
    pub fn new() -> Self {
        Self::with_buffer(LinearMemory::new())
    }

    /// Allocate on top of an existing buffer, after its current contents.
    pub fn with_buffer(buffer: LinearMemory) -> Self {
        let start = align_to((buffer.len() as u32).max(8), 8);
        Self {
            id: Uuid::new_v4().to_string(),
            buffer,
            next: Mutex::new(start),
        }
    }

    pub fn buffer(&self) -> &LinearMemory {
        &self.buffer
    }
}

impl RawMemory for BumpMemory {
    fn id(&self) -> &str {
        &self.id
    }

    fn byte_length(&self) -> usize {
        self.buffer.len()
    }

    fn read(&self, ptr: u32, dst: &mut [u8]) -> Result<(), Trap> {
        self.buffer.read(ptr, dst)
    }

    fn write(&self, ptr: u32, src: &[u8]) -> Result<(), Trap> {
        self.buffer.write(ptr, src)
    }

    fn realloc(&self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32, Trap> {
        if old_ptr != 0 && new_size <= old_size {
            return Ok(old_ptr);
        }
        let mut next = self.next.lock();
        let ptr = align_to(*next, align.max(1));
        let end = ptr.checked_add(new_size).ok_or(Trap::OutOfMemory {
            size: new_size,
            alignment: align,
        })?;
        self.buffer.ensure_len(end as usize);
        *next = end;
        drop(next);
        if old_ptr != 0 && old_size > 0 {
            let mut old = vec![0u8; old_size as usize];
            self.buffer.read(old_ptr, &mut old)?;
            self.buffer.write(ptr, &old)?;
        }
        Ok(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory() -> Memory {
        Memory::new(BumpMemory::new()).unwrap()
    }

    #[test]
    fn test_alloc_is_aligned() {
        let mem = memory();
        let a = mem.alloc(1, 3).unwrap();
        let b = mem.alloc(8, 16).unwrap();
        let c = mem.alloc(4, 4).unwrap();
        assert_eq!(b.ptr() % 8, 0);
        assert_eq!(c.ptr() % 4, 0);
        assert!(b.ptr() >= a.ptr() + 3);
        assert_ne!(a.ptr(), 0);
    }

    #[test]
    fn test_typed_read_write() {
        let mem = memory();
        let range = mem.alloc(8, 16).unwrap();
        range.set_u16(0, 0xBEEF).unwrap();
        range.set_i32(4, -5).unwrap();
        range.set_f64(8, 2.5).unwrap();
        assert_eq!(range.get_u16(0).unwrap(), 0xBEEF);
        assert_eq!(range.get_i32(4).unwrap(), -5);
        assert_eq!(range.get_f64(8).unwrap(), 2.5);
        assert_eq!(range.get_bytes(0, 2).unwrap(), vec![0xEF, 0xBE]);
    }

    #[test]
    fn test_bounds_checked() {
        let mem = memory();
        let range = mem.alloc(4, 4).unwrap();
        assert!(matches!(range.get_u64(0), Err(Trap::OutOfBounds { .. }) | Err(Trap::Misaligned { .. })));
        assert!(matches!(range.set_u32(4, 1), Err(Trap::OutOfBounds { .. })));
    }

    #[test]
    fn test_assert_alignment() {
        let mem = memory();
        let range = mem.alloc(8, 32).unwrap();
        let view = mem.pre_allocated(range.ptr() + 4, 8).unwrap();
        assert!(view.assert_alignment(0, 4).is_ok());
        assert!(view.assert_alignment(0, 8).is_err());
        assert!(view.assert_alignment(2, 4).is_err());
        assert!(view.assert_alignment(3, 1).is_ok());
    }

    #[test]
    fn test_copy_bytes_between_memories() {
        let a = memory();
        let b = memory();
        let src = a.alloc(1, 4).unwrap();
        src.set_bytes(0, b"wasm").unwrap();
        let dest = b.alloc(1, 4).unwrap();
        src.copy_bytes(0, 4, &dest, 0).unwrap();
        assert_eq!(dest.get_bytes(0, 4).unwrap(), b"wasm".to_vec());
    }

    #[test]
    fn test_realloc_preserves_contents() {
        let mem = memory();
        let range = mem.alloc(4, 4).unwrap();
        range.set_u32(0, 42).unwrap();
        let grown = mem.realloc(&range, 64).unwrap();
        assert_eq!(grown.get_u32(0).unwrap(), 42);
        assert_eq!(grown.size(), 64);
    }

    #[test]
    fn test_null_memory_rejects_everything() {
        let mem = Memory::null();
        assert!(matches!(mem.alloc(1, 1), Err(Trap::NullMemory(_))));
        assert!(mem.readonly(0, 1).is_err());
        assert_eq!(mem.byte_length(), 0);
    }
}
