//! The shared buffer a call and its result travel through.
//!
//! Layout (little-endian byte offsets):
//!
//! | offset | len | field       |
//! |--------|-----|-------------|
//! | 0      | 4   | sync        |
//! | 4      | 4   | error code  |
//! | 8      | 4   | result type |
//! | 12     | 8   | result      |
//! | 20     | 4   | next        |
//! | 24     | ..  | arena       |
//!
//! The result type is `0` for no value, `1` for a float widened to 64 bits
//! and `2` for an integer. Integers travel as their raw bit pattern, so a
//! signed result needs no separate tag; the reader narrows to the flat type
//! it expects.
//!
//! Allocation bumps `next` through the arena and never frees. A waiter
//! blocks on a condition variable until `sync` becomes non-zero.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use super::ProtocolError;
use crate::abi::buffer::{align_to, read_slice, write_slice};
use crate::abi::{FlatType, FlatValue, Memory, RawMemory, Trap};
use crate::logging::trace;

pub const SYNC: u32 = 0;
pub const ERROR_CODE: u32 = 4;
pub const RESULT_TYPE: u32 = 8;
pub const RESULT: u32 = 12;
pub const NEXT: u32 = 20;
pub const ARENA_START: u32 = 24;

/// Size of a connection memory unless configured otherwise.
pub const DEFAULT_MEMORY_SIZE: usize = 64 * 1024;

const TAG_NONE: u32 = 0;
const TAG_FLOAT: u32 = 1;
const TAG_INTEGER: u32 = 2;

fn header_u32(bytes: &[u8], offset: u32) -> u32 {
    read_slice(bytes, offset, 4)
        .ok()
        .and_then(|slice| slice.try_into().ok())
        .map_or(0, u32::from_le_bytes)
}

fn header_u64(bytes: &[u8], offset: u32) -> u64 {
    read_slice(bytes, offset, 8)
        .ok()
        .and_then(|slice| slice.try_into().ok())
        .map_or(0, u64::from_le_bytes)
}

struct Region {
    id: String,
    bytes: Mutex<Vec<u8>>,
    signal: Condvar,
    error: Mutex<Option<String>>,
}

impl Region {
    // The constructor sizes every buffer to hold the header.
    fn set_header(bytes: &mut [u8], offset: u32, value: &[u8]) {
        let written = write_slice(bytes, offset, value);
        debug_assert!(written.is_ok(), "header field at {} out of bounds", offset);
    }
}

impl RawMemory for Region {
    fn id(&self) -> &str {
        &self.id
    }

    fn byte_length(&self) -> usize {
        self.bytes.lock().len()
    }

    fn read(&self, ptr: u32, dst: &mut [u8]) -> Result<(), Trap> {
        let bytes = self.bytes.lock();
        dst.copy_from_slice(read_slice(&bytes, ptr, dst.len() as u32)?);
        Ok(())
    }

    fn write(&self, ptr: u32, src: &[u8]) -> Result<(), Trap> {
        write_slice(&mut self.bytes.lock(), ptr, src)
    }

    fn realloc(&self, old_ptr: u32, old_size: u32, align: u32, new_size: u32) -> Result<u32, Trap> {
        if old_ptr != 0 && new_size <= old_size {
            return Ok(old_ptr);
        }
        let mut bytes = self.bytes.lock();
        let out_of_memory = Trap::OutOfMemory {
            size: new_size,
            alignment: align,
        };
        let next = header_u32(&bytes, NEXT).max(ARENA_START);
        let ptr = align_to(next, align.max(1));
        let end = ptr.checked_add(new_size).ok_or_else(|| out_of_memory.clone())?;
        if end as usize > bytes.len() {
            return Err(out_of_memory);
        }
        Region::set_header(&mut bytes, NEXT, &end.to_le_bytes());
        if old_ptr != 0 && old_size > 0 {
            let old = read_slice(&bytes, old_ptr, old_size)?.to_vec();
            write_slice(&mut bytes, ptr, &old)?;
        }
        trace!(memory = %self.id, ptr, size = new_size, "connection memory allocation");
        Ok(ptr)
    }
}

/// A buffer shared by the two ends of a connection.
///
/// Cloning yields another handle to the same buffer.
#[derive(Clone)]
pub struct ConnectionMemory {
    region: Arc<Region>,
    view: Memory,
}

impl fmt::Debug for ConnectionMemory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMemory")
            .field("id", &self.region.id)
            .field("next", &self.next())
            .finish()
    }
}

impl ConnectionMemory {
    pub fn new(size: usize) -> Result<Self, Trap> {
        let region = Arc::new(Region {
            id: Uuid::new_v4().to_string(),
            bytes: Mutex::new(vec![0; size.max(ARENA_START as usize)]),
            signal: Condvar::new(),
            error: Mutex::new(None),
        });
        let view = Memory::from_arc(region.clone())?;
        let memory = Self { region, view };
        memory.reset();
        Ok(memory)
    }

    pub fn id(&self) -> &str {
        &self.region.id
    }

    /// The buffer as a [`Memory`], for marshalling values into it.
    pub fn memory(&self) -> &Memory {
        &self.view
    }

    /// Zero the header and rewind the arena.
    pub fn reset(&self) {
        let mut bytes = self.region.bytes.lock();
        if let Some(header) = bytes.get_mut(..ARENA_START as usize) {
            header.fill(0);
        }
        Region::set_header(&mut bytes, NEXT, &ARENA_START.to_le_bytes());
        *self.region.error.lock() = None;
    }

    /// Next free arena offset.
    pub fn next(&self) -> u32 {
        header_u32(&self.region.bytes.lock(), NEXT)
    }

    pub fn sync(&self) -> u32 {
        header_u32(&self.region.bytes.lock(), SYNC)
    }

    /// Store the sync flag and wake any waiter.
    pub fn set_sync(&self, value: u32) {
        Region::set_header(&mut self.region.bytes.lock(), SYNC, &value.to_le_bytes());
        self.region.signal.notify_all();
    }

    /// Write the outcome of a call into the header, raise the sync flag and
    /// wake the waiter.
    pub fn complete(&self, result: Result<Option<FlatValue>, String>) {
        let mut bytes = self.region.bytes.lock();
        let (error_code, tag, raw) = match result {
            Ok(None) => (0, TAG_NONE, 0),
            Ok(Some(FlatValue::I32(v))) => (0, TAG_INTEGER, u64::from(v)),
            Ok(Some(FlatValue::I64(v))) => (0, TAG_INTEGER, v),
            Ok(Some(FlatValue::F32(v))) => (0, TAG_FLOAT, f64::from(v).to_bits()),
            Ok(Some(FlatValue::F64(v))) => (0, TAG_FLOAT, v.to_bits()),
            Err(message) => {
                *self.region.error.lock() = Some(message);
                (1, TAG_NONE, 0)
            }
        };
        Region::set_header(&mut bytes, ERROR_CODE, &u32::to_le_bytes(error_code));
        Region::set_header(&mut bytes, RESULT_TYPE, &tag.to_le_bytes());
        Region::set_header(&mut bytes, RESULT, &raw.to_le_bytes());
        Region::set_header(&mut bytes, SYNC, &1u32.to_le_bytes());
        self.region.signal.notify_all();
    }

    /// Block until the sync flag is raised or `timeout` passes. Returns the
    /// flag, or `None` on timeout.
    pub fn wait_for_sync(&self, timeout: Duration) -> Option<u32> {
        let deadline = Instant::now() + timeout;
        let mut bytes = self.region.bytes.lock();
        loop {
            let sync = header_u32(&bytes, SYNC);
            if sync != 0 {
                return Some(sync);
            }
            if self.region.signal.wait_until(&mut bytes, deadline).timed_out() {
                let sync = header_u32(&bytes, SYNC);
                return (sync != 0).then_some(sync);
            }
        }
    }

    /// Read the result written by [`complete`](Self::complete), converted to
    /// the flat type the caller expects.
    pub fn read_result(&self, expected: Option<FlatType>) -> Result<Option<FlatValue>, ProtocolError> {
        let (error_code, tag, raw) = {
            let bytes = self.region.bytes.lock();
            (
                header_u32(&bytes, ERROR_CODE),
                header_u32(&bytes, RESULT_TYPE),
                header_u64(&bytes, RESULT),
            )
        };
        if error_code != 0 {
            let message = self.region.error.lock().take().unwrap_or_default();
            return Err(ProtocolError::Remote(message));
        }
        let value = match (tag, expected) {
            (TAG_NONE, None) => None,
            (TAG_FLOAT, Some(FlatType::F32)) => Some(FlatValue::F32(f64::from_bits(raw) as f32)),
            (TAG_FLOAT, Some(FlatType::F64)) => Some(FlatValue::F64(f64::from_bits(raw))),
            (TAG_INTEGER, Some(FlatType::I32)) => Some(FlatValue::I32(raw as u32)),
            (TAG_INTEGER, Some(FlatType::I64)) => Some(FlatValue::I64(raw)),
            (tag, expected) => return Err(ProtocolError::ResultMismatch { tag, expected }),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::MemoryView;

    #[test]
    fn test_fresh_memory_layout() {
        let memory = ConnectionMemory::new(256).unwrap();
        assert_eq!(memory.next(), ARENA_START);
        assert_eq!(memory.sync(), 0);
        assert_eq!(memory.memory().byte_length(), 256);
    }

    #[test]
    fn test_alloc_bumps_and_reset_rewinds() {
        let memory = ConnectionMemory::new(256).unwrap();
        let a = memory.memory().alloc(8, 10).unwrap();
        assert_eq!(a.ptr(), 24);
        let b = memory.memory().alloc(4, 4).unwrap();
        assert_eq!(b.ptr(), 36);
        assert_eq!(memory.next(), 40);
        memory.reset();
        assert_eq!(memory.next(), ARENA_START);
    }

    #[test]
    fn test_alloc_past_end_fails() {
        let memory = ConnectionMemory::new(64).unwrap();
        assert!(matches!(memory.memory().alloc(1, 64), Err(Trap::OutOfMemory { .. })));
    }

    #[test]
    fn test_result_slot() {
        let memory = ConnectionMemory::new(64).unwrap();
        memory.complete(Ok(Some(FlatValue::I64((-9i64) as u64))));
        assert_eq!(memory.sync(), 1);
        assert_eq!(
            memory.read_result(Some(FlatType::I64)).unwrap(),
            Some(FlatValue::I64((-9i64) as u64))
        );

        memory.reset();
        memory.complete(Ok(Some(FlatValue::F32(1.5))));
        assert_eq!(memory.read_result(Some(FlatType::F32)).unwrap(), Some(FlatValue::F32(1.5)));
        assert!(memory.read_result(Some(FlatType::I32)).is_err());

        memory.reset();
        memory.complete(Ok(Some(FlatValue::I32((-3i32) as u32))));
        assert_eq!(header_u32(&memory.region.bytes.lock(), RESULT_TYPE), TAG_INTEGER);
        assert_eq!(memory.read_result(Some(FlatType::I32)).unwrap(), Some(FlatValue::I32((-3i32) as u32)));

        memory.reset();
        memory.complete(Err("boom".to_string()));
        assert_eq!(memory.read_result(None).unwrap_err(), ProtocolError::Remote("boom".to_string()));
    }

    #[test]
    fn test_wait_times_out_without_sync() {
        let memory = ConnectionMemory::new(64).unwrap();
        assert_eq!(memory.wait_for_sync(Duration::from_millis(10)), None);
    }

    #[test]
    fn test_wait_wakes_on_complete() {
        let memory = ConnectionMemory::new(64).unwrap();
        let other = memory.clone();
        let handle = std::thread::spawn(move || other.wait_for_sync(Duration::from_secs(5)));
        memory.complete(Ok(None));
        assert_eq!(handle.join().unwrap(), Some(1));
    }

    #[test]
    fn test_set_sync_wakes_waiter() {
        let memory = ConnectionMemory::new(64).unwrap();
        let other = memory.clone();
        let handle = std::thread::spawn(move || other.wait_for_sync(Duration::from_secs(5)));
        memory.set_sync(2);
        assert_eq!(handle.join().unwrap(), Some(2));
    }
}
