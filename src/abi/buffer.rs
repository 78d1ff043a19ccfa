//! Alignment arithmetic and bounds-checked byte buffer helpers.

use super::Trap;

/// Align a value up to the nearest multiple of alignment.
///
/// `align` must be a power of two. Saturates instead of wrapping so that an
/// oversized offset fails the following bounds check.
#[inline]
pub fn align_to(val: u32, align: u32) -> u32 {
    val.saturating_add(align - 1) & !(align - 1)
}

/// The natural alignment of a pointer: the largest of 8, 4, 2 and 1 that
/// divides it.
#[inline]
pub fn natural_alignment(ptr: u32) -> u32 {
    match ptr {
        p if p % 8 == 0 => 8,
        p if p % 4 == 0 => 4,
        p if p % 2 == 0 => 2,
        _ => 1,
    }
}

/// Fails on big-endian hosts. Multi-byte scalars are always read and written
/// little-endian, and there is no byte swapping fallback.
#[inline]
pub fn ensure_little_endian() -> Result<(), Trap> {
    if cfg!(target_endian = "big") {
        return Err(Trap::BigEndian);
    }
    Ok(())
}

/// Safe buffer slice read helper.
#[inline]
pub fn read_slice(buffer: &[u8], ptr: u32, len: u32) -> Result<&[u8], Trap> {
    let start = ptr as usize;
    let end = start.saturating_add(len as usize);
    buffer.get(start..end).ok_or(Trap::InvalidMemoryPointer {
        ptr,
        len,
        memory_size: buffer.len(),
    })
}

/// Safe buffer slice write helper.
#[inline]
pub fn write_slice(buffer: &mut [u8], ptr: u32, data: &[u8]) -> Result<(), Trap> {
    let start = ptr as usize;
    let end = start.saturating_add(data.len());
    let memory_size = buffer.len();
    buffer
        .get_mut(start..end)
        .ok_or(Trap::InvalidMemoryPointer {
            ptr,
            len: data.len() as u32,
            memory_size,
        })?
        .copy_from_slice(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 4), 0);
        assert_eq!(align_to(1, 4), 4);
        assert_eq!(align_to(5, 2), 6);
        assert_eq!(align_to(9, 8), 16);
        assert_eq!(align_to(7, 1), 7);
    }

    #[test]
    fn test_natural_alignment() {
        assert_eq!(natural_alignment(0), 8);
        assert_eq!(natural_alignment(24), 8);
        assert_eq!(natural_alignment(12), 4);
        assert_eq!(natural_alignment(6), 2);
        assert_eq!(natural_alignment(7), 1);
    }

    #[test]
    fn test_slice_bounds() {
        let mut buf = vec![0u8; 4];
        assert!(write_slice(&mut buf, 2, &[1, 2]).is_ok());
        assert!(write_slice(&mut buf, 3, &[1, 2]).is_err());
        assert_eq!(read_slice(&buf, 2, 2).ok(), Some(&[1u8, 2][..]));
        assert!(read_slice(&buf, u32::MAX, 2).is_err());
    }
}
