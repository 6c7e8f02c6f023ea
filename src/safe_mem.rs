// safe_mem.rs — C1: the single Safe-Read primitive. Every read of host
// memory in this crate funnels through `read_bytes` or one of the typed
// helpers below; nothing else in the crate is allowed to dereference a raw
// pointer into the game's address space (§4.1).
//
// The teacher's `entities::read_u32` et al. gate a direct dereference behind
// `VirtualQuery` (good enough for single-threaded ESP reads against a frozen
// frame). That's too weak here: the creature map mutates under us on another
// thread, so a page can be unmapped between the VirtualQuery probe and the
// dereference. We instead copy through `ReadProcessMemory` against our own
// pseudo-handle (`GetCurrentProcess()`), which performs the copy under the
// kernel's own page-fault handling and reports a torn/partial copy as
// failure rather than raising. `VirtualQuery` survives only as a cheap
// prefilter (module-range checks) the way the teacher uses it in
// `find_gengfuncs_in_client`.

use std::mem::size_of;
use winapi::um::memoryapi::ReadProcessMemory;
use winapi::um::processthreadsapi::GetCurrentProcess;

/// Copies `buf.len()` bytes from `addr` into `buf`. Returns `false` on any
/// failure (unmapped page, partial copy, zero address) without touching
/// `buf`'s existing contents beyond what the OS call wrote.
///
/// Never panics, never allocates. Safe to call from inside an armed
/// FaultContext or from a hook cave's dispatcher.
pub fn read_bytes(addr: u32, buf: &mut [u8]) -> bool {
    if addr == 0 || buf.is_empty() {
        return false;
    }
    let mut bytes_read: usize = 0;
    let ok = unsafe {
        ReadProcessMemory(
            GetCurrentProcess(),
            addr as *const _,
            buf.as_mut_ptr() as *mut _,
            buf.len(),
            &mut bytes_read as *mut usize,
        )
    };
    ok != 0 && bytes_read == buf.len()
}

macro_rules! typed_read {
    ($name:ident, $ty:ty) => {
        pub fn $name(addr: u32) -> Option<$ty> {
            let mut raw = [0u8; size_of::<$ty>()];
            if read_bytes(addr, &mut raw) {
                Some(<$ty>::from_le_bytes(raw))
            } else {
                None
            }
        }
    };
}

typed_read!(read_u32, u32);
typed_read!(read_i32, i32);
typed_read!(read_u16, u16);
typed_read!(read_i16, i16);
typed_read!(read_u8, u8);
typed_read!(read_f32, f32);

/// Reads three consecutive little-endian i32 words starting at `addr`
/// (used by the Position Reader, §4.4b).
pub fn read_i32x3(addr: u32) -> Option<(i32, i32, i32)> {
    let mut raw = [0u8; 12];
    if !read_bytes(addr, &mut raw) {
        return None;
    }
    let x = i32::from_le_bytes(raw[0..4].try_into().unwrap());
    let y = i32::from_le_bytes(raw[4..8].try_into().unwrap());
    let z = i32::from_le_bytes(raw[8..12].try_into().unwrap());
    Some((x, y, z))
}

/// Copies up to `buf.len()` bytes, returning the number actually copied on
/// success. Used by the name reader's bounded heap copy and diagnostic
/// `dump_mem`/`read_mem` commands.
pub fn read_into(addr: u32, buf: &mut [u8]) -> Option<usize> {
    if read_bytes(addr, buf) {
        Some(buf.len())
    } else {
        None
    }
}

/// Cheap `VirtualQuery`-based prefilter: true if `addr` lies in a committed,
/// readable region. Not a substitute for `read_bytes`'s safety — only used
/// to skip obviously-pointless RPM syscalls during bulk scans (locator
/// fallback scan, name-reader probing), mirroring the teacher's
/// `is_readable` use in `find_player_extra_info`.
pub fn is_probably_readable(addr: u32) -> bool {
    use std::mem::MaybeUninit;
    use winapi::um::memoryapi::VirtualQuery;
    use winapi::um::winnt::{
        MEMORY_BASIC_INFORMATION, PAGE_EXECUTE, PAGE_EXECUTE_READ, PAGE_EXECUTE_READWRITE,
        PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS, PAGE_READONLY, PAGE_READWRITE,
        PAGE_WRITECOPY,
    };

    if addr == 0 {
        return false;
    }
    let mut mbi = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
    let written = unsafe {
        VirtualQuery(
            addr as *const _,
            mbi.as_mut_ptr(),
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if written == 0 {
        return false;
    }
    let mbi = unsafe { mbi.assume_init() };
    if mbi.State != winapi::um::winnt::MEM_COMMIT {
        return false;
    }
    if mbi.Protect & PAGE_GUARD != 0 || mbi.Protect & PAGE_NOACCESS != 0 {
        return false;
    }
    matches!(
        mbi.Protect,
        PAGE_READONLY
            | PAGE_READWRITE
            | PAGE_WRITECOPY
            | PAGE_EXECUTE
            | PAGE_EXECUTE_READ
            | PAGE_EXECUTE_READWRITE
            | PAGE_EXECUTE_WRITECOPY
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_address_fails_cleanly() {
        let mut buf = [0u8; 4];
        assert!(!read_bytes(0, &mut buf));
    }

    #[test]
    fn empty_buffer_fails_cleanly() {
        let mut buf: [u8; 0] = [];
        assert!(!read_bytes(1, &mut buf));
    }

    #[test]
    fn reads_own_stack_memory() {
        let value: u32 = 0xCAFEBABE;
        let addr = &value as *const u32 as u32;
        assert_eq!(read_u32(addr), Some(0xCAFEBABE));
    }

    #[test]
    fn reads_own_memory_as_three_words() {
        let values: [i32; 3] = [10, -20, 5];
        let addr = values.as_ptr() as u32;
        assert_eq!(read_i32x3(addr), Some((10, -20, 5)));
    }

    #[test]
    fn is_probably_readable_true_for_stack() {
        let value: u32 = 1;
        let addr = &value as *const u32 as u32;
        assert!(is_probably_readable(addr));
    }

    #[test]
    fn is_probably_readable_false_for_null() {
        assert!(!is_probably_readable(0));
    }
}
