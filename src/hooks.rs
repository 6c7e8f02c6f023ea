// hooks.rs — C6 Hook Engine. Two inline-JMP caves built the way the
// teacher's `entities::write_jmp` + `TRAMPOLINE` buffer are built for
// `hk_initialize`: allocate an executable buffer, compute a `rel32`
// back-edge, patch `E9 <rel32>` plus NOP fill over the displaced prologue.
// Generalized here to variable-length displaced regions and a
// register-preserving dispatch step the teacher's single-shot "capture the
// function table and uninstall" hook never needed.

use crate::error::{CoreError, CoreResult};
use crate::safe_mem::read_bytes;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use winapi::um::memoryapi::{VirtualAlloc, VirtualProtect};
use winapi::um::winnt::{
    MEM_COMMIT, MEM_RESERVE, PAGE_EXECUTE_READWRITE,
};

const CAPTURE_RING_LEN: usize = 4096;

/// One slot in the XTEA hook's capture ring: the caller's and grand-caller's
/// return addresses, converted to module-relative RVAs (§4.5 step 3).
#[derive(Clone, Copy, Default)]
struct CaptureEntry {
    caller_rva: u32,
    grand_caller_rva: u32,
}

struct CaptureRing {
    slots: [std::sync::Mutex<CaptureEntry>; CAPTURE_RING_LEN],
    next: AtomicUsize,
}

impl CaptureRing {
    fn push(&self, entry: CaptureEntry) {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % CAPTURE_RING_LEN;
        if let Ok(mut slot) = self.slots[idx].try_lock() {
            *slot = entry;
        }
        // Overflow/contention both silently drop the entry (§5): the ring
        // is a liveness log, not a queue anyone blocks to drain exactly.
    }

    /// Drains everything currently buffered, for the pipe thread's XTEA
    /// caller log (§6 "Log files").
    fn drain(&self) -> Vec<(u32, u32)> {
        self.slots
            .iter()
            .filter_map(|s| s.try_lock().ok())
            .map(|s| (s.caller_rva, s.grand_caller_rva))
            .filter(|(c, g)| *c != 0 || *g != 0)
            .collect()
    }

    fn reset(&self) {
        for slot in self.slots.iter() {
            if let Ok(mut s) = slot.try_lock() {
                *s = CaptureEntry::default();
            }
        }
        self.next.store(0, Ordering::Relaxed);
    }
}

// `std::sync::Mutex` isn't `Copy`/const-friendly in an array initializer
// without a helper; build the fixed array via a small macro-free const fn.
const fn new_capture_ring() -> CaptureRing {
    #[allow(clippy::declare_interior_mutable_const)]
    const SLOT: std::sync::Mutex<CaptureEntry> = std::sync::Mutex::new(CaptureEntry {
        caller_rva: 0,
        grand_caller_rva: 0,
    });
    CaptureRing {
        slots: [SLOT; CAPTURE_RING_LEN],
        next: AtomicUsize::new(0),
    }
}

static CAPTURE_RING: CaptureRing = new_capture_ring();

pub fn drain_xtea_log() -> Vec<(u32, u32)> {
    CAPTURE_RING.drain()
}

pub fn reset_xtea_ring() {
    CAPTURE_RING.reset();
}

/// Captured by the attack hook (§4.5 "Attack hook"); consumed by the XTEA
/// cave's step 4 quick-send path and by the Targeting Orchestrator (§4.7
/// step 7, the send-attack call's `this` register).
pub static PROTOCOL_OBJECT: AtomicU32 = AtomicU32::new(0);
pub static GAME_OBJECT: AtomicU32 = AtomicU32::new(0);
pub static CAPTURED_CREATURE_ID: AtomicU32 = AtomicU32::new(0);
pub static ATTACK_CALLER_RVA: AtomicU32 = AtomicU32::new(0);

/// The XTEA cave's own single-word "attack request" mailbox (§4.5 step 4) —
/// distinct from C8's `PendingAttack`. This is the secondary keepalive
/// trigger: whatever creature id is parked here gets a quick re-send attempt
/// the next time the encrypt routine fires, independent of whether the UI
/// thread has run the orchestrator yet.
static QUICK_ATTACK_ID: AtomicU32 = AtomicU32::new(0);
static QUICK_ATTACK_DONE: AtomicBool = AtomicBool::new(true);

pub fn request_quick_attack(creature_id: u32) {
    QUICK_ATTACK_ID.store(creature_id, Ordering::Release);
    QUICK_ATTACK_DONE.store(false, Ordering::Release);
}

pub fn quick_attack_done() -> bool {
    QUICK_ATTACK_DONE.load(Ordering::Acquire)
}

static ATTACK_TRAMPOLINE_INSTALLED: AtomicBool = AtomicBool::new(false);
static XTEA_MODULE_BASE: AtomicU32 = AtomicU32::new(0);

/// Register snapshot left on the stack by PUSHAD, in the order the
/// instruction actually pushes them (so the lowest address — where the
/// dispatcher's pointer argument lands — holds `edi`). `esp` here is the
/// value ESP held *before* PUSHAD executed, i.e. the stack pointer at cave
/// entry, which at a fresh function entry still points at the caller's
/// return address (§4.5 step 2: "top of stack").
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct PushadRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushadRegs {
    /// `esp` is the value PUSHAD captured, which is ESP as it stood right
    /// after our cave's leading `pushfd` — i.e. it points at the saved
    /// EFLAGS dword, one word *below* the value ESP held at cave entry.
    /// The caller's return address is the word above that.
    fn caller_return_addr(&self) -> u32 {
        self.esp.wrapping_add(4)
    }
}

fn to_rva(addr: u32) -> u32 {
    let base = XTEA_MODULE_BASE.load(Ordering::Relaxed);
    if base == 0 || addr < base {
        0
    } else {
        addr - base
    }
}

/// Dispatcher invoked by the XTEA cave on every call, any thread (§4.5).
/// Must stay bounded-time and allocation-free: the ring push is a `try_lock`
/// over a fixed array, the mailbox checks are atomics, the trampoline call
/// is a direct indirect call through a raw function pointer.
///
/// # Safety
/// Called only from the generated cave with `regs` pointing at a live
/// PUSHAD frame still on the hooked thread's stack.
pub unsafe extern "system" fn xtea_dispatch(regs: *const PushadRegs) {
    // A panic crossing back into the cave's hand-written asm would unwind
    // into game code built for neither; catch it here the way the teacher's
    // `hook::detour` wraps its own per-frame callback.
    let regs_addr = regs as usize;
    let _ = std::panic::catch_unwind(move || xtea_dispatch_body(regs_addr as *const PushadRegs));
}

fn xtea_dispatch_body(regs: *const PushadRegs) {
    let regs = unsafe { &*regs };

    let caller_ret = crate::safe_mem::read_u32(regs.caller_return_addr()).unwrap_or(0);
    let grand_caller_ret = if regs.ebp != 0 {
        crate::safe_mem::read_u32(regs.ebp.wrapping_add(4)).unwrap_or(0)
    } else {
        0
    };

    CAPTURE_RING.push(CaptureEntry {
        caller_rva: to_rva(caller_ret),
        grand_caller_rva: to_rva(grand_caller_ret),
    });

    crate::targeting::xtea_cave_entry();

    if QUICK_ATTACK_DONE.load(Ordering::Acquire) {
        return;
    }
    if !ATTACK_TRAMPOLINE_INSTALLED.load(Ordering::Acquire) {
        return;
    }
    let protocol = PROTOCOL_OBJECT.load(Ordering::Acquire);
    if protocol == 0 {
        return;
    }
    let creature_id = QUICK_ATTACK_ID.swap(0, Ordering::AcqRel);
    QUICK_ATTACK_DONE.store(true, Ordering::Release);
    if creature_id == 0 {
        return;
    }

    let send_attack_fn = crate::offsets::OFFSETS.send_attack_fn.load(Ordering::Relaxed);
    if send_attack_fn == 0 {
        return;
    }
    type SendAttackFn = unsafe extern "thiscall" fn(this: u32, creature_id: u32, sequence: u32) -> u32;
    let trampoline: SendAttackFn = std::mem::transmute(send_attack_fn as usize);
    let _ = trampoline(protocol, creature_id, 0);
}

// --- Cave construction -----------------------------------------------------

/// Table-driven instruction-length lookahead over the handful of MSVC
/// prologue encodings this function actually needs to step across: `push
/// reg`, `mov ebp,esp`, `sub esp,imm8/imm32`, `push imm8/imm32`, `nop`.
/// Returns `None` on an opcode outside that table — the caller then refuses
/// to hook rather than guess.
fn instruction_length(bytes: &[u8]) -> Option<usize> {
    let op = *bytes.first()?;
    match op {
        0x50..=0x57 => Some(1), // push reg
        0x90 => Some(1),        // nop
        0x8B if bytes.get(1) == Some(&0xEC) => Some(2), // mov ebp, esp
        0x83 if bytes.get(1) == Some(&0xEC) => Some(3), // sub esp, imm8
        0x81 if bytes.get(1) == Some(&0xEC) => Some(6), // sub esp, imm32
        0x6A => Some(2),         // push imm8
        0x68 => Some(5),         // push imm32
        _ => None,
    }
}

/// §4.5: "exactly the minimum number of consecutive whole instructions ≥ 5
/// bytes". Returns `None` if the prologue runs out of recognized
/// instructions before reaching 5 bytes.
fn displaced_length(prologue: &[u8]) -> Option<usize> {
    let mut total = 0usize;
    while total < 5 {
        let remaining = &prologue[total..];
        let len = instruction_length(remaining)?;
        total += len;
        if total > prologue.len() {
            return None;
        }
    }
    Some(total)
}

fn alloc_exec(len: usize) -> CoreResult<*mut u8> {
    let ptr = unsafe {
        VirtualAlloc(
            std::ptr::null_mut(),
            len,
            MEM_COMMIT | MEM_RESERVE,
            PAGE_EXECUTE_READWRITE,
        )
    };
    if ptr.is_null() {
        Err(CoreError::AllocExecFailed)
    } else {
        Ok(ptr as *mut u8)
    }
}

/// Writes `E9 <rel32>` at `site`, NOP-filling the remainder of
/// `displaced_len`, under a temporary `PAGE_EXECUTE_READWRITE` protection
/// flip — same sequence as the teacher's `write_jmp`.
unsafe fn patch_jmp(site: u32, target: u32, displaced_len: usize) -> CoreResult<()> {
    if displaced_len < 5 {
        return Err(CoreError::PatchFailed);
    }
    let mut old_protect = 0u32;
    let ok = VirtualProtect(
        site as *mut _,
        displaced_len,
        PAGE_EXECUTE_READWRITE,
        &mut old_protect,
    );
    if ok == 0 {
        return Err(CoreError::PatchFailed);
    }

    let rel32 = (target as i64 - (site as i64 + 5)) as i32;
    let site_ptr = site as *mut u8;
    site_ptr.write(0xE9);
    site_ptr.add(1).cast::<i32>().write_unaligned(rel32);
    for i in 5..displaced_len {
        site_ptr.add(i).write(0x90);
    }

    let mut restored = 0u32;
    VirtualProtect(site as *mut _, displaced_len, old_protect, &mut restored);
    Ok(())
}

/// Appends the displaced original bytes and a `jmp resume_at` to `buf`. The
/// `rel32` cannot be computed yet — `buf` hasn't been copied to its final
/// executable address — so this leaves a zeroed placeholder and returns the
/// tail's offset within `buf` for `fixup_trampoline_tail` to patch once the
/// cave has a real address.
fn emit_trampoline_tail(buf: &mut Vec<u8>, displaced: &[u8]) -> usize {
    buf.extend_from_slice(displaced);
    let jmp_site = buf.len();
    buf.push(0xE9);
    buf.extend_from_slice(&0u32.to_le_bytes());
    jmp_site
}

/// Patches the `rel32` of a trampoline tail written by `emit_trampoline_tail`
/// now that the cave lives at `cave_mem`.
unsafe fn fixup_trampoline_tail(cave_mem: *mut u8, jmp_site: usize, resume_at: u32) {
    let jmp_instr_addr = cave_mem.add(jmp_site) as i64;
    let rel32 = (resume_at as i64 - (jmp_instr_addr + 5)) as i32;
    cave_mem
        .add(jmp_site + 1)
        .cast::<i32>()
        .write_unaligned(rel32);
}

fn read_prologue(site: u32) -> CoreResult<[u8; 16]> {
    let mut buf = [0u8; 16];
    if read_bytes(site, &mut buf) {
        Ok(buf)
    } else {
        Err(CoreError::UnreadablePrologue)
    }
}

/// Builds and installs the XTEA-encrypt cave (§4.5). On success the function
/// at `xtea_fn` jumps into freshly allocated executable memory that:
/// PUSHFD, PUSHAD, `call xtea_dispatch` with ESP as the argument, POPAD,
/// POPFD, replays the displaced prologue, and jumps back.
pub fn install_xtea_hook(xtea_fn: u32, module_base: u32) -> CoreResult<()> {
    XTEA_MODULE_BASE.store(module_base, Ordering::Relaxed);

    let prologue = read_prologue(xtea_fn)?;
    let displaced_len = displaced_length(&prologue).ok_or(CoreError::PatchFailed)?;
    let displaced = prologue[..displaced_len].to_vec();

    let mut cave = Vec::with_capacity(64);
    cave.push(0x9C); // pushfd
    cave.push(0x60); // pushad
    cave.push(0x54); // push esp  (arg: pointer to PushadRegs)
    cave.push(0xB8); // mov eax, imm32 (dispatcher address)
    cave.extend_from_slice(&(xtea_dispatch as usize as u32).to_le_bytes());
    cave.push(0xFF);
    cave.push(0xD0); // call eax
    cave.push(0x83);
    cave.push(0xC4);
    cave.push(0x04); // add esp, 4 (drop our pushed arg)
    cave.push(0x61); // popad
    cave.push(0x9D); // popfd

    let resume_at = xtea_fn + displaced_len as u32;
    let jmp_site = emit_trampoline_tail(&mut cave, &displaced);
    let cave_mem = alloc_exec(cave.len())?;

    unsafe {
        std::ptr::copy_nonoverlapping(cave.as_ptr(), cave_mem, cave.len());
        fixup_trampoline_tail(cave_mem, jmp_site, resume_at);
        patch_jmp(xtea_fn, cave_mem as u32, displaced_len)?;
    }

    Ok(())
}

/// Builds and installs the attack-function capture hook (§4.5 "Attack
/// hook"). Unlike the XTEA cave this one never dispatches or replays
/// application logic of its own beyond recording identities — it exists
/// purely to learn `PROTOCOL_OBJECT`/`GAME_OBJECT`/the creature id argument
/// from a live call site.
pub fn install_attack_hook(send_attack_fn: u32) -> CoreResult<()> {
    let prologue = read_prologue(send_attack_fn)?;
    let displaced_len = displaced_length(&prologue).ok_or(CoreError::PatchFailed)?;
    let displaced = prologue[..displaced_len].to_vec();

    let mut cave = Vec::with_capacity(48);
    cave.push(0x9C); // pushfd
    cave.push(0x60); // pushad
    cave.push(0x54); // push esp
    cave.push(0xB8);
    cave.extend_from_slice(&(attack_capture_dispatch as usize as u32).to_le_bytes());
    cave.push(0xFF);
    cave.push(0xD0);
    cave.push(0x83);
    cave.push(0xC4);
    cave.push(0x04);
    cave.push(0x61);
    cave.push(0x9D);

    let resume_at = send_attack_fn + displaced_len as u32;
    let jmp_site = emit_trampoline_tail(&mut cave, &displaced);
    let cave_mem = alloc_exec(cave.len())?;

    unsafe {
        std::ptr::copy_nonoverlapping(cave.as_ptr(), cave_mem, cave.len());
        fixup_trampoline_tail(cave_mem, jmp_site, resume_at);
        patch_jmp(send_attack_fn, cave_mem as u32, displaced_len)?;
    }

    ATTACK_TRAMPOLINE_INSTALLED.store(true, Ordering::Release);
    Ok(())
}

/// # Safety
/// Same contract as `xtea_dispatch`.
pub unsafe extern "system" fn attack_capture_dispatch(regs: *const PushadRegs) {
    let regs_addr = regs as usize;
    let _ = std::panic::catch_unwind(move || attack_capture_dispatch_body(regs_addr as *const PushadRegs));
}

fn attack_capture_dispatch_body(regs: *const PushadRegs) {
    let regs = unsafe { &*regs };
    PROTOCOL_OBJECT.store(regs.ecx, Ordering::Release);
    GAME_OBJECT.store(regs.eax, Ordering::Release);
    CAPTURED_CREATURE_ID.store(regs.edx, Ordering::Release);
    let caller_ret = crate::safe_mem::read_u32(regs.caller_return_addr()).unwrap_or(0);
    ATTACK_CALLER_RVA.store(to_rva(caller_ret), Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displaced_length_five_from_push_ebp_mov_push_push() {
        let prologue = [0x55, 0x8B, 0xEC, 0x56, 0x57, 0x90, 0x90, 0x90];
        assert_eq!(displaced_length(&prologue), Some(5));
    }

    #[test]
    fn displaced_length_six_from_push_mov_sub_imm8() {
        let prologue = [0x55, 0x8B, 0xEC, 0x83, 0xEC, 0x40, 0x90, 0x90];
        assert_eq!(displaced_length(&prologue), Some(6));
    }

    #[test]
    fn displaced_length_nine_from_sub_imm32() {
        let prologue = [0x55, 0x8B, 0xEC, 0x81, 0xEC, 0x00, 0x01, 0x00, 0x00, 0x90];
        assert_eq!(displaced_length(&prologue), Some(9));
    }

    #[test]
    fn displaced_length_none_on_unknown_opcode() {
        let prologue = [0xCC, 0xCC, 0xCC, 0xCC, 0xCC];
        assert_eq!(displaced_length(&prologue), None);
    }

    #[test]
    fn capture_ring_drain_after_push() {
        CAPTURE_RING.reset();
        CAPTURE_RING.push(CaptureEntry {
            caller_rva: 0x1000,
            grand_caller_rva: 0x2000,
        });
        let drained = CAPTURE_RING.drain();
        assert!(drained.contains(&(0x1000, 0x2000)));
    }

    #[test]
    fn quick_attack_roundtrip() {
        request_quick_attack(0x4000_0001);
        assert!(!quick_attack_done());
        let id = QUICK_ATTACK_ID.swap(0, Ordering::AcqRel);
        QUICK_ATTACK_DONE.store(true, Ordering::Release);
        assert_eq!(id, 0x4000_0001);
        assert!(quick_attack_done());
    }
}
