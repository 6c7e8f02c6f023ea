// targeting.rs — C8 Targeting Orchestrator. Three entry points (§4.7): the
// pipe thread's `request_game_attack`, the UI thread's `run_ui_entry`
// (driven by the Courier), and the XTEA cave's `xtea_cave_entry` liveness
// fallback. All three share the same `PendingAttack` mailbox and
// last-attacked bookkeeping.

use crate::creature_map;
use crate::fault::{self, UI_FAULT};
use crate::hooks;
use crate::locator;
use crate::offsets::OFFSETS;
use crate::stability::{self, STABILITY};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

struct PendingAttack {
    creature_id: AtomicU32,
    cached_ptr: AtomicU32,
    pending: AtomicBool,
}

impl PendingAttack {
    const fn new() -> Self {
        Self {
            creature_id: AtomicU32::new(0),
            cached_ptr: AtomicU32::new(0),
            pending: AtomicBool::new(false),
        }
    }

    /// Requester side: two back-to-back requests coalesce — the second
    /// simply overwrites the first (§5).
    fn post(&self, creature_id: u32, cached_ptr: u32) {
        self.creature_id.store(creature_id, Ordering::Relaxed);
        self.cached_ptr.store(cached_ptr, Ordering::Relaxed);
        self.pending.store(true, Ordering::Release);
    }

    /// Consumer side: atomic exchange, so the orchestrator sees at most one
    /// outstanding request and never double-consumes (§5, §8 property 6).
    fn take(&self) -> Option<(u32, u32)> {
        if self.pending.swap(false, Ordering::AcqRel) {
            Some((
                self.creature_id.load(Ordering::Relaxed),
                self.cached_ptr.load(Ordering::Relaxed),
            ))
        } else {
            None
        }
    }
}

static MAILBOX: PendingAttack = PendingAttack::new();
static LAST_ATTACKED: AtomicU32 = AtomicU32::new(0);

fn game_has_attacking_target() -> bool {
    let singleton = OFFSETS.singleton_base.load(Ordering::Relaxed);
    let off = OFFSETS.singleton_attacking_creature_off.load(Ordering::Relaxed);
    crate::safe_mem::read_u32(singleton + off).unwrap_or(0) != 0
}

/// Looks up a creature pointer for `id`: map binary search first, scan-cache
/// second, full heap scan as a last resort (§4.7 pipe-thread entry).
fn lookup_creature(id: u32) -> Option<u32> {
    let map = creature_map::map_addr();
    if map != 0 {
        if let Some(ptr) = creature_map::find_by_id(map, id) {
            return Some(ptr);
        }
    }
    if let Some(ptr) = creature_map::scan_cache_lookup(id, &OFFSETS) {
        return Some(ptr);
    }
    let (base, end) = locator::module_range(locator::HOST_MODULE_NAME)?;
    creature_map::full_heap_scan(id, base, end, &OFFSETS)
}

fn validate_creature(ptr: u32, expected_id: u32) -> bool {
    use std::sync::atomic::Ordering as O;
    let vtable_off = OFFSETS.creature_vtable_off.load(O::Relaxed);
    let id_off = OFFSETS.creature_id_off.load(O::Relaxed);
    let health_off = OFFSETS.creature_health_off.load(O::Relaxed);
    let vtable_min = OFFSETS.vtable_min_rva.load(O::Relaxed);
    let vtable_max = OFFSETS.vtable_max_rva.load(O::Relaxed);

    let vtable = match crate::safe_mem::read_u32(ptr + vtable_off) {
        Some(v) => v,
        None => return false,
    };
    if vtable < vtable_min || vtable > vtable_max {
        return false;
    }
    let id = match crate::safe_mem::read_u32(ptr + id_off) {
        Some(v) => v,
        None => return false,
    };
    if id != expected_id {
        return false;
    }
    let hp = match crate::safe_mem::read_u8(ptr + health_off) {
        Some(v) => v,
        None => return false,
    };
    hp > 0 && hp <= 100
}

/// Pipe-thread entry. Posts a mailbox request and wakes the UI thread via
/// the Courier; returns `false` if nothing was posted (no-op due to
/// idempotence or an unresolvable target).
pub fn request_game_attack(creature_id: u32) -> bool {
    if LAST_ATTACKED.load(Ordering::Relaxed) == creature_id && game_has_attacking_target() {
        return false;
    }

    let ptr = match lookup_creature(creature_id) {
        Some(p) => p,
        None => return false,
    };
    if !validate_creature(ptr, creature_id) {
        return false;
    }

    MAILBOX.post(creature_id, ptr);
    crate::courier::post_run_orchestrator();
    true
}

/// UI-thread entry (§4.7 steps 1-8), invoked by the Courier's subclass
/// procedure on the private message.
pub fn run_ui_entry() {
    fault::guard(&UI_FAULT, ui_entry_body);
}

fn ui_entry_body() {
    let Some((creature_id, cached_ptr)) = MAILBOX.take() else {
        return;
    };

    let now = stability::now_ms();
    if STABILITY.is_unstable(now) {
        LAST_ATTACKED.store(0, Ordering::Relaxed);
        return;
    }

    let map = creature_map::map_addr();
    let ptr = creature_map::find_by_id(map, creature_id).unwrap_or(cached_ptr);
    if ptr == 0 || !validate_creature(ptr, creature_id) {
        return;
    }

    if LAST_ATTACKED.load(Ordering::Relaxed) == creature_id && game_has_attacking_target() {
        return;
    }

    invoke_attack(creature_id, ptr);
    LAST_ATTACKED.store(creature_id, Ordering::Relaxed);
}

fn invoke_attack(creature_id: u32, creature_ptr: u32) {
    let singleton = OFFSETS.singleton_base.load(Ordering::Relaxed);
    let attack_fn = OFFSETS.attack_fn.load(Ordering::Relaxed);
    let send_attack_fn = OFFSETS.send_attack_fn.load(Ordering::Relaxed);
    let seq_off = OFFSETS.singleton_sequence_off.load(Ordering::Relaxed);

    if attack_fn != 0 && singleton != 0 {
        type AttackFn = unsafe extern "thiscall" fn(this: u32, creature_ptr: *const u32) -> u32;
        let local_ptr = creature_ptr;
        unsafe {
            let f: AttackFn = std::mem::transmute(attack_fn as usize);
            f(singleton, &local_ptr as *const u32);
        }
    }

    let protocol = hooks::PROTOCOL_OBJECT.load(Ordering::Acquire);
    if send_attack_fn != 0 && protocol != 0 {
        let sequence_addr = singleton + seq_off;
        let sequence = bump_sequence(sequence_addr);

        type SendAttackFn = unsafe extern "thiscall" fn(this: u32, id: u32, seq: u32) -> u32;
        unsafe {
            let f: SendAttackFn = std::mem::transmute(send_attack_fn as usize);
            f(protocol, creature_id, sequence);
        }
    }
}

/// §5: "read-modify-write via atomic increment" on the game singleton's
/// sequence word. This is an in-process agent, so the word is ordinary
/// addressable memory — a real `lock xadd` via `AtomicU32` is both correct
/// and simpler than a read/write pair. Returns the pre-increment value,
/// the sequence number the send-attack call itself expects.
fn bump_sequence(addr: u32) -> u32 {
    let cell = unsafe { &*(addr as *const std::sync::atomic::AtomicU32) };
    cell.fetch_add(1, Ordering::SeqCst)
}

/// XTEA cave liveness fallback (§4.5 step 5, §2 data flow). Runs on
/// whatever thread the game's encrypt routine fires on; must stay
/// bounded-time, so this only re-attempts the UI-thread sequence when the
/// calling thread happens to already be the recorded UI thread, otherwise
/// it's a no-op (the private-message path from the Courier remains the
/// primary trigger, per §4.6).
pub fn xtea_cave_entry() {
    if crate::courier::ui_thread_id() == unsafe { winapi::um::processthreadsapi::GetCurrentThreadId() } {
        run_ui_entry();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_post_then_take_roundtrips() {
        let mb = PendingAttack::new();
        mb.post(0x4000_0001, 0x0050_0000);
        let (id, ptr) = mb.take().unwrap();
        assert_eq!(id, 0x4000_0001);
        assert_eq!(ptr, 0x0050_0000);
        assert!(mb.take().is_none());
    }

    #[test]
    fn bump_sequence_increments_and_returns_prior_value() {
        let word: u32 = 41;
        let addr = &word as *const u32 as u32;
        let old = bump_sequence(addr);
        assert_eq!(old, 41);
        assert_eq!(word, 42);
    }

    #[test]
    fn second_post_coalesces_before_consumption() {
        let mb = PendingAttack::new();
        mb.post(1, 100);
        mb.post(2, 200);
        let (id, ptr) = mb.take().unwrap();
        assert_eq!(id, 2);
        assert_eq!(ptr, 200);
    }
}
