// creature_map.rs — C4 Creature-Map Walker, C4a Name Reader, C4b Position
// Reader.
//
// Grounded in the teacher's `entities::find_player_extra_info` for the
// general shape of "walk a host structure defensively, bail on anything
// that doesn't validate" — the teacher has no tree walker (goldsrc keeps
// entities in a flat array), so the red-black-tree traversal itself is new,
// built directly against the MSVC `std::map` layout spec.md treats as a
// fixed binary contract (§3).

use crate::geometry::WorldPos;
use crate::offsets::OffsetRegistry;
use crate::safe_mem::{read_bytes, read_i32x3, read_u32, read_u8};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// The Map Locator's one-shot discovery result (§4.4c step 4). Written once,
/// read freely; survives pipe reconnections for the life of the host
/// process (§5 "Shared resource policy").
pub static MAP_ADDR: AtomicU32 = AtomicU32::new(0);

pub fn map_addr() -> u32 {
    MAP_ADDR.load(Ordering::Acquire)
}

pub fn set_map_addr(addr: u32) {
    MAP_ADDR.store(addr, Ordering::Release);
}

const NODE_LEFT: u32 = 0;
const NODE_PARENT: u32 = 4;
const NODE_RIGHT: u32 = 8;
const NODE_ISNIL: u32 = 13;
const NODE_KEY: u32 = 16;
const NODE_VALUE: u32 = 20;

const CREATURE_ID_MIN: u32 = 0x1000_0000;
const CREATURE_ID_MAX: u32 = 0x8000_0000;

const MAX_ROWS: usize = 200;
const MAX_COUNT: u32 = 500;
const MAX_ITERATIONS: u32 = 500;

const USER_ADDR_MIN: u32 = 0x1_0000;
const USER_ADDR_MAX: u32 = 0x8000_0000;

fn in_user_range(addr: u32) -> bool {
    addr >= USER_ADDR_MIN && addr < USER_ADDR_MAX
}

pub fn is_valid_creature_id(id: u32) -> bool {
    id >= CREATURE_ID_MIN && id < CREATURE_ID_MAX
}

#[derive(Clone, Debug, PartialEq)]
pub struct CreatureSnapshot {
    pub id: u32,
    pub name: String,
    pub hp: u8,
    pub pos: WorldPos,
    /// Host address of the creature's identifier field; a cheap stability
    /// token for the fast re-read path (§3).
    pub id_addr: u32,
}

struct Header {
    sentinel: u32,
    count: u32,
}

fn read_header(map_addr: u32) -> Option<Header> {
    let sentinel = read_u32(map_addr)?;
    let count = read_u32(map_addr + 4)?;
    if count == 0 || count > MAX_COUNT {
        return None;
    }
    if sentinel == 0 || !in_user_range(sentinel) {
        return None;
    }
    let is_nil = read_u8(sentinel + NODE_ISNIL)?;
    if is_nil != 1 {
        return None;
    }
    let left = read_u32(sentinel + NODE_LEFT)?;
    let parent = read_u32(sentinel + NODE_PARENT)?;
    let right = read_u32(sentinel + NODE_RIGHT)?;
    if ![left, parent, right].into_iter().all(in_user_range) {
        return None;
    }
    Some(Header { sentinel, count })
}

fn leftmost_from(mut node: u32, sentinel: u32) -> Option<u32> {
    let mut guard = 0u32;
    loop {
        guard += 1;
        if guard > MAX_ITERATIONS {
            return None;
        }
        let left = read_u32(node + NODE_LEFT)?;
        if left == 0 || left == sentinel {
            return Some(node);
        }
        node = left;
    }
}

fn successor(node: u32, sentinel: u32) -> Option<u32> {
    let right = read_u32(node + NODE_RIGHT)?;
    if right != 0 && right != sentinel {
        return leftmost_from(right, sentinel);
    }
    let mut current = node;
    let mut guard = 0u32;
    loop {
        guard += 1;
        if guard > MAX_ITERATIONS {
            return None;
        }
        let parent = read_u32(current + NODE_PARENT)?;
        if parent == 0 || parent == sentinel {
            return None;
        }
        let parent_right = read_u32(parent + NODE_RIGHT)?;
        if parent_right != current {
            return Some(parent);
        }
        current = parent;
    }
}

/// §4.4: walks the in-order sequence of the tree rooted under `map_addr`'s
/// header, producing up to `MAX_ROWS` validated snapshots. Intended to run
/// inside an armed `SCANNER_FAULT` region (`fault::guard`); a fault during
/// any read here aborts the walk by propagating `None` up through the
/// caller's guarded closure, not by panicking.
pub fn walk(map_addr: u32, player_id: Option<u32>, offsets: &OffsetRegistry) -> Option<Vec<CreatureSnapshot>> {
    let header = read_header(map_addr)?;
    let mut rows = Vec::with_capacity(header.count.min(MAX_ROWS as u32) as usize);

    let mut node = match leftmost_from(header.sentinel, header.sentinel) {
        Some(n) => n,
        None => return Some(rows),
    };

    let mut iterations: u32 = 0;
    while node != header.sentinel {
        iterations += 1;
        if iterations > MAX_ITERATIONS || rows.len() >= MAX_ROWS {
            break;
        }

        let is_nil = read_u8(node + NODE_ISNIL)?;
        if is_nil == 1 {
            break;
        }

        if let Some(row) = read_row(node, player_id, offsets) {
            rows.push(row);
        }

        node = match successor(node, header.sentinel) {
            Some(n) => n,
            None => break,
        };
    }

    Some(rows)
}

fn read_row(node: u32, player_id: Option<u32>, offsets: &OffsetRegistry) -> Option<CreatureSnapshot> {
    let key = read_u32(node + NODE_KEY)?;
    let creature_ptr = read_u32(node + NODE_VALUE)?;
    if !is_valid_creature_id(key) || creature_ptr == 0 {
        return None;
    }

    let vtable_off = offsets.creature_vtable_off.load(Ordering::Relaxed);
    let id_off = offsets.creature_id_off.load(Ordering::Relaxed);
    let name_off = offsets.creature_name_off.load(Ordering::Relaxed);
    let health_off = offsets.creature_health_off.load(Ordering::Relaxed);
    let vtable_min = offsets.vtable_min_rva.load(Ordering::Relaxed);
    let vtable_max = offsets.vtable_max_rva.load(Ordering::Relaxed);

    let vtable = read_u32(creature_ptr + vtable_off)?;
    if vtable < vtable_min || vtable > vtable_max {
        return None;
    }

    let id_addr = creature_ptr + id_off;
    let obj_id = read_u32(id_addr)?;
    if obj_id != key {
        return None;
    }

    let hp = read_u8(creature_ptr + health_off)?;
    if hp == 0 || hp > 100 {
        return None;
    }

    let name = read_name(creature_ptr + name_off)?;

    let player_off = offsets.creature_pos_off_player.load(Ordering::Relaxed);
    let npc_off = offsets.creature_pos_off_npc.load(Ordering::Relaxed);
    let pos = read_position(id_addr, obj_id, player_id, player_off, npc_off)?;

    Some(CreatureSnapshot {
        id: key,
        name,
        hp,
        pos,
        id_addr,
    })
}

// --- §4.4a Name Reader ----------------------------------------------------

const SSO_CAPACITY_INLINE: u32 = 16;
const MAX_NAME_LEN: usize = 30;
const MAX_CAPACITY: u32 = 256;

/// Reads an MSVC short-string-optimized `std::string` at `addr`: 16 bytes
/// inline data / 4-byte size / 4-byte capacity (size and capacity sit right
/// after the 16-byte inline buffer).
fn read_name(addr: u32) -> Option<String> {
    let size = read_u32(addr + 16)?;
    let capacity = read_u32(addr + 20)?;

    if size == 0 || size as usize > MAX_NAME_LEN || capacity < size || capacity >= MAX_CAPACITY {
        return None;
    }

    let mut buf = [0u8; MAX_NAME_LEN];
    let slice = &mut buf[..size as usize];

    if capacity < SSO_CAPACITY_INLINE {
        if !read_bytes(addr, slice) {
            return None;
        }
    } else {
        let heap_ptr = read_u32(addr)?;
        if !read_bytes(heap_ptr, slice) {
            return None;
        }
    }

    let name = std::str::from_utf8(slice).ok()?.to_string();
    if validate_name_grammar(&name) {
        Some(name)
    } else {
        None
    }
}

/// §4.4a grammar: length 3..30; first char uppercase ASCII; every character
/// in `[A-Za-z0-9 '.\-]`; at least one lowercase letter; no internal
/// lowercase-to-uppercase transition (filters interned symbol text and
/// pointer-like byte sequences that happen to pass the numeric checks).
pub fn validate_name_grammar(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.len() < 3 || bytes.len() > MAX_NAME_LEN {
        return false;
    }
    if !bytes[0].is_ascii_uppercase() {
        return false;
    }

    let mut has_lower = false;
    let mut prev_was_lower = false;
    for &b in bytes {
        let allowed = b.is_ascii_alphanumeric() || matches!(b, b' ' | b'\'' | b'.' | b'-');
        if !allowed {
            return false;
        }
        if b.is_ascii_lowercase() {
            has_lower = true;
            prev_was_lower = true;
        } else if b.is_ascii_uppercase() {
            if prev_was_lower {
                return false;
            }
            prev_was_lower = false;
        } else {
            prev_was_lower = false;
        }
    }
    has_lower
}

// --- §4.4b Position Reader ------------------------------------------------

fn read_position(
    id_addr: u32,
    obj_id: u32,
    player_id: Option<u32>,
    player_off: i32,
    npc_off: i32,
) -> Option<WorldPos> {
    let is_player = player_id == Some(obj_id);
    let off = if is_player { player_off } else { npc_off };
    let base = id_addr.wrapping_add(off as u32);
    let (x, y, z) = read_i32x3(base)?;
    let pos = WorldPos { x, y, z };
    if pos.in_bounds() {
        Some(pos)
    } else {
        None
    }
}

/// §4.4c step 2: "validate as header" — element count in [1,500], sentinel
/// structurally valid, and the first three in-order nodes each have keys in
/// the creature-id window. Used by the Map Locator to score candidate
/// addresses; deliberately independent of `walk` since the locator runs
/// before any offsets beyond the node layout itself are trusted.
pub fn validate_candidate(addr: u32) -> bool {
    let header = match read_header(addr) {
        Some(h) => h,
        None => return false,
    };
    let first = match leftmost_from(header.sentinel, header.sentinel) {
        Some(n) => n,
        None => return false,
    };

    let mut node = first;
    for i in 0..3 {
        if node == header.sentinel {
            return false;
        }
        let is_nil = match read_u8(node + NODE_ISNIL) {
            Some(v) => v,
            None => return false,
        };
        if is_nil == 1 {
            return false;
        }
        let key = match read_u32(node + NODE_KEY) {
            Some(v) => v,
            None => return false,
        };
        if !is_valid_creature_id(key) {
            return false;
        }
        if i < 2 {
            node = match successor(node, header.sentinel) {
                Some(n) => n,
                None => return false,
            };
        }
    }
    true
}

/// §4.7 step 3: binary search the live map for `id`, used by the orchestrator
/// to re-validate a requested target on the UI thread without a full walk.
pub fn find_by_id(map_addr: u32, id: u32) -> Option<u32> {
    let header = read_header(map_addr)?;
    let mut node = read_u32(header.sentinel + NODE_PARENT)?; // root
    let mut iterations = 0u32;
    while node != 0 && node != header.sentinel {
        iterations += 1;
        if iterations > MAX_ITERATIONS {
            return None;
        }
        let is_nil = read_u8(node + NODE_ISNIL)?;
        if is_nil == 1 {
            return None;
        }
        let key = read_u32(node + NODE_KEY)?;
        if key == id {
            return read_u32(node + NODE_VALUE);
        }
        let next = if id < key { NODE_LEFT } else { NODE_RIGHT };
        node = read_u32(node + next)?;
    }
    None
}

// --- Scan cache & fallback lookup (§4.7 pipe-thread entry) -----------------

const SCAN_CACHE_CAP: usize = 256;

static SCAN_CACHE: Mutex<Vec<(u32, u32)>> = Mutex::new(Vec::new());

/// Refreshed after every successful `walk` (pipe thread). Stores
/// `(id, id_addr)` pairs; the creature pointer is recovered on lookup via
/// `id_addr - id_off`, since `id_addr == creature_ptr + id_off`.
pub fn update_scan_cache(rows: &[CreatureSnapshot]) {
    let mut cache = SCAN_CACHE.lock().unwrap();
    cache.clear();
    cache.extend(rows.iter().take(SCAN_CACHE_CAP).map(|r| (r.id, r.id_addr)));
}

pub fn scan_cache_lookup(id: u32, offsets: &OffsetRegistry) -> Option<u32> {
    let id_off = offsets.creature_id_off.load(Ordering::Relaxed);
    let cache = SCAN_CACHE.lock().unwrap();
    cache
        .iter()
        .find(|(cached_id, _)| *cached_id == id)
        .map(|(_, id_addr)| id_addr.wrapping_sub(id_off))
}

/// Last-resort lookup (§4.7 "full heap scan"): word-aligned sweep of the
/// host module's image for a creature object whose vtable and identifier
/// both validate against `id`. Bounded by `MAX_ITERATIONS` like every other
/// walk in this module, so a corrupted or adversarial image can't hang the
/// pipe thread.
pub fn full_heap_scan(id: u32, module_base: u32, module_end: u32, offsets: &OffsetRegistry) -> Option<u32> {
    let vtable_off = offsets.creature_vtable_off.load(Ordering::Relaxed);
    let id_off = offsets.creature_id_off.load(Ordering::Relaxed);
    let vtable_min = offsets.vtable_min_rva.load(Ordering::Relaxed);
    let vtable_max = offsets.vtable_max_rva.load(Ordering::Relaxed);

    let mut addr = module_base;
    let mut iterations = 0u32;
    while addr + 8 <= module_end {
        iterations += 1;
        if iterations > MAX_ITERATIONS * 100 {
            break;
        }
        if let Some(candidate_id) = read_u32(addr + id_off) {
            if candidate_id == id {
                if let Some(vtable) = read_u32(addr + vtable_off) {
                    if vtable >= vtable_min && vtable <= vtable_max {
                        return Some(addr);
                    }
                }
            }
        }
        addr += 4;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_creature_id_range() {
        assert!(is_valid_creature_id(0x1000_0000));
        assert!(is_valid_creature_id(0x7FFF_FFFF));
        assert!(!is_valid_creature_id(0x0FFF_FFFF));
        assert!(!is_valid_creature_id(0x8000_0000));
    }

    #[test]
    fn grammar_accepts_typical_name() {
        assert!(validate_name_grammar("Rat"));
        assert!(validate_name_grammar("Orc Berserker"));
        assert!(validate_name_grammar("Player's Ghost"));
        assert!(validate_name_grammar("D'Angelo"));
    }

    #[test]
    fn grammar_rejects_too_short_or_long() {
        assert!(!validate_name_grammar("Ab"));
        let too_long = format!("A{}", "a".repeat(30));
        assert!(!validate_name_grammar(&too_long));
    }

    #[test]
    fn grammar_rejects_lowercase_first_char() {
        assert!(!validate_name_grammar("rat"));
    }

    #[test]
    fn grammar_rejects_no_lowercase() {
        assert!(!validate_name_grammar("RAT"));
    }

    #[test]
    fn grammar_rejects_internal_lower_to_upper_transition() {
        assert!(!validate_name_grammar("RaTface"));
    }

    #[test]
    fn grammar_rejects_disallowed_characters() {
        assert!(!validate_name_grammar("Rat_Thing"));
        assert!(!validate_name_grammar("Rat#1"));
    }

    #[test]
    fn in_user_range_rejects_low_and_kernel_addresses() {
        assert!(!in_user_range(0x1000));
        assert!(!in_user_range(0x8000_0000));
        assert!(in_user_range(0x0050_0000));
    }
}
