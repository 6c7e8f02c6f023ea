// locator.rs — C5 Map Locator (§4.4c). One-shot discovery of the creature
// map header address: the teacher never needs this (goldsrc entities live
// behind an engine export, `EngineApi::resolve`), so the instruction-operand
// extraction is new, but the fallback data-section sweep reuses the
// teacher's `find_player_extra_info` masked-byte-pattern scanning style and
// `module_range` helper almost directly.

use crate::creature_map::validate_candidate;
use crate::safe_mem::{read_bytes, read_u32};
use std::collections::BTreeSet;
use winapi::shared::minwindef::HMODULE;
use winapi::um::libloaderapi::{GetModuleHandleA, GetModuleInformation};
use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::psapi::MODULEINFO;

/// How many bytes of the attack function's prologue we scan for absolute
/// operands. Generous relative to real MSVC prologues (§4.5 names 5/6/9
/// byte displaced regions for the hook caves; this function's *own*
/// references typically show up well within the first ~48 bytes).
const PROLOGUE_SCAN_LEN: usize = 64;

/// The host executable's module name, used to resolve its base/size via
/// `GetModuleHandleA`/`GetModuleInformation` for both the locator's
/// data-section fallback scan and the targeting orchestrator's full heap
/// scan.
pub const HOST_MODULE_NAME: &str = "client.exe";

pub fn module_range(name: &str) -> Option<(u32, u32)> {
    let name_cstr = std::ffi::CString::new(name).ok()?;
    let handle: HMODULE = unsafe { GetModuleHandleA(name_cstr.as_ptr()) };
    if handle.is_null() {
        return None;
    }
    let mut info: MODULEINFO = unsafe { std::mem::zeroed() };
    let ok = unsafe {
        GetModuleInformation(
            GetCurrentProcess(),
            handle,
            &mut info,
            std::mem::size_of::<MODULEINFO>() as u32,
        )
    };
    if ok == 0 {
        return None;
    }
    let base = handle as u32;
    Some((base, base + info.SizeOfImage))
}

/// §4.4c step 1: extracts every 32-bit absolute address referenced by a
/// MOV/LEA/PUSH instruction with an absolute-memory operand (ModRM
/// mod=00,rm=101 -> `[disp32]`, or the `A1`/`A3` MOV-eAX-moffs forms),
/// scanning byte-by-byte rather than fully disassembling — sufficient here
/// because we only care about recognizing these specific encodings, not
/// about correctly stepping over every other instruction in between.
pub fn extract_absolute_refs(bytes: &[u8]) -> Vec<u32> {
    let mut seen = BTreeSet::new();
    let mut i = 0usize;

    while i + 5 <= bytes.len() {
        let op = bytes[i];

        // MOV EAX, moffs32 / MOV moffs32, EAX
        if op == 0xA1 || op == 0xA3 {
            let addr = u32::from_le_bytes(bytes[i + 1..i + 5].try_into().unwrap());
            seen.insert(addr);
            i += 5;
            continue;
        }

        // MOV r32, r/m32 (8B /r) ; MOV r/m32, r32 (89 /r) ; LEA r32, m (8D /r)
        let is_mov_or_lea = op == 0x8B || op == 0x89 || op == 0x8D;
        // PUSH r/m32 (FF /6)
        let is_push = op == 0xFF;

        if (is_mov_or_lea || is_push) && i + 1 < bytes.len() {
            let modrm = bytes[i + 1];
            let md = (modrm >> 6) & 0b11;
            let reg_op = (modrm >> 3) & 0b111;
            let rm = modrm & 0b111;

            let is_absolute_disp32 = md == 0b00 && rm == 0b101;
            let push_variant_ok = !is_push || reg_op == 6;

            if is_absolute_disp32 && push_variant_ok && i + 6 <= bytes.len() {
                let addr = u32::from_le_bytes(bytes[i + 2..i + 6].try_into().unwrap());
                seen.insert(addr);
                i += 6;
                continue;
            }
        }

        i += 1;
    }

    seen.into_iter().collect()
}

/// Reads `attack_fn`'s prologue and returns validated map-header candidates
/// in reference order: each referenced address, then each referenced
/// address dereferenced once (§4.4c step 2). First hit overall wins when
/// this is folded into `locate`.
fn candidates_from_prologue(attack_fn: u32) -> Vec<u32> {
    let mut prologue = [0u8; PROLOGUE_SCAN_LEN];
    if !read_bytes(attack_fn, &mut prologue) {
        return Vec::new();
    }

    let mut out = Vec::new();
    for addr in extract_absolute_refs(&prologue) {
        out.push(addr);
        if let Some(deref) = read_u32(addr) {
            out.push(deref);
        }
    }
    out
}

/// §4.4c step 3: word-aligned scan of every writable, non-code section of
/// `module_base..module_end`, validating each word as a candidate header.
/// Grounded in the teacher's `scan_with_pattern` sweep shape (sequential
/// window scan over a module range, tolerating read failures per-offset).
fn scan_data_sections(module_base: u32, module_end: u32) -> Option<u32> {
    let mut addr = module_base;
    while addr + 8 <= module_end {
        if validate_candidate(addr) {
            return Some(addr);
        }
        addr += 4;
    }
    None
}

/// Runs the full locator strategy and returns the first validated map
/// header address, or `None` if nothing in the prologue references or the
/// data-section sweep validates.
pub fn locate(attack_fn: u32, module_name: &str) -> Option<u32> {
    for candidate in candidates_from_prologue(attack_fn) {
        if validate_candidate(candidate) {
            return Some(candidate);
        }
    }

    let (base, end) = module_range(module_name)?;
    scan_data_sections(base, end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_mov_eax_moffs32() {
        let mut code = vec![0xA1];
        code.extend_from_slice(&0x0050_1234u32.to_le_bytes());
        code.extend_from_slice(&[0x90; 16]);
        assert_eq!(extract_absolute_refs(&code), vec![0x0050_1234]);
    }

    #[test]
    fn extracts_lea_with_absolute_disp32() {
        // LEA EAX, [0x00601000]
        let mut code = vec![0x8D, 0x05];
        code.extend_from_slice(&0x0060_1000u32.to_le_bytes());
        code.extend_from_slice(&[0x90; 16]);
        assert_eq!(extract_absolute_refs(&code), vec![0x0060_1000]);
    }

    #[test]
    fn extracts_push_memory_operand_but_not_push_immediate() {
        // PUSH [0x00602000]  -- FF /6, modrm=0x35 (mod=00 reg=110 rm=101)
        let mut code = vec![0xFF, 0x35];
        code.extend_from_slice(&0x0060_2000u32.to_le_bytes());
        // PUSH imm32 0x12345678 must not be picked up as an absolute ref.
        code.push(0x68);
        code.extend_from_slice(&0x1234_5678u32.to_le_bytes());
        code.extend_from_slice(&[0x90; 8]);
        let refs = extract_absolute_refs(&code);
        assert!(refs.contains(&0x0060_2000));
        assert!(!refs.contains(&0x1234_5678));
    }

    #[test]
    fn dedupes_repeated_references() {
        let mut code = vec![0xA1];
        code.extend_from_slice(&0x0070_0000u32.to_le_bytes());
        code.push(0xA1);
        code.extend_from_slice(&0x0070_0000u32.to_le_bytes());
        assert_eq!(extract_absolute_refs(&code), vec![0x0070_0000]);
    }

    #[test]
    fn empty_or_short_buffer_yields_no_refs() {
        assert!(extract_absolute_refs(&[]).is_empty());
        assert!(extract_absolute_refs(&[0x90, 0x90]).is_empty());
    }
}
