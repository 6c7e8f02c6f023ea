// pipe.rs — C9 Pipe Server. Single-connection duplex named pipe owning the
// main scanner loop (§4.8). Grounded in the teacher's worker-thread shape
// (`lib.rs::worker`, a loop with a stop flag and a sleep) generalized from
// "one hook install, one long sleep" into an accept/read/scan/write cycle.

use std::ffi::CString;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{json, Value};
use winapi::shared::minwindef::DWORD;
use winapi::um::fileapi::{ReadFile, WriteFile};
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{VirtualProtect, WriteProcessMemory};
use winapi::um::namedpipeapi::{ConnectNamedPipe, CreateNamedPipeA, DisconnectNamedPipe, SetNamedPipeHandleState};
use winapi::um::processthreadsapi::GetCurrentProcess;
use winapi::um::winbase::{PIPE_ACCESS_DUPLEX, PIPE_NOWAIT, PIPE_READMODE_BYTE, PIPE_TYPE_BYTE};
use winapi::um::winnt::HANDLE;

use crate::creature_map::{self, CreatureSnapshot};
use crate::hooks;
use crate::locator;
use crate::log;
use crate::offsets::{SetOffsetsFields, OFFSETS};
use crate::protocol::{self, diagnostic_event, snapshot_event};
use crate::stability::STABILITY;
use crate::targeting;

pub const PIPE_NAME: &str = r"\\.\pipe\tibia_agent_core";
const BUFFER_SIZE: DWORD = 65536;
const SCANNER_SLEEP_MS: u64 = 4;

const MAP_SCAN_INTERVAL_MS: u32 = 16;
const FALLBACK_FAST_MS: u32 = 200;
const FALLBACK_FULL_MS: u32 = 5000;

fn now_ms() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u32)
        .unwrap_or(0)
}

/// Per-session state, reset on every reconnection (§4.8). The discovered
/// map address is process-wide (`creature_map::MAP_ADDR`) and deliberately
/// excluded from this reset.
struct SessionState {
    player_id: Option<u32>,
    use_map_scan: bool,
    last_scan_ms: u32,
    last_fallback_fast_ms: u32,
    last_fallback_full_ms: u32,
    read_buf: String,
}

impl SessionState {
    fn new() -> Self {
        Self {
            player_id: None,
            use_map_scan: true,
            last_scan_ms: 0,
            last_fallback_fast_ms: 0,
            last_fallback_full_ms: 0,
            read_buf: String::new(),
        }
    }
}

/// Staged snapshot, published under a mutex so readers never see a torn
/// half-write (§5 "Snapshot publish"). The scanner writes here; the pipe
/// loop's write step reads it back.
static LATEST_SNAPSHOT: Mutex<Vec<CreatureSnapshot>> = Mutex::new(Vec::new());

pub static SHOULD_STOP: AtomicBool = AtomicBool::new(false);

fn pipe_name_cstring() -> CString {
    CString::new(PIPE_NAME).expect("pipe name has no interior NUL")
}

fn create_pipe_instance() -> crate::error::CoreResult<HANDLE> {
    let name = pipe_name_cstring();
    let handle = unsafe {
        CreateNamedPipeA(
            name.as_ptr(),
            PIPE_ACCESS_DUPLEX,
            PIPE_TYPE_BYTE | PIPE_READMODE_BYTE,
            1,
            BUFFER_SIZE,
            BUFFER_SIZE,
            0,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(crate::error::CoreError::PipeCreateFailed(unsafe {
            winapi::um::errhandlingapi::GetLastError()
        }));
    }
    let mut mode: DWORD = PIPE_READMODE_BYTE | PIPE_NOWAIT;
    unsafe {
        SetNamedPipeHandleState(handle, &mut mode, ptr::null_mut(), ptr::null_mut());
    }
    Ok(handle)
}

/// Blocking accept — runs before any session state exists, so blocking here
/// doesn't violate §5's "no cooperative suspension inside the loop".
fn accept(handle: HANDLE) -> bool {
    unsafe { ConnectNamedPipe(handle, ptr::null_mut()) != 0 }
}

/// Attempts a non-blocking read; returns a complete line if the session's
/// buffer now contains a `\n`.
fn try_read_line(handle: HANDLE, session: &mut SessionState) -> Option<String> {
    let mut chunk = [0u8; 4096];
    let mut read: DWORD = 0;
    let ok = unsafe {
        ReadFile(
            handle,
            chunk.as_mut_ptr() as *mut _,
            chunk.len() as DWORD,
            &mut read,
            ptr::null_mut(),
        )
    };
    if ok != 0 && read > 0 {
        session
            .read_buf
            .push_str(&String::from_utf8_lossy(&chunk[..read as usize]));
    }

    if let Some(pos) = session.read_buf.find('\n') {
        let line: String = session.read_buf.drain(..=pos).collect();
        Some(line.trim_end().to_string())
    } else {
        None
    }
}

fn send_event(handle: HANDLE, event: &protocol::OutboundEvent) -> bool {
    let Ok(mut line) = serde_json::to_string(event) else {
        return false;
    };
    line.push('\n');
    let bytes = line.as_bytes();
    let mut written: DWORD = 0;
    let ok = unsafe {
        WriteFile(
            handle,
            bytes.as_ptr() as *const _,
            bytes.len() as DWORD,
            &mut written,
            ptr::null_mut(),
        )
    };
    ok != 0 && written as usize == bytes.len()
}

fn run_scan_cycle(session: &mut SessionState, handle: HANDLE) -> bool {
    let now = now_ms();
    let map = creature_map::map_addr();

    let should_scan = if session.use_map_scan && map != 0 {
        now.saturating_sub(session.last_scan_ms) >= MAP_SCAN_INTERVAL_MS
    } else {
        now.saturating_sub(session.last_fallback_fast_ms) >= FALLBACK_FAST_MS
    };

    if !should_scan {
        return true;
    }

    if session.use_map_scan && map != 0 {
        session.last_scan_ms = now;
        let rows = crate::fault::guard(&crate::fault::SCANNER_FAULT, || {
            creature_map::walk(map, session.player_id, &OFFSETS)
        })
        .flatten();

        match rows {
            Some(rows) => {
                STABILITY.observe_count(rows.len(), now);
                STABILITY.reset_scanner_fault_streak();
                creature_map::update_scan_cache(&rows);
                *LATEST_SNAPSHOT.lock().unwrap() = rows;
            }
            None => {
                // fault recovered; current cycle's snapshot is simply stale,
                // per §4.4 "aborts the cycle cleanly". A short burst of these
                // auto-reverts to heap-scan mode (§7): an explicit
                // `scan_gmap` is required to re-enter tree mode.
                if STABILITY.note_scanner_fault(now) {
                    session.use_map_scan = false;
                    creature_map::set_map_addr(0);
                }
            }
        }
    } else {
        session.last_fallback_fast_ms = now;
        if now.saturating_sub(session.last_fallback_full_ms) >= FALLBACK_FULL_MS {
            session.last_fallback_full_ms = now;
            // Heap-scan fallback mode republishes whatever the scan cache
            // still holds; a full rebuild requires a fresh `scan_gmap`.
        }
    }

    let snapshot = LATEST_SNAPSHOT.lock().unwrap().clone();
    send_event(handle, &snapshot_event(&snapshot))
}

fn dispatch_command(line: &str, handle: HANDLE, session: &mut SessionState) -> bool {
    let Some((cmd, value)) = protocol::parse_command(line) else {
        return true; // malformed/unknown: ignored, §7
    };

    match cmd.as_str() {
        "init" => {
            if let Some(id) = protocol::field_u32(&value, "player_id") {
                session.player_id = Some(id);
            }
        }
        "set_offsets" => {
            if let Ok(fields) = serde_json::from_value::<SetOffsetsFields>(value) {
                OFFSETS.apply(&fields);
            }
        }
        "scan_gmap" => {
            let attack_fn = OFFSETS.attack_fn.load(Ordering::Relaxed);
            if let Some((base, _)) = locator::module_range(locator::HOST_MODULE_NAME) {
                if let Some(addr) = locator::locate(attack_fn, locator::HOST_MODULE_NAME) {
                    creature_map::set_map_addr(addr);
                    let _ = send_event(
                        handle,
                        &diagnostic_event("scan_gmap", json!({"found": true, "addr": addr})),
                    );
                } else {
                    let _ = send_event(
                        handle,
                        &diagnostic_event("scan_gmap", json!({"found": false, "module_base": base})),
                    );
                }
            }
        }
        "use_map_scan" => {
            if let Some(enabled) = protocol::field_bool(&value, "enabled") {
                session.use_map_scan = enabled;
            }
        }
        "hook_wndproc" => {
            let result = crate::courier::install();
            let _ = send_event(
                handle,
                &diagnostic_event("hook_wndproc", json!({"ok": result.is_ok()})),
            );
        }
        "hook_attack" => {
            let send_attack_fn = OFFSETS.send_attack_fn.load(Ordering::Relaxed);
            let result = hooks::install_attack_hook(send_attack_fn);
            let _ = send_event(
                handle,
                &diagnostic_event("hook_attack", json!({"ok": result.is_ok()})),
            );
        }
        "hook_xtea" => {
            let xtea_fn = OFFSETS.xtea_encrypt_fn.load(Ordering::Relaxed);
            let base = locator::module_range(locator::HOST_MODULE_NAME)
                .map(|(b, _)| b)
                .unwrap_or(0);
            let result = hooks::install_xtea_hook(xtea_fn, base);
            let _ = send_event(
                handle,
                &diagnostic_event("hook_xtea", json!({"ok": result.is_ok()})),
            );
        }
        "unhook_xtea" => {
            // §5: caves are write-once and never removed once installed;
            // "unhook" disarms the quick-attack dispatch instead of undoing
            // the JMP patch.
            hooks::reset_xtea_ring();
        }
        "reset_xtea" => {
            hooks::reset_xtea_ring();
        }
        "game_attack" => {
            if let Some(id) = protocol::field_u32(&value, "creature_id") {
                targeting::request_game_attack(id);
            }
        }
        "dump_mem" | "dump_code" => {
            if let (Some(addr), Some(len)) = (
                protocol::field_u32(&value, "addr"),
                protocol::field_u32(&value, "len"),
            ) {
                let len = (len as usize).min(4096);
                let mut buf = vec![0u8; len];
                let ok = crate::safe_mem::read_bytes(addr, &mut buf);
                let hex = hex_encode(&buf);
                let _ = send_event(handle, &diagnostic_event(&cmd, json!({"ok": ok, "data": hex})));
            }
        }
        "read_mem" => {
            if let Some(addr) = protocol::field_u32(&value, "addr") {
                let result = crate::safe_mem::read_u32(addr);
                let _ = send_event(
                    handle,
                    &diagnostic_event("read_mem", json!({"value": result})),
                );
            }
        }
        "write_mem" => {
            if let (Some(addr), Some(val)) =
                (protocol::field_u32(&value, "addr"), protocol::field_u32(&value, "value"))
            {
                let ok = write_mem(addr, val);
                let _ = send_event(handle, &diagnostic_event("write_mem", json!({"ok": ok})));
            }
        }
        "deref" => {
            if let Some(addr) = protocol::field_u32(&value, "addr") {
                let result = crate::safe_mem::read_u32(addr);
                let _ = send_event(handle, &diagnostic_event("deref", json!({"value": result})));
            }
        }
        "find_xrefs" => {
            if let Some(addr) = protocol::field_u32(&value, "addr") {
                let mut buf = [0u8; 256];
                if crate::safe_mem::read_bytes(addr, &mut buf) {
                    let refs = locator::extract_absolute_refs(&buf);
                    let _ = send_event(handle, &diagnostic_event("find_xrefs", json!({"refs": refs})));
                }
            }
        }
        "query_attack" => {
            let _ = send_event(
                handle,
                &diagnostic_event(
                    "query_attack",
                    json!({
                        "protocol_object": hooks::PROTOCOL_OBJECT.load(Ordering::Relaxed),
                        "game_object": hooks::GAME_OBJECT.load(Ordering::Relaxed),
                        "captured_creature_id": hooks::CAPTURED_CREATURE_ID.load(Ordering::Relaxed),
                        "caller_rva": hooks::ATTACK_CALLER_RVA.load(Ordering::Relaxed),
                    }),
                ),
            );
        }
        "query_game" => {
            let singleton = OFFSETS.singleton_base.load(Ordering::Relaxed);
            let seq_off = OFFSETS.singleton_sequence_off.load(Ordering::Relaxed);
            let attacking_off = OFFSETS.singleton_attacking_creature_off.load(Ordering::Relaxed);
            let _ = send_event(
                handle,
                &diagnostic_event(
                    "query_game",
                    json!({
                        "singleton": singleton,
                        "sequence": crate::safe_mem::read_u32(singleton + seq_off),
                        "attacking_creature": crate::safe_mem::read_u32(singleton + attacking_off),
                        "map_addr": creature_map::map_addr(),
                    }),
                ),
            );
        }
        "scan_game_attack" => {
            let entries = hooks::drain_xtea_log();
            let _ = send_event(
                handle,
                &diagnostic_event("scan_game_attack", json!({"xtea_log": entries})),
            );
        }
        "stop" => {
            return false;
        }
        _ => {
            // unknown command: ignored, §7
        }
    }

    true
}

fn write_mem(addr: u32, value: u32) -> bool {
    let mut old_protect = 0u32;
    unsafe {
        if VirtualProtect(addr as *mut _, 4, winapi::um::winnt::PAGE_READWRITE, &mut old_protect) == 0 {
            return false;
        }
        let mut written = 0usize;
        let ok = WriteProcessMemory(
            GetCurrentProcess(),
            addr as *mut _,
            value.to_le_bytes().as_ptr() as *const _,
            4,
            &mut written,
        );
        VirtualProtect(addr as *mut _, 4, old_protect, &mut old_protect);
        ok != 0 && written == 4
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

fn handle_session(handle: HANDLE) {
    let mut session = SessionState::new();
    loop {
        if SHOULD_STOP.load(Ordering::Relaxed) {
            break;
        }

        if let Some(line) = try_read_line(handle, &mut session) {
            let keep_going = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                dispatch_command(&line, handle, &mut session)
            }))
            .unwrap_or(true); // a panicked command is treated as a no-op, session stays up
            if !keep_going {
                break;
            }
        }

        let scan_ok = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            run_scan_cycle(&mut session, handle)
        }))
        .unwrap_or(false);
        if !scan_ok {
            break; // write failed, or the cycle panicked: tear down (§4.8 "Back-pressure")
        }

        log::DEBUG_LOG.flush();
        log::XTEA_LOG.flush();
        log::flush_crash_ring();

        std::thread::sleep(std::time::Duration::from_millis(SCANNER_SLEEP_MS));
    }

    unsafe {
        DisconnectNamedPipe(handle);
    }
}

/// Entry point for the pipe/scanner thread (§6 "On attach: ... starts the
/// pipe/scanner thread").
pub fn run() {
    loop {
        if SHOULD_STOP.load(Ordering::Relaxed) {
            break;
        }
        let handle = match create_pipe_instance() {
            Ok(h) => h,
            Err(_) => {
                std::thread::sleep(std::time::Duration::from_millis(250));
                continue;
            }
        };

        if accept(handle) {
            handle_session(handle);
        }

        unsafe {
            CloseHandle(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_encode_matches_expected() {
        assert_eq!(hex_encode(&[0x00, 0xFF, 0x10]), "00ff10");
    }

    #[test]
    fn dispatch_unknown_command_keeps_session_alive() {
        // `dispatch_command` needs a real HANDLE only for the commands that
        // emit a response; "bogus" never reaches `send_event`.
        let mut session = SessionState::new();
        let keep_going = dispatch_command(
            r#"{"cmd":"bogus_unknown_cmd"}"#,
            std::ptr::null_mut(),
            &mut session,
        );
        assert!(keep_going);
    }

    #[test]
    fn dispatch_stop_ends_session() {
        let mut session = SessionState::new();
        let keep_going = dispatch_command(r#"{"cmd":"stop"}"#, std::ptr::null_mut(), &mut session);
        assert!(!keep_going);
    }

    #[test]
    fn dispatch_init_sets_player_id() {
        let mut session = SessionState::new();
        dispatch_command(
            r#"{"cmd":"init","player_id":1073741825}"#,
            std::ptr::null_mut(),
            &mut session,
        );
        assert_eq!(session.player_id, Some(1073741825));
    }

    #[test]
    fn repeated_scan_faults_revert_to_heap_scan_mode() {
        // Unreadable address: `creature_map::walk` bottoms out in `None` via
        // `safe_mem`'s gated reads, no real access violation needed.
        creature_map::set_map_addr(1);
        let mut session = SessionState::new();
        session.player_id = None;

        for _ in 0..3 {
            session.last_scan_ms = 0; // force `should_scan` past the interval gate
            assert!(session.use_map_scan);
            run_scan_cycle(&mut session, std::ptr::null_mut());
        }

        session.last_scan_ms = 0;
        run_scan_cycle(&mut session, std::ptr::null_mut());
        assert!(!session.use_map_scan);
        assert_eq!(creature_map::map_addr(), 0);
    }

    #[test]
    fn dispatch_use_map_scan_toggles_flag() {
        let mut session = SessionState::new();
        dispatch_command(
            r#"{"cmd":"use_map_scan","enabled":false}"#,
            std::ptr::null_mut(),
            &mut session,
        );
        assert!(!session.use_map_scan);
    }
}
