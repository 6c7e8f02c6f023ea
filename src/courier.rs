// courier.rs — C7 UI-Thread Courier. Grounded in the pack's window-wrapping
// pattern (a launcher module that owns an `HWND` and intercepts a private
// message) generalized to window-procedure *subclassing* rather than
// ownership, since here the game already owns the message loop and we are
// only borrowing it.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use winapi::shared::minwindef::{BOOL, LPARAM, LRESULT, TRUE, UINT, WPARAM};
use winapi::shared::windef::HWND;
use winapi::um::processthreadsapi::GetCurrentProcessId;
use winapi::um::winuser::{
    CallWindowProcA, EnumWindows, GetWindowLongPtrA, GetWindowTextLengthA,
    GetWindowThreadProcessId, IsWindowVisible, PostMessageA, SetWindowLongPtrA, GWLP_WNDPROC,
    WM_APP,
};

/// Private message id the courier intercepts (§4.6).
pub const WM_RUN_ORCHESTRATOR: UINT = WM_APP + 47;

static TARGET_HWND: AtomicUsize = AtomicUsize::new(0);
static ORIGINAL_WNDPROC: AtomicUsize = AtomicUsize::new(0);
static UI_THREAD_ID: AtomicU32 = AtomicU32::new(0);

pub fn ui_thread_id() -> u32 {
    UI_THREAD_ID.load(Ordering::Acquire)
}

unsafe extern "system" fn enum_proc(hwnd: HWND, lparam: LPARAM) -> BOOL {
    let out = &mut *(lparam as *mut HWND);
    let mut pid = 0u32;
    GetWindowThreadProcessId(hwnd, &mut pid);
    if pid != GetCurrentProcessId() {
        return TRUE;
    }
    if IsWindowVisible(hwnd) == 0 {
        return TRUE;
    }
    if GetWindowTextLengthA(hwnd) <= 0 {
        return TRUE;
    }
    *out = hwnd;
    0 // first match wins, stop enumerating
}

fn find_candidate_window() -> Option<HWND> {
    let mut found: HWND = std::ptr::null_mut();
    unsafe {
        EnumWindows(Some(enum_proc), &mut found as *mut HWND as LPARAM);
    }
    if found.is_null() {
        None
    } else {
        Some(found)
    }
}

/// §4.6: replaces the candidate window's procedure with `subclass_proc`,
/// recording the original for forwarding. Idempotent per process lifetime —
/// the subclass is never removed (§5 "Installed hooks ... are not removed
/// at session end").
pub fn install() -> crate::error::CoreResult<()> {
    if TARGET_HWND.load(Ordering::Acquire) != 0 {
        return Ok(());
    }
    let hwnd = find_candidate_window().ok_or(crate::error::CoreError::NoCandidateWindow)?;

    let original = unsafe { GetWindowLongPtrA(hwnd, GWLP_WNDPROC) };
    ORIGINAL_WNDPROC.store(original as usize, Ordering::Release);
    TARGET_HWND.store(hwnd as usize, Ordering::Release);

    unsafe {
        SetWindowLongPtrA(hwnd, GWLP_WNDPROC, subclass_proc as isize);
    }
    Ok(())
}

unsafe extern "system" fn subclass_proc(
    hwnd: HWND,
    msg: UINT,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    if msg == WM_RUN_ORCHESTRATOR {
        UI_THREAD_ID.store(winapi::um::processthreadsapi::GetCurrentThreadId(), Ordering::Release);
        // A panic unwinding across this extern "system" boundary back into
        // the game's own message loop is UB; catch it the way the teacher's
        // `hook::detour` guards its own per-frame callback.
        let _ = std::panic::catch_unwind(crate::targeting::run_ui_entry);
        return 0;
    }

    let original = ORIGINAL_WNDPROC.load(Ordering::Acquire);
    if original == 0 {
        return 0;
    }
    let original_proc: winapi::um::winuser::WNDPROC = std::mem::transmute(original);
    CallWindowProcA(original_proc, hwnd, msg, wparam, lparam)
}

/// Posted from the pipe thread so the orchestrator runs within one frame
/// instead of waiting on the XTEA liveness fallback (§4.6).
pub fn post_run_orchestrator() -> bool {
    let hwnd = TARGET_HWND.load(Ordering::Acquire);
    if hwnd == 0 {
        return false;
    }
    unsafe { PostMessageA(hwnd as HWND, WM_RUN_ORCHESTRATOR, 0, 0) != 0 }
}

pub fn is_installed() -> bool {
    TARGET_HWND.load(Ordering::Acquire) != 0
}
