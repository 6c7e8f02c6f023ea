// fault.rs — C3: Fault-Recovery Core.
//
// The teacher has no equivalent (its ESP reads are gated by VirtualQuery and
// simply skip a frame on failure); this is grounded instead on the pack's
// Windows VEH pattern (the memory-fault crate's recovery mechanism), adapted
// to spec.md's explicit FaultContext design: a saved CONTEXT + armed flag +
// owning-thread id per protected region, consulted by a single process-wide
// vectored exception handler that resumes execution instead of unwinding
// (§4.3, §9 "Replacing exceptions" — resume, don't unwind, because the stack
// below the fault point is game code not built for it).
//
// Two FaultContext instances exist, one per protected thread (§3): the
// scanner/pipe thread and the UI thread. Both are process-wide statics,
// consistent with §9 "Replacing global state".

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Once;

use winapi::shared::ntdef::LONG;
use winapi::um::errhandlingapi::AddVectoredExceptionHandler;
use winapi::um::minwinbase::EXCEPTION_ACCESS_VIOLATION;
use winapi::um::processthreadsapi::GetCurrentThreadId;
use winapi::um::winnt::{CONTEXT, EXCEPTION_POINTERS};
use winapi::vc::excpt::EXCEPTION_CONTINUE_EXECUTION;
use winapi::um::winnt::EXCEPTION_CONTINUE_SEARCH;

/// A foreign (non-access-violation) language-runtime exception code. The
/// game's Lua bridge raises MSVC C++ exceptions (0xE06D7363, "msc") from
/// inside the attack call path; §4.3 requires these be resumed past on the
/// UI thread only, while armed.
const CPP_EH_EXCEPTION: u32 = 0xE06D_7363;

pub struct FaultContext {
    armed: AtomicBool,
    owner_thread: AtomicU32,
    saved: std::sync::Mutex<Option<CONTEXT>>,
    pub last_fault_ms: AtomicU32,
}

impl FaultContext {
    const fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            owner_thread: AtomicU32::new(0),
            saved: std::sync::Mutex::new(None),
            last_fault_ms: AtomicU32::new(0),
        }
    }

    fn arm(&self, ctx: CONTEXT) {
        *self.saved.lock().unwrap() = Some(ctx);
        self.owner_thread
            .store(unsafe { GetCurrentThreadId() }, Ordering::Relaxed);
        self.armed.store(true, Ordering::Release);
    }

    fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }

    fn is_armed_for(&self, thread_id: u32) -> bool {
        self.armed.load(Ordering::Acquire) && self.owner_thread.load(Ordering::Relaxed) == thread_id
    }

    fn take_saved(&self) -> Option<CONTEXT> {
        self.saved.lock().unwrap().take()
    }
}

pub static SCANNER_FAULT: FaultContext = FaultContext::new();
pub static UI_FAULT: FaultContext = FaultContext::new();

thread_local! {
    /// Set by the VEH handler immediately before it copies the saved
    /// context back into `ContextRecord`, so that once execution resumes
    /// at the point `capture_context` returned to, `guard` can tell "this
    /// is the resume, not the first pass" — the CPU registers were
    /// restored by the context swap, but ordinary memory like this flag
    /// was not.
    static FAULTED: std::cell::Cell<bool> = std::cell::Cell::new(false);
}

static VEH_INSTALL: Once = Once::new();

/// Installs the process-wide vectored exception handler. Idempotent; call
/// once from DllMain (§6 "On attach").
pub fn install() {
    VEH_INSTALL.call_once(|| unsafe {
        AddVectoredExceptionHandler(1, Some(veh_handler));
    });
}

unsafe extern "system" fn veh_handler(info: *mut EXCEPTION_POINTERS) -> LONG {
    let record = &*(*info).ExceptionRecord;
    let code = record.ExceptionCode as u32;
    let thread_id = GetCurrentThreadId();
    let faulting_addr = record.ExceptionAddress as u32;

    let target = if code == EXCEPTION_ACCESS_VIOLATION {
        if SCANNER_FAULT.is_armed_for(thread_id) {
            Some(&SCANNER_FAULT)
        } else if UI_FAULT.is_armed_for(thread_id) {
            Some(&UI_FAULT)
        } else {
            None
        }
    } else if code == CPP_EH_EXCEPTION && UI_FAULT.is_armed_for(thread_id) {
        Some(&UI_FAULT)
    } else {
        None
    };

    let Some(ctx) = target else {
        return EXCEPTION_CONTINUE_SEARCH;
    };

    if let Some(saved) = ctx.take_saved() {
        ctx.disarm();
        let now = crate::stability::now_ms();
        ctx.last_fault_ms.store(now, Ordering::Relaxed);
        // Stores the raw faulting address, not an RVA: converting to
        // module-relative requires `CString`/`GetModuleHandleA`, which
        // allocate and call into loader state we don't want to touch from
        // inside the handler. The pipe thread converts on flush instead.
        crate::log::CRASH_RING.record(crate::log::CrashRecord {
            faulting_addr,
            thread_id,
            fault_ms: now,
            exception_code: code,
        });
        // The resumed context's registers (including the thread-local's
        // storage pointer, which doesn't move) land us back right after
        // `capture_context()` in `guard`. Set the flag now, in ordinary
        // memory, so that resumed call sees it.
        FAULTED.with(|f| f.set(true));
        *(*info).ContextRecord = saved;
        EXCEPTION_CONTINUE_EXECUTION
    } else {
        EXCEPTION_CONTINUE_SEARCH
    }
}

/// Runs `f` inside an armed region on `ctx`. If `f` completes normally the
/// region is disarmed and `Some(result)` is returned. If a fault resumes
/// execution back to the saved context (i.e. control returns to the point
/// right after `RtlCaptureContext`, not after the protected call), `f`
/// never finishes and this returns `None`.
///
/// This is the crate's setjmp/longjmp analogue: `RtlCaptureContext` stands
/// in for `setjmp`, and the VEH's context copy-back stands in for
/// `longjmp`. A thread-local sentinel distinguishes "fresh call to `guard`"
/// from "resumed after a fault" without needing a second capture.
pub fn guard<T>(ctx: &FaultContext, f: impl FnOnce() -> T) -> Option<T> {
    FAULTED.with(|f| f.set(false));

    let captured = capture_context();
    if FAULTED.with(|f| f.get()) {
        // Resumed here by the VEH handler copying `captured` back into
        // ContextRecord after a fault during the protected call below.
        FAULTED.with(|f| f.set(false));
        return None;
    }

    ctx.arm(captured);
    let result = f();
    ctx.disarm();
    Some(result)
}

fn capture_context() -> CONTEXT {
    use winapi::um::winnt::CONTEXT_FULL;
    use std::mem::MaybeUninit;
    unsafe {
        let mut ctx = MaybeUninit::<CONTEXT>::zeroed().assume_init();
        ctx.ContextFlags = CONTEXT_FULL;
        winapi::um::winnt::RtlCaptureContext(&mut ctx as *mut CONTEXT);
        ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_context_is_unarmed() {
        let ctx = FaultContext::new();
        assert!(!ctx.is_armed_for(unsafe { GetCurrentThreadId() }));
    }

    #[test]
    fn arm_then_disarm_clears_flag() {
        let ctx = FaultContext::new();
        let tid = unsafe { GetCurrentThreadId() };
        let dummy: CONTEXT = unsafe { std::mem::zeroed() };
        ctx.arm(dummy);
        assert!(ctx.is_armed_for(tid));
        ctx.disarm();
        assert!(!ctx.is_armed_for(tid));
    }

    #[test]
    fn armed_for_rejects_other_thread() {
        let ctx = FaultContext::new();
        let dummy: CONTEXT = unsafe { std::mem::zeroed() };
        ctx.arm(dummy);
        assert!(!ctx.is_armed_for(unsafe { GetCurrentThreadId() }.wrapping_add(1)));
    }

    #[test]
    fn guard_runs_body_and_disarms_on_normal_return() {
        let value = guard(&SCANNER_FAULT, || 7);
        assert_eq!(value, Some(7));
        assert!(!SCANNER_FAULT.is_armed_for(unsafe { GetCurrentThreadId() }));
    }
}
