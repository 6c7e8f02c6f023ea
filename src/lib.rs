// lib.rs — DLL entry point for the in-process creature-map / targeting
// agent.
//
// When this DLL is injected into the game client via LoadLibraryA, DllMain
// fires with DLL_PROCESS_ATTACH. Per §6: disables thread-attach
// notifications, records the install directory for the log files, installs
// the vectored exception handler, creates a named mutex (guards against a
// double injection racing a second pipe/scanner thread into existence), and
// starts the pipe/scanner thread. On detach: signals the thread to stop,
// joins with a 2-second timeout, releases the mutex. Installed hooks and
// the window subclass are deliberately left in place (§5).
//
// Must be compiled as a 32-bit cdylib (i686-pc-windows-msvc).

#![allow(non_snake_case)]

#[cfg(not(target_arch = "x86"))]
compile_error!("Build with i686-pc-windows-msvc (32-bit x86).");

mod courier;
mod creature_map;
mod error;
mod fault;
mod geometry;
mod hooks;
mod locator;
mod log;
mod offsets;
mod pipe;
mod protocol;
mod safe_mem;
mod stability;
mod targeting;

use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use winapi::shared::minwindef::{BOOL, DWORD, HINSTANCE, LPVOID, TRUE};
use winapi::um::handleapi::CloseHandle;
use winapi::um::libloaderapi::DisableThreadLibraryCalls;
use winapi::um::processthreadsapi::CreateThread;
use winapi::um::synchapi::{CreateMutexA, WaitForSingleObject};
use winapi::um::winnt::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH, HANDLE};

static WORKER_THREAD: AtomicUsize = AtomicUsize::new(0);
static MUTEX_HANDLE: AtomicUsize = AtomicUsize::new(0);
static DLL_HINST: AtomicUsize = AtomicUsize::new(0);

const SESSION_MUTEX_NAME: &str = "Local\\tibia_agent_core_singleton";
const DETACH_JOIN_TIMEOUT_MS: u32 = 2_000;

unsafe extern "system" fn worker(_: LPVOID) -> DWORD {
    pipe::run();
    0
}

#[no_mangle]
pub unsafe extern "system" fn DllMain(hinst: HINSTANCE, reason: DWORD, _reserved: LPVOID) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            DisableThreadLibraryCalls(hinst);
            DLL_HINST.store(hinst as usize, Ordering::Release);

            log::DEBUG_LOG.init(log::install_dir_path(hinst, "agent_debug.log"));
            log::XTEA_LOG.init(log::install_dir_path(hinst, "agent_xtea.log"));
            log::init_crash_log(log::install_dir_path(hinst, "agent_crash.log"));
            log::DEBUG_LOG.log("DLL attached");

            fault::install();

            let mutex_name = std::ffi::CString::new(SESSION_MUTEX_NAME).unwrap();
            let mutex: HANDLE = CreateMutexA(ptr::null_mut(), 0, mutex_name.as_ptr());
            if !mutex.is_null() {
                MUTEX_HANDLE.store(mutex as usize, Ordering::Release);
            }

            pipe::SHOULD_STOP.store(false, Ordering::Release);
            let thread = CreateThread(
                ptr::null_mut(),
                0,
                Some(worker),
                ptr::null_mut(),
                0,
                ptr::null_mut(),
            );
            if !thread.is_null() {
                WORKER_THREAD.store(thread as usize, Ordering::Release);
            }

            log::DEBUG_LOG.flush();
        }
        DLL_PROCESS_DETACH => {
            pipe::SHOULD_STOP.store(true, Ordering::Release);

            let thread = WORKER_THREAD.swap(0, Ordering::AcqRel);
            if thread != 0 {
                WaitForSingleObject(thread as HANDLE, DETACH_JOIN_TIMEOUT_MS);
                CloseHandle(thread as HANDLE);
            }

            let mutex = MUTEX_HANDLE.swap(0, Ordering::AcqRel);
            if mutex != 0 {
                CloseHandle(mutex as HANDLE);
            }

            log::DEBUG_LOG.log("DLL detached");
            log::DEBUG_LOG.flush();
        }
        _ => {}
    }
    TRUE
}
