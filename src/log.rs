// log.rs — ambient logging stack (§6 "Log files"). Three append-only text
// files in the install directory, generalized from the teacher's
// `entities::log`/`logf`/`flush_log` (a single `Mutex<Vec<String>>` flushed
// to one path next to the DLL, discovered via `GetModuleFileNameA`) into one
// `Logger` per file so the crash log and the XTEA caller log never serialize
// behind the main debug log's mutex.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use winapi::shared::minwindef::HMODULE;
use winapi::um::libloaderapi::GetModuleFileNameA;

/// Mirrors the teacher's `log_path` helper: resolve our own module's path
/// via `GetModuleFileNameA(module, ...)`, then swap the file name for
/// `file_name`.
pub fn install_dir_path(module: HMODULE, file_name: &str) -> PathBuf {
    let mut buf = [0u8; 260];
    let len = unsafe { GetModuleFileNameA(module, buf.as_mut_ptr() as *mut i8, buf.len() as u32) };
    let dll_path = if len == 0 {
        PathBuf::from(".")
    } else {
        PathBuf::from(String::from_utf8_lossy(&buf[..len as usize]).into_owned())
    };
    dll_path
        .parent()
        .map(|p| p.join(file_name))
        .unwrap_or_else(|| PathBuf::from(file_name))
}

pub struct Logger {
    path: Mutex<Option<PathBuf>>,
    buffer: Mutex<Vec<String>>,
}

impl Logger {
    pub const fn new() -> Self {
        Self {
            path: Mutex::new(None),
            buffer: Mutex::new(Vec::new()),
        }
    }

    pub fn init(&self, path: PathBuf) {
        *self.path.lock().unwrap() = Some(path);
    }

    pub fn log(&self, line: impl Into<String>) {
        self.buffer.lock().unwrap().push(line.into());
    }

    pub fn logf(&self, args: std::fmt::Arguments<'_>) {
        self.log(args.to_string());
    }

    /// Appends everything buffered since the last flush to disk. Called
    /// from the pipe thread on its cadence — never from the VEH handler.
    pub fn flush(&self) {
        let path = self.path.lock().unwrap().clone();
        let Some(path) = path else { return };
        let mut lines = self.buffer.lock().unwrap();
        if lines.is_empty() {
            return;
        }
        if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
            for line in lines.iter() {
                let _ = writeln!(file, "{line}");
            }
        }
        lines.clear();
    }
}

pub static DEBUG_LOG: Logger = Logger::new();
pub static XTEA_LOG: Logger = Logger::new();

/// Fixed-size, allocation-free crash record ring (§4.3/§7: "no log entry is
/// emitted from the handler itself" / §6: "a crash log populated by the
/// exception handler: register dump, faulting RVA, core state counters").
/// The VEH handler stamps a slot under a `try_lock` (mirrors
/// `hooks::CaptureRing`, which has the same "never block inside a handler"
/// constraint); the pipe thread turns populated slots into formatted lines
/// in the crash log on its next tick.
const CRASH_RING_LEN: usize = 32;

#[derive(Clone, Copy, Default)]
pub struct CrashRecord {
    /// Raw faulting address. Converted to a module-relative RVA at flush
    /// time (`flush_crash_ring`), not inside the handler — that conversion
    /// allocates (`CString`) and calls into loader state the handler should
    /// never touch.
    pub faulting_addr: u32,
    pub thread_id: u32,
    pub fault_ms: u32,
    pub exception_code: u32,
}

pub struct CrashRing {
    slots: [Mutex<CrashRecord>; CRASH_RING_LEN],
    next: std::sync::atomic::AtomicUsize,
}

impl CrashRing {
    const fn new() -> Self {
        #[allow(clippy::declare_interior_mutable_const)]
        const SLOT: Mutex<CrashRecord> = Mutex::new(CrashRecord {
            faulting_rva: 0,
            thread_id: 0,
            fault_ms: 0,
            exception_code: 0,
        });
        Self {
            slots: [SLOT; CRASH_RING_LEN],
            next: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    /// Called from the VEH handler. `try_lock` so a contended slot is
    /// simply skipped rather than blocking the handler.
    pub fn record(&self, record: CrashRecord) {
        use std::sync::atomic::Ordering;
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % CRASH_RING_LEN;
        if let Ok(mut slot) = self.slots[idx].try_lock() {
            *slot = record;
        }
    }

    pub fn drain(&self) -> Vec<CrashRecord> {
        self.slots
            .iter()
            .filter_map(|s| s.try_lock().ok())
            .map(|s| *s)
            .filter(|r| r.exception_code != 0)
            .collect()
    }
}

pub static CRASH_RING: CrashRing = CrashRing::new();
static CRASH_LOG_PATH: Mutex<Option<PathBuf>> = Mutex::new(None);

pub fn init_crash_log(path: PathBuf) {
    *CRASH_LOG_PATH.lock().unwrap() = Some(path);
}

/// Called from the pipe thread's cadence, never from the handler itself.
pub fn flush_crash_ring() {
    let records = CRASH_RING.drain();
    if records.is_empty() {
        return;
    }
    let path = CRASH_LOG_PATH.lock().unwrap().clone();
    let Some(path) = path else { return };
    let host_base = crate::locator::module_range(crate::locator::HOST_MODULE_NAME).map(|(b, _)| b);
    if let Ok(mut file) = OpenOptions::new().create(true).append(true).open(&path) {
        for r in records {
            let rva = match host_base {
                Some(base) if r.faulting_addr >= base => r.faulting_addr - base,
                _ => r.faulting_addr,
            };
            let _ = writeln!(
                file,
                "fault rva=0x{:08X} thread={} ms={} code=0x{:08X}",
                rva, r.thread_id, r.fault_ms, r.exception_code
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_ring_roundtrips_records() {
        let ring = CrashRing::new();
        ring.record(CrashRecord {
            faulting_addr: 0x1234,
            thread_id: 7,
            fault_ms: 42,
            exception_code: 0xC000_0005,
        });
        let drained = ring.drain();
        assert!(drained.iter().any(|r| r.faulting_addr == 0x1234 && r.thread_id == 7));
    }

    #[test]
    fn logger_buffers_without_a_path() {
        let logger = Logger::new();
        logger.log("hello");
        logger.flush();
        assert_eq!(logger.buffer.lock().unwrap().len(), 1);
    }
}
