// error.rs — typed failures that cross the pipe boundary.
//
// Everything on the hot read/walk path (safe_mem, creature_map, stability)
// keeps the teacher's convention instead: Option/bool, never a constructed
// error value, because those paths run under a torn read and must not
// allocate or format a message while doing it. CoreError exists only for the
// handful of one-shot operations a consumer asks for explicitly over the
// pipe (installing a hook, running the locator) where reporting *why* it
// failed is part of the contract (§7: "Hook install failure — reported on
// the pipe").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("function prologue is not readable")]
    UnreadablePrologue,
    #[error("failed to allocate executable memory")]
    AllocExecFailed,
    #[error("failed to patch function prologue")]
    PatchFailed,
    #[error("no top-level window found to subclass")]
    NoCandidateWindow,
    #[error("pipe create failed (GetLastError={0})")]
    PipeCreateFailed(u32),
}

pub type CoreResult<T> = Result<T, CoreError>;
