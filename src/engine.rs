//! Pluggable primary wake-word engine.
//!
//! The arbitration code depends only on the [`WakeEngine`] capability.
//! The production implementation resolves convention-named C symbols
//! from a vendor module at startup; absence or load failure degrades the
//! pipeline to fallback-only mode rather than aborting.

use std::ffi::c_void;
use std::path::Path;

use libloading::Library;
use thiserror::Error;
use tracing::{info, warn};

use crate::capture::Sample;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("failed to load engine module: {0}")]
    Load(String),

    #[error("engine module is missing symbol {0}")]
    Symbol(String),

    #[error("engine initialization failed: {0}")]
    Init(String),
}

/// Signal-processing contract of the primary detector.
pub trait WakeEngine {
    /// Process one reference block. Returns the keyword start offset in
    /// samples, or zero when nothing was detected this block.
    fn process_signal(
        &mut self,
        block: &[Sample],
        notify: bool,
        iteration: i32,
        trigger_enabled: bool,
    ) -> i32;
}

type CreateFn = unsafe extern "C" fn() -> *mut c_void;
type ProcessFn =
    unsafe extern "C" fn(*mut c_void, *const Sample, usize, i32, i32, i32) -> i32;
type DestroyFn = unsafe extern "C" fn(*mut c_void);

const CREATE_SYMBOL: &[u8] = b"voice_engine_create\0";
const PROCESS_SYMBOL: &[u8] = b"voice_engine_process\0";
const DESTROY_SYMBOL: &[u8] = b"voice_engine_destroy\0";

/// A wake-word engine resolved from a shared module at startup.
///
/// The module exports `voice_engine_create`, `voice_engine_process` and
/// `voice_engine_destroy`; the opaque handle returned by create is owned
/// here for the process lifetime.
pub struct LoadedWakeEngine {
    handle: *mut c_void,
    process: ProcessFn,
    destroy: DestroyFn,
    // Keeps the module mapped while the function pointers live.
    _library: Library,
}

impl LoadedWakeEngine {
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let library =
            unsafe { Library::new(path) }.map_err(|e| EngineError::Load(e.to_string()))?;

        let create = Self::symbol::<CreateFn>(&library, CREATE_SYMBOL)?;
        let process = Self::symbol::<ProcessFn>(&library, PROCESS_SYMBOL)?;
        let destroy = Self::symbol::<DestroyFn>(&library, DESTROY_SYMBOL)?;

        let handle = unsafe { create() };
        if handle.is_null() {
            return Err(EngineError::Init("create returned a null handle".into()));
        }

        info!(path = %path.display(), "wake-word engine module loaded");
        Ok(Self {
            handle,
            process,
            destroy,
            _library: library,
        })
    }

    fn symbol<T: Copy>(library: &Library, name: &[u8]) -> Result<T, EngineError> {
        unsafe { library.get::<T>(name) }
            .map(|symbol| *symbol)
            .map_err(|_| EngineError::Symbol(String::from_utf8_lossy(name).into_owned()))
    }
}

impl WakeEngine for LoadedWakeEngine {
    fn process_signal(
        &mut self,
        block: &[Sample],
        notify: bool,
        iteration: i32,
        trigger_enabled: bool,
    ) -> i32 {
        unsafe {
            (self.process)(
                self.handle,
                block.as_ptr(),
                block.len(),
                notify as i32,
                iteration,
                trigger_enabled as i32,
            )
        }
    }
}

impl Drop for LoadedWakeEngine {
    fn drop(&mut self) {
        unsafe { (self.destroy)(self.handle) }
    }
}

/// Load the primary engine if a module path is configured.
///
/// Any failure is logged and reported as `None`: the pipeline then runs
/// with the fallback engine as the sole detector.
pub fn load_wake_engine(path: Option<&Path>) -> Option<Box<dyn WakeEngine>> {
    let path = path?;
    match LoadedWakeEngine::load(path) {
        Ok(engine) => Some(Box::new(engine)),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "wake-word engine unavailable, continuing fallback-only"
            );
            None
        }
    }
}

/// Replays a fixed sequence of offsets; for tests.
pub struct ScriptedWakeEngine {
    offsets: std::collections::VecDeque<i32>,
    pub calls: u32,
}

impl ScriptedWakeEngine {
    pub fn new(offsets: Vec<i32>) -> Self {
        Self {
            offsets: offsets.into(),
            calls: 0,
        }
    }
}

impl WakeEngine for ScriptedWakeEngine {
    fn process_signal(
        &mut self,
        _block: &[Sample],
        _notify: bool,
        _iteration: i32,
        _trigger_enabled: bool,
    ) -> i32 {
        self.calls += 1;
        self.offsets.pop_front().unwrap_or(0)
    }
}
