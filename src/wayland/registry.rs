//! Selection of the registry globals a recording needs

use wayland_client::globals::Global;

use crate::error::{RecorderError, Result};

pub const MANAGER_INTERFACE: &str = "lipstick_recorder_manager";
pub const SHM_INTERFACE: &str = "wl_shm";
pub const OUTPUT_INTERFACE: &str = "wl_output";

/// Registry name and advertised version of one global
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalRef {
    pub name: u32,
    pub version: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequiredGlobals {
    pub manager: GlobalRef,
    pub shm: GlobalRef,
    /// The output that gets recorded: the first one advertised
    pub output: GlobalRef,
}

/// Pick the capture manager, the shm allocator and the first output
///
/// Everything else in the registry is ignored. A missing capture manager is
/// reported before any other missing global.
pub fn select_globals(globals: &[Global]) -> Result<RequiredGlobals> {
    let find = |interface: &str| {
        globals
            .iter()
            .find(|g| g.interface == interface)
            .map(|g| GlobalRef {
                name: g.name,
                version: g.version,
            })
    };

    let manager = find(MANAGER_INTERFACE).ok_or(RecorderError::CaptureUnsupported)?;
    let shm = find(SHM_INTERFACE).ok_or(RecorderError::ShmUnavailable)?;
    let output = find(OUTPUT_INTERFACE).ok_or(RecorderError::NoOutput)?;

    Ok(RequiredGlobals {
        manager,
        shm,
        output,
    })
}
