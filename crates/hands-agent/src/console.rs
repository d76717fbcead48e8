//! Console allocation for agents injected into GUI processes

#[cfg(windows)]
use tracing::info;
use tracing::warn;

/// Give the process a console. False if one could not be created,
/// including when the process already has one.
#[cfg(windows)]
pub fn allocate() -> bool {
    use windows::Win32::System::Console::AllocConsole;

    // Rust's std handles are looked up on every write, so output goes to
    // the new console without reopening stdout/stderr.
    match unsafe { AllocConsole() } {
        Ok(()) => {
            info!(target: "hands_agent::console", "Console allocated");
            true
        }
        Err(e) => {
            warn!(target: "hands_agent::console", error = %e, "AllocConsole failed");
            false
        }
    }
}

#[cfg(not(windows))]
pub fn allocate() -> bool {
    warn!(target: "hands_agent::console", "Console allocation is not supported on this platform");
    false
}
