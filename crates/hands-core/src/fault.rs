//! Fault containment
//!
//! [`guarded`] runs a closure that may touch bad memory or jump to a bad
//! address. A SIGSEGV/SIGBUS (or an access violation on Windows) raised by
//! the closure's own thread is turned into [`Error::Fault`] instead of
//! killing the process.
//!
//! The handlers are process-wide. They are installed when the first guarded
//! scope opens and the previous handlers are put back when the last one
//! closes, on every exit path. A fault on a thread that is not inside a
//! guarded scope is passed on to whatever handler was there before.
//!
//! On Windows an access violation on the guarded thread is caught by a
//! vectored exception handler and reported with the exception code in place
//! of the signal number. 32-bit Windows has no recovery: the closure simply
//! runs.

use hands_common::{Error, Result};
use std::panic::{self, AssertUnwindSafe};

/// Run `f`, converting a hardware fault inside it into an error.
///
/// Recovery does not unwind the frames between the fault and this call, so
/// anything they own is leaked. A panic inside `f` propagates.
pub fn guarded<R, F>(f: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    let mut f = Some(f);
    let mut outcome = None;

    let fault = {
        let mut body = || {
            if let Some(f) = f.take() {
                outcome = Some(panic::catch_unwind(AssertUnwindSafe(f)));
            }
        };
        imp::run_protected(&mut body)?
    };

    if let Some((signal, address)) = fault {
        return Err(Error::Fault { signal, address });
    }

    match outcome {
        Some(Ok(value)) => Ok(value),
        Some(Err(payload)) => panic::resume_unwind(payload),
        None => Err(Error::Internal("guarded scope did not run".into())),
    }
}

#[cfg(unix)]
mod imp {
    use hands_common::{Error, Result};
    use libc::{c_int, c_void, siginfo_t};
    use parking_lot::Mutex;
    use std::cell::{Cell, UnsafeCell};
    use std::mem::MaybeUninit;
    use std::ptr;
    use tracing::debug;

    const SIGNALS: [c_int; 2] = [libc::SIGSEGV, libc::SIGBUS];

    /// Storage for the C library's `sigjmp_buf`; larger than any supported
    /// platform's definition.
    #[repr(C, align(16))]
    struct JmpBuf([u64; 64]);

    extern "C" {
        #[cfg_attr(all(target_os = "linux", target_env = "gnu"), link_name = "__sigsetjmp")]
        fn sigsetjmp(env: *mut JmpBuf, savesigs: c_int) -> c_int;
        fn siglongjmp(env: *mut JmpBuf, val: c_int) -> !;
    }

    /// One active guarded scope on the current thread.
    struct Frame {
        env: JmpBuf,
        previous: *mut Frame,
        signal: c_int,
        address: usize,
    }

    thread_local! {
        static CURRENT: Cell<*mut Frame> = const { Cell::new(ptr::null_mut()) };
    }

    struct SavedActions(UnsafeCell<[MaybeUninit<libc::sigaction>; 2]>);

    // Written only under INSTALLED while no guarded scope is open; read by the
    // handler while one is.
    unsafe impl Sync for SavedActions {}

    static SAVED: SavedActions = SavedActions(UnsafeCell::new([MaybeUninit::uninit(); 2]));

    /// Number of open guarded scopes across all threads.
    static INSTALLED: Mutex<usize> = Mutex::new(0);

    struct HandlerScope;

    impl HandlerScope {
        fn enter() -> Result<Self> {
            let mut count = INSTALLED.lock();
            if *count == 0 {
                install()?;
            }
            *count += 1;
            Ok(HandlerScope)
        }
    }

    impl Drop for HandlerScope {
        fn drop(&mut self) {
            let mut count = INSTALLED.lock();
            *count -= 1;
            if *count == 0 {
                restore();
            }
        }
    }

    fn install() -> Result<()> {
        let saved = SAVED.0.get() as *mut libc::sigaction;
        for (i, signal) in SIGNALS.iter().enumerate() {
            unsafe {
                let mut action: libc::sigaction = std::mem::zeroed();
                action.sa_sigaction = handle_fault as *const () as libc::sighandler_t;
                action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
                libc::sigemptyset(&mut action.sa_mask);

                if libc::sigaction(*signal, &action, saved.add(i)) != 0 {
                    let err = std::io::Error::last_os_error();
                    for (j, installed) in SIGNALS.iter().enumerate().take(i) {
                        libc::sigaction(*installed, saved.add(j), ptr::null_mut());
                    }
                    return Err(Error::Internal(format!(
                        "Failed to install fault handler for signal {}: {}",
                        signal, err
                    )));
                }
            }
        }
        debug!(target: "hands_core::fault", "Fault handlers installed");
        Ok(())
    }

    fn restore() {
        let saved = SAVED.0.get() as *const libc::sigaction;
        for (i, signal) in SIGNALS.iter().enumerate() {
            unsafe {
                libc::sigaction(*signal, saved.add(i), ptr::null_mut());
            }
        }
        debug!(target: "hands_core::fault", "Fault handlers restored");
    }

    fn saved_action(signal: c_int) -> *const libc::sigaction {
        let index = SIGNALS.iter().position(|s| *s == signal).unwrap_or(0);
        unsafe { (SAVED.0.get() as *const libc::sigaction).add(index) }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    unsafe fn fault_address(info: *const siginfo_t) -> usize {
        if info.is_null() {
            0
        } else {
            (*info).si_addr() as usize
        }
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    unsafe fn fault_address(info: *const siginfo_t) -> usize {
        if info.is_null() {
            0
        } else {
            (*info).si_addr as usize
        }
    }

    extern "C" fn handle_fault(signal: c_int, info: *mut siginfo_t, context: *mut c_void) {
        let frame = CURRENT.with(|current| current.get());
        unsafe {
            if !frame.is_null() {
                (*frame).signal = signal;
                (*frame).address = fault_address(info);
                siglongjmp(&mut (*frame).env, 1);
            }

            // Not ours. Hand over to the handler that was there before.
            let previous = &*saved_action(signal);
            let handler = previous.sa_sigaction;
            if handler == libc::SIG_DFL || handler == libc::SIG_IGN {
                // Re-executing the faulting instruction triggers the default.
                libc::sigaction(signal, previous, ptr::null_mut());
            } else if previous.sa_flags & libc::SA_SIGINFO != 0 {
                let chained: extern "C" fn(c_int, *mut siginfo_t, *mut c_void) =
                    std::mem::transmute(handler);
                chained(signal, info, context);
            } else {
                let chained: extern "C" fn(c_int) = std::mem::transmute(handler);
                chained(signal);
            }
        }
    }

    /// Returns the fault `(signal, address)` if `body` trapped.
    #[inline(never)]
    pub(super) fn run_protected(body: &mut dyn FnMut()) -> Result<Option<(c_int, usize)>> {
        let _scope = HandlerScope::enter()?;

        let mut frame = Frame {
            env: JmpBuf([0; 64]),
            previous: CURRENT.with(|current| current.get()),
            signal: 0,
            address: 0,
        };
        let frame_ptr: *mut Frame = &mut frame;
        CURRENT.with(|current| current.set(frame_ptr));

        unsafe {
            if sigsetjmp(ptr::addr_of_mut!((*frame_ptr).env), 1) == 0 {
                body();
                let frame = CURRENT.with(|current| current.get());
                CURRENT.with(|current| current.set((*frame).previous));
                Ok(None)
            } else {
                // Locals may not survive the jump; re-read through the thread-local.
                let frame = CURRENT.with(|current| current.get());
                CURRENT.with(|current| current.set((*frame).previous));
                Ok(Some((
                    ptr::read_volatile(&(*frame).signal),
                    ptr::read_volatile(&(*frame).address),
                )))
            }
        }
    }
}

#[cfg(all(windows, any(target_arch = "x86_64", target_arch = "aarch64")))]
mod imp {
    use hands_common::{Error, Result};
    use parking_lot::Mutex;
    use std::cell::Cell;
    use std::ffi::c_void;
    use std::ptr;
    use tracing::debug;
    use windows::Win32::Foundation::{EXCEPTION_ACCESS_VIOLATION, EXCEPTION_IN_PAGE_ERROR};
    use windows::Win32::System::Diagnostics::Debug::{
        AddVectoredExceptionHandler, RemoveVectoredExceptionHandler, RtlCaptureContext,
        RtlRestoreContext, CONTEXT, EXCEPTION_CONTINUE_SEARCH, EXCEPTION_POINTERS,
    };

    /// One active guarded scope on the current thread.
    struct Frame {
        context: CONTEXT,
        previous: *mut Frame,
        faulted: bool,
        code: i32,
        address: usize,
    }

    thread_local! {
        static CURRENT: Cell<*mut Frame> = const { Cell::new(ptr::null_mut()) };
    }

    struct Registration {
        scopes: usize,
        handle: usize,
    }

    static INSTALLED: Mutex<Registration> = Mutex::new(Registration {
        scopes: 0,
        handle: 0,
    });

    struct HandlerScope;

    impl HandlerScope {
        fn enter() -> Result<Self> {
            let mut registration = INSTALLED.lock();
            if registration.scopes == 0 {
                let handle = unsafe { AddVectoredExceptionHandler(1, Some(handle_exception)) };
                if handle.is_null() {
                    return Err(Error::Internal(
                        "Failed to install vectored exception handler".into(),
                    ));
                }
                registration.handle = handle as usize;
                debug!(target: "hands_core::fault", "Exception handler installed");
            }
            registration.scopes += 1;
            Ok(HandlerScope)
        }
    }

    impl Drop for HandlerScope {
        fn drop(&mut self) {
            let mut registration = INSTALLED.lock();
            registration.scopes -= 1;
            if registration.scopes == 0 {
                unsafe { RemoveVectoredExceptionHandler(registration.handle as *const c_void) };
                registration.handle = 0;
                debug!(target: "hands_core::fault", "Exception handler removed");
            }
        }
    }

    unsafe extern "system" fn handle_exception(info: *mut EXCEPTION_POINTERS) -> i32 {
        let frame = CURRENT.with(|current| current.get());
        if frame.is_null() || info.is_null() || (*info).ExceptionRecord.is_null() {
            return EXCEPTION_CONTINUE_SEARCH;
        }

        let record = &*(*info).ExceptionRecord;
        if record.ExceptionCode != EXCEPTION_ACCESS_VIOLATION
            && record.ExceptionCode != EXCEPTION_IN_PAGE_ERROR
        {
            return EXCEPTION_CONTINUE_SEARCH;
        }

        (*frame).faulted = true;
        (*frame).code = record.ExceptionCode.0;
        (*frame).address = if record.NumberParameters >= 2 {
            record.ExceptionInformation[1]
        } else {
            record.ExceptionAddress as usize
        };
        // Resumes inside run_protected, right after the capture.
        RtlRestoreContext(&(*frame).context, None);
        EXCEPTION_CONTINUE_SEARCH
    }

    /// Returns the fault `(exception code, address)` if `body` trapped.
    #[inline(never)]
    pub(super) fn run_protected(body: &mut dyn FnMut()) -> Result<Option<(i32, usize)>> {
        let _scope = HandlerScope::enter()?;

        let mut frame = Frame {
            context: unsafe { std::mem::zeroed() },
            previous: CURRENT.with(|current| current.get()),
            faulted: false,
            code: 0,
            address: 0,
        };
        let frame_ptr: *mut Frame = &mut frame;
        CURRENT.with(|current| current.set(frame_ptr));

        unsafe {
            RtlCaptureContext(ptr::addr_of_mut!((*frame_ptr).context));
            // Reached twice after a fault: once on capture, once on restore.
            let frame = CURRENT.with(|current| current.get());
            if !ptr::read_volatile(&(*frame).faulted) {
                body();
                let frame = CURRENT.with(|current| current.get());
                CURRENT.with(|current| current.set((*frame).previous));
                Ok(None)
            } else {
                CURRENT.with(|current| current.set((*frame).previous));
                Ok(Some((
                    ptr::read_volatile(&(*frame).code),
                    ptr::read_volatile(&(*frame).address),
                )))
            }
        }
    }
}

#[cfg(all(windows, not(any(target_arch = "x86_64", target_arch = "aarch64"))))]
mod imp {
    use hands_common::Result;

    pub(super) fn run_protected(body: &mut dyn FnMut()) -> Result<Option<(i32, usize)>> {
        body();
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_returns_value() {
        assert_eq!(guarded(|| 40 + 2).unwrap(), 42);
    }

    #[test]
    fn test_guarded_nested() {
        let value = guarded(|| guarded(|| 7).unwrap() * 2).unwrap();
        assert_eq!(value, 14);
    }

    #[test]
    #[should_panic(expected = "inner panic")]
    fn test_guarded_propagates_panic() {
        let _ = guarded(|| panic!("inner panic"));
    }

    #[cfg(unix)]
    #[test]
    fn test_guarded_recovers_from_segfault() {
        let page = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(page, libc::MAP_FAILED);

        let address = page as usize;
        let result = guarded(|| unsafe { std::ptr::read_volatile(address as *const u8) });
        match result {
            Err(Error::Fault { address: at, .. }) => assert_eq!(at, address),
            other => panic!("expected fault, got {:?}", other),
        }

        // Still usable afterwards.
        assert_eq!(guarded(|| 1).unwrap(), 1);
        unsafe { libc::munmap(page, 4096) };
    }

    #[cfg(all(windows, target_arch = "x86_64"))]
    #[test]
    fn test_guarded_recovers_from_access_violation() {
        use windows::Win32::System::Memory::{
            VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_NOACCESS,
        };

        let page = unsafe { VirtualAlloc(None, 4096, MEM_COMMIT | MEM_RESERVE, PAGE_NOACCESS) };
        assert!(!page.is_null());

        let address = page as usize;
        let result = guarded(|| unsafe { std::ptr::read_volatile(address as *const u8) });
        match result {
            Err(Error::Fault { signal, address: at }) => {
                assert_eq!(signal, windows::Win32::Foundation::EXCEPTION_ACCESS_VIOLATION.0);
                assert_eq!(at, address);
            }
            other => panic!("expected fault, got {:?}", other),
        }

        assert_eq!(guarded(|| 1).unwrap(), 1);
        unsafe { VirtualFree(page, 0, MEM_RELEASE) }.unwrap();
    }
}
