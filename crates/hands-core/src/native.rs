//! Native call layer
//!
//! Calling-convention descriptors and closure trampolines built on libffi.
//! Every function signature handled here takes N pointer-sized arguments and
//! returns one pointer-sized value under the platform's default ABI. All raw
//! ABI work in the crate is confined to this module.

use hands_common::{Error, Result};
use libffi::low::{
    call, closure_alloc, closure_free, ffi_abi_FFI_DEFAULT_ABI, ffi_cif, ffi_closure, ffi_type,
    prep_cif, prep_closure, types, CodePtr,
};
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::ptr::{self, addr_of_mut};

/// Prepared call interface for `(ptr, ptr, ...) -> ptr`.
pub struct CallDescriptor {
    // Boxed so the address handed to libffi stays put when the descriptor moves.
    cif: Box<ffi_cif>,
    arg_types: Vec<*mut ffi_type>,
}

// The cif and the type table are never mutated after preparation.
unsafe impl Send for CallDescriptor {}
unsafe impl Sync for CallDescriptor {}

/// Largest argument count a descriptor or trampoline accepts.
pub const MAX_ARITY: usize = 64;

impl CallDescriptor {
    pub fn pointer_args(arity: usize) -> Result<Self> {
        if arity > MAX_ARITY {
            return Err(Error::ResourceExhausted(format!(
                "{} arguments exceeds the limit of {}",
                arity, MAX_ARITY
            )));
        }

        let mut arg_types: Vec<*mut ffi_type> = (0..arity)
            .map(|_| unsafe { addr_of_mut!(types::pointer) })
            .collect();
        let mut cif: Box<ffi_cif> = Box::new(unsafe { std::mem::zeroed() });

        unsafe {
            prep_cif(
                &mut *cif,
                ffi_abi_FFI_DEFAULT_ABI,
                arity,
                addr_of_mut!(types::pointer),
                if arity > 0 {
                    arg_types.as_mut_ptr()
                } else {
                    ptr::null_mut()
                },
            )
        }
        .map_err(|e| {
            Error::NativeCall(format!(
                "Failed to prepare call interface for {} arguments: {:?}",
                arity, e
            ))
        })?;

        Ok(Self { cif, arg_types })
    }

    pub fn arity(&self) -> usize {
        self.arg_types.len()
    }

    /// Call the function at `address` with `args`.
    ///
    /// # Safety
    /// `address` must be a function with this descriptor's signature; the
    /// callee may do anything the target process can do.
    pub unsafe fn invoke(&mut self, address: usize, args: &[usize]) -> Result<usize> {
        if args.len() != self.arity() {
            return Err(Error::NativeCall(format!(
                "Descriptor takes {} arguments, {} supplied",
                self.arity(),
                args.len()
            )));
        }

        let mut storage = args.to_vec();
        let mut values: Vec<*mut c_void> = storage
            .iter_mut()
            .map(|slot| slot as *mut usize as *mut c_void)
            .collect();

        Ok(call::<usize>(
            &mut *self.cif,
            CodePtr::from_ptr(address as *const c_void),
            if values.is_empty() {
                ptr::null_mut()
            } else {
                values.as_mut_ptr()
            },
        ))
    }
}

/// Receives the calls made to a [`Trampoline`].
pub trait TrampolineHandler: Send + Sync + 'static {
    fn invoke(&self, args: &[usize]) -> usize;
}

/// A natively callable address that forwards to a [`TrampolineHandler`].
///
/// Dropping the trampoline frees its code. Calling the address afterwards,
/// or while the drop is in progress, is undefined.
pub struct Trampoline<H: TrampolineHandler> {
    closure: *mut ffi_closure,
    code: CodePtr,
    // Referenced by the closure; must outlive it.
    _descriptor: CallDescriptor,
    handler: Box<H>,
}

unsafe impl<H: TrampolineHandler> Send for Trampoline<H> {}
unsafe impl<H: TrampolineHandler> Sync for Trampoline<H> {}

impl<H: TrampolineHandler> Trampoline<H> {
    pub fn new(arity: usize, handler: H) -> Result<Self> {
        let mut descriptor = CallDescriptor::pointer_args(arity)?;
        let handler = Box::new(handler);

        let (closure, code) = closure_alloc();
        if closure.is_null() {
            return Err(Error::ResourceExhausted(
                "Failed to allocate closure trampoline".into(),
            ));
        }

        let prepared = unsafe {
            prep_closure(
                closure,
                &mut *descriptor.cif,
                trampoline_entry::<H>,
                &*handler as *const H,
                code,
            )
        };
        if let Err(e) = prepared {
            unsafe { closure_free(closure) };
            return Err(Error::NativeCall(format!(
                "Failed to prepare closure for {} arguments: {:?}",
                arity, e
            )));
        }

        Ok(Self {
            closure,
            code,
            _descriptor: descriptor,
            handler,
        })
    }

    /// Entry address native code calls.
    pub fn address(&self) -> usize {
        self.code.as_ptr() as usize
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: TrampolineHandler> Drop for Trampoline<H> {
    fn drop(&mut self) {
        unsafe { closure_free(self.closure) };
    }
}

/// Shared entry point of every trampoline. Never unwinds into the caller.
unsafe extern "C" fn trampoline_entry<H: TrampolineHandler>(
    cif: &ffi_cif,
    result: &mut usize,
    args: *const *const c_void,
    handler: &H,
) {
    let arity = cif.nargs as usize;
    let mut values = Vec::with_capacity(arity);
    for i in 0..arity {
        values.push(*(*args.add(i) as *const usize));
    }

    *result = panic::catch_unwind(AssertUnwindSafe(|| handler.invoke(&values))).unwrap_or(0);
}
