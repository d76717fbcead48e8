//! Outbound calls into target code
//!
//! The protocol carries no signature information, so every argument is a
//! pointer-sized value and so is the result.

use crate::fault;
use crate::native::CallDescriptor;
use hands_common::{Error, Result};
use tracing::{debug, warn};

/// Call the function at `address` with `arguments`.
///
/// The descriptor is built per call. A fault inside the callee comes back
/// as [`Error::Fault`].
pub fn call_function(address: usize, arguments: &[u64]) -> Result<usize> {
    if address == 0 {
        return Err(Error::InvalidAddress(address));
    }

    let mut descriptor = CallDescriptor::pointer_args(arguments.len())?;
    let args: Vec<usize> = arguments.iter().map(|value| *value as usize).collect();

    debug!(
        target: "hands_core::call",
        address = format!("{:#x}", address),
        arg_count = args.len(),
        "Calling native function"
    );

    let result = fault::guarded(|| unsafe { descriptor.invoke(address, &args) })
        .and_then(|inner| inner);

    match &result {
        Ok(value) => {
            debug!(target: "hands_core::call", address = format!("{:#x}", address), result = format!("{:#x}", value), "Native call returned")
        }
        Err(e) => {
            warn!(target: "hands_core::call", address = format!("{:#x}", address), error = %e, "Native call failed")
        }
    }
    result
}
