use bitvec::vec::BitVec;

use crate::{Error, IsolateContext};

/// Compute the keep-set and mark every function accordingly.
///
/// Roots are: all imported functions, the caller-requested indices, and
/// every index an element segment referenced. Functions that are merely
/// called from kept bodies are NOT traced. The relocator treats a call
/// into the dropped set as a broken internal invariant, so callers must
/// request every function their chosen ones reach.
pub fn mark_live(ctx: &mut IsolateContext, requested: &[u32]) -> Result<(), Error> {
    let num_funcs = ctx.funcs.len();
    let mut live_flags: BitVec<usize> = BitVec::repeat(false, num_funcs);

    // All imports are kept unconditionally. Pruning unreferenced imports
    // would shift the index space under the import section we pass
    // through, so it is out of scope here.
    for index in 0..ctx.num_imported_funcs {
        live_flags.set(index, true);
    }

    for &index in requested {
        if index as usize >= num_funcs {
            return Err(Error::UnknownFunction {
                index,
                num_funcs: num_funcs as u32,
            });
        }
        live_flags.set(index as usize, true);
    }

    // Element-segment entries were bounds-checked during the scan
    for &index in ctx.declared_funcs.iter() {
        live_flags.set(index as usize, true);
    }

    for (index, func) in ctx.funcs.iter_mut().enumerate() {
        func.keep = live_flags[index];
    }

    Ok(())
}
