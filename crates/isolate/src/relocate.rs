use bumpalo::collections::vec::Vec;
use bumpalo::Bump;

use isolate_wasm_module::internal_error;
use isolate_wasm_module::serialize::SerialBuffer;

use crate::IsolateContext;

/// Give every kept function its post-isolation index: a zero-based counter
/// over the kept functions in their original order, imports first. Kept
/// functions keep their relative order and end up with the smallest
/// possible contiguous index space.
pub fn assign_new_indices(ctx: &mut IsolateContext) {
    let mut next_index: u32 = 0;
    for func in ctx.funcs.iter_mut() {
        if func.keep {
            func.new_index = next_index;
            next_index += 1;
        }
    }
}

/// Rewrite the function-index operands inside every kept body to the new
/// index space, leaving all other bytes untouched.
///
/// Precondition: every call target of a kept function must itself be in
/// the keep-set. Liveness marking does not trace calls, so a violation
/// here means the roots were incomplete, which is an internal bug rather
/// than bad input.
pub fn relocate_bodies<'a>(arena: &'a Bump, ctx: &mut IsolateContext<'a>) {
    let new_indices = Vec::from_iter_in(
        ctx.funcs
            .iter()
            .map(|func| if func.keep { Some(func.new_index) } else { None }),
        arena,
    );

    for func in ctx.funcs.iter_mut() {
        if !func.keep || func.call_sites.is_empty() {
            continue;
        }

        let mut new_body = Vec::with_capacity_in(func.body.len(), arena);
        let mut copied_up_to: usize = 0;
        for site in func.call_sites.iter() {
            let operand_start = site.offset as usize;
            new_body.extend_from_slice(&func.body[copied_up_to..operand_start]);

            let new_index = match new_indices[site.target as usize] {
                Some(index) => index,
                None => internal_error!(
                    "call instruction targets function {} which is not in the keep set",
                    site.target
                ),
            };
            new_body.encode_u32(new_index);

            copied_up_to = operand_start + site.len as usize;
        }
        new_body.extend_from_slice(&func.body[copied_up_to..]);

        func.body = new_body;
    }
}
