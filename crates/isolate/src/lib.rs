//! Reduce a binary WebAssembly module to a subset of its functions.
//!
//! The pipeline is a single synchronous pass over the input bytes, a pair
//! of in-place passes over the shared function list, and a buffered write:
//!
//! 1. scan: walk the module section by section, collecting functions,
//!    call sites, and liveness roots ([`IsolateContext::scan`])
//! 2. mark: compute the keep-set from imports, caller-requested indices,
//!    and element-segment entries
//! 3. compact: assign each kept function a new contiguous index, and
//!    rewrite the function-index operands inside kept bodies
//! 4. write: replay the sections in their original order

mod liveness;
mod relocate;
mod scan;

use std::fmt;

use bumpalo::Bump;
use isolate_wasm_module::parse::ParseError;

pub use scan::IsolateContext;

#[derive(Debug)]
pub enum Error {
    /// The input module is structurally invalid (or uses an encoding this
    /// tool does not support)
    Parse(ParseError),
    /// The caller asked to keep a function index the module does not have
    UnknownFunction { index: u32, num_funcs: u32 },
}

impl From<ParseError> for Error {
    fn from(err: ParseError) -> Self {
        Error::Parse(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Parse(err) => write!(f, "{err}"),
            Error::UnknownFunction { index, num_funcs } => write!(
                f,
                "cannot isolate function {index}: the module only has {num_funcs} functions"
            ),
        }
    }
}

impl std::error::Error for Error {}

/// Isolate the requested functions (plus all imports and every function
/// referenced by an element segment) and return the complete transformed
/// module. The output is buffered so that nothing is committed if any
/// stage fails.
///
/// `requested` indices are in the module's combined import+declared
/// function index space.
pub fn isolate<'a>(
    arena: &'a Bump,
    wasm: &'a [u8],
    requested: &[u32],
    verbose: bool,
) -> Result<std::vec::Vec<u8>, Error> {
    let mut ctx = IsolateContext::scan(arena, wasm, verbose)?;

    liveness::mark_live(&mut ctx, requested)?;
    relocate::assign_new_indices(&mut ctx);
    relocate::relocate_bodies(arena, &mut ctx);

    if verbose {
        let kept = ctx.funcs.iter().filter(|func| func.keep).count();
        eprintln!("keeping {} of {} functions", kept, ctx.funcs.len());
    }

    let mut buffer = std::vec::Vec::with_capacity(wasm.len());
    ctx.write_module(&mut buffer);
    Ok(buffer)
}
