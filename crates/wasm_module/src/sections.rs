use bumpalo::collections::vec::Vec;
use bumpalo::Bump;

use crate::serialize::SerialBuffer;

#[repr(u8)]
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum SectionId {
    Custom = 0,
    Type = 1,
    Import = 2,
    Function = 3,
    Table = 4,
    Memory = 5,
    Global = 6,
    Export = 7,
    Start = 8,
    Element = 9,
    Code = 10,
    Data = 11,
    DataCount = 12,
    Tag = 13,
}

/*******************************************************************
 *
 * The function index space
 *
 * Imports first, then locally declared functions, in declaration
 * order. The whole pipeline shares this one list: the scan appends to
 * it, liveness marking and index reallocation mutate it, and the
 * section writers read it at output time.
 *
 *******************************************************************/

/// A function-index operand found inside a body during the scan:
/// the operand of a `call`, `return_call`, or `ref.func`.
#[derive(Clone, Copy, Debug)]
pub struct CallSite {
    /// Byte offset of the operand within the body
    pub offset: u32,
    /// Encoded length of the operand as it appeared in the input
    pub len: u8,
    /// The pre-isolation function index it refers to
    pub target: u32,
}

#[derive(Debug)]
pub struct WasmFunction<'a> {
    pub type_index: u32,
    /// Locals declarations plus instructions. Empty for imports, and for
    /// declared functions until the code section has been scanned.
    pub body: Vec<'a, u8>,
    /// Function-index operands found in `body`, in order
    pub call_sites: Vec<'a, CallSite>,
    pub keep: bool,
    pub new_index: u32,
}

impl<'a> WasmFunction<'a> {
    pub fn new(arena: &'a Bump, type_index: u32) -> Self {
        WasmFunction {
            type_index,
            body: Vec::new_in(arena),
            call_sites: Vec::new_in(arena),
            keep: false,
            new_index: 0,
        }
    }
}

/*******************************************************************
 *
 * Sections
 *
 * Collected in encounter order during the scan and replayed in that
 * order at output time. The function and code sections are views over
 * the shared function list (by index position, so there is no aliasing
 * of the list itself); everything else is an opaque byte blob.
 *
 *******************************************************************/

#[derive(Debug)]
pub enum Section<'a> {
    /// Passed through byte-identical
    Plain { id: u8, bytes: &'a [u8] },
    /// Regenerated from the function list at write time.
    /// `funcs_start` is the position of the first declared (non-import)
    /// function in the shared list.
    Function { funcs_start: usize },
    Code { funcs_start: usize },
}

pub struct SectionHeaderIndices {
    size_index: usize,
    body_index: usize,
}

/// Write a section header, returning the position of the encoded length
pub fn write_section_header<B: SerialBuffer>(buffer: &mut B, id: SectionId) -> SectionHeaderIndices {
    buffer.append_u8(id as u8);
    let size_index = buffer.reserve_padded_u32();
    let body_index = buffer.size();
    SectionHeaderIndices {
        size_index,
        body_index,
    }
}

/// Update a section header with its final size, after writing the bytes
pub fn update_section_size<B: SerialBuffer>(buffer: &mut B, header_indices: SectionHeaderIndices) {
    let size = buffer.size() - header_indices.body_index;
    buffer.overwrite_padded_u32(header_indices.size_index, size as u32);
}

impl<'a> Section<'a> {
    /// Serialize this section. The function and code variants derive their
    /// contents from the (by now fully marked and relocated) function list,
    /// so no separate resync pass is needed.
    pub fn write<B: SerialBuffer>(&self, funcs: &[WasmFunction<'a>], buffer: &mut B) {
        match self {
            Section::Plain { id, bytes } => {
                buffer.append_u8(*id);
                buffer.encode_u32(bytes.len() as u32);
                buffer.append_slice(bytes);
            }
            Section::Function { funcs_start } => {
                let header_indices = write_section_header(buffer, SectionId::Function);
                let kept = funcs[*funcs_start..].iter().filter(|f| f.keep);
                buffer.encode_u32(kept.clone().count() as u32);
                for func in kept {
                    buffer.encode_u32(func.type_index);
                }
                update_section_size(buffer, header_indices);
            }
            Section::Code { funcs_start } => {
                let header_indices = write_section_header(buffer, SectionId::Code);
                let kept = funcs[*funcs_start..].iter().filter(|f| f.keep);
                buffer.encode_u32(kept.clone().count() as u32);
                for func in kept {
                    buffer.encode_u32(func.body.len() as u32);
                    buffer.append_slice(&func.body);
                }
                update_section_size(buffer, header_indices);
            }
        }
    }
}
