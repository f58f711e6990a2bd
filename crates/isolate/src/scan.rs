use bumpalo::collections::vec::Vec;
use bumpalo::Bump;

use isolate_wasm_module::opcodes::{skip_instruction, OpCode};
use isolate_wasm_module::parse::{Cursor, ParseError};
use isolate_wasm_module::sections::{CallSite, Section, WasmFunction};
use isolate_wasm_module::serialize::SerialBuffer;
use isolate_wasm_module::{WASM_MAGIC, WASM_VERSION};

/// All the state one isolation run threads through its stages: the shared
/// function list, the sections in encounter order, and the liveness roots
/// discovered while scanning.
pub struct IsolateContext<'a> {
    pub funcs: Vec<'a, WasmFunction<'a>>,
    pub sections: Vec<'a, Section<'a>>,
    pub num_imported_funcs: usize,
    /// Function indices referenced by element segments. These must be kept
    /// so that tables (and `ref.func` declarations) stay valid.
    pub declared_funcs: Vec<'a, u32>,
}

impl<'a> IsolateContext<'a> {
    /// Walk the module section by section. Sections the isolation cares
    /// about are decoded structurally; export and start sections are
    /// dropped; everything else is kept as an opaque blob to pass through
    /// unchanged.
    pub fn scan(arena: &'a Bump, wasm: &'a [u8], verbose: bool) -> Result<Self, ParseError> {
        let mut cursor = Cursor::new(wasm);
        cursor.expect("magic number", &WASM_MAGIC)?;
        cursor.expect("version number", &WASM_VERSION)?;

        let mut ctx = IsolateContext {
            funcs: Vec::new_in(arena),
            sections: Vec::new_in(arena),
            num_imported_funcs: 0,
            declared_funcs: Vec::new_in(arena),
        };

        while !cursor.at_end() {
            let id = cursor.read_byte("section id")?;
            let size = cursor.read_u32("section size")?;
            let body_start = cursor.offset();
            let body_end = body_start + size as usize;
            if body_end > wasm.len() {
                return Err(ParseError {
                    offset: body_start,
                    message: format!("section with id {id}: extends past the end of the file"),
                });
            }
            let body = &wasm[body_start..body_end];

            if verbose {
                eprintln!("section with id {id}, size {size}");
            }

            match id {
                0 => {
                    // Custom sections are dropped. A name-section rebuild
                    // would slot in here if we ever regenerate one.
                    let name = cursor.read_name("custom section name")?;
                    if cursor.offset() > body_end {
                        return Err(ParseError {
                            offset: body_start,
                            message: "custom section name: extends past the end of the section"
                                .into(),
                        });
                    }
                    if verbose {
                        eprintln!("dropping custom section \"{name}\"");
                    }
                    let remaining = body_end - cursor.offset();
                    cursor.read_n("custom section contents", remaining)?;
                }
                2 => {
                    ctx.sections.push(Section::Plain { id, bytes: body });
                    ctx.scan_import_section(arena, &mut cursor)?;
                }
                3 => {
                    ctx.scan_function_section(arena, &mut cursor)?;
                }
                7 | 8 => {
                    // A function subset has no use for export names or a
                    // start function
                    cursor.read_n("section contents", size as usize)?;
                }
                9 => {
                    ctx.sections.push(Section::Plain { id, bytes: body });
                    ctx.scan_element_section(&mut cursor)?;
                }
                10 => {
                    ctx.scan_code_section(arena, &mut cursor)?;
                }
                _ => {
                    cursor.read_n("section contents", size as usize)?;
                    ctx.sections.push(Section::Plain { id, bytes: body });
                }
            }

            if cursor.offset() != body_end {
                return Err(ParseError {
                    offset: cursor.offset(),
                    message: format!(
                        "section with id {id}: expected to end at offset {body_end}"
                    ),
                });
            }
        }

        Ok(ctx)
    }

    /// The import section is re-emitted unchanged; we only parse it to
    /// count imported functions (which anchor the function index space)
    /// and to skip the other import kinds correctly.
    fn scan_import_section(
        &mut self,
        arena: &'a Bump,
        cursor: &mut Cursor<'a>,
    ) -> Result<(), ParseError> {
        let num_imports = cursor.read_u32("num imports")?;
        for _ in 0..num_imports {
            cursor.read_name("import module")?;
            cursor.read_name("import name")?;

            let kind_at = cursor.offset();
            let kind = cursor.read_byte("import kind")?;
            match kind {
                0x00 => {
                    let type_index = cursor.read_u32("type of imported function")?;
                    self.funcs.push(WasmFunction::new(arena, type_index));
                    self.num_imported_funcs += 1;
                }
                0x01 => {
                    cursor.read_table_type("type of imported table")?;
                }
                0x02 => {
                    cursor.read_mem_type("type of imported memory")?;
                }
                0x03 => {
                    cursor.read_global_type("type of imported global")?;
                }
                0x04 => {
                    cursor.read_tag_type("type of imported tag")?;
                }
                other => {
                    return Err(ParseError {
                        offset: kind_at,
                        message: format!("import kind: unknown kind 0x{other:02x}"),
                    });
                }
            }
        }
        Ok(())
    }

    fn scan_function_section(
        &mut self,
        arena: &'a Bump,
        cursor: &mut Cursor<'a>,
    ) -> Result<(), ParseError> {
        let funcs_start = self.funcs.len();
        let num_funcs = cursor.read_u32("num functions")?;
        for _ in 0..num_funcs {
            let type_index = cursor.read_u32("function type index")?;
            self.funcs.push(WasmFunction::new(arena, type_index));
        }
        self.sections.push(Section::Function { funcs_start });
        Ok(())
    }

    /// The element section is re-emitted unchanged; its only effect on the
    /// pipeline is the liveness roots it contributes. Flags: bit 0 set
    /// means the segment is passive or declarative, bit 1 selects an
    /// explicit table index (when active), bit 2 switches the entries to
    /// expression encoding, which we do not support.
    fn scan_element_section(&mut self, cursor: &mut Cursor<'a>) -> Result<(), ParseError> {
        let num_segments = cursor.read_u32("num element segments")?;
        for _ in 0..num_segments {
            let flags_at = cursor.offset();
            let flags = cursor.read_u32("element segment flags")?;
            if flags & 0b100 != 0 {
                return Err(ParseError {
                    offset: flags_at,
                    message: "element segment flags: expression-encoded element segments are not \
                              supported"
                        .into(),
                });
            }

            let active = flags & 0b001 == 0;
            if active && flags & 0b010 != 0 {
                cursor.read_u32("element segment table index")?;
            }
            if active {
                cursor.read_const_expr("element segment offset")?;
            }
            if flags & 0b011 != 0 {
                // Everything but the shorthand form carries an elem-kind byte
                let kind_at = cursor.offset();
                let kind = cursor.read_byte("element kind")?;
                if kind != 0x00 {
                    return Err(ParseError {
                        offset: kind_at,
                        message: format!("element kind: unknown kind 0x{kind:02x}"),
                    });
                }
            }

            let num_indices = cursor.read_u32("num element function indices")?;
            for _ in 0..num_indices {
                let index_at = cursor.offset();
                let index = cursor.read_u32("element function index")?;
                if index as usize >= self.funcs.len() {
                    return Err(ParseError {
                        offset: index_at,
                        message: format!(
                            "element function index: index {index} is out of range (the module \
                             has {} functions)",
                            self.funcs.len()
                        ),
                    });
                }
                self.declared_funcs.push(index);
            }
        }
        Ok(())
    }

    fn scan_code_section(
        &mut self,
        arena: &'a Bump,
        cursor: &mut Cursor<'a>,
    ) -> Result<(), ParseError> {
        let num_bodies = cursor.read_u32("num function bodies")?;
        for i in 0..num_bodies {
            let func_index = self.num_imported_funcs + i as usize;
            if func_index >= self.funcs.len() {
                return Err(ParseError {
                    offset: cursor.offset(),
                    message: format!(
                        "function body {i}: no matching entry in the function section"
                    ),
                });
            }

            let body_size = cursor.read_u32("function body size")?;
            let body_start = cursor.offset();
            let body_end = body_start + body_size as usize;

            cursor.start_recording();
            let call_sites = scan_function_body(
                arena,
                cursor,
                body_start,
                body_end,
                self.funcs.len(),
            )?;
            let body_bytes = cursor.stop_recording();

            let mut body = Vec::with_capacity_in(body_bytes.len(), arena);
            body.extend_from_slice(body_bytes);

            let func = &mut self.funcs[func_index];
            func.body = body;
            func.call_sites = call_sites;
        }
        self.sections.push(Section::Code {
            funcs_start: self.num_imported_funcs,
        });
        Ok(())
    }

    /// Replay the section list. By this point liveness flags, new indices,
    /// and relocated bodies are all in place, so the function and code
    /// writers see the final state.
    pub fn write_module<B: SerialBuffer>(&self, buffer: &mut B) {
        buffer.append_slice(&WASM_MAGIC);
        buffer.append_slice(&WASM_VERSION);
        for section in self.sections.iter() {
            section.write(&self.funcs, buffer);
        }
    }
}

/// Walk one function body instruction by instruction, recording the byte
/// offset of every function-index operand. This is what makes relocation
/// safe: an opcode byte inside some other instruction's immediate can
/// never be mistaken for a call.
fn scan_function_body<'a>(
    arena: &'a Bump,
    cursor: &mut Cursor<'a>,
    body_start: usize,
    body_end: usize,
    num_funcs: usize,
) -> Result<Vec<'a, CallSite>, ParseError> {
    let mut call_sites = Vec::new_in(arena);

    let num_local_groups = cursor.read_u32("num local groups")?;
    for _ in 0..num_local_groups {
        cursor.read_u32("local group count")?;
        cursor.read_val_type("local group type")?;
    }

    while cursor.offset() < body_end {
        let opcode = cursor.peek_byte("opcode")?;
        if opcode == OpCode::CALL as u8
            || opcode == OpCode::RETURNCALL as u8
            || opcode == OpCode::REFFUNC as u8
        {
            cursor.read_byte("opcode")?;
            let operand_at = cursor.offset();
            let target = cursor.read_u32("function index operand")?;
            if target as usize >= num_funcs {
                return Err(ParseError {
                    offset: operand_at,
                    message: format!(
                        "function index operand: index {target} is out of range (the module has \
                         {num_funcs} functions)"
                    ),
                });
            }
            call_sites.push(CallSite {
                offset: (operand_at - body_start) as u32,
                len: (cursor.offset() - operand_at) as u8,
                target,
            });
        } else {
            skip_instruction(cursor, "code section instruction")?;
        }
    }

    if cursor.offset() != body_end {
        return Err(ParseError {
            offset: cursor.offset(),
            message: format!("function body: expected to end at offset {body_end}"),
        });
    }

    Ok(call_sites)
}
