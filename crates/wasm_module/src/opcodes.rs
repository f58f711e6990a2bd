use crate::parse::{Cursor, ParseError};

/// The opcodes the isolation engine inspects by name. Instruction
/// skipping below covers the whole instruction set; this enum only names
/// the bytes that some piece of code or test refers to directly.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpCode {
    UNREACHABLE = 0x00,
    NOP = 0x01,
    BLOCK = 0x02,
    LOOP = 0x03,
    IF = 0x04,
    END = 0x0b,
    BR = 0x0c,
    BRIF = 0x0d,
    BRTABLE = 0x0e,
    RETURN = 0x0f,
    CALL = 0x10,
    CALLINDIRECT = 0x11,
    RETURNCALL = 0x12,
    RETURNCALLINDIRECT = 0x13,
    DROP = 0x1a,
    SELECT = 0x1b,
    SELECTT = 0x1c,
    LOCALGET = 0x20,
    LOCALSET = 0x21,
    LOCALTEE = 0x22,
    GLOBALGET = 0x23,
    GLOBALSET = 0x24,
    I32CONST = 0x41,
    I64CONST = 0x42,
    F32CONST = 0x43,
    F64CONST = 0x44,
    I32ADD = 0x6a,
    I32SUB = 0x6b,
    I32MUL = 0x6c,
    I64ADD = 0x7c,
    I64SUB = 0x7d,
    I64MUL = 0x7e,
    REFNULL = 0xd0,
    REFISNULL = 0xd1,
    REFFUNC = 0xd2,
    MISCPREFIX = 0xfc,
    SIMDPREFIX = 0xfd,
}

/// The format of an instruction's immediate operands: the bytes that
/// follow the opcode in the byte stream, as opposed to values popped off
/// the operand stack.
#[derive(Debug)]
enum OpImmediates {
    NoImmediate,
    BlockType,
    U32x1,
    U32x2,
    S32x1,
    S64x1,
    Bytes4,
    Bytes8,
    BrTable,
    SelectTypes,
    HeapTypeImm,
    TryTable,
    MiscPrefixed,
    SimdPrefixed,
}

fn immediates_for(op: u8) -> Result<OpImmediates, String> {
    use OpImmediates::*;

    let imm = match op {
        0x00 | 0x01 => NoImmediate, // unreachable, nop
        0x02..=0x04 => BlockType,   // block, loop, if
        0x05 => NoImmediate,        // else
        0x06 => BlockType,          // try (legacy exception handling)
        0x07..=0x09 => U32x1,       // catch, throw, rethrow
        0x0a => NoImmediate,        // throw_ref
        0x0b => NoImmediate,        // end
        0x0c | 0x0d => U32x1,       // br, br_if
        0x0e => BrTable,
        0x0f => NoImmediate, // return
        0x10 => U32x1,       // call
        0x11 => U32x2,       // call_indirect
        0x12 => U32x1,       // return_call
        0x13 => U32x2,       // return_call_indirect
        0x14 | 0x15 => U32x1, // call_ref, return_call_ref
        0x18 => U32x1,       // delegate
        0x19 => NoImmediate, // catch_all
        0x1a | 0x1b => NoImmediate, // drop, select
        0x1c => SelectTypes,
        0x1f => TryTable,
        0x20..=0x26 => U32x1, // local/global get & set, table.get/set
        0x28..=0x3e => U32x2, // loads and stores (align, offset)
        0x3f | 0x40 => U32x1, // memory.size, memory.grow
        0x41 => S32x1,
        0x42 => S64x1,
        0x43 => Bytes4,
        0x44 => Bytes8,
        0x45..=0xc4 => NoImmediate, // comparisons, arithmetic, conversions
        0xd0 => HeapTypeImm,        // ref.null
        0xd1 => NoImmediate,        // ref.is_null
        0xd2 => U32x1,              // ref.func
        0xd3 | 0xd4 => NoImmediate, // ref.eq, ref.as_non_null
        0xd5 | 0xd6 => U32x1,       // br_on_null, br_on_non_null
        0xfc => MiscPrefixed,
        0xfd => SimdPrefixed,
        _ => return Err(format!("unknown opcode 0x{op:02x}")),
    };

    Ok(imm)
}

fn skip_block_type(cursor: &mut Cursor, thing: &str) -> Result<(), ParseError> {
    let byte = cursor.peek_byte(thing)?;
    if byte == 0x63 || byte == 0x64 {
        cursor.read_ref_type(thing)?;
    } else {
        // A value type code or a (positive) type index, either way one
        // signed varint
        cursor.read_s64(thing)?;
    }
    Ok(())
}

fn skip_misc_immediates(cursor: &mut Cursor, thing: &str, at: usize) -> Result<(), ParseError> {
    let sub = cursor.read_u32(thing)?;
    match sub {
        0..=7 => {} // saturating truncations
        8 => {
            // memory.init
            cursor.read_u32(thing)?;
            cursor.read_byte(thing)?;
        }
        9 => {
            // data.drop
            cursor.read_u32(thing)?;
        }
        10 => {
            // memory.copy
            cursor.read_byte(thing)?;
            cursor.read_byte(thing)?;
        }
        11 => {
            // memory.fill
            cursor.read_byte(thing)?;
        }
        12 | 14 => {
            // table.init, table.copy
            cursor.read_u32(thing)?;
            cursor.read_u32(thing)?;
        }
        13 | 15 | 16 | 17 => {
            // elem.drop, table.grow, table.size, table.fill
            cursor.read_u32(thing)?;
        }
        other => {
            return Err(ParseError {
                offset: at,
                message: format!("{thing}: unknown 0xfc opcode {other}"),
            });
        }
    }
    Ok(())
}

fn skip_simd_immediates(cursor: &mut Cursor, thing: &str, at: usize) -> Result<(), ParseError> {
    let sub = cursor.read_u32(thing)?;
    match sub {
        0..=11 | 92 | 93 => {
            // loads and stores (align, offset)
            cursor.read_u32(thing)?;
            cursor.read_u32(thing)?;
        }
        12 | 13 => {
            // v128.const, i8x16.shuffle
            cursor.read_n(thing, 16)?;
        }
        21..=34 => {
            // extract_lane / replace_lane
            cursor.read_byte(thing)?;
        }
        84..=91 => {
            // load_lane / store_lane (align, offset, lane)
            cursor.read_u32(thing)?;
            cursor.read_u32(thing)?;
            cursor.read_byte(thing)?;
        }
        14..=20 | 35..=83 | 94..=255 => {} // plain vector arithmetic
        other => {
            return Err(ParseError {
                offset: at,
                message: format!("{thing}: unknown SIMD opcode {other}"),
            });
        }
    }
    Ok(())
}

/// Read one instruction (opcode plus immediates) and discard it.
///
/// The cursor advances past exactly the instruction's bytes, which is all
/// the body scan needs: operands that matter (function indices) are
/// handled by the caller before this is reached.
pub fn skip_instruction(cursor: &mut Cursor, thing: &str) -> Result<(), ParseError> {
    use OpImmediates::*;

    let at = cursor.offset();
    let op = cursor.read_byte(thing)?;
    let immediates = immediates_for(op).map_err(|message| ParseError {
        offset: at,
        message: format!("{thing}: {message}"),
    })?;

    match immediates {
        NoImmediate => {}
        BlockType => skip_block_type(cursor, thing)?,
        U32x1 => {
            cursor.read_u32(thing)?;
        }
        U32x2 => {
            cursor.read_u32(thing)?;
            cursor.read_u32(thing)?;
        }
        S32x1 => {
            cursor.read_s32(thing)?;
        }
        S64x1 => {
            cursor.read_s64(thing)?;
        }
        Bytes4 => {
            cursor.read_n(thing, 4)?;
        }
        Bytes8 => {
            cursor.read_n(thing, 8)?;
        }
        BrTable => {
            // n branch targets plus the default
            let n = cursor.read_u32(thing)?;
            for _ in 0..=n {
                cursor.read_u32(thing)?;
            }
        }
        SelectTypes => {
            let n = cursor.read_u32(thing)?;
            for _ in 0..n {
                cursor.read_val_type(thing)?;
            }
        }
        HeapTypeImm => {
            cursor.read_heap_type(thing)?;
        }
        TryTable => {
            skip_block_type(cursor, thing)?;
            let n = cursor.read_u32(thing)?;
            for _ in 0..n {
                let clause_at = cursor.offset();
                let kind = cursor.read_byte(thing)?;
                match kind {
                    0x00 | 0x01 => {
                        // catch, catch_ref: tag index and label
                        cursor.read_u32(thing)?;
                        cursor.read_u32(thing)?;
                    }
                    0x02 | 0x03 => {
                        // catch_all, catch_all_ref: label only
                        cursor.read_u32(thing)?;
                    }
                    other => {
                        return Err(ParseError {
                            offset: clause_at,
                            message: format!("{thing}: unknown catch clause 0x{other:02x}"),
                        });
                    }
                }
            }
        }
        MiscPrefixed => skip_misc_immediates(cursor, thing, at)?,
        SimdPrefixed => skip_simd_immediates(cursor, thing, at)?,
    }

    Ok(())
}
