use std::fmt;

use crate::{
    AbsHeapType, AddressType, GlobalType, HeapType, Limits, MemType, NumType, RefType, TableType,
    TagType, ValType, V128_CODE,
};

/// Longest possible LEB-128 encoding of a 64-bit integer.
pub const MAX_SIZE_ENCODED_U64: usize = 10;

/// An error from the varint codec itself, before any section context is
/// known. `consumed` is how many bytes were read before giving up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarintError {
    /// The encoding needs more than 64 bits (or more than 10 bytes).
    Overflow { consumed: usize },
    /// The input ended in the middle of a value.
    Truncated { consumed: usize },
}

/// Decode an unsigned LEB-128 integer from the front of `bytes`.
/// Returns the value and the number of bytes it occupied.
///
/// An empty slice decodes to `(0, 0)`: the absence of bytes is for the
/// caller's end-of-stream check to notice, not an error here.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize), VarintError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in bytes.iter().take(MAX_SIZE_ENCODED_U64).enumerate() {
        let group = (byte & 0x7f) as u64;
        if shift == 63 && group > 1 {
            // The tenth byte can only contribute bit 63
            return Err(VarintError::Overflow {
                consumed: MAX_SIZE_ENCODED_U64,
            });
        }
        value |= group << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    if bytes.is_empty() {
        return Ok((0, 0));
    }
    if bytes.len() < MAX_SIZE_ENCODED_U64 {
        return Err(VarintError::Truncated {
            consumed: bytes.len(),
        });
    }
    Err(VarintError::Overflow {
        consumed: MAX_SIZE_ENCODED_U64,
    })
}

/// Decode a signed LEB-128 integer from the front of `bytes`, sign-extending
/// from bit 6 of the final byte. Same 10-byte / 64-bit ceiling as
/// [`decode_u64`].
pub fn decode_i64(bytes: &[u8]) -> Result<(i64, usize), VarintError> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in bytes.iter().take(MAX_SIZE_ENCODED_U64).enumerate() {
        let group = (byte & 0x7f) as u64;
        if shift == 63 {
            // The tenth byte holds bit 63 plus sign bits, so it must be
            // all-zeros or all-ones in its low seven bits
            if group != 0 && group != 0x7f {
                return Err(VarintError::Overflow {
                    consumed: MAX_SIZE_ENCODED_U64,
                });
            }
            value |= (group & 1) << 63;
        } else {
            value |= group << shift;
        }
        if byte & 0x80 == 0 {
            if shift < 63 && byte & 0x40 != 0 {
                value |= !0u64 << (shift + 7);
            }
            return Ok((value as i64, i + 1));
        }
        shift += 7;
    }
    if bytes.is_empty() {
        return Ok((0, 0));
    }
    if bytes.len() < MAX_SIZE_ENCODED_U64 {
        return Err(VarintError::Truncated {
            consumed: bytes.len(),
        });
    }
    Err(VarintError::Overflow {
        consumed: MAX_SIZE_ENCODED_U64,
    })
}

/// A structural problem with the input module. The offset is the absolute
/// byte position at which the failing read began.
#[derive(Debug, PartialEq, Eq)]
pub struct ParseError {
    pub offset: usize,
    pub message: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at offset {}: {}", self.offset, self.message)
    }
}

// Sentinel bytes indicating that a ref type's heap type follows.
const REF_NON_NULL: u8 = 0x64;
const REF_NULL: u8 = 0x63;

/// Interpret a single byte as the SLEB-128 value it would encode on its
/// own. Type codes are negative numbers in the binary format, so `0x7f`
/// means -1, `0x63` means -29, and so on.
fn one_byte_code(byte: u8) -> i64 {
    if byte & 0x40 != 0 {
        byte as i64 - 0x80
    } else {
        byte as i64
    }
}

/// A position-tracked reader over a module's bytes.
///
/// Every read takes a `thing` label naming what is being read; failures
/// report that label together with the offset where the read started.
pub struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    record_start: Option<usize>,
}

impl<'a> Cursor<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Cursor {
            bytes,
            pos: 0,
            record_start: None,
        }
    }

    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Begin mirroring consumed bytes. Every byte read until
    /// [`Cursor::stop_recording`] will be part of the returned slice.
    /// Used to capture a constant expression's encoding verbatim.
    pub fn start_recording(&mut self) {
        self.record_start = Some(self.pos);
    }

    pub fn stop_recording(&mut self) -> &'a [u8] {
        let start = self.record_start.take().unwrap_or(self.pos);
        &self.bytes[start..self.pos]
    }

    fn eof_error(&self, thing: &str, at: usize) -> ParseError {
        ParseError {
            offset: at,
            message: format!("{thing}: unexpected end of file"),
        }
    }

    fn varint_error(&self, thing: &str, at: usize, err: VarintError) -> ParseError {
        let message = match err {
            VarintError::Overflow { .. } => {
                format!("{thing}: LEB-128 value does not fit in 64 bits")
            }
            VarintError::Truncated { .. } => {
                format!("{thing}: unexpected end of file inside LEB-128 value")
            }
        };
        ParseError {
            offset: at,
            message,
        }
    }

    pub fn read_byte(&mut self, thing: &str) -> Result<u8, ParseError> {
        match self.bytes.get(self.pos) {
            Some(&byte) => {
                self.pos += 1;
                Ok(byte)
            }
            None => Err(self.eof_error(thing, self.pos)),
        }
    }

    /// Look at the next byte without advancing.
    pub fn peek_byte(&self, thing: &str) -> Result<u8, ParseError> {
        match self.bytes.get(self.pos) {
            Some(&byte) => Ok(byte),
            None => Err(self.eof_error(thing, self.pos)),
        }
    }

    pub fn read_n(&mut self, thing: &str, n: usize) -> Result<&'a [u8], ParseError> {
        let at = self.pos;
        let end = match at.checked_add(n) {
            Some(end) if end <= self.bytes.len() => end,
            _ => return Err(self.eof_error(thing, at)),
        };
        self.pos = end;
        Ok(&self.bytes[at..end])
    }

    /// Read exactly the given bytes, failing if the input differs.
    pub fn expect(&mut self, thing: &str, expected: &[u8]) -> Result<(), ParseError> {
        let at = self.pos;
        let actual = self.read_n(thing, expected.len())?;
        if actual != expected {
            return Err(ParseError {
                offset: at,
                message: format!("{thing}: expected bytes {expected:02x?} but got {actual:02x?}"),
            });
        }
        Ok(())
    }

    pub fn read_u64(&mut self, thing: &str) -> Result<u64, ParseError> {
        let at = self.pos;
        if self.at_end() {
            return Err(self.eof_error(thing, at));
        }
        match decode_u64(&self.bytes[at..]) {
            Ok((value, n)) => {
                self.pos += n;
                Ok(value)
            }
            Err(err) => Err(self.varint_error(thing, at, err)),
        }
    }

    pub fn read_u32(&mut self, thing: &str) -> Result<u32, ParseError> {
        Ok(self.read_u64(thing)? as u32)
    }

    pub fn read_s64(&mut self, thing: &str) -> Result<i64, ParseError> {
        let at = self.pos;
        if self.at_end() {
            return Err(self.eof_error(thing, at));
        }
        match decode_i64(&self.bytes[at..]) {
            Ok((value, n)) => {
                self.pos += n;
                Ok(value)
            }
            Err(err) => Err(self.varint_error(thing, at, err)),
        }
    }

    pub fn read_s32(&mut self, thing: &str) -> Result<i32, ParseError> {
        Ok(self.read_s64(thing)? as i32)
    }

    pub fn read_f32(&mut self, thing: &str) -> Result<f32, ParseError> {
        let b = self.read_n(thing, 4)?;
        Ok(f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f64(&mut self, thing: &str) -> Result<f64, ParseError> {
        let b = self.read_n(thing, 8)?;
        Ok(f64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// A length-prefixed UTF-8 name.
    pub fn read_name(&mut self, thing: &str) -> Result<&'a str, ParseError> {
        let len = self.read_u32(thing)?;
        let at = self.pos;
        let bytes = self.read_n(thing, len as usize)?;
        match std::str::from_utf8(bytes) {
            Ok(name) => Ok(name),
            Err(_) => Err(ParseError {
                offset: at,
                message: format!("{thing}: name is not valid UTF-8"),
            }),
        }
    }

    pub fn read_limits(&mut self, thing: &str) -> Result<Limits, ParseError> {
        let flags = self.read_byte(&format!("limits flags for {thing}"))?;
        let min = self.read_u64(&format!("limits min for {thing}"))?;
        let max = if flags & 0b001 != 0 {
            Some(self.read_u64(&format!("limits max for {thing}"))?)
        } else {
            None
        };
        let addr = if flags & 0b100 != 0 {
            AddressType::I64
        } else {
            AddressType::I32
        };
        Ok(Limits { addr, min, max })
    }

    pub fn read_val_type(&mut self, thing: &str) -> Result<ValType, ParseError> {
        let at = self.pos;
        let byte = self.read_byte(thing)?;
        match byte {
            REF_NON_NULL | REF_NULL => {
                let heap = self.read_heap_type(thing)?;
                Ok(ValType::Ref(RefType {
                    nullable: byte == REF_NULL,
                    heap,
                }))
            }
            _ => {
                let code = one_byte_code(byte);
                if let Some(num) = NumType::from_code(code) {
                    Ok(ValType::Num(num))
                } else if code == V128_CODE {
                    Ok(ValType::Vec128)
                } else if let Some(heap) = AbsHeapType::from_code(code) {
                    // Shorthand for a nullable reference to an abstract heap type
                    Ok(ValType::Ref(RefType {
                        nullable: true,
                        heap: HeapType::Abstract(heap),
                    }))
                } else {
                    Err(ParseError {
                        offset: at,
                        message: format!("{thing}: invalid value type 0x{byte:02x}"),
                    })
                }
            }
        }
    }

    /// A reference type: an optional nullability sentinel, then a heap type.
    /// Without the sentinel the reference defaults to nullable.
    pub fn read_ref_type(&mut self, thing: &str) -> Result<RefType, ParseError> {
        let byte = self.peek_byte(thing)?;
        let nullable = if byte == REF_NON_NULL || byte == REF_NULL {
            self.read_byte(thing)?;
            byte == REF_NULL
        } else {
            true
        };
        let heap = self.read_heap_type(thing)?;
        Ok(RefType { nullable, heap })
    }

    pub fn read_heap_type(&mut self, thing: &str) -> Result<HeapType, ParseError> {
        let at = self.pos;
        if self.at_end() {
            return Err(self.eof_error(thing, at));
        }
        let (code, n) = match decode_i64(&self.bytes[at..]) {
            Ok(decoded) => decoded,
            Err(err) => return Err(self.varint_error(thing, at, err)),
        };
        self.pos += n;
        if code < 0 {
            if n != 1 {
                return Err(ParseError {
                    offset: at,
                    message: format!("{thing}: invalid abstract heap type"),
                });
            }
            match AbsHeapType::from_code(code) {
                Some(heap) => Ok(HeapType::Abstract(heap)),
                None => Err(ParseError {
                    offset: at,
                    message: format!("{thing}: invalid heap type"),
                }),
            }
        } else if code <= u32::MAX as i64 {
            Ok(HeapType::Index(code as u32))
        } else {
            Err(ParseError {
                offset: at,
                message: format!("{thing}: invalid heap type"),
            })
        }
    }

    pub fn read_table_type(&mut self, thing: &str) -> Result<TableType, ParseError> {
        let elem = self.read_ref_type(&format!("element type for {thing}"))?;
        let limits = self.read_limits(thing)?;
        Ok(TableType { elem, limits })
    }

    pub fn read_mem_type(&mut self, thing: &str) -> Result<MemType, ParseError> {
        let limits = self.read_limits(thing)?;
        Ok(MemType { limits })
    }

    pub fn read_global_type(&mut self, thing: &str) -> Result<GlobalType, ParseError> {
        let ty = self.read_val_type(thing)?;
        let mutable = self.read_byte(thing)? == 0x01;
        Ok(GlobalType { mutable, ty })
    }

    pub fn read_tag_type(&mut self, thing: &str) -> Result<TagType, ParseError> {
        self.read_byte(thing)?; // attribute byte, always 0 today
        let type_index = self.read_u32(thing)?;
        Ok(TagType { type_index })
    }

    /// Walk a constant expression up to and including its `end` opcode, and
    /// return its raw bytes. This is deliberately a minimal evaluator: it
    /// recognizes the constant and basic-arithmetic opcodes that appear in
    /// offset expressions and nothing more.
    pub fn read_const_expr(&mut self, thing: &str) -> Result<&'a [u8], ParseError> {
        self.start_recording();
        loop {
            let at = self.pos;
            let opcode = self.read_byte(thing)?;
            match opcode {
                0x0b => break,                                                  // end
                0x41 => {
                    self.read_s32(&format!("i32.const in {thing}"))?;
                }
                0x42 => {
                    self.read_s64(&format!("i64.const in {thing}"))?;
                }
                0x43 => {
                    self.read_f32(&format!("f32.const in {thing}"))?;
                }
                0x44 => {
                    self.read_f64(&format!("f64.const in {thing}"))?;
                }
                0x6a | 0x6b | 0x6c => {}                                        // i32 add/sub/mul
                0x7c | 0x7d | 0x7e => {}                                        // i64 add/sub/mul
                _ => {
                    return Err(ParseError {
                        offset: at,
                        message: format!(
                            "{thing}: unknown opcode 0x{opcode:02x} in constant expression"
                        ),
                    });
                }
            }
        }
        Ok(self.stop_recording())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialize::SerialBuffer;

    fn encode_u64_to_vec(value: u64) -> std::vec::Vec<u8> {
        let mut buffer = std::vec::Vec::new();
        buffer.encode_u64(value);
        buffer
    }

    fn encode_i64_to_vec(value: i64) -> std::vec::Vec<u8> {
        let mut buffer = std::vec::Vec::new();
        buffer.encode_i64(value);
        buffer
    }

    #[test]
    fn unsigned_roundtrip() {
        for value in [
            0u64,
            1,
            63,
            64,
            127,
            128,
            300,
            16383,
            16384,
            u32::MAX as u64,
            u64::MAX / 7,
            u64::MAX,
        ] {
            let encoded = encode_u64_to_vec(value);
            assert_eq!(decode_u64(&encoded), Ok((value, encoded.len())));
        }
    }

    #[test]
    fn unsigned_single_byte() {
        assert_eq!(encode_u64_to_vec(120), [0x78]);
        assert_eq!(decode_u64(&[0x78]), Ok((120, 1)));
    }

    #[test]
    fn unsigned_max_is_ten_bytes() {
        let expected = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert_eq!(encode_u64_to_vec(u64::MAX), expected);
        assert_eq!(decode_u64(&expected), Ok((u64::MAX, 10)));
    }

    #[test]
    fn unsigned_stops_at_terminator() {
        let input = [0x78, 0x10, 0x0f, 0x0a, 0x0b, 0x90, 0x01, 0x00, 0xff, 0xff, 0xff];
        assert_eq!(decode_u64(&input), Ok((120, 1)));
    }

    #[test]
    fn unsigned_empty_input() {
        assert_eq!(decode_u64(&[]), Ok((0, 0)));
    }

    #[test]
    fn unsigned_overflow_consumes_ten_bytes() {
        let input = [
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00,
        ];
        assert_eq!(
            decode_u64(&input),
            Err(VarintError::Overflow { consumed: 10 })
        );
    }

    #[test]
    fn unsigned_truncated_input() {
        assert_eq!(
            decode_u64(&[0x80, 0x80]),
            Err(VarintError::Truncated { consumed: 2 })
        );
    }

    #[test]
    fn signed_roundtrip() {
        for value in [
            0i64,
            1,
            -1,
            63,
            64,
            -64,
            -65,
            127,
            128,
            -128,
            -129,
            123456,
            -123456,
            i64::MAX,
            i64::MIN,
        ] {
            let encoded = encode_i64_to_vec(value);
            assert_eq!(decode_i64(&encoded), Ok((value, encoded.len())));
        }
    }

    #[test]
    fn signed_single_byte_boundaries() {
        assert_eq!(encode_i64_to_vec(63), [0x3f]);
        assert_eq!(encode_i64_to_vec(64), [0xc0, 0x00]);
        assert_eq!(encode_i64_to_vec(-64), [0x40]);
        assert_eq!(encode_i64_to_vec(-65), [0xbf, 0x7f]);
        assert_eq!(encode_i64_to_vec(-1), [0x7f]);
    }

    #[test]
    fn signed_extremes() {
        let max = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x00];
        assert_eq!(encode_i64_to_vec(i64::MAX), max);
        assert_eq!(decode_i64(&max), Ok((i64::MAX, 10)));

        let min = [0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x7f];
        assert_eq!(encode_i64_to_vec(i64::MIN), min);
        assert_eq!(decode_i64(&min), Ok((i64::MIN, 10)));
    }

    #[test]
    fn cursor_reports_label_and_offset() {
        let mut cursor = Cursor::new(&[0x01, 0x02]);
        cursor.read_byte("first byte").unwrap();
        cursor.read_byte("second byte").unwrap();
        let err = cursor.read_byte("third byte").unwrap_err();
        assert_eq!(err.offset, 2);
        assert!(err.message.contains("third byte"));
    }

    #[test]
    fn cursor_expect_mismatch() {
        let mut cursor = Cursor::new(&[0x00, 0x61, 0x73, 0x6e]);
        let err = cursor.expect("magic number", &crate::WASM_MAGIC).unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.message.contains("magic number"));
    }

    #[test]
    fn cursor_read_name() {
        let mut cursor = Cursor::new(&[0x03, b'e', b'n', b'v', 0xff]);
        assert_eq!(cursor.read_name("import module").unwrap(), "env");
        assert_eq!(cursor.offset(), 4);
    }

    #[test]
    fn cursor_recording_captures_consumed_bytes() {
        let bytes = [0x41, 0x80, 0x01, 0x0b, 0x55];
        let mut cursor = Cursor::new(&bytes);
        let expr = cursor.read_const_expr("offset expression").unwrap();
        assert_eq!(expr, &bytes[0..4]);
        assert_eq!(cursor.offset(), 4);
    }

    #[test]
    fn const_expr_rejects_unknown_opcodes() {
        // global.get is not part of the minimal evaluator
        let mut cursor = Cursor::new(&[0x23, 0x00, 0x0b]);
        let err = cursor.read_const_expr("offset expression").unwrap_err();
        assert_eq!(err.offset, 0);
        assert!(err.message.contains("unknown opcode"));
    }

    #[test]
    fn limits_with_max_and_wide_addresses() {
        let mut cursor = Cursor::new(&[0b101, 0x10, 0x20]);
        let limits = cursor.read_limits("memory type").unwrap();
        assert_eq!(limits.min, 0x10);
        assert_eq!(limits.max, Some(0x20));
        assert_eq!(limits.addr, AddressType::I64);
    }

    #[test]
    fn val_type_abstract_shorthand_is_nullable() {
        let mut cursor = Cursor::new(&[0x70]);
        let ty = cursor.read_val_type("value type").unwrap();
        assert_eq!(
            ty,
            ValType::Ref(RefType {
                nullable: true,
                heap: HeapType::Abstract(AbsHeapType::Func),
            })
        );
    }

    #[test]
    fn val_type_sentinel_reads_heap_type() {
        let mut cursor = Cursor::new(&[0x64, 0x05]);
        let ty = cursor.read_val_type("value type").unwrap();
        assert_eq!(
            ty,
            ValType::Ref(RefType {
                nullable: false,
                heap: HeapType::Index(5),
            })
        );
    }

    #[test]
    fn val_type_rejects_unknown_codes() {
        let mut cursor = Cursor::new(&[0x00]);
        let err = cursor.read_val_type("value type").unwrap_err();
        assert!(err.message.contains("invalid value type"));
    }

    #[test]
    fn heap_type_rejects_multi_byte_abstract_codes() {
        // -12 (noexn) encoded redundantly in two bytes
        let mut cursor = Cursor::new(&[0xf4, 0x7f]);
        let err = cursor.read_heap_type("heap type").unwrap_err();
        assert!(err.message.contains("invalid abstract heap type"));
    }

    #[test]
    fn heap_type_concrete_index() {
        let mut cursor = Cursor::new(&[0x2a]);
        assert_eq!(
            cursor.read_heap_type("heap type").unwrap(),
            HeapType::Index(42)
        );
    }
}
