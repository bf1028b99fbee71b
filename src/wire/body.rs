//! Message body cursors.
//!
//! [`BodyWriter`] and [`BodyReader`] walk a signature while producing or
//! consuming a little-endian, naturally aligned body. Both keep a stack of
//! open containers; a variant frame closes itself once its single value is
//! complete, so callers never close variants explicitly.

use super::signature::{self as sig, complete_type_len};
use crate::error::{BusError, BusResult};

#[derive(Debug)]
enum Frame {
    /// Whole message body
    Top { sig: String, pos: usize },
    /// Array: the element signature repeats until the container is closed
    Array {
        elem: String,
        len_pos: usize,
        start: usize,
        end: usize,
    },
    /// Struct or dictionary entry members
    Members { sig: String, pos: usize },
    /// Variant holding exactly one value
    Variant { sig: String, done: bool },
}

impl Frame {
    fn next_sig(&self) -> Option<&str> {
        match self {
            Frame::Top { sig, pos } | Frame::Members { sig, pos } => {
                let rest = &sig[*pos..];
                if rest.is_empty() {
                    return None;
                }
                complete_type_len(rest.as_bytes()).ok().map(|len| &rest[..len])
            }
            Frame::Array { elem, .. } => Some(elem),
            Frame::Variant { sig, done } => {
                if *done {
                    None
                } else {
                    Some(sig)
                }
            }
        }
    }

    fn consume(&mut self, len: usize) {
        match self {
            Frame::Top { pos, .. } | Frame::Members { pos, .. } => *pos += len,
            Frame::Array { .. } => {}
            Frame::Variant { done, .. } => *done = true,
        }
    }
}

fn pad_len(offset: usize, align: usize) -> usize {
    (align - offset % align) % align
}

fn expect_next(frames: &[Frame]) -> BusResult<String> {
    frames
        .last()
        .and_then(Frame::next_sig)
        .map(str::to_string)
        .ok_or_else(|| BusError::signature("too many arguments"))
}

fn check_tag(expected: &str, tag: u8) -> BusResult<()> {
    if expected.as_bytes().first() == Some(&tag) {
        Ok(())
    } else {
        Err(BusError::signature(format!(
            "expected '{}' found '{}'",
            expected,
            tag as char
        )))
    }
}

fn settle(frames: &mut Vec<Frame>) {
    while matches!(frames.last(), Some(Frame::Variant { done: true, .. })) {
        frames.pop();
    }
}

/// Refuse to open a container or variant `tag` past the nesting limits;
/// variants count as struct levels
fn check_nesting(frames: &[Frame], tag: u8) -> BusResult<()> {
    let arrays = frames
        .iter()
        .filter(|f| matches!(f, Frame::Array { .. }))
        .count();
    let structs = frames
        .iter()
        .filter(|f| matches!(f, Frame::Members { .. } | Frame::Variant { .. }))
        .count();
    let too_deep = match tag {
        sig::ARRAY => arrays >= sig::MAX_ARRAY_DEPTH,
        _ => structs >= sig::MAX_STRUCT_DEPTH,
    };
    if too_deep {
        Err(BusError::invalid("container nesting too deep"))
    } else {
        Ok(())
    }
}

/// Signature-driven body encoder
#[derive(Debug)]
pub struct BodyWriter {
    buf: Vec<u8>,
    frames: Vec<Frame>,
}

impl BodyWriter {
    /// Create a writer for a body with the given signature
    pub fn new(signature: impl Into<String>) -> Self {
        Self {
            buf: Vec::new(),
            frames: vec![Frame::Top {
                sig: signature.into(),
                pos: 0,
            }],
        }
    }

    /// Signature of the next value to marshal, `None` when the current
    /// container or the argument list is complete
    pub fn next_arg_sig(&self) -> Option<&str> {
        self.frames.last().and_then(Frame::next_sig)
    }

    /// Whether the writer is inside an array whose element type is `tag`
    pub fn in_array_of(&self, tag: u8) -> bool {
        matches!(self.frames.last(), Some(Frame::Array { elem, .. }) if elem.as_bytes()[0] == tag)
    }

    /// Current container depth, zero at the top level
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    fn align(&mut self, align: usize) {
        let pad = pad_len(self.buf.len(), align);
        self.buf.extend(std::iter::repeat(0u8).take(pad));
    }

    fn begin(&mut self, tag: u8) -> BusResult<()> {
        let expected = expect_next(&self.frames)?;
        check_tag(&expected, tag)?;
        self.align(sig::alignment(tag));
        Ok(())
    }

    fn finish_value(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(1);
        }
        settle(&mut self.frames);
    }

    /// Marshal a byte
    pub fn put_byte(&mut self, v: u8) -> BusResult<()> {
        self.begin(sig::BYTE)?;
        self.buf.push(v);
        self.finish_value();
        Ok(())
    }

    /// Marshal a boolean
    pub fn put_bool(&mut self, v: bool) -> BusResult<()> {
        self.begin(sig::BOOLEAN)?;
        self.buf.extend_from_slice(&(v as u32).to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal a signed 16-bit integer
    pub fn put_i16(&mut self, v: i16) -> BusResult<()> {
        self.begin(sig::INT16)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal an unsigned 16-bit integer
    pub fn put_u16(&mut self, v: u16) -> BusResult<()> {
        self.begin(sig::UINT16)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal a signed 32-bit integer
    pub fn put_i32(&mut self, v: i32) -> BusResult<()> {
        self.begin(sig::INT32)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal an unsigned 32-bit integer
    pub fn put_u32(&mut self, v: u32) -> BusResult<()> {
        self.begin(sig::UINT32)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal a signed 64-bit integer
    pub fn put_i64(&mut self, v: i64) -> BusResult<()> {
        self.begin(sig::INT64)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal an unsigned 64-bit integer
    pub fn put_u64(&mut self, v: u64) -> BusResult<()> {
        self.begin(sig::UINT64)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal a double
    pub fn put_double(&mut self, v: f64) -> BusResult<()> {
        self.begin(sig::DOUBLE)?;
        self.buf.extend_from_slice(&v.to_le_bytes());
        self.finish_value();
        Ok(())
    }

    /// Marshal a string, object path or signature
    pub fn put_string(&mut self, tag: u8, v: &str) -> BusResult<()> {
        if !sig::is_string_like(tag) {
            return Err(BusError::signature(format!(
                "'{}' is not a string type",
                tag as char
            )));
        }
        if v.as_bytes().contains(&0) {
            return Err(BusError::invalid("embedded NUL in string"));
        }
        self.begin(tag)?;
        if tag == sig::SIGNATURE {
            if v.len() > sig::MAX_SIGNATURE_LEN {
                return Err(BusError::signature("signature too long"));
            }
            self.buf.push(v.len() as u8);
        } else {
            self.buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
        }
        self.buf.extend_from_slice(v.as_bytes());
        self.buf.push(0);
        self.finish_value();
        Ok(())
    }

    /// Open an array, struct or dictionary entry
    pub fn open_container(&mut self, tag: u8) -> BusResult<()> {
        let expected = expect_next(&self.frames)?;
        check_tag(&expected, tag)?;
        check_nesting(&self.frames, tag)?;
        self.align(sig::alignment(tag));
        let len = expected.len();
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(len);
        }
        match tag {
            sig::ARRAY => {
                let len_pos = self.buf.len();
                self.buf.extend_from_slice(&0u32.to_le_bytes());
                let elem = expected[1..].to_string();
                self.align(sig::alignment(elem.as_bytes()[0]));
                let start = self.buf.len();
                self.frames.push(Frame::Array {
                    elem,
                    len_pos,
                    start,
                    end: 0,
                });
            }
            sig::STRUCT_OPEN | sig::DICT_OPEN => {
                self.frames.push(Frame::Members {
                    sig: expected[1..expected.len() - 1].to_string(),
                    pos: 0,
                });
            }
            other => {
                return Err(BusError::signature(format!(
                    "'{}' is not a container",
                    other as char
                )))
            }
        }
        Ok(())
    }

    /// Close the innermost array, struct or dictionary entry
    pub fn close_container(&mut self) -> BusResult<()> {
        match self.frames.last() {
            Some(Frame::Array { len_pos, start, .. }) => {
                let (len_pos, start) = (*len_pos, *start);
                let len = (self.buf.len() - start) as u32;
                self.buf[len_pos..len_pos + 4].copy_from_slice(&len.to_le_bytes());
            }
            Some(Frame::Members { sig, pos }) => {
                if *pos < sig.len() {
                    return Err(BusError::signature("container closed with missing members"));
                }
            }
            _ => return Err(BusError::invalid("no open container")),
        }
        self.frames.pop();
        settle(&mut self.frames);
        Ok(())
    }

    /// Open a variant holding a value of type `value_sig`
    pub fn open_variant(&mut self, value_sig: &str) -> BusResult<()> {
        if !sig::is_single_complete_type(value_sig) {
            return Err(BusError::signature(format!(
                "variant signature '{}' is not a single complete type",
                value_sig
            )));
        }
        sig::validate(value_sig)?;
        check_nesting(&self.frames, sig::VARIANT)?;
        self.begin(sig::VARIANT)?;
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(1);
        }
        self.buf.push(value_sig.len() as u8);
        self.buf.extend_from_slice(value_sig.as_bytes());
        self.buf.push(0);
        self.frames.push(Frame::Variant {
            sig: value_sig.to_string(),
            done: false,
        });
        Ok(())
    }

    /// Marshal a whole byte array in one step
    pub fn put_byte_array(&mut self, bytes: &[u8]) -> BusResult<()> {
        let expected = expect_next(&self.frames)?;
        if expected != "ay" {
            return Err(BusError::signature(format!(
                "expected '{}' found 'ay'",
                expected
            )));
        }
        self.align(4);
        self.buf
            .extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(bytes);
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(2);
        }
        settle(&mut self.frames);
        Ok(())
    }

    /// Finish the body, failing if arguments are missing or containers open
    pub fn finish(self) -> BusResult<Vec<u8>> {
        if self.frames.len() != 1 {
            return Err(BusError::signature("unclosed container"));
        }
        if self.next_arg_sig().is_some() {
            return Err(BusError::signature("missing arguments"));
        }
        Ok(self.buf)
    }

    /// Bytes written so far
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Signature-driven body decoder
#[derive(Debug)]
pub struct BodyReader<'a> {
    body: &'a [u8],
    pos: usize,
    frames: Vec<Frame>,
    invalid: Option<BusError>,
}

impl<'a> BodyReader<'a> {
    /// Create a reader over `body` described by `signature`
    ///
    /// A malformed signature is reported by the first read.
    pub fn new(body: &'a [u8], signature: &str) -> Self {
        Self {
            body,
            pos: 0,
            frames: vec![Frame::Top {
                sig: signature.to_string(),
                pos: 0,
            }],
            invalid: sig::validate(signature).err(),
        }
    }

    /// Signature of the next value; [`BusError::NoMore`] at the end of the
    /// current container or of the arguments
    pub fn next_arg_sig(&self) -> BusResult<String> {
        if let Some(e) = &self.invalid {
            return Err(e.clone());
        }
        match self.frames.last() {
            Some(Frame::Array { end, elem, .. }) => {
                if self.pos >= *end {
                    Err(BusError::NoMore)
                } else {
                    Ok(elem.clone())
                }
            }
            Some(frame) => frame
                .next_sig()
                .map(str::to_string)
                .ok_or(BusError::NoMore),
            None => Err(BusError::NoMore),
        }
    }

    /// Current container depth, zero at the top level
    pub fn depth(&self) -> usize {
        self.frames.len() - 1
    }

    fn align(&mut self, align: usize) -> BusResult<()> {
        let pad = pad_len(self.pos, align);
        if self.pos + pad > self.body.len() {
            return Err(BusError::invalid("truncated body"));
        }
        self.pos += pad;
        Ok(())
    }

    fn take(&mut self, n: usize) -> BusResult<&'a [u8]> {
        if self.pos + n > self.body.len() {
            return Err(BusError::invalid("truncated body"));
        }
        let bytes = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> BusResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn begin(&mut self, tag: u8) -> BusResult<()> {
        let expected = self.next_arg_sig()?;
        check_tag(&expected, tag)?;
        self.align(sig::alignment(tag))
    }

    fn finish_value(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(1);
        }
        settle(&mut self.frames);
    }

    /// Unmarshal a byte
    pub fn get_byte(&mut self) -> BusResult<u8> {
        self.begin(sig::BYTE)?;
        let v = self.take(1)?[0];
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal a boolean
    pub fn get_bool(&mut self) -> BusResult<bool> {
        self.begin(sig::BOOLEAN)?;
        let v = u32::from_le_bytes(self.take_array()?);
        if v > 1 {
            return Err(BusError::invalid("boolean out of range"));
        }
        self.finish_value();
        Ok(v == 1)
    }

    /// Unmarshal a signed 16-bit integer
    pub fn get_i16(&mut self) -> BusResult<i16> {
        self.begin(sig::INT16)?;
        let v = i16::from_le_bytes(self.take_array()?);
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal an unsigned 16-bit integer
    pub fn get_u16(&mut self) -> BusResult<u16> {
        self.begin(sig::UINT16)?;
        let v = u16::from_le_bytes(self.take_array()?);
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal a signed 32-bit integer
    pub fn get_i32(&mut self) -> BusResult<i32> {
        self.begin(sig::INT32)?;
        let v = i32::from_le_bytes(self.take_array()?);
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal an unsigned 32-bit integer
    pub fn get_u32(&mut self) -> BusResult<u32> {
        self.begin(sig::UINT32)?;
        let v = u32::from_le_bytes(self.take_array()?);
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal a signed 64-bit integer
    pub fn get_i64(&mut self) -> BusResult<i64> {
        self.begin(sig::INT64)?;
        let v = i64::from_le_bytes(self.take_array()?);
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal an unsigned 64-bit integer
    pub fn get_u64(&mut self) -> BusResult<u64> {
        self.begin(sig::UINT64)?;
        let v = u64::from_le_bytes(self.take_array()?);
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal a double
    pub fn get_double(&mut self) -> BusResult<f64> {
        self.begin(sig::DOUBLE)?;
        let v = f64::from_le_bytes(self.take_array()?);
        self.finish_value();
        Ok(v)
    }

    /// Unmarshal a string, object path or signature
    pub fn get_string(&mut self, tag: u8) -> BusResult<&'a str> {
        if !sig::is_string_like(tag) {
            return Err(BusError::signature(format!(
                "'{}' is not a string type",
                tag as char
            )));
        }
        self.begin(tag)?;
        let len = if tag == sig::SIGNATURE {
            self.take(1)?[0] as usize
        } else {
            u32::from_le_bytes(self.take_array()?) as usize
        };
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(BusError::invalid("string not NUL terminated"));
        }
        let s = std::str::from_utf8(bytes).map_err(|_| BusError::invalid("string is not UTF-8"))?;
        self.finish_value();
        Ok(s)
    }

    /// Open an array, struct or dictionary entry
    pub fn open_container(&mut self, tag: u8) -> BusResult<()> {
        let expected = self.next_arg_sig()?;
        check_tag(&expected, tag)?;
        check_nesting(&self.frames, tag)?;
        self.align(sig::alignment(tag))?;
        let len = expected.len();
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(len);
        }
        match tag {
            sig::ARRAY => {
                let byte_len = u32::from_le_bytes(self.take_array()?) as usize;
                let elem = expected[1..].to_string();
                self.align(sig::alignment(elem.as_bytes()[0]))?;
                let start = self.pos;
                let end = start + byte_len;
                if end > self.body.len() {
                    return Err(BusError::invalid("array length exceeds body"));
                }
                self.frames.push(Frame::Array {
                    elem,
                    len_pos: 0,
                    start,
                    end,
                });
            }
            sig::STRUCT_OPEN | sig::DICT_OPEN => {
                self.frames.push(Frame::Members {
                    sig: expected[1..expected.len() - 1].to_string(),
                    pos: 0,
                });
            }
            other => {
                return Err(BusError::signature(format!(
                    "'{}' is not a container",
                    other as char
                )))
            }
        }
        Ok(())
    }

    /// Close the innermost array, struct or dictionary entry
    ///
    /// Unread array elements are skipped.
    pub fn close_container(&mut self) -> BusResult<()> {
        match self.frames.last() {
            Some(Frame::Array { end, .. }) => self.pos = *end,
            Some(Frame::Members { .. }) => {}
            _ => return Err(BusError::invalid("no open container")),
        }
        self.frames.pop();
        settle(&mut self.frames);
        Ok(())
    }

    /// Open a variant, returning the signature of the value it holds
    pub fn open_variant(&mut self) -> BusResult<String> {
        self.begin(sig::VARIANT)?;
        check_nesting(&self.frames, sig::VARIANT)?;
        let len = self.take(1)?[0] as usize;
        let bytes = self.take(len)?;
        if self.take(1)?[0] != 0 {
            return Err(BusError::invalid("signature not NUL terminated"));
        }
        let value_sig = std::str::from_utf8(bytes)
            .map_err(|_| BusError::invalid("signature is not UTF-8"))?
            .to_string();
        if !sig::is_single_complete_type(&value_sig) {
            return Err(BusError::signature(format!(
                "variant signature '{}' is not a single complete type",
                value_sig
            )));
        }
        sig::validate(&value_sig)?;
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(1);
        }
        self.frames.push(Frame::Variant {
            sig: value_sig.clone(),
            done: false,
        });
        Ok(value_sig)
    }

    /// Unmarshal a whole byte array in one step
    pub fn get_byte_array(&mut self) -> BusResult<&'a [u8]> {
        let expected = self.next_arg_sig()?;
        if expected != "ay" {
            return Err(BusError::signature(format!(
                "expected '{}' found 'ay'",
                expected
            )));
        }
        self.align(4)?;
        let len = u32::from_le_bytes(self.take_array()?) as usize;
        let bytes = self.take(len)?;
        if let Some(frame) = self.frames.last_mut() {
            frame.consume(2);
        }
        settle(&mut self.frames);
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_layout_and_alignment() {
        let mut w = BodyWriter::new("yqut");
        w.put_byte(7).unwrap();
        w.put_u16(0x0102).unwrap();
        w.put_u32(3).unwrap();
        w.put_u64(4).unwrap();
        let body = w.finish().unwrap();
        assert_eq!(body.len(), 16);
        assert_eq!(&body[0..4], &[7, 0, 2, 1]);
        assert_eq!(&body[4..8], &[3, 0, 0, 0]);
        assert_eq!(&body[8..16], &[4, 0, 0, 0, 0, 0, 0, 0]);

        let mut r = BodyReader::new(&body, "yqut");
        assert_eq!(r.get_byte().unwrap(), 7);
        assert_eq!(r.get_u16().unwrap(), 0x0102);
        assert_eq!(r.get_u32().unwrap(), 3);
        assert_eq!(r.get_u64().unwrap(), 4);
        assert_eq!(r.next_arg_sig(), Err(BusError::NoMore));
    }

    #[test]
    fn test_string_layout() {
        let mut w = BodyWriter::new("sg");
        w.put_string(sig::STRING, "ab").unwrap();
        w.put_string(sig::SIGNATURE, "i").unwrap();
        let body = w.finish().unwrap();
        assert_eq!(body, vec![2, 0, 0, 0, b'a', b'b', 0, 1, b'i', 0]);
    }

    #[test]
    fn test_signature_mismatch() {
        let mut w = BodyWriter::new("s");
        assert!(matches!(w.put_u32(1), Err(BusError::Signature(_))));
        assert!(matches!(
            BodyWriter::new("").put_u32(1),
            Err(BusError::Signature(_))
        ));
    }

    #[test]
    fn test_missing_arguments_detected() {
        let mut w = BodyWriter::new("ii");
        w.put_i32(1).unwrap();
        assert!(matches!(w.finish(), Err(BusError::Signature(_))));
    }

    #[test]
    fn test_array_of_structs() {
        let mut w = BodyWriter::new("a(is)");
        w.open_container(sig::ARRAY).unwrap();
        for (n, s) in [(1, "x"), (2, "yz")] {
            w.open_container(sig::STRUCT_OPEN).unwrap();
            w.put_i32(n).unwrap();
            w.put_string(sig::STRING, s).unwrap();
            w.close_container().unwrap();
        }
        w.close_container().unwrap();
        let body = w.finish().unwrap();

        let mut r = BodyReader::new(&body, "a(is)");
        r.open_container(sig::ARRAY).unwrap();
        let mut seen = Vec::new();
        while r.next_arg_sig().is_ok() {
            r.open_container(sig::STRUCT_OPEN).unwrap();
            let n = r.get_i32().unwrap();
            let s = r.get_string(sig::STRING).unwrap().to_string();
            assert_eq!(r.next_arg_sig(), Err(BusError::NoMore));
            r.close_container().unwrap();
            seen.push((n, s));
        }
        r.close_container().unwrap();
        assert_eq!(seen, vec![(1, "x".to_string()), (2, "yz".to_string())]);
        assert_eq!(r.depth(), 0);
    }

    #[test]
    fn test_empty_array_still_pads_to_element_alignment() {
        let mut w = BodyWriter::new("ya(i)");
        w.put_byte(1).unwrap();
        w.open_container(sig::ARRAY).unwrap();
        w.close_container().unwrap();
        let body = w.finish().unwrap();
        assert_eq!(body.len(), 8);
        assert_eq!(&body[4..8], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_variant_closes_itself() {
        let mut w = BodyWriter::new("vi");
        w.open_variant("s").unwrap();
        assert_eq!(w.next_arg_sig(), Some("s"));
        w.put_string(sig::STRING, "hi").unwrap();
        assert_eq!(w.depth(), 0);
        w.put_i32(9).unwrap();
        let body = w.finish().unwrap();

        let mut r = BodyReader::new(&body, "vi");
        assert_eq!(r.open_variant().unwrap(), "s");
        assert_eq!(r.get_string(sig::STRING).unwrap(), "hi");
        assert_eq!(r.depth(), 0);
        assert_eq!(r.get_i32().unwrap(), 9);
    }

    #[test]
    fn test_nested_variants_close_together() {
        let mut w = BodyWriter::new("v");
        w.open_variant("v").unwrap();
        w.open_variant("ai").unwrap();
        w.open_container(sig::ARRAY).unwrap();
        w.put_i32(1).unwrap();
        w.close_container().unwrap();
        assert_eq!(w.depth(), 0);
        assert!(w.finish().is_ok());
    }

    #[test]
    fn test_byte_array_fast_path_matches_generic_path() {
        let data = [1u8, 2, 3, 4, 5];

        let mut fast = BodyWriter::new("yay");
        fast.put_byte(9).unwrap();
        fast.put_byte_array(&data).unwrap();

        let mut slow = BodyWriter::new("yay");
        slow.put_byte(9).unwrap();
        slow.open_container(sig::ARRAY).unwrap();
        for b in data {
            slow.put_byte(b).unwrap();
        }
        slow.close_container().unwrap();

        let fast = fast.finish().unwrap();
        assert_eq!(fast, slow.finish().unwrap());

        let mut r = BodyReader::new(&fast, "yay");
        r.get_byte().unwrap();
        assert_eq!(r.get_byte_array().unwrap(), &data);
    }

    #[test]
    fn test_truncated_body() {
        let mut r = BodyReader::new(&[1, 0], "u");
        assert!(matches!(r.get_u32(), Err(BusError::Invalid(_))));
    }

    #[test]
    fn test_bad_variant_signature_rejected() {
        let mut w = BodyWriter::new("v");
        assert!(matches!(w.open_variant("ii"), Err(BusError::Signature(_))));
    }

    #[test]
    fn test_invalid_signature_reported_on_first_read() {
        for signature in ["a()", "a{}", "(i"] {
            let r = BodyReader::new(&[0, 0, 0, 0], signature);
            assert!(matches!(r.next_arg_sig(), Err(BusError::Signature(_))));
        }
    }

    #[test]
    fn test_empty_container_in_variant_rejected() {
        for inner in ["a()", "a{}"] {
            let mut body = vec![inner.len() as u8];
            body.extend_from_slice(inner.as_bytes());
            body.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0]);
            let mut r = BodyReader::new(&body, "v");
            assert!(matches!(r.open_variant(), Err(BusError::Signature(_))));
        }
    }

    #[test]
    fn test_variant_nesting_limited() {
        let mut body = Vec::new();
        for _ in 0..40 {
            body.extend_from_slice(&[1, b'v', 0]);
        }
        let mut r = BodyReader::new(&body, "v");
        for _ in 0..sig::MAX_STRUCT_DEPTH {
            assert_eq!(r.open_variant().unwrap(), "v");
        }
        assert!(matches!(r.open_variant(), Err(BusError::Invalid(_))));

        let mut w = BodyWriter::new("v");
        for _ in 0..sig::MAX_STRUCT_DEPTH {
            w.open_variant("v").unwrap();
        }
        assert!(matches!(w.open_variant("v"), Err(BusError::Invalid(_))));
    }

    #[test]
    fn test_array_nesting_through_variants_limited() {
        let outer = format!("{}v", "a".repeat(20));
        let mut w = BodyWriter::new(&outer);
        for _ in 0..20 {
            w.open_container(sig::ARRAY).unwrap();
        }
        w.open_variant(&format!("{}i", "a".repeat(20))).unwrap();
        for _ in 0..12 {
            w.open_container(sig::ARRAY).unwrap();
        }
        assert!(matches!(
            w.open_container(sig::ARRAY),
            Err(BusError::Invalid(_))
        ));
    }
}
