//! Canonical binary data format.
//!
//! Every value is a type byte followed by its payload:
//!
//! ```text
//! 0x00            null
//! 0x10 / 0x11     false / true
//! 0x28 i64 BE     integer
//! 0x48 u32 BE n   UTF-8 string of n bytes
//! 0x58 u32 BE n   raw bytes
//! 0x60 ... 0x80   list
//! ```
//!
//! There is exactly one encoding per value, so signatures and hashes can be
//! computed over encoded bytes.

use crate::core::EncodeError;

const NULL: u8 = 0x00;
const FALSE: u8 = 0x10;
const TRUE: u8 = 0x11;
const LONG: u8 = 0x28;
const STRING: u8 = 0x48;
const RAW: u8 = 0x58;
const LIST: u8 = 0x60;
const END: u8 = 0x80;

/// Lists may nest this deep.
const MAX_DEPTH: usize = 16;

/// A decoded value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BdfValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Long(i64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Raw(Vec<u8>),
    /// Nested list.
    List(BdfList),
}

impl From<i64> for BdfValue {
    fn from(v: i64) -> Self {
        BdfValue::Long(v)
    }
}

impl From<&str> for BdfValue {
    fn from(v: &str) -> Self {
        BdfValue::String(v.to_owned())
    }
}

impl From<&[u8]> for BdfValue {
    fn from(v: &[u8]) -> Self {
        BdfValue::Raw(v.to_vec())
    }
}

impl<T: Into<BdfValue>> From<Option<T>> for BdfValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(BdfValue::Null, Into::into)
    }
}

/// An ordered list of values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BdfList(Vec<BdfValue>);

/// Build a [`BdfList`] from values convertible into [`BdfValue`].
#[macro_export]
macro_rules! bdf_list {
    ($($v:expr),* $(,)?) => {
        $crate::message::BdfList::from_values(vec![$($crate::message::BdfValue::from($v)),*])
    };
}

impl BdfList {
    /// Wrap a vector of values.
    pub fn from_values(values: Vec<BdfValue>) -> Self {
        Self(values)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get(&self, index: usize) -> Result<&BdfValue, EncodeError> {
        self.0
            .get(index)
            .ok_or_else(|| EncodeError::Format(format!("no element at {index}")))
    }

    /// Integer at `index`.
    pub fn get_long(&self, index: usize) -> Result<i64, EncodeError> {
        match self.get(index)? {
            BdfValue::Long(v) => Ok(*v),
            other => Err(type_error(index, "integer", other)),
        }
    }

    /// String at `index`.
    pub fn get_string(&self, index: usize) -> Result<&str, EncodeError> {
        match self.get(index)? {
            BdfValue::String(v) => Ok(v),
            other => Err(type_error(index, "string", other)),
        }
    }

    /// String or null at `index`.
    pub fn get_optional_string(&self, index: usize) -> Result<Option<&str>, EncodeError> {
        match self.get(index)? {
            BdfValue::Null => Ok(None),
            BdfValue::String(v) => Ok(Some(v)),
            other => Err(type_error(index, "string or null", other)),
        }
    }

    /// Raw bytes at `index`.
    pub fn get_raw(&self, index: usize) -> Result<&[u8], EncodeError> {
        match self.get(index)? {
            BdfValue::Raw(v) => Ok(v),
            other => Err(type_error(index, "raw", other)),
        }
    }

    /// Encode the list canonically.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_list(&mut out, self);
        out
    }

    /// Decode a list that must span all of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EncodeError> {
        let mut reader = Reader { bytes, pos: 0 };
        let value = reader.read_value(0)?;
        if reader.pos != bytes.len() {
            return Err(EncodeError::Format("trailing bytes".into()));
        }
        match value {
            BdfValue::List(list) => Ok(list),
            other => Err(EncodeError::Format(format!("expected list, got {other:?}"))),
        }
    }
}

fn type_error(index: usize, expected: &str, got: &BdfValue) -> EncodeError {
    EncodeError::Format(format!("element {index}: expected {expected}, got {got:?}"))
}

fn write_value(out: &mut Vec<u8>, value: &BdfValue) {
    match value {
        BdfValue::Null => out.push(NULL),
        BdfValue::Bool(b) => out.push(if *b { TRUE } else { FALSE }),
        BdfValue::Long(v) => {
            out.push(LONG);
            out.extend_from_slice(&v.to_be_bytes());
        }
        BdfValue::String(s) => {
            out.push(STRING);
            out.extend_from_slice(&(s.len() as u32).to_be_bytes());
            out.extend_from_slice(s.as_bytes());
        }
        BdfValue::Raw(r) => {
            out.push(RAW);
            out.extend_from_slice(&(r.len() as u32).to_be_bytes());
            out.extend_from_slice(r);
        }
        BdfValue::List(list) => write_list(out, list),
    }
}

fn write_list(out: &mut Vec<u8>, list: &BdfList) {
    out.push(LIST);
    for value in &list.0 {
        write_value(out, value);
    }
    out.push(END);
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], EncodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| EncodeError::Format("unexpected end of input".into()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<usize, EncodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn read_value(&mut self, depth: usize) -> Result<BdfValue, EncodeError> {
        let type_byte = self.take(1)?[0];
        match type_byte {
            NULL => Ok(BdfValue::Null),
            FALSE => Ok(BdfValue::Bool(false)),
            TRUE => Ok(BdfValue::Bool(true)),
            LONG => {
                let mut b = [0u8; 8];
                b.copy_from_slice(self.take(8)?);
                Ok(BdfValue::Long(i64::from_be_bytes(b)))
            }
            STRING => {
                let len = self.read_u32()?;
                let s = std::str::from_utf8(self.take(len)?)
                    .map_err(|_| EncodeError::Format("invalid UTF-8".into()))?;
                Ok(BdfValue::String(s.to_owned()))
            }
            RAW => {
                let len = self.read_u32()?;
                Ok(BdfValue::Raw(self.take(len)?.to_vec()))
            }
            LIST => {
                if depth >= MAX_DEPTH {
                    return Err(EncodeError::Format("nesting too deep".into()));
                }
                let mut values = Vec::new();
                loop {
                    if self.bytes.get(self.pos) == Some(&END) {
                        self.pos += 1;
                        return Ok(BdfValue::List(BdfList(values)));
                    }
                    values.push(self.read_value(depth + 1)?);
                }
            }
            other => Err(EncodeError::Format(format!("unknown type byte {other:#04x}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_encoding() {
        let list = bdf_list![1i64, "a", None::<&str>];
        assert_eq!(
            hex::encode(list.to_bytes()),
            "60280000000000000001480000000161\
             0080"
        );
    }

    #[test]
    fn test_decode_accessors() {
        let raw: &[u8] = &[1, 2, 3];
        let list = bdf_list![7i64, "text", raw, None::<&str>];
        let decoded = BdfList::from_bytes(&list.to_bytes()).unwrap();
        assert_eq!(decoded, list);
        assert_eq!(decoded.get_long(0).unwrap(), 7);
        assert_eq!(decoded.get_string(1).unwrap(), "text");
        assert_eq!(decoded.get_raw(2).unwrap(), &[1, 2, 3]);
        assert_eq!(decoded.get_optional_string(3).unwrap(), None);
        assert!(decoded.get_string(0).is_err());
        assert!(decoded.get_long(9).is_err());
    }

    #[test]
    fn test_nested_list() {
        let inner = BdfValue::List(bdf_list![1i64]);
        let outer = BdfList::from_values(vec![inner.clone(), BdfValue::Bool(true)]);
        let decoded = BdfList::from_bytes(&outer.to_bytes()).unwrap();
        assert_eq!(decoded, outer);
    }

    #[test]
    fn test_rejects_malformed() {
        // Truncated string
        assert!(BdfList::from_bytes(&[LIST, STRING, 0, 0, 0, 5, b'a']).is_err());
        // Missing end marker
        assert!(BdfList::from_bytes(&[LIST, NULL]).is_err());
        // Trailing bytes
        assert!(BdfList::from_bytes(&[LIST, END, NULL]).is_err());
        // Not a list
        assert!(BdfList::from_bytes(&[NULL]).is_err());
        // Unknown type
        assert!(BdfList::from_bytes(&[LIST, 0x99, END]).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut bytes = vec![LIST; MAX_DEPTH + 2];
        bytes.extend(vec![END; MAX_DEPTH + 2]);
        assert!(BdfList::from_bytes(&bytes).is_err());
    }
}
