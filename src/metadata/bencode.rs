use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use thiserror::Error;

/// Containers deeper than this are rejected rather than recursed into.
const MAX_DEPTH: usize = 64;

pub type Dictionary = BTreeMap<Vec<u8>, BencodeValue>;

/// Byte ranges of each top-level dictionary value, as they appeared in the input.
pub type Spans = BTreeMap<Vec<u8>, Range<usize>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BencodeValue {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<BencodeValue>),
    Dictionary(Dictionary),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BencodeError {
    #[error("{num_remaining} unconsumed byte(s) after the top-level value")]
    UnconsumedContents { num_remaining: usize },
    #[error("input ended before the value was complete")]
    InsufficientContents,
    #[error("unknown type marker {value:#04x} at position {pos}")]
    UnknownType { pos: usize, value: u8 },
    #[error("integer at position {pos} has leading zeros")]
    IntegerWithLeadingZeros { pos: usize },
    #[error("integer at position {pos} has no digits")]
    EmptyInteger { pos: usize },
    #[error("integer at position {pos} is not representable")]
    IllegalInteger { pos: usize },
    #[error("value at position {pos} is not terminated by 'e'")]
    UnterminatedValue { pos: usize },
    #[error("string length at position {pos} is illegal")]
    IllegalStringLength { pos: usize },
    #[error("expected ':' after string length at position {pos}")]
    StringMissingSeparator { pos: usize },
    #[error("dictionary key at position {pos} is not a byte string")]
    IllegalDictionaryKeyType { pos: usize },
    #[error("dictionary key '{name}' appears more than once")]
    DuplicateDictionaryKey { name: String },
    #[error("containers nested too deeply at position {pos}")]
    NestingTooDeep { pos: usize },
}

type Result<T> = std::result::Result<T, BencodeError>;

fn write_bytes(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    for byte in bytes {
        write!(f, "{:02X}", byte)?;
    }
    Ok(())
}

fn write_byte_string(bytes: &[u8], f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(bytes) {
        Ok(s) if bytes.iter().all(|&byte| (0x20..=0x7e).contains(&byte)) => write!(f, "{}", s),
        _ => write_bytes(bytes, f),
    }
}

impl fmt::Display for BencodeValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BencodeValue::Integer(num) => write!(f, "{}", num),
            BencodeValue::ByteString(bytes) => write_byte_string(bytes, f),
            BencodeValue::List(elements) => {
                write!(f, "[")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", element)?;
                }
                write!(f, "]")
            },
            BencodeValue::Dictionary(items) => {
                write!(f, "{{")?;
                for (i, (key, value)) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write_byte_string(key, f)?;
                    write!(f, " => {}", value)?;
                }
                write!(f, "}}")
            },
        }
    }
}

impl BencodeValue {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(num) => Some(*num),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::ByteString(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(elements) => Some(elements),
            _ => None,
        }
    }

    pub fn as_dictionary(&self) -> Option<&Dictionary> {
        match self {
            BencodeValue::Dictionary(items) => Some(items),
            _ => None,
        }
    }
}

impl TryFrom<&[u8]> for BencodeValue {
    type Error = BencodeError;
    fn try_from(bytes: &[u8]) -> Result<Self> {
        decode(bytes)
    }
}

/// Canonical encoding: dictionary keys are written in sorted order, which
/// is not necessarily the order they were read in.
impl From<&BencodeValue> for Vec<u8> {
    fn from(value: &BencodeValue) -> Vec<u8> {
        let mut v = Vec::new();
        encode_into(value, &mut v);
        v
    }
}

fn encode_into(value: &BencodeValue, v: &mut Vec<u8>) {
    match value {
        BencodeValue::Integer(i) => v.extend(format!("i{}e", i).as_bytes()),
        BencodeValue::ByteString(bytes) => {
            v.extend(format!("{}:", bytes.len()).as_bytes());
            v.extend_from_slice(bytes);
        },
        BencodeValue::List(elements) => {
            v.push(b'l');
            for element in elements {
                encode_into(element, v);
            }
            v.push(b'e');
        },
        BencodeValue::Dictionary(items) => {
            v.push(b'd');
            for (key, value) in items {
                v.extend(format!("{}:", key.len()).as_bytes());
                v.extend_from_slice(key);
                encode_into(value, v);
            }
            v.push(b'e');
        },
    }
}

pub fn decode(bytes: &[u8]) -> Result<BencodeValue> {
    BencodeParser::new(bytes, false).deserialize()
}

/// Decodes `bytes` and also reports where each value of the top-level
/// dictionary sits in the input, so callers can hash the original bytes.
pub fn decode_with_spans(bytes: &[u8]) -> Result<(BencodeValue, Spans)> {
    let mut parser = BencodeParser::new(bytes, true);
    let value = parser.deserialize()?;
    Ok((value, parser.spans.unwrap_or_default()))
}

#[derive(Debug)]
struct BencodeParser<'a> {
    contents: &'a [u8],
    pos: usize,
    depth: usize,
    spans: Option<Spans>,
}

impl<'a> BencodeParser<'a> {

    fn new(contents: &'a [u8], record_spans: bool) -> Self {
        Self {
            contents,
            pos: 0,
            depth: 0,
            spans: if record_spans { Some(Spans::new()) } else { None },
        }
    }

    fn deserialize(&mut self) -> Result<BencodeValue> {
        let value: BencodeValue = self.parse_value()?;
        if self.pos != self.contents.len() {
            Err(BencodeError::UnconsumedContents { num_remaining: self.contents.len() - self.pos })
        } else {
            Ok(value)
        }
    }

    fn parse_value(&mut self) -> Result<BencodeValue> {
        self.ensure_available()?;
        let first: u8 = self.contents[self.pos];
        match first {
            b'i' => self.parse_integer(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dictionary(),
            b'0'..=b'9' => Ok(BencodeValue::ByteString(self.parse_bytes()?)),
            _ => Err(BencodeError::UnknownType { pos: self.pos, value: first }),
        }
    }

    fn parse_integer_value(&mut self, leading_zeros_allowed: bool) -> Result<i64> {
        let start = self.pos;
        loop {
            self.ensure_available()?;
            if !self.contents[self.pos].is_ascii_digit() {
                break;
            }
            self.pos += 1;
        }
        let slice = &self.contents[start..self.pos];
        if slice.is_empty() {
            return Err(BencodeError::EmptyInteger { pos: start });
        }
        if !leading_zeros_allowed && slice[0] == b'0' && slice.len() > 1 {
            return Err(BencodeError::IntegerWithLeadingZeros { pos: start });
        }

        let s = std::str::from_utf8(slice).map_err(|_| BencodeError::IllegalInteger { pos: start })?;
        s.parse::<i64>().map_err(|_| BencodeError::IllegalInteger { pos: start })
    }

    fn parse_integer(&mut self) -> Result<BencodeValue> {
        self.pos += 1;
        let mut sign: i64 = 1;
        self.ensure_available()?;
        if self.contents[self.pos] == b'-' {
            sign = -1;
            self.pos += 1;
        }
        let value: i64 = self.parse_integer_value(false)?;
        if value == 0 && sign == -1 {
            return Err(BencodeError::IllegalInteger { pos: self.pos });
        }
        self.expect_end()?;
        self.pos += 1;
        Ok(BencodeValue::Integer(sign * value))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>> {
        let start = self.pos;
        let length: i64 = self.parse_integer_value(true)?;
        let length = usize::try_from(length).map_err(|_| BencodeError::IllegalStringLength { pos: start })?;
        self.ensure_available()?;
        if self.contents[self.pos] != b':' {
            return Err(BencodeError::StringMissingSeparator { pos: self.pos });
        }
        self.pos += 1;
        let end = self.pos.checked_add(length).ok_or(BencodeError::IllegalStringLength { pos: start })?;
        if end > self.contents.len() {
            return Err(BencodeError::InsufficientContents);
        }
        let bytes = self.contents[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<BencodeValue> {
        self.enter()?;
        self.pos += 1;
        let mut values: Vec<BencodeValue> = Vec::new();
        loop {
            self.ensure_available()?;
            if self.contents[self.pos] == b'e' {
                break;
            }
            values.push(self.parse_value()?);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(BencodeValue::List(values))
    }

    fn parse_dictionary(&mut self) -> Result<BencodeValue> {
        self.enter()?;
        let top_level = self.depth == 1;
        self.pos += 1;
        let mut map = Dictionary::new();
        loop {
            self.ensure_available()?;
            let next = self.contents[self.pos];
            if next == b'e' {
                break;
            }
            if !next.is_ascii_digit() {
                return Err(BencodeError::IllegalDictionaryKeyType { pos: self.pos });
            }
            // Key order is not enforced: descriptors with unsorted keys exist
            // in the wild and their info hash is taken over the raw bytes.
            let key = self.parse_bytes()?;
            if map.contains_key(&key) {
                return Err(BencodeError::DuplicateDictionaryKey { name: String::from_utf8_lossy(&key).into_owned() });
            }

            let start = self.pos;
            let value: BencodeValue = self.parse_value()?;
            if top_level {
                if let Some(spans) = self.spans.as_mut() {
                    spans.insert(key.clone(), start..self.pos);
                }
            }
            map.insert(key, value);
        }
        self.pos += 1;
        self.depth -= 1;
        Ok(BencodeValue::Dictionary(map))
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            Err(BencodeError::NestingTooDeep { pos: self.pos })
        } else {
            Ok(())
        }
    }

    fn ensure_available(&self) -> Result<()> {
        if self.pos >= self.contents.len() {
            Err(BencodeError::InsufficientContents)
        } else {
            Ok(())
        }
    }

    fn expect_end(&self) -> Result<()> {
        self.ensure_available()?;
        if self.contents[self.pos] != b'e' {
            Err(BencodeError::UnterminatedValue { pos: self.pos })
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_scalars() {
        assert_eq!(decode(b"i42e"), Ok(BencodeValue::Integer(42)));
        assert_eq!(decode(b"i-7e"), Ok(BencodeValue::Integer(-7)));
        assert_eq!(decode(b"i0e"), Ok(BencodeValue::Integer(0)));
        assert_eq!(decode(b"4:spam"), Ok(BencodeValue::ByteString(b"spam".to_vec())));
        assert_eq!(decode(b"0:"), Ok(BencodeValue::ByteString(Vec::new())));
    }

    #[test]
    fn decodes_nested_containers() {
        let value = decode(b"d4:listli1ei2ee3:subd1:a1:bee").unwrap();
        let items = value.as_dictionary().unwrap();
        let list = items.get(b"list".as_slice()).and_then(BencodeValue::as_list).unwrap();
        assert_eq!(list, &[BencodeValue::Integer(1), BencodeValue::Integer(2)]);
        let sub = items.get(b"sub".as_slice()).and_then(BencodeValue::as_dictionary).unwrap();
        assert_eq!(sub.get(b"a".as_slice()).and_then(BencodeValue::as_bytes), Some(b"b".as_slice()));
    }

    #[test]
    fn rejects_structural_violations() {
        assert_eq!(decode(b"i12"), Err(BencodeError::InsufficientContents));
        assert_eq!(decode(b"li1e"), Err(BencodeError::InsufficientContents));
        assert_eq!(decode(b"d1:ai1e"), Err(BencodeError::InsufficientContents));
        assert_eq!(decode(b"10:short"), Err(BencodeError::InsufficientContents));
        assert_eq!(decode(b"i03e"), Err(BencodeError::IntegerWithLeadingZeros { pos: 1 }));
        assert!(matches!(decode(b"i-0e"), Err(BencodeError::IllegalInteger { .. })));
        assert!(matches!(decode(b"ie"), Err(BencodeError::EmptyInteger { .. })));
        assert!(matches!(decode(b"4spam"), Err(BencodeError::StringMissingSeparator { .. })));
        assert!(matches!(decode(b"x"), Err(BencodeError::UnknownType { pos: 0, value: b'x' })));
        assert!(matches!(decode(b"di1ei2ee"), Err(BencodeError::IllegalDictionaryKeyType { .. })));
        assert!(matches!(decode(b"i1ei2e"), Err(BencodeError::UnconsumedContents { num_remaining: 3 })));
        assert!(matches!(decode(b"d1:ai1e1:ai2ee"), Err(BencodeError::DuplicateDictionaryKey { .. })));
    }

    #[test]
    fn rejects_runaway_nesting() {
        let mut bytes = vec![b'l'; MAX_DEPTH + 1];
        bytes.extend(vec![b'e'; MAX_DEPTH + 1]);
        assert!(matches!(decode(&bytes), Err(BencodeError::NestingTooDeep { .. })));
    }

    #[test]
    fn accepts_unsorted_keys_but_encodes_sorted() {
        let value = decode(b"d1:bi2e1:ai1ee").unwrap();
        assert_eq!(Vec::from(&value), b"d1:ai1e1:bi2ee".to_vec());
    }

    #[test]
    fn spans_cover_raw_top_level_values() {
        let bytes = b"d3:fooli1ei2ee4:infod1:zi1e1:ai2eee";
        let (_, spans) = decode_with_spans(bytes).unwrap();
        let info = spans.get(b"info".as_slice()).unwrap().clone();
        assert_eq!(&bytes[info], b"d1:zi1e1:ai2ee");
        let foo = spans.get(b"foo".as_slice()).unwrap().clone();
        assert_eq!(&bytes[foo], b"li1ei2ee");
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn nested_dictionaries_do_not_record_spans() {
        let (_, spans) = decode_with_spans(b"d1:ad1:bi1eee").unwrap();
        assert_eq!(spans.keys().collect::<Vec<_>>(), vec![&b"a".to_vec()]);
    }
}
