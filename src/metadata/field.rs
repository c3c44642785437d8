use thiserror::Error;

use crate::metadata::bencode::{BencodeValue, Dictionary};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("missing required key '{0}'")]
    MissingRequiredKey(&'static str),
    #[error("key '{0}' does not map to a byte string")]
    KeyDoesNotMapToString(&'static str),
    #[error("key '{0}' does not map to an integer")]
    KeyDoesNotMapToInteger(&'static str),
    #[error("key '{0}' does not map to a list")]
    KeyDoesNotMapToList(&'static str),
    #[error("key '{0}' does not map to a dictionary")]
    KeyDoesNotMapToDictionary(&'static str),
    #[error("key '{key}' maps to negative integer {value}")]
    NegativeInteger { key: &'static str, value: i64 },
    #[error("key '{0}' is not valid UTF-8")]
    InvalidUtf8(&'static str),
}

type Result<T> = std::result::Result<T, FieldError>;

fn lookup<'a>(items: &'a Dictionary, key: &'static str) -> Option<&'a BencodeValue> {
    items.get(key.as_bytes())
}

pub(crate) fn convert_string(value: &BencodeValue, key: &'static str) -> Result<String> {
    match value {
        BencodeValue::ByteString(bytes) => {
            std::str::from_utf8(bytes).map(str::to_owned).map_err(|_| FieldError::InvalidUtf8(key))
        },
        _ => Err(FieldError::KeyDoesNotMapToString(key)),
    }
}

pub(crate) fn optional_string(items: &Dictionary, key: &'static str) -> Result<Option<String>> {
    lookup(items, key).map(|v| convert_string(v, key)).transpose()
}

pub(crate) fn required_string(items: &Dictionary, key: &'static str) -> Result<String> {
    optional_string(items, key)?.ok_or(FieldError::MissingRequiredKey(key))
}

/// Like `convert_string`, but invalid UTF-8 is replaced rather than rejected.
/// For descriptive text that may be in a legacy encoding.
pub(crate) fn lossy_string(value: &BencodeValue, key: &'static str) -> Result<String> {
    value
        .as_bytes()
        .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
        .ok_or(FieldError::KeyDoesNotMapToString(key))
}

pub(crate) fn optional_lossy_string(items: &Dictionary, key: &'static str) -> Result<Option<String>> {
    lookup(items, key).map(|v| lossy_string(v, key)).transpose()
}

pub(crate) fn required_lossy_string(items: &Dictionary, key: &'static str) -> Result<String> {
    optional_lossy_string(items, key)?.ok_or(FieldError::MissingRequiredKey(key))
}

pub(crate) fn optional_bytes<'a>(items: &'a Dictionary, key: &'static str) -> Result<Option<&'a [u8]>> {
    match lookup(items, key) {
        Some(v) => v.as_bytes().map(Some).ok_or(FieldError::KeyDoesNotMapToString(key)),
        None => Ok(None),
    }
}

pub(crate) fn required_bytes<'a>(items: &'a Dictionary, key: &'static str) -> Result<&'a [u8]> {
    optional_bytes(items, key)?.ok_or(FieldError::MissingRequiredKey(key))
}

pub(crate) fn optional_uint(items: &Dictionary, key: &'static str) -> Result<Option<u64>> {
    match lookup(items, key) {
        Some(BencodeValue::Integer(num)) => {
            u64::try_from(*num).map(Some).map_err(|_| FieldError::NegativeInteger { key, value: *num })
        },
        Some(_) => Err(FieldError::KeyDoesNotMapToInteger(key)),
        None => Ok(None),
    }
}

pub(crate) fn required_uint(items: &Dictionary, key: &'static str) -> Result<u64> {
    optional_uint(items, key)?.ok_or(FieldError::MissingRequiredKey(key))
}

pub(crate) fn optional_list<'a>(items: &'a Dictionary, key: &'static str) -> Result<Option<&'a [BencodeValue]>> {
    match lookup(items, key) {
        Some(v) => v.as_list().map(Some).ok_or(FieldError::KeyDoesNotMapToList(key)),
        None => Ok(None),
    }
}

pub(crate) fn optional_dictionary<'a>(items: &'a Dictionary, key: &'static str) -> Result<Option<&'a Dictionary>> {
    match lookup(items, key) {
        Some(v) => v.as_dictionary().map(Some).ok_or(FieldError::KeyDoesNotMapToDictionary(key)),
        None => Ok(None),
    }
}

pub(crate) fn required_dictionary<'a>(items: &'a Dictionary, key: &'static str) -> Result<&'a Dictionary> {
    optional_dictionary(items, key)?.ok_or(FieldError::MissingRequiredKey(key))
}

pub(crate) fn string_list(elements: &[BencodeValue], key: &'static str) -> Result<Vec<String>> {
    elements.iter().map(|element| convert_string(element, key)).collect()
}

pub(crate) fn lossy_string_list(elements: &[BencodeValue], key: &'static str) -> Result<Vec<String>> {
    elements.iter().map(|element| lossy_string(element, key)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::bencode::decode;

    fn dictionary(bytes: &[u8]) -> Dictionary {
        match decode(bytes).unwrap() {
            BencodeValue::Dictionary(items) => items,
            other => panic!("expected dictionary, got {other}"),
        }
    }

    #[test]
    fn extracts_typed_fields() {
        let items = dictionary(b"d1:ai5e1:b3:abc1:cl1:x1:yee");
        assert_eq!(required_uint(&items, "a"), Ok(5));
        assert_eq!(required_string(&items, "b"), Ok("abc".to_string()));
        assert_eq!(optional_string(&items, "zzz"), Ok(None));
        let list = optional_list(&items, "c").unwrap().unwrap();
        assert_eq!(string_list(list, "c"), Ok(vec!["x".to_string(), "y".to_string()]));
    }

    #[test]
    fn reports_type_and_presence_errors() {
        let items = dictionary(b"d1:ai-5e1:b3:abce");
        assert_eq!(required_uint(&items, "a"), Err(FieldError::NegativeInteger { key: "a", value: -5 }));
        assert_eq!(required_uint(&items, "b"), Err(FieldError::KeyDoesNotMapToInteger("b")));
        assert_eq!(required_string(&items, "missing"), Err(FieldError::MissingRequiredKey("missing")));
        assert_eq!(optional_list(&items, "b"), Err(FieldError::KeyDoesNotMapToList("b")));
    }

    #[test]
    fn lossy_strings_accept_legacy_encodings() {
        let items = dictionary(b"d1:a2:\xD6\xD01:bi1e1:cl2:ok1:\xFFee");
        assert_eq!(required_string(&items, "a"), Err(FieldError::InvalidUtf8("a")));
        assert_eq!(required_lossy_string(&items, "a"), Ok("\u{FFFD}\u{FFFD}".to_string()));
        assert_eq!(optional_lossy_string(&items, "b"), Err(FieldError::KeyDoesNotMapToString("b")));
        assert_eq!(optional_lossy_string(&items, "zzz"), Ok(None));
        let list = optional_list(&items, "c").unwrap().unwrap();
        assert_eq!(lossy_string_list(list, "c"), Ok(vec!["ok".to_string(), "\u{FFFD}".to_string()]));
    }
}
