//! PAX extended header records
//!
//! A PAX payload is a list of `"<len> <key>=<value>\n"` records where `<len>`
//! is the byte length of the whole record, its own digits included.

use std::collections::BTreeMap;

use crate::error::{TarError, TarResult};

/// Key overriding the entry name
pub const PATH_KEY: &str = "path";
/// Key overriding the link target
pub const LINKPATH_KEY: &str = "linkpath";

/// Encode `path`, `linkpath` and the extra attributes into a PAX payload.
///
/// `path` and `linkpath` always come first; `path`/`linkpath` keys in
/// `attrs` are ignored.
pub fn encode_pax(name: &str, linkname: &str, attrs: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    push_record(&mut out, PATH_KEY, name);
    push_record(&mut out, LINKPATH_KEY, linkname);
    for (key, value) in attrs {
        if key == PATH_KEY || key == LINKPATH_KEY {
            continue;
        }
        push_record(&mut out, key, value);
    }
    out
}

/// Decode a PAX payload into its key/value mapping. Later records win.
pub fn decode_pax(bytes: &[u8]) -> TarResult<BTreeMap<String, String>> {
    let mut attrs = BTreeMap::new();
    let mut rest = bytes;
    while let Some(&first) = rest.first() {
        // payload is NUL padded up to the block
        if first == 0 {
            break;
        }
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| invalid("missing length separator"))?;
        let len: usize = std::str::from_utf8(&rest[..space])
            .ok()
            .and_then(|digits| digits.parse().ok())
            .ok_or_else(|| invalid("length is not a decimal number"))?;
        if len <= space + 1 || len > rest.len() {
            return Err(invalid(&format!("record length {len} out of range")));
        }
        let record = &rest[space + 1..len];
        let record = record.strip_suffix(b"\n").unwrap_or(record);
        let eq = record
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| invalid("missing '=' in record"))?;
        let key = String::from_utf8_lossy(&record[..eq]).into_owned();
        let value = String::from_utf8_lossy(&record[eq + 1..]).into_owned();
        attrs.insert(key, value);
        rest = &rest[len..];
    }
    Ok(attrs)
}

fn invalid(reason: &str) -> TarError {
    TarError::InvalidPaxRecord(reason.to_string())
}

fn push_record(out: &mut Vec<u8>, key: &str, value: &str) {
    // " " + key + "=" + value + "\n"
    let payload = key.len() + value.len() + 3;
    let mut len = payload + digit_count(payload);
    while payload + digit_count(len) != len {
        len = payload + digit_count(len);
    }
    out.extend_from_slice(format!("{len} {key}={value}\n").as_bytes());
}

fn digit_count(n: usize) -> usize {
    n.checked_ilog10().map_or(1, |d| d as usize + 1)
}
