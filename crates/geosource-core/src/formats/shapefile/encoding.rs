//! Text encoding detection for DBF attribute data

use encoding_rs::{Encoding, GBK, UTF_8};
use std::path::Path;

/// Fallback when neither a `.cpg` file nor the language driver names an encoding
pub const DEFAULT_ENCODING: &str = "GBK";

/// Encoding for a DBF language driver id (header byte 29)
pub fn encoding_for_ldid(ldid: u8) -> Option<&'static Encoding> {
    let label: &[u8] = match ldid {
        0x03 | 0x57 | 0x58 | 0x59 => b"windows-1252",
        0x13 | 0x7B => b"shift_jis",
        0x26 | 0x65 => b"ibm866",
        0x4D | 0x7A => b"gbk",
        0x4E | 0x79 => b"euc-kr",
        0x4F | 0x78 => b"big5",
        0x7C => b"windows-874",
        0x7D => b"windows-1255",
        0x7E => b"windows-1256",
        0xC8 => b"windows-1250",
        0xC9 => b"windows-1251",
        0xCA => b"windows-1254",
        0xCB => b"windows-1253",
        0xCC => b"windows-1257",
        _ => return None,
    };
    Encoding::for_label(label)
}

/// Language driver id to record when writing a DBF in the given encoding
pub fn ldid_for_encoding(encoding: &'static Encoding) -> u8 {
    match encoding.name() {
        "windows-1252" => 0x57,
        "Shift_JIS" => 0x13,
        "GBK" | "gb18030" => 0x4D,
        "EUC-KR" => 0x4E,
        "Big5" => 0x4F,
        "windows-1250" => 0xC8,
        "windows-1251" => 0xC9,
        _ => 0x00,
    }
}

/// Encoding named by `.cpg` content: a WHATWG label or a Windows code page number
pub fn encoding_from_cpg(content: &str) -> Option<&'static Encoding> {
    let label = content.trim();
    let label = label.strip_prefix("ANSI ").unwrap_or(label).trim();
    let mapped: Option<&str> = match label.to_ascii_uppercase().as_str() {
        "936" | "CP936" => Some("gbk"),
        "950" | "CP950" => Some("big5"),
        "932" | "CP932" => Some("shift_jis"),
        "949" | "CP949" => Some("euc-kr"),
        "65001" | "UTF8" | "UTF-8" => Some("utf-8"),
        "874" => Some("windows-874"),
        "866" => Some("ibm866"),
        "1250" | "1251" | "1252" | "1253" | "1254" | "1255" | "1256" | "1257" | "1258" => None,
        "88591" => Some("iso-8859-1"),
        "88592" => Some("iso-8859-2"),
        "88595" => Some("iso-8859-5"),
        _ => None,
    };
    if let Some(mapped) = mapped {
        return Encoding::for_label(mapped.as_bytes());
    }
    if label.len() == 4 && label.starts_with("125") {
        return Encoding::for_label(format!("windows-{label}").as_bytes());
    }
    Encoding::for_label(label.as_bytes())
}

/// Resolve the encoding of a DBF: `.cpg` first, then the language driver id,
/// then `default_label` (GBK when the label is unknown).
pub fn resolve(cpg_path: Option<&Path>, ldid: u8, default_label: &str) -> &'static Encoding {
    if let Some(path) = cpg_path {
        if let Ok(content) = std::fs::read_to_string(path) {
            match encoding_from_cpg(&content) {
                Some(encoding) => return encoding,
                None => tracing::warn!(
                    path = %path.display(),
                    content = content.trim(),
                    "unrecognised .cpg encoding"
                ),
            }
        }
    }
    if let Some(encoding) = encoding_for_ldid(ldid) {
        return encoding;
    }
    Encoding::for_label(default_label.as_bytes()).unwrap_or(GBK)
}

/// Decode field bytes; malformed sequences become U+FFFD
pub fn decode(encoding: &'static Encoding, bytes: &[u8]) -> String {
    let (text, _) = encoding.decode_without_bom_handling(bytes);
    text.into_owned()
}

/// Encode text; unmappable characters become numeric character references
pub fn encode(encoding: &'static Encoding, text: &str) -> Vec<u8> {
    if encoding == UTF_8 {
        return text.as_bytes().to_vec();
    }
    let (bytes, _, _) = encoding.encode(text);
    bytes.into_owned()
}
