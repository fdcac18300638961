//! File-transfer frames.
//!
//! Frames travel as ordinary chat payloads (`DM <peer> FILE_CHUNK ...` or
//! `MSG FILE_CHUNK ...`), so the server relays them without knowing about
//! transfers beyond skipping them for persistence and unread counting.

use std::fmt;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::error::ProtocolError;

/// Standard alphabet, emits padding, accepts chunks with or without it.
pub const CHUNK_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

const FRAME_KINDS: [&str; 8] = [
    "FILE_META",
    "FILE_QUERY",
    "FILE_BEGIN",
    "FILE_CHUNK",
    "FILE_ACK",
    "FILE_HAVE",
    "FILE_END",
    "FILE_CANCEL",
];

/// What the receiver already holds for a queried hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HaveState {
    Complete,
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferFrame {
    Meta {
        name: String,
        mime: String,
        size: u64,
        hash: String,
    },
    Query {
        hash: String,
    },
    Begin {
        name: String,
        mime: String,
        size: u64,
    },
    Chunk {
        offset: u64,
        data: String,
    },
    /// `hash` is `None` when the receiver saw chunks before any META.
    Ack {
        hash: Option<String>,
        offset: u64,
        written: u64,
    },
    Have {
        hash: String,
        written: u64,
        state: HaveState,
    },
    End {
        name: String,
    },
    Cancel {
        name: String,
    },
}

fn number(raw: Option<&str>, field: &'static str) -> Result<u64, ProtocolError> {
    let raw = raw.ok_or(ProtocolError::MissingArgument(field))?;
    raw.parse().map_err(|_| ProtocolError::InvalidNumber {
        field,
        value: raw.to_string(),
    })
}

fn text(raw: Option<&str>, field: &'static str) -> Result<String, ProtocolError> {
    raw.map(str::to_string)
        .ok_or(ProtocolError::MissingArgument(field))
}

impl TransferFrame {
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let mut parts = payload.split_whitespace();
        let kind = parts.next().ok_or(ProtocolError::Empty)?;
        let frame = match kind {
            "FILE_META" => TransferFrame::Meta {
                name: text(parts.next(), "FILE_META")?,
                mime: text(parts.next(), "FILE_META")?,
                size: number(parts.next(), "size")?,
                hash: text(parts.next(), "FILE_META")?,
            },
            "FILE_QUERY" => TransferFrame::Query {
                hash: text(parts.next(), "FILE_QUERY")?,
            },
            "FILE_BEGIN" => TransferFrame::Begin {
                name: text(parts.next(), "FILE_BEGIN")?,
                mime: text(parts.next(), "FILE_BEGIN")?,
                size: number(parts.next(), "size")?,
            },
            "FILE_CHUNK" => TransferFrame::Chunk {
                offset: number(parts.next(), "offset")?,
                data: text(parts.next(), "FILE_CHUNK")?,
            },
            "FILE_ACK" => {
                let hash = text(parts.next(), "FILE_ACK")?;
                TransferFrame::Ack {
                    hash: (hash != "-").then_some(hash),
                    offset: number(parts.next(), "offset")?,
                    written: number(parts.next(), "written")?,
                }
            }
            "FILE_HAVE" => TransferFrame::Have {
                hash: text(parts.next(), "FILE_HAVE")?,
                written: number(parts.next(), "written")?,
                state: match parts.next() {
                    Some("COMPLETE") => HaveState::Complete,
                    Some("PARTIAL") => HaveState::Partial,
                    _ => return Err(ProtocolError::MissingArgument("FILE_HAVE")),
                },
            },
            "FILE_END" => TransferFrame::End {
                name: text(parts.next(), "FILE_END")?,
            },
            "FILE_CANCEL" => TransferFrame::Cancel {
                name: text(parts.next(), "FILE_CANCEL")?,
            },
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };
        Ok(frame)
    }

    pub fn chunk(offset: u64, bytes: &[u8]) -> Self {
        TransferFrame::Chunk {
            offset,
            data: CHUNK_ENGINE.encode(bytes),
        }
    }
}

impl fmt::Display for TransferFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferFrame::Meta {
                name,
                mime,
                size,
                hash,
            } => write!(f, "FILE_META {name} {mime} {size} {hash}"),
            TransferFrame::Query { hash } => write!(f, "FILE_QUERY {hash}"),
            TransferFrame::Begin { name, mime, size } => {
                write!(f, "FILE_BEGIN {name} {mime} {size}")
            }
            TransferFrame::Chunk { offset, data } => write!(f, "FILE_CHUNK {offset} {data}"),
            TransferFrame::Ack {
                hash,
                offset,
                written,
            } => write!(
                f,
                "FILE_ACK {} {offset} {written}",
                hash.as_deref().unwrap_or("-")
            ),
            TransferFrame::Have {
                hash,
                written,
                state,
            } => {
                let state = match state {
                    HaveState::Complete => "COMPLETE",
                    HaveState::Partial => "PARTIAL",
                };
                write!(f, "FILE_HAVE {hash} {written} {state}")
            }
            TransferFrame::End { name } => write!(f, "FILE_END {name}"),
            TransferFrame::Cancel { name } => write!(f, "FILE_CANCEL {name}"),
        }
    }
}

/// Decode a chunk body.
pub fn decode_chunk(data: &str) -> Result<Vec<u8>, ProtocolError> {
    CHUNK_ENGINE
        .decode(data.trim())
        .map_err(|_| ProtocolError::InvalidBase64)
}

/// Number of bytes `data` decodes to, computed from its length alone.
/// Works with and without trailing `=` padding.
pub fn decoded_len(data: &str) -> usize {
    let body = data.trim().trim_end_matches('=');
    let full = body.len() / 4 * 3;
    match body.len() % 4 {
        2 => full + 1,
        3 => full + 2,
        _ => full,
    }
}

/// Any `FILE_*` frame. These are relayed but never persisted or counted.
pub fn is_transfer_payload(payload: &str) -> bool {
    let kind = payload.split_whitespace().next().unwrap_or("");
    FRAME_KINDS.contains(&kind)
}

/// Bulk chunk data. DM echoes are suppressed for these.
pub fn is_bulk_payload(payload: &str) -> bool {
    payload.starts_with("FILE_CHUNK ")
}

/// Make a file name safe to carry as a single protocol token and to use as
/// a path component.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '/' || c == '\\' || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    match cleaned.trim_start_matches('.') {
        "" => "file".to_string(),
        rest => rest.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_and_have() {
        assert_eq!(
            TransferFrame::parse("FILE_META notes.txt text/plain 1234 abcd").unwrap(),
            TransferFrame::Meta {
                name: "notes.txt".into(),
                mime: "text/plain".into(),
                size: 1234,
                hash: "abcd".into(),
            }
        );
        assert_eq!(
            TransferFrame::parse("FILE_HAVE abcd 4096 PARTIAL").unwrap(),
            TransferFrame::Have {
                hash: "abcd".into(),
                written: 4096,
                state: HaveState::Partial,
            }
        );
        assert!(TransferFrame::parse("FILE_HAVE abcd 4096 MAYBE").is_err());
    }

    #[test]
    fn test_ack_without_hash() {
        let frame = TransferFrame::Ack {
            hash: None,
            offset: 49152,
            written: 49152,
        };
        assert_eq!(frame.to_string(), "FILE_ACK - 49152 49152");
        assert_eq!(TransferFrame::parse(&frame.to_string()).unwrap(), frame);
    }

    #[test]
    fn test_chunk_encoding() {
        let frame = TransferFrame::chunk(10, b"hello");
        let TransferFrame::Chunk { offset, data } = &frame else {
            panic!("not a chunk");
        };
        assert_eq!(*offset, 10);
        assert_eq!(decode_chunk(data).unwrap(), b"hello");
        assert_eq!(decoded_len(data), 5);
    }

    #[test]
    fn test_decoded_len_with_and_without_padding() {
        for len in 0..20usize {
            let bytes = vec![7u8; len];
            let padded = CHUNK_ENGINE.encode(&bytes);
            let bare = padded.trim_end_matches('=').to_string();
            assert_eq!(decoded_len(&padded), len);
            assert_eq!(decoded_len(&bare), len);
            assert_eq!(decode_chunk(&bare).unwrap(), bytes);
        }
    }

    #[test]
    fn test_payload_classification() {
        assert!(is_transfer_payload("FILE_CHUNK 0 AAAA"));
        assert!(is_transfer_payload("FILE_END a.bin"));
        assert!(!is_transfer_payload("FILE_SHARING is fun"));
        assert!(!is_transfer_payload("hello"));
        assert!(is_bulk_payload("FILE_CHUNK 0 AAAA"));
        assert!(!is_bulk_payload("FILE_END a.bin"));
    }

    #[test]
    fn test_sanitize_name() {
        assert_eq!(sanitize_name("my report.pdf"), "my_report.pdf");
        assert_eq!(sanitize_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_name("..."), "file");
    }
}
