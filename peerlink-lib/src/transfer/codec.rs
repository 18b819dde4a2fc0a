//! Wire format of the transfer protocol.
//!
//! Binary chunk frames carry the owning file id inline:
//!
//! ```text
//! [1 byte: id length N] [N bytes: file id, UTF-8] [rest: chunk payload]
//! ```
//!
//! Control messages travel as UTF-8 JSON text frames on the same channel.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::transfer::FileMetadata;

pub const MAX_FILE_ID_LEN: usize = u8::MAX as usize;

/// Closed union of control frames; anything else on the text path is a
/// codec error and the frame is dropped.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileStart {
        #[serde(rename = "fileId")]
        file_id: String,
        metadata: FileMetadata,
    },
    FileEnd {
        #[serde(rename = "fileId")]
        file_id: String,
    },
}

pub fn encode_chunk(file_id: &str, payload: &[u8]) -> Result<Bytes, Error> {
    let id = file_id.as_bytes();
    if id.len() > MAX_FILE_ID_LEN {
        return Err(Error::Codec(format!(
            "file id of {} bytes exceeds the {} byte limit",
            id.len(),
            MAX_FILE_ID_LEN
        )));
    }
    let mut frame = BytesMut::with_capacity(1 + id.len() + payload.len());
    frame.put_u8(id.len() as u8);
    frame.put_slice(id);
    frame.put_slice(payload);
    Ok(frame.freeze())
}

pub fn decode_chunk(frame: &[u8]) -> Result<(&str, &[u8]), Error> {
    let (&id_len, rest) = frame
        .split_first()
        .ok_or_else(|| Error::Codec("empty frame".to_owned()))?;
    let id_len = id_len as usize;
    if rest.len() < id_len {
        return Err(Error::Codec(format!(
            "declared id length {} exceeds frame size {}",
            id_len,
            frame.len()
        )));
    }
    let (id, payload) = rest.split_at(id_len);
    let id = std::str::from_utf8(id).map_err(|_| Error::Codec("file id is not UTF-8".to_owned()))?;
    Ok((id, payload))
}

pub fn encode_control(msg: &ControlMessage) -> Result<String, Error> {
    serde_json::to_string(msg).map_err(|e| Error::Codec(e.to_string()))
}

pub fn decode_control(text: &str) -> Result<ControlMessage, Error> {
    serde_json::from_str(text).map_err(|e| Error::Codec(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_frame_round_trip() {
        let frame = encode_chunk("f1", b"hello").unwrap();
        assert_eq!(frame[0], 2);
        let (id, payload) = decode_chunk(&frame).unwrap();
        assert_eq!(id, "f1");
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn decode_rejects_truncated_frames() {
        assert!(decode_chunk(&[]).is_err());
        // declared id length larger than the remaining frame
        assert!(decode_chunk(&[5, b'a', b'b']).is_err());
    }

    #[test]
    fn decode_rejects_non_utf8_ids() {
        assert!(decode_chunk(&[2, 0xff, 0xfe, 1, 2, 3]).is_err());
    }

    #[test]
    fn encode_rejects_oversized_ids() {
        let id = "x".repeat(MAX_FILE_ID_LEN + 1);
        assert!(encode_chunk(&id, b"payload").is_err());
    }

    #[test]
    fn empty_payload_is_a_valid_chunk() {
        let frame = encode_chunk("f1", b"").unwrap();
        let (id, payload) = decode_chunk(&frame).unwrap();
        assert_eq!(id, "f1");
        assert!(payload.is_empty());
    }

    #[test]
    fn control_messages_use_the_wire_naming() {
        let msg = ControlMessage::FileStart {
            file_id: "f1".to_owned(),
            metadata: FileMetadata::new("a.txt", 30, "text/plain"),
        };
        let json: serde_json::Value = serde_json::from_str(&encode_control(&msg).unwrap()).unwrap();
        assert_eq!(json["type"], "file-start");
        assert_eq!(json["fileId"], "f1");
        assert_eq!(json["metadata"]["name"], "a.txt");
        assert_eq!(json["metadata"]["size"], 30);
        assert_eq!(json["metadata"]["type"], "text/plain");

        let end = decode_control(r#"{"type":"file-end","fileId":"f1"}"#).unwrap();
        assert!(matches!(end, ControlMessage::FileEnd { file_id } if file_id == "f1"));
    }

    #[test]
    fn metadata_extension_fields_round_trip() {
        let text = r#"{"type":"file-start","fileId":"f1","metadata":{"name":"a.bin","size":4,"type":"application/octet-stream","lastModified":1700000000000,"correlationId":"req-7"}}"#;
        let msg = decode_control(text).unwrap();
        let ControlMessage::FileStart { metadata, .. } = &msg else {
            panic!("expected file-start");
        };
        assert_eq!(metadata.last_modified, 1_700_000_000_000);
        assert_eq!(metadata.extra["correlationId"], "req-7");

        // unknown fields are echoed back unmodified
        let reencoded: serde_json::Value =
            serde_json::from_str(&encode_control(&msg).unwrap()).unwrap();
        assert_eq!(reencoded["metadata"]["correlationId"], "req-7");
    }

    #[test]
    fn unknown_control_kinds_are_rejected() {
        assert!(decode_control(r#"{"type":"file-abort","fileId":"f1"}"#).is_err());
        assert!(decode_control("not json").is_err());
    }
}
