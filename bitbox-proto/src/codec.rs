//! The line codec: one JSON object per newline-terminated line.

use crate::errors::{ProtoError, Result};
use crate::message::Message;

/// Serialize a message to its wire form, without the trailing newline.
pub fn encode(message: &Message) -> String {
    // Serialization of the catalogue cannot fail: every field is a plain
    // string, integer, bool, or list thereof.
    serde_json::to_string(message).expect("message serialization is infallible")
}

/// Parse one line into a message and validate its fields.
pub fn decode(line: &str) -> Result<Message> {
    let message: Message = serde_json::from_str(line)?;
    validate(&message)?;
    Ok(message)
}

/// Field checks beyond what deserialization enforces.
fn validate(message: &Message) -> Result<()> {
    match message {
        Message::FileCreateRequest {
            file_descriptor, ..
        }
        | Message::FileCreateResponse {
            file_descriptor, ..
        }
        | Message::FileModifyRequest {
            file_descriptor, ..
        }
        | Message::FileModifyResponse {
            file_descriptor, ..
        }
        | Message::FileDeleteRequest {
            file_descriptor, ..
        }
        | Message::FileDeleteResponse {
            file_descriptor, ..
        } => check_md5(&file_descriptor.md5),
        Message::FileBytesRequest {
            file_descriptor,
            position,
            length,
            ..
        } => {
            check_md5(&file_descriptor.md5)?;
            check_range(*position, *length, file_descriptor.file_size)
        }
        Message::FileBytesResponse {
            file_descriptor,
            position,
            length,
            ..
        } => {
            check_md5(&file_descriptor.md5)?;
            check_range(*position, *length, file_descriptor.file_size)
        }
        _ => Ok(()),
    }
}

fn check_md5(md5: &str) -> Result<()> {
    if md5.len() == 32 && md5.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(())
    } else {
        Err(ProtoError::InvalidField {
            field: "fileDescriptor.md5",
            reason: format!("expected 32 hex characters, got {:?}", md5),
        })
    }
}

fn check_range(position: u64, length: u64, file_size: u64) -> Result<()> {
    let end = position.checked_add(length);
    match end {
        Some(end) if end <= file_size => Ok(()),
        _ => Err(ProtoError::InvalidField {
            field: "position",
            reason: format!(
                "range {}+{} exceeds file size {}",
                position, length, file_size
            ),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{FileDescriptor, HostPort};

    const MD5: &str = "9e107d9d372bb6826bd81d3542a419d6";

    fn descriptor() -> FileDescriptor {
        FileDescriptor::new(MD5, 1000, 5)
    }

    #[test]
    fn encode_decode_is_identity_for_every_type() {
        let hp = HostPort::new("peer.example", 8111);
        let d = descriptor();
        let messages = vec![
            Message::HandshakeRequest {
                host_port: hp.clone(),
            },
            Message::HandshakeResponse {
                host_port: hp.clone(),
            },
            Message::ConnectionRefused {
                message: "connection limit reached".into(),
                peers: vec![hp.clone(), HostPort::new("other.example", 8112)],
            },
            Message::InvalidProtocol {
                message: "missing field".into(),
            },
            Message::FileCreateRequest {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
            },
            Message::FileCreateResponse {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
                status: true,
                message: "file loader ready".into(),
            },
            Message::FileModifyRequest {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
            },
            Message::FileModifyResponse {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
                status: false,
                message: "file does not exist".into(),
            },
            Message::FileDeleteRequest {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
            },
            Message::FileDeleteResponse {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
                status: true,
                message: "file deleted".into(),
            },
            Message::FileBytesRequest {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
                position: 0,
                length: 5,
            },
            Message::FileBytesResponse {
                path_name: "a/b.txt".into(),
                file_descriptor: d.clone(),
                position: 0,
                length: 5,
                content: "aGVsbG8=".into(),
                status: true,
                message: "successful read".into(),
            },
            Message::DirectoryCreateRequest {
                path_name: "a/dir".into(),
            },
            Message::DirectoryCreateResponse {
                path_name: "a/dir".into(),
                status: true,
                message: "directory created".into(),
            },
            Message::DirectoryDeleteRequest {
                path_name: "a/dir".into(),
            },
            Message::DirectoryDeleteResponse {
                path_name: "a/dir".into(),
                status: false,
                message: "directory is not empty".into(),
            },
        ];

        for message in messages {
            let line = encode(&message);
            let back = decode(&line).unwrap();
            assert_eq!(message, back, "round trip failed for {}", message.command());
        }
    }

    #[test]
    fn decode_rejects_unknown_command() {
        let err = decode(r#"{"command":"SELF_DESTRUCT"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_missing_field() {
        // HANDSHAKE_REQUEST without hostPort.
        let err = decode(r#"{"command":"HANDSHAKE_REQUEST"}"#).unwrap_err();
        assert!(matches!(err, ProtoError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_wrong_type() {
        let line = format!(
            r#"{{"command":"FILE_CREATE_REQUEST","pathName":7,"fileDescriptor":{{"md5":"{}","lastModified":1,"fileSize":1}}}}"#,
            MD5
        );
        assert!(decode(&line).is_err());
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(decode("{not json").is_err());
    }

    #[test]
    fn decode_rejects_bad_md5() {
        let line = r#"{"command":"FILE_CREATE_REQUEST","pathName":"f","fileDescriptor":{"md5":"xyz","lastModified":1,"fileSize":1}}"#;
        let err = decode(line).unwrap_err();
        assert!(matches!(err, ProtoError::InvalidField { .. }));
    }

    #[test]
    fn decode_rejects_out_of_range_byte_request() {
        let line = format!(
            r#"{{"command":"FILE_BYTES_REQUEST","pathName":"f","fileDescriptor":{{"md5":"{}","lastModified":1,"fileSize":5}},"position":4,"length":5}}"#,
            MD5
        );
        assert!(decode(&line).is_err());
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let msg = Message::FileBytesRequest {
            path_name: "f".into(),
            file_descriptor: descriptor(),
            position: 0,
            length: 5,
        };
        let line = encode(&msg);
        assert!(line.contains(r#""pathName""#));
        assert!(line.contains(r#""fileDescriptor""#));
        assert!(line.contains(r#""lastModified""#));
        assert!(line.contains(r#""fileSize""#));
    }
}
