//! SFTP packet reassembly and write-operation classification.

use bytes::{Buf, Bytes};

use super::types::{packet_types, SftpOpenFlags, WRITE_EXTENDED_REQUESTS};

/// Pop every complete length-prefixed SFTP packet off `buf`, leaving any
/// incomplete trailing data for the next read.
pub fn split_frames(buf: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut frames = Vec::new();
    loop {
        if buf.len() < 4 {
            break;
        }
        let pkt_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        let total_len = 4 + pkt_len;
        if buf.len() < total_len {
            break;
        }
        frames.push(buf.drain(..total_len).collect());
    }
    frames
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SftpClassification {
    /// A request that would modify the host's filesystem.
    Write {
        request_id: u32,
        operation: &'static str,
    },
    /// Read-only or metadata traffic, safe to forward.
    Benign,
}

/// Classify one complete SFTP frame. Anything unparseable is forwarded
/// untouched; the host's SFTP server is the authority on malformed
/// input.
pub fn classify(frame: &[u8]) -> SftpClassification {
    if frame.len() < 5 {
        return SftpClassification::Benign;
    }

    let mut buf = Bytes::copy_from_slice(frame);
    let _length = buf.get_u32();
    let packet_type = buf.get_u8();

    // INIT carries a version, not a request id.
    if packet_type == packet_types::SSH_FXP_INIT {
        return SftpClassification::Benign;
    }
    if buf.remaining() < 4 {
        return SftpClassification::Benign;
    }
    let request_id = buf.get_u32();

    let operation = match packet_type {
        packet_types::SSH_FXP_OPEN => {
            let Some(_path) = read_string(&mut buf) else {
                return SftpClassification::Benign;
            };
            if buf.remaining() < 4 {
                return SftpClassification::Benign;
            }
            let flags = SftpOpenFlags::from_raw(buf.get_u32());
            if flags.mutates() {
                "open for writing"
            } else {
                return SftpClassification::Benign;
            }
        }
        packet_types::SSH_FXP_WRITE => "write",
        packet_types::SSH_FXP_SETSTAT => "setstat",
        packet_types::SSH_FXP_FSETSTAT => "fsetstat",
        packet_types::SSH_FXP_REMOVE => "remove",
        packet_types::SSH_FXP_MKDIR => "mkdir",
        packet_types::SSH_FXP_RMDIR => "rmdir",
        packet_types::SSH_FXP_RENAME => "rename",
        packet_types::SSH_FXP_SYMLINK => "symlink",
        packet_types::SSH_FXP_EXTENDED => {
            let Some(request) = read_string(&mut buf) else {
                return SftpClassification::Benign;
            };
            match WRITE_EXTENDED_REQUESTS
                .iter()
                .copied()
                .find(|r| *r == request)
            {
                Some(operation) => operation,
                None => return SftpClassification::Benign,
            }
        }
        _ => return SftpClassification::Benign,
    };

    SftpClassification::Write {
        request_id,
        operation,
    }
}

fn read_string(buf: &mut Bytes) -> Option<String> {
    if buf.remaining() < 4 {
        return None;
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return None;
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).ok()
}
