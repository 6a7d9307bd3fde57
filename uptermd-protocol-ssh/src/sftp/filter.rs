use tracing::*;

use super::parser::{classify, split_frames, SftpClassification};
use super::response::build_permission_denied_response;

/// Result of pushing client SFTP bytes through the read-only filter:
/// `forward` goes to the host, `denials` go straight back to the client.
#[derive(Debug, Default)]
pub struct FilterOutcome {
    pub forward: Vec<u8>,
    pub denials: Vec<Vec<u8>>,
}

/// Interposed on the client→host direction of an SFTP splice when the
/// session is read-only. Requests that would modify the host's
/// filesystem never reach it; the client gets SSH_FX_PERMISSION_DENIED
/// and the channel stays open.
#[derive(Default)]
pub struct SftpWriteFilter {
    buf: Vec<u8>,
}

impl SftpWriteFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) -> FilterOutcome {
        self.buf.extend_from_slice(data);

        let mut outcome = FilterOutcome::default();
        for frame in split_frames(&mut self.buf) {
            match classify(&frame) {
                SftpClassification::Write {
                    request_id,
                    operation,
                } => {
                    debug!(request_id, operation, "Rejecting SFTP write on read-only session");
                    outcome.denials.push(build_permission_denied_response(
                        request_id,
                        &format!("{operation}: session is read-only"),
                    ));
                }
                SftpClassification::Benign => {
                    outcome.forward.extend_from_slice(&frame);
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{open_frame, simple_frame, string_field};
    use super::super::types::{packet_types, status_codes};
    use super::*;

    fn status_code_of(denial: &[u8]) -> u32 {
        u32::from_be_bytes([denial[9], denial[10], denial[11], denial[12]])
    }

    fn request_id_of(denial: &[u8]) -> u32 {
        u32::from_be_bytes([denial[5], denial[6], denial[7], denial[8]])
    }

    #[test]
    fn test_reads_pass_through_unchanged() {
        let mut filter = SftpWriteFilter::new();
        let open = open_frame(1, "/tmp/x", 0x01);
        let read = simple_frame(packet_types::SSH_FXP_READ, 2, &string_field("handle"));

        let mut stream = Vec::new();
        stream.extend_from_slice(&open);
        stream.extend_from_slice(&read);

        let outcome = filter.feed(&stream);
        assert_eq!(outcome.forward, stream);
        assert!(outcome.denials.is_empty());
    }

    #[test]
    fn test_write_open_is_denied() {
        let mut filter = SftpWriteFilter::new();
        let create = open_frame(5, "/tmp/y", 0x02 | 0x08 | 0x10);

        let outcome = filter.feed(&create);
        assert!(outcome.forward.is_empty());
        assert_eq!(outcome.denials.len(), 1);
        assert_eq!(request_id_of(&outcome.denials[0]), 5);
        assert_eq!(
            status_code_of(&outcome.denials[0]),
            status_codes::SSH_FX_PERMISSION_DENIED
        );
    }

    #[test]
    fn test_every_write_opcode_is_denied() {
        for (request_id, packet_type) in [
            packet_types::SSH_FXP_WRITE,
            packet_types::SSH_FXP_SETSTAT,
            packet_types::SSH_FXP_FSETSTAT,
            packet_types::SSH_FXP_REMOVE,
            packet_types::SSH_FXP_MKDIR,
            packet_types::SSH_FXP_RMDIR,
            packet_types::SSH_FXP_RENAME,
            packet_types::SSH_FXP_SYMLINK,
        ]
        .into_iter()
        .enumerate()
        {
            let mut filter = SftpWriteFilter::new();
            let frame = simple_frame(packet_type, request_id as u32, &string_field("/tmp/y"));
            let outcome = filter.feed(&frame);
            assert!(
                outcome.forward.is_empty(),
                "packet type {packet_type} leaked to the host"
            );
            assert_eq!(outcome.denials.len(), 1);
            assert_eq!(request_id_of(&outcome.denials[0]), request_id as u32);
        }
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut filter = SftpWriteFilter::new();
        let read = simple_frame(packet_types::SSH_FXP_READ, 1, &string_field("handle"));
        let write = simple_frame(packet_types::SSH_FXP_WRITE, 2, &string_field("handle"));

        let mut stream = Vec::new();
        stream.extend_from_slice(&read);
        stream.extend_from_slice(&write);

        let outcome_a = filter.feed(&stream[..read.len() + 2]);
        assert_eq!(outcome_a.forward, read);
        assert!(outcome_a.denials.is_empty());

        let outcome_b = filter.feed(&stream[read.len() + 2..]);
        assert!(outcome_b.forward.is_empty());
        assert_eq!(outcome_b.denials.len(), 1);
        assert_eq!(request_id_of(&outcome_b.denials[0]), 2);
    }

    #[test]
    fn test_mixed_batch_keeps_order_of_benign_frames() {
        let mut filter = SftpWriteFilter::new();
        let read_a = simple_frame(packet_types::SSH_FXP_READ, 1, &string_field("h1"));
        let remove = simple_frame(packet_types::SSH_FXP_REMOVE, 2, &string_field("/tmp/y"));
        let read_b = simple_frame(packet_types::SSH_FXP_READ, 3, &string_field("h2"));

        let mut stream = Vec::new();
        stream.extend_from_slice(&read_a);
        stream.extend_from_slice(&remove);
        stream.extend_from_slice(&read_b);

        let outcome = filter.feed(&stream);
        let mut expected = Vec::new();
        expected.extend_from_slice(&read_a);
        expected.extend_from_slice(&read_b);
        assert_eq!(outcome.forward, expected);
        assert_eq!(outcome.denials.len(), 1);
    }
}
