mod filter;
mod parser;
mod response;
mod types;

pub use filter::{FilterOutcome, SftpWriteFilter};
pub use response::build_permission_denied_response;
pub use types::SftpOpenFlags;

#[cfg(test)]
pub(crate) mod tests {
    pub fn string_field(s: &str) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + s.len());
        out.extend_from_slice(&(s.len() as u32).to_be_bytes());
        out.extend_from_slice(s.as_bytes());
        out
    }

    /// `<len><type><request_id><body>`
    pub fn simple_frame(packet_type: u8, request_id: u32, body: &[u8]) -> Vec<u8> {
        let payload_len = 1 + 4 + body.len();
        let mut out = Vec::with_capacity(4 + payload_len);
        out.extend_from_slice(&(payload_len as u32).to_be_bytes());
        out.push(packet_type);
        out.extend_from_slice(&request_id.to_be_bytes());
        out.extend_from_slice(body);
        out
    }

    pub fn open_frame(request_id: u32, path: &str, pflags: u32) -> Vec<u8> {
        let mut body = string_field(path);
        body.extend_from_slice(&pflags.to_be_bytes());
        // empty ATTRS (no flags set)
        body.extend_from_slice(&0u32.to_be_bytes());
        simple_frame(super::types::packet_types::SSH_FXP_OPEN, request_id, &body)
    }
}
