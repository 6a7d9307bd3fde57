//! Builds the SFTP status responses the gateway injects when a request
//! is blocked by session policy.

use super::types::{packet_types, status_codes};

pub fn build_permission_denied_response(request_id: u32, message: &str) -> Vec<u8> {
    build_status_response(
        request_id,
        status_codes::SSH_FX_PERMISSION_DENIED,
        message,
        "en",
    )
}

pub fn build_status_response(
    request_id: u32,
    status_code: u32,
    error_message: &str,
    language_tag: &str,
) -> Vec<u8> {
    // type + request_id + status_code + two length-prefixed strings
    let payload_len = 1 + 4 + 4 + 4 + error_message.len() + 4 + language_tag.len();

    let mut packet = Vec::with_capacity(4 + payload_len);
    packet.extend_from_slice(&(payload_len as u32).to_be_bytes());
    packet.push(packet_types::SSH_FXP_STATUS);
    packet.extend_from_slice(&request_id.to_be_bytes());
    packet.extend_from_slice(&status_code.to_be_bytes());
    packet.extend_from_slice(&(error_message.len() as u32).to_be_bytes());
    packet.extend_from_slice(error_message.as_bytes());
    packet.extend_from_slice(&(language_tag.len() as u32).to_be_bytes());
    packet.extend_from_slice(language_tag.as_bytes());

    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_denied_layout() {
        let response = build_permission_denied_response(42, "Permission denied");

        let length = u32::from_be_bytes([response[0], response[1], response[2], response[3]]);
        assert_eq!(length as usize, response.len() - 4);
        assert_eq!(response[4], packet_types::SSH_FXP_STATUS);

        let request_id = u32::from_be_bytes([response[5], response[6], response[7], response[8]]);
        assert_eq!(request_id, 42);

        let status_code =
            u32::from_be_bytes([response[9], response[10], response[11], response[12]]);
        assert_eq!(status_code, status_codes::SSH_FX_PERMISSION_DENIED);
    }

    #[test]
    fn test_status_response_carries_message() {
        let response = build_status_response(7, status_codes::SSH_FX_FAILURE, "nope", "en-US");
        let message_len =
            u32::from_be_bytes([response[13], response[14], response[15], response[16]]) as usize;
        assert_eq!(message_len, 4);
        assert_eq!(&response[17..21], b"nope");
    }
}
