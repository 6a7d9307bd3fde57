pub const HOST_VERSION_PREFIX: &str = "SSH-2.0-upterm-host-";
pub const CLIENT_VERSION_PREFIX: &str = "SSH-2.0-upterm-client-";

/// Header carrying the peer's product version on WebSocket upgrades.
pub const CLIENT_VERSION_HEADER: &str = "Upterm-Client-Version";

pub fn server_id() -> String {
    format!("SSH-2.0-uptermd-{}", env!("CARGO_PKG_VERSION"))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerKind {
    Host,
    Client,
}

/// Classify an SSH-style product version string. Unknown strings are
/// rejected without telling the peer why.
pub fn classify_product_version(version: &str) -> Option<PeerKind> {
    if version.starts_with(HOST_VERSION_PREFIX) {
        Some(PeerKind::Host)
    } else if version.starts_with(CLIENT_VERSION_PREFIX) {
        Some(PeerKind::Client)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify_product_version("SSH-2.0-upterm-host-1.0.0"),
            Some(PeerKind::Host)
        );
        assert_eq!(
            classify_product_version("SSH-2.0-upterm-client-1.0.0"),
            Some(PeerKind::Client)
        );
        assert_eq!(classify_product_version("SSH-2.0-OpenSSH_9.4"), None);
        assert_eq!(classify_product_version(""), None);
    }
}
