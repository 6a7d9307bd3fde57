use data_encoding::BASE64URL_NOPAD;

/// The SSH username is the wire-level routing key. Hosts present the bare
/// session id; clients append the owning node's address so any node can
/// route the connection without consulting the directory first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identifier {
    Host {
        session_id: String,
    },
    Client {
        session_id: String,
        node_addr: String,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum IdentifierError {
    #[error("empty identifier")]
    Empty,
    #[error("session id contains a reserved character")]
    ReservedCharacter,
    #[error("malformed node address encoding")]
    BadNodeAddr,
}

impl Identifier {
    pub fn session_id(&self) -> &str {
        match self {
            Identifier::Host { session_id } => session_id,
            Identifier::Client { session_id, .. } => session_id,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Identifier::Host { session_id } => session_id.clone(),
            Identifier::Client {
                session_id,
                node_addr,
            } => format!(
                "{}:{}",
                session_id,
                BASE64URL_NOPAD.encode(node_addr.as_bytes())
            ),
        }
    }

    pub fn decode(s: &str) -> Result<Self, IdentifierError> {
        if s.is_empty() {
            return Err(IdentifierError::Empty);
        }
        match s.split_once(':') {
            None => Ok(Identifier::Host {
                session_id: s.to_owned(),
            }),
            Some((session_id, encoded_addr)) => {
                if session_id.is_empty() {
                    return Err(IdentifierError::Empty);
                }
                let addr = BASE64URL_NOPAD
                    .decode(encoded_addr.as_bytes())
                    .map_err(|_| IdentifierError::BadNodeAddr)?;
                let node_addr =
                    String::from_utf8(addr).map_err(|_| IdentifierError::BadNodeAddr)?;
                Ok(Identifier::Client {
                    session_id: session_id.to_owned(),
                    node_addr,
                })
            }
        }
    }

    /// Validate a host-chosen session id before it enters the directory.
    pub fn validate_session_id(session_id: &str) -> Result<(), IdentifierError> {
        if session_id.is_empty() {
            return Err(IdentifierError::Empty);
        }
        if session_id.contains(':') {
            return Err(IdentifierError::ReservedCharacter);
        }
        Ok(())
    }
}
