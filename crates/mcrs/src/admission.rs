use mcr_common::types::{header, MIN_CREDENTIAL_LEN};
use mcr_common::ServerId;
use thiserror::Error;
use tokio_tungstenite::tungstenite::http::HeaderMap;

/// Admission metadata read from the WebSocket upgrade request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Bearer token, `Bearer ` prefix stripped.
    pub token: Option<String>,
    /// Declared server id, trimmed.
    pub server_id: Option<String>,
    /// Declared protocol version.
    pub version: Option<String>,
    /// Declared capabilities.
    pub capabilities: Vec<String>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// `Bearer <token>` → `<token>`; a value without the scheme is taken as the token.
fn strip_bearer(value: &str) -> &str {
    if value.eq_ignore_ascii_case("bearer") {
        return "";
    }
    match value.get(..7) {
        Some(scheme) if scheme.eq_ignore_ascii_case("bearer ") => value[7..].trim(),
        _ => value,
    }
}

impl Credentials {
    /// Extracts admission fields. Non-UTF-8 or blank headers count as absent.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let token = header_str(headers, header::AUTHORIZATION).map(|v| strip_bearer(v).to_owned());

        let capabilities = header_str(headers, header::CAPABILITIES)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            token: token.filter(|t| !t.is_empty()),
            server_id: header_str(headers, header::SERVER_ID).map(str::to_owned),
            version: header_str(headers, header::SERVER_VERSION).map(str::to_owned),
            capabilities,
        }
    }
}

/// Identity granted to an admitted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerClaims {
    /// Registry key for the peer.
    pub server_id: ServerId,
    /// Declared protocol version.
    pub version: Option<String>,
    /// Declared capabilities.
    pub capabilities: Vec<String>,
}

/// Admission refused. Fatal to the connection attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    /// No bearer token in the `Authorization` header.
    #[error("missing authorization token")]
    MissingCredential,
    /// The token failed the authenticator's policy.
    #[error("invalid authorization token")]
    WeakCredential,
    /// No `X-Server-Id` header.
    #[error("missing server id")]
    MissingServerId,
}

/// Decides whether a connection may join the relay.
///
/// The connection handler only sees this trait, so a signature- or
/// token-service-backed check can replace [`MinLengthAuthenticator`]
/// without touching connection handling.
pub trait Authenticator: Send + Sync {
    /// Returns the peer's identity, or why admission is refused.
    ///
    /// # Errors
    ///
    /// [`HandshakeError`] describing the refusal.
    fn verify(&self, credentials: &Credentials) -> Result<PeerClaims, HandshakeError>;
}

/// Placeholder policy: any token of at least `min_len` characters is accepted.
///
/// This proves nothing about the peer's identity. It only filters out
/// misconfigured peers that send no or obviously truncated tokens.
#[derive(Debug, Clone)]
pub struct MinLengthAuthenticator {
    min_len: usize,
}

impl MinLengthAuthenticator {
    /// Accept tokens of at least `min_len` characters.
    #[must_use]
    pub const fn new(min_len: usize) -> Self {
        Self { min_len }
    }
}

impl Default for MinLengthAuthenticator {
    fn default() -> Self {
        Self::new(MIN_CREDENTIAL_LEN)
    }
}

impl Authenticator for MinLengthAuthenticator {
    fn verify(&self, credentials: &Credentials) -> Result<PeerClaims, HandshakeError> {
        let token = credentials
            .token
            .as_deref()
            .ok_or(HandshakeError::MissingCredential)?;
        let server_id = credentials
            .server_id
            .clone()
            .ok_or(HandshakeError::MissingServerId)?;

        if token.chars().count() < self.min_len {
            return Err(HandshakeError::WeakCredential);
        }

        Ok(PeerClaims {
            server_id,
            version: credentials.version.clone(),
            capabilities: credentials.capabilities.clone(),
        })
    }
}
