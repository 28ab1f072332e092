//! `Proxy-Authorization` header synthesis.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::types::Credentials;

/// Header name inserted into forwarded CONNECT requests.
pub const PROXY_AUTHORIZATION: &str = "Proxy-Authorization";

/// Basic auth token for `username:password`, standard alphabet, no line wrapping.
pub fn basic_token(credentials: &Credentials) -> String {
    let raw = format!("{}:{}", credentials.username(), credentials.password());
    STANDARD.encode(raw.as_bytes())
}

/// Full header line without the trailing CRLF.
pub fn basic_header(credentials: &Credentials) -> String {
    format!("{PROXY_AUTHORIZATION}: Basic {}", basic_token(credentials))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_header() {
        let credentials = Credentials::new("alice", "secret");
        assert_eq!(
            basic_header(&credentials),
            "Proxy-Authorization: Basic YWxpY2U6c2VjcmV0"
        );
    }

    #[test]
    fn test_utf8_credentials() {
        let credentials = Credentials::new("jürgen", "pä:ss");
        let decoded = STANDARD.decode(basic_token(&credentials)).unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "jürgen:pä:ss");
    }
}
