//! Secret handling for store credentials.
//!
//! The store URL may embed a password (`redis://:pw@host`). It is kept in a
//! [`SecretString`] and only rendered through [`redact_url`].

pub use secrecy::{ExposeSecret, SecretString};

/// Render `url` with any userinfo replaced, for logs.
///
/// ```
/// use libq::config::secrets::{SecretString, redact_url};
///
/// let url = SecretString::from("redis://:hunter2@cache:6379/0".to_string());
/// assert_eq!(redact_url(&url), "redis://***@cache:6379/0");
/// ```
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let (scheme, rest) = match raw.split_once("://") {
        Some(parts) => parts,
        None => return "***".to_string(),
    };
    match rest.rsplit_once('@') {
        Some((_, host)) => format!("{scheme}://***@{host}"),
        None => raw.to_string(),
    }
}
