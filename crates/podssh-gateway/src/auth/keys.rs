//! Authorized key parsing and matching

use russh_keys::key::PublicKey;

/// The public key a service account accepts, from its annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedKey {
    /// Key algorithm name (`ssh-ed25519`, `rsa-sha2-256`, ...)
    pub algorithm: String,
    /// SHA-256 fingerprint of the key's wire encoding
    pub fingerprint: String,
    /// Key comment (if any)
    pub comment: Option<String>,
}

impl AuthorizedKey {
    /// Parse an annotation value in `authorized_keys` format.
    ///
    /// Blank lines and `#` comments are skipped; the first key line wins.
    /// Both `type base64 [comment]` and a bare base64 blob are accepted.
    pub fn parse(value: &str) -> Result<Self, String> {
        let line = value
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .ok_or_else(|| "no key in annotation".to_string())?;

        let key = match russh_keys::parse_public_key_base64(line) {
            Ok(key) => key,
            Err(e) => parse_openssh_line(line).ok_or_else(|| e.to_string())?,
        };

        Ok(Self {
            algorithm: key.name().to_string(),
            fingerprint: key.fingerprint(),
            comment: extract_comment(line),
        })
    }

    /// Whether `presented` is this key.
    ///
    /// Keys are compared by the fingerprint of their wire encoding, so
    /// formatting differences in the annotation (comments, whitespace) do
    /// not matter.
    pub fn matches(&self, presented: &PublicKey) -> bool {
        presented.fingerprint() == self.fingerprint
    }
}

/// Parse an OpenSSH public key line (type base64 [comment])
fn parse_openssh_line(line: &str) -> Option<PublicKey> {
    let mut parts = line.split_whitespace();
    let _algorithm = parts.next()?;
    russh_keys::parse_public_key_base64(parts.next()?).ok()
}

/// Extract the comment from an OpenSSH public key line
fn extract_comment(line: &str) -> Option<String> {
    let parts: Vec<&str> = line.splitn(3, char::is_whitespace).collect();
    match parts.as_slice() {
        [_, _, comment] if !comment.trim().is_empty() => Some(comment.trim().to_string()),
        _ => None,
    }
}
