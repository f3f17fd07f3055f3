use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// HTTP basic-auth credential pair protecting an HTTP tunnel host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Auth {
    pub user: String,
    pub password: String,
}

impl Auth {
    /// Parses the `user:password` form. The split happens once, so the
    /// password itself may contain colons. Empty input yields `None`.
    pub fn parse(s: &str) -> Option<Auth> {
        if s.is_empty() {
            return None;
        }
        match s.split_once(':') {
            Some((user, password)) => Some(Auth {
                user: user.to_string(),
                password: password.to_string(),
            }),
            None => Some(Auth {
                user: s.to_string(),
                password: String::new(),
            }),
        }
    }

    /// Checks an `Authorization` header value against these credentials.
    pub fn verify_basic(&self, header: Option<&str>) -> bool {
        match header.and_then(parse_basic) {
            Some((user, password)) => user == self.user && password == self.password,
            None => false,
        }
    }
}

/// Decodes a `Basic <base64>` authorization header into its credential pair.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_once() {
        assert_eq!(
            Auth::parse("bob:secret"),
            Some(Auth {
                user: "bob".into(),
                password: "secret".into()
            })
        );
        assert_eq!(
            Auth::parse("bob:se:cr:et"),
            Some(Auth {
                user: "bob".into(),
                password: "se:cr:et".into()
            })
        );
        assert_eq!(
            Auth::parse("bob"),
            Some(Auth {
                user: "bob".into(),
                password: String::new()
            })
        );
        assert_eq!(Auth::parse(""), None);
    }

    #[test]
    fn verify_basic_header() {
        let auth = Auth::parse("user:password").unwrap();
        // base64("user:password")
        assert!(auth.verify_basic(Some("Basic dXNlcjpwYXNzd29yZA==")));
        assert!(!auth.verify_basic(Some("Basic dXNlcjpvdGhlcg==")));
        assert!(!auth.verify_basic(Some("Bearer dXNlcjpwYXNzd29yZA==")));
        assert!(!auth.verify_basic(None));
    }
}
