//! Target and dependency names as URIs.
//!
//! Every name the engine sees is a URI. A bare string such as
//! `out/report.txt` is shorthand for the `file` scheme on `localhost`, and
//! the scheme decides which resource backend answers modification-time and
//! removal requests for the name.
//!
//! Names are compared, ordered and hashed by their original spelling:
//! `a/b` and `file://localhost/a/b` address the same file but are distinct
//! names in the registry, exactly as they would be as map keys.

use std::{
    cmp::Ordering,
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

use derive_more::{Display, Error};

/// Error raised for names the engine refuses to address.
#[derive(Clone, Debug, Display, Error, PartialEq, Eq)]
pub enum UriError {
    /// `file` URIs may only point at the local host.
    #[display("netloc of a file URI must be localhost: {uri}")]
    ForeignFileNetloc {
        uri: String,
    },
}

/// A parsed target or dependency name.
///
/// The six fields follow the classic split of a URL reference: scheme,
/// netloc, path, params, query, fragment. No percent-decoding or path
/// normalisation is applied; the split is purely syntactic so that relative
/// paths survive untouched.
#[derive(Clone)]
pub struct Uri {
    raw: Arc<str>,
    scheme: String,
    netloc: String,
    path: String,
    params: String,
    query: String,
    fragment: String,
}

impl Uri {
    /// Parse a name.
    ///
    /// A missing scheme defaults to `file`; a `file` URI with an empty
    /// netloc defaults to `localhost`.
    pub fn parse(s: &str) -> Result<Self, UriError> {
        let mut rest = s;

        let mut fragment = "";
        if let Some(i) = rest.find('#') {
            fragment = &rest[i + 1..];
            rest = &rest[..i];
        }

        let mut query = "";
        if let Some(i) = rest.find('?') {
            query = &rest[i + 1..];
            rest = &rest[..i];
        }

        let mut scheme = String::new();
        if let Some(i) = rest.find(':') {
            if is_scheme(&rest[..i]) {
                scheme = rest[..i].to_ascii_lowercase();
                rest = &rest[i + 1..];
            }
        }

        let mut netloc = "";
        if let Some(tail) = rest.strip_prefix("//") {
            let end = tail.find('/').unwrap_or(tail.len());
            netloc = &tail[..end];
            rest = &tail[end..];
        }

        // Params attach to the final path segment only.
        let mut params = "";
        let segment = rest.rfind('/').map_or(0, |i| i + 1);
        if let Some(i) = rest[segment..].find(';') {
            params = &rest[segment + i + 1..];
            rest = &rest[..segment + i];
        }

        if scheme.is_empty() {
            scheme.push_str("file");
        }
        let netloc = if scheme == "file" && netloc.is_empty() {
            "localhost"
        } else {
            netloc
        };
        if scheme == "file" && netloc != "localhost" {
            return Err(UriError::ForeignFileNetloc { uri: s.to_owned() });
        }

        Ok(Self {
            raw: Arc::from(s),
            scheme,
            netloc: netloc.to_owned(),
            path: rest.to_owned(),
            params: params.to_owned(),
            query: query.to_owned(),
            fragment: fragment.to_owned(),
        })
    }

    /// The name exactly as it was declared.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn netloc(&self) -> &str {
        &self.netloc
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn params(&self) -> &str {
        &self.params
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn fragment(&self) -> &str {
        &self.fragment
    }

    /// Whether this name is served by the local `file` backend.
    pub fn is_local_file(&self) -> bool {
        self.scheme == "file"
    }
}

impl FromStr for Uri {
    type Err = UriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl fmt::Debug for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.raw, f)
    }
}

impl PartialEq for Uri {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl Eq for Uri {}

impl Hash for Uri {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl PartialOrd for Uri {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Uri {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

/// RFC 3986 scheme shape: a letter, then letters, digits, `+`, `-` or `.`.
fn is_scheme(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq as pretty_assert_eq;
    use simple_test_case::test_case;

    use super::*;

    #[test]
    fn splits_all_six_fields() {
        let uri = Uri::parse("a/b;c;d?e=f#gh").unwrap();
        pretty_assert_eq!(uri.scheme(), "file");
        pretty_assert_eq!(uri.netloc(), "localhost");
        pretty_assert_eq!(uri.path(), "a/b");
        pretty_assert_eq!(uri.params(), "c;d");
        pretty_assert_eq!(uri.query(), "e=f");
        pretty_assert_eq!(uri.fragment(), "gh");
    }

    #[test_case("out", "file", "localhost", "out"; "bare_relative")]
    #[test_case("/tmp/out", "file", "localhost", "/tmp/out"; "bare_absolute")]
    #[test_case("file:///tmp/out", "file", "localhost", "/tmp/out"; "explicit_file")]
    #[test_case("file://localhost/tmp/out", "file", "localhost", "/tmp/out"; "explicit_localhost")]
    #[test_case("s3://bucket/key/obj", "s3", "bucket", "/key/obj"; "remote_scheme")]
    #[test_case("gs://bucket", "gs", "bucket", ""; "netloc_only")]
    #[test]
    fn parses(raw: &str, scheme: &str, netloc: &str, path: &str) {
        let uri = Uri::parse(raw).unwrap();
        pretty_assert_eq!(uri.scheme(), scheme);
        pretty_assert_eq!(uri.netloc(), netloc);
        pretty_assert_eq!(uri.path(), path);
        pretty_assert_eq!(uri.as_str(), raw);
    }

    #[test]
    fn rejects_foreign_file_netloc() {
        let err = Uri::parse("file://example.com/x").unwrap_err();
        pretty_assert_eq!(
            err,
            UriError::ForeignFileNetloc {
                uri: "file://example.com/x".into()
            }
        );
    }

    #[test]
    fn spelling_is_identity() {
        let bare = Uri::parse("a/b").unwrap();
        let explicit = Uri::parse("file://localhost/a/b").unwrap();
        assert_ne!(bare, explicit);
        pretty_assert_eq!(bare, Uri::parse("a/b").unwrap());
    }

    #[test]
    fn windows_style_drive_is_a_scheme() {
        // Single letters satisfy the scheme shape; the split is purely
        // syntactic and does not special-case drive letters.
        let uri = Uri::parse("c:/x").unwrap();
        pretty_assert_eq!(uri.scheme(), "c");
    }
}
