//! Image name parsing.
//!
//! Parses fully-qualified image names like `ko.local/app:3f1a...` or
//! `gcr.io/distroless/static:latest` into structured components. This is
//! the type publishers return for a published artifact.

use crate::error::{KoError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Default tag when neither a tag nor a digest is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageName {
    /// Registry hostname (e.g., "gcr.io", "ko.local")
    pub registry: String,
    /// Repository path (e.g., "distroless/static", "my-app")
    pub repository: String,
    /// Tag (e.g., "latest", a build hash)
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:abc123...")
    pub digest: Option<String>,
}

impl ImageName {
    /// Parse an image name string.
    ///
    /// Supports formats:
    /// - `nginx` → docker.io/library/nginx:latest
    /// - `myuser/myimage:v1.0` → docker.io/myuser/myimage:v1.0
    /// - `gcr.io/org/image:tag`
    /// - `gcr.io/org/image@sha256:abc...`
    pub fn parse(name: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KoError::Reference("empty image name".to_string()));
        }

        // Split off the digest first (@ separator).
        let (name_tag, digest) = match name.rsplit_once('@') {
            Some((head, digest)) => {
                if !digest.contains(':') {
                    return Err(KoError::Reference(format!(
                        "invalid digest in {:?}: expected algorithm:hex",
                        name
                    )));
                }
                (head, Some(digest.to_string()))
            }
            None => (name, None),
        };

        // Split the tag: the last colon after the last slash. A colon in
        // the first component followed only by digits is a registry port.
        let (repo_part, tag) = match name_tag.rsplit_once(':') {
            Some((head, candidate)) if !candidate.contains('/') => {
                let is_port = !head.contains('/') && candidate.chars().all(|c| c.is_ascii_digit());
                if is_port {
                    (name_tag, None)
                } else {
                    (head, Some(candidate.to_string()))
                }
            }
            _ => (name_tag, None),
        };

        let (registry, repository) = split_registry(repo_part)?;

        // Apply the default tag only when fully unqualified.
        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(ImageName {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Build a tag name from a repository string and tag, e.g.
    /// `ko.local/my-app` + `3f1a...`.
    pub fn new_tag(repository: &str, tag: &str) -> Result<Self> {
        if tag.is_empty() || tag.contains('/') || tag.contains(':') || tag.contains('@') {
            return Err(KoError::Reference(format!("invalid tag {:?}", tag)));
        }
        let (registry, repository) = split_registry(repository)?;
        Ok(ImageName {
            registry,
            repository,
            tag: Some(tag.to_string()),
            digest: None,
        })
    }

    /// The same name, qualified by a content digest.
    pub fn with_digest(mut self, digest: &str) -> Self {
        self.digest = Some(digest.to_string());
        self
    }

    /// The full name string.
    pub fn qualified(&self) -> String {
        let mut s = format!("{}/{}", self.registry, self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }
}

/// Split a repo string into registry and repository. The first path
/// component is a registry iff it contains a dot or colon or is
/// "localhost"; otherwise the docker.io defaults apply.
fn split_registry(name: &str) -> Result<(String, String)> {
    if let Some((first, rest)) = name.split_once('/') {
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if rest.is_empty() {
                return Err(KoError::Reference(format!(
                    "empty repository in {:?}",
                    name
                )));
            }
            return Ok((first.to_string(), rest.to_string()));
        }
    }

    let repository = if name.contains('/') {
        name.to_string()
    } else {
        format!("library/{}", name)
    };

    Ok((DEFAULT_REGISTRY.to_string(), repository))
}

impl std::fmt::Display for ImageName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageName::parse("nginx").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/nginx");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageName::parse("gcr.io/distroless/static:latest").unwrap();
        assert_eq!(r.registry, "gcr.io");
        assert_eq!(r.repository, "distroless/static");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageName::parse("gcr.io/app@sha256:abc123").unwrap();
        assert_eq!(r.tag, None);
        assert_eq!(r.digest, Some("sha256:abc123".to_string()));
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageName::parse("ko.local/app:v1@sha256:abc123").unwrap();
        assert_eq!(r.registry, "ko.local");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("v1".to_string()));
        assert_eq!(r.digest, Some("sha256:abc123".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageName::parse("registry.io:5000/app:v1").unwrap();
        assert_eq!(r.registry, "registry.io:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_port_without_tag() {
        let r = ImageName::parse("localhost:5000/app").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "app");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_invalid_digest() {
        assert!(ImageName::parse("nginx@invaliddigest").is_err());
    }

    #[test]
    fn test_parse_empty() {
        assert!(ImageName::parse("").is_err());
    }

    #[test]
    fn test_new_tag() {
        let r = ImageName::new_tag("ko.local/my-app", "3f1a9c").unwrap();
        assert_eq!(r.qualified(), "ko.local/my-app:3f1a9c");
    }

    #[test]
    fn test_new_tag_rejects_separators() {
        assert!(ImageName::new_tag("ko.local/my-app", "a:b").is_err());
        assert!(ImageName::new_tag("ko.local/my-app", "").is_err());
    }

    #[test]
    fn test_with_digest_display() {
        let r = ImageName::new_tag("ko.local/app", "v1")
            .unwrap()
            .with_digest("sha256:abc123");
        assert_eq!(format!("{}", r), "ko.local/app:v1@sha256:abc123");
    }
}
