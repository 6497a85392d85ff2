//! Docker image pull specs.

use std::{fmt, str::FromStr};
use thiserror::Error;

/// A parsed pull spec: `[registry/][namespace/]name[:tag][@digest]`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct DockerImageReference {
    pub registry: String,
    pub namespace: String,
    pub name: String,
    pub tag: String,
    pub id: String,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("image reference is empty")]
    Empty,

    #[error("invalid image reference {0:?}: invalid repository name")]
    InvalidName(String),

    #[error("invalid image reference {0:?}: invalid tag")]
    InvalidTag(String),

    #[error("invalid image reference {0:?}: invalid digest")]
    InvalidDigest(String),
}

// === impl DockerImageReference ===

impl DockerImageReference {
    pub fn parse(spec: &str) -> Result<Self, ReferenceError> {
        if spec.is_empty() {
            return Err(ReferenceError::Empty);
        }

        let (repo, id) = match spec.split_once('@') {
            Some((repo, id)) => {
                if !is_digest(id) {
                    return Err(ReferenceError::InvalidDigest(spec.to_string()));
                }
                (repo, id)
            }
            None => (spec, ""),
        };

        let last_slash = repo.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (repo, tag) = match repo[last_slash..].rfind(':') {
            Some(i) => {
                let (r, t) = repo.split_at(last_slash + i);
                let t = &t[1..];
                if !is_tag(t) {
                    return Err(ReferenceError::InvalidTag(spec.to_string()));
                }
                (r, t)
            }
            None => (repo, ""),
        };

        let parts = repo.split('/').collect::<Vec<_>>();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ReferenceError::InvalidName(spec.to_string()));
        }

        let (registry, namespace, name) = match parts.as_slice() {
            [name] => ("", "", (*name).to_string()),
            [first, name] if is_registry(first) => (*first, "", (*name).to_string()),
            [namespace, name] => ("", *namespace, (*name).to_string()),
            [registry, namespace, rest @ ..] => (*registry, *namespace, rest.join("/")),
            [] => return Err(ReferenceError::InvalidName(spec.to_string())),
        };

        if !namespace.is_empty() && !is_path_component(namespace)
            || !name.split('/').all(is_path_component)
        {
            return Err(ReferenceError::InvalidName(spec.to_string()));
        }

        Ok(Self {
            registry: registry.to_string(),
            namespace: namespace.to_string(),
            name,
            tag: tag.to_string(),
            id: id.to_string(),
        })
    }

    /// Drops the tag when a digest is present, since the digest alone
    /// identifies the image.
    pub fn most_specific(&self) -> Self {
        let mut reference = self.clone();
        if !reference.id.is_empty() {
            reference.tag.clear();
        }
        reference
    }

    /// The pull spec that refers to exactly this image.
    pub fn exact(&self) -> String {
        self.most_specific().to_string()
    }

    /// The pull spec without tag or digest.
    pub fn repository(&self) -> String {
        let mut s = String::new();
        for part in [&self.registry, &self.namespace] {
            if !part.is_empty() {
                s.push_str(part);
                s.push('/');
            }
        }
        s.push_str(&self.name);
        s
    }
}

impl FromStr for DockerImageReference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DockerImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.repository())?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        if !self.id.is_empty() {
            write!(f, "@{}", self.id)?;
        }
        Ok(())
    }
}

fn is_registry(s: &str) -> bool {
    s.contains('.') || s.contains(':') || s == "localhost"
}

fn is_path_component(s: &str) -> bool {
    let bytes = s.as_bytes();
    !bytes.is_empty()
        && bytes[0].is_ascii_alphanumeric()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes
            .iter()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_tag(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 128
        && !s.starts_with(['.', '-'])
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
}

fn is_digest(s: &str) -> bool {
    match s.split_once(':') {
        Some((algo, hex)) => {
            !algo.is_empty()
                && hex.len() >= 32
                && algo
                    .bytes()
                    .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'+' || b == b'.')
                && hex.bytes().all(|b| b.is_ascii_hexdigit())
        }
        None => false,
    }
}
