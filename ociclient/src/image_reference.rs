use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::digest::OciDigest;

/// Error type for image reference parsing
#[derive(Debug, Error)]
pub enum ImageReferenceError {
    #[error("Invalid image reference format: {0}")]
    InvalidFormat(String),
    #[error("Invalid digest in image reference: {0}")]
    InvalidDigest(String),
}

/// Represents an OCI image reference: `[hostname/]name[:tag][@digest]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Optional hostname (registry)
    pub hostname: Option<String>,
    /// Repository name
    pub name: String,
    /// Tag, if one was given
    pub tag: Option<String>,
    /// Digest, if one was given
    pub digest: Option<OciDigest>,
}

impl ImageReference {
    /// The object to ask the registry for: digest first, then tag, then `latest`
    pub fn object(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => "latest".to_string(),
        }
    }

    /// Repository path including the hostname, without tag or digest
    pub fn locator(&self) -> String {
        match &self.hostname {
            Some(hostname) => format!("{}/{}", hostname, self.name),
            None => self.name.clone(),
        }
    }
}

impl FromStr for ImageReference {
    type Err = ImageReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.starts_with('/') || s.ends_with('/') {
            return Err(ImageReferenceError::InvalidFormat(s.to_string()));
        }

        let (remainder, digest) = match s.split_once('@') {
            Some((remainder, digest)) => {
                let digest = digest
                    .parse::<OciDigest>()
                    .map_err(|_| ImageReferenceError::InvalidDigest(digest.to_string()))?;
                (remainder, Some(digest))
            }
            None => (s, None),
        };

        // The first component is a registry host if it looks like one
        let (hostname, path) = match remainder.split_once('/') {
            Some((first, rest))
                if first.contains('.') || first.contains(':') || first == "localhost" =>
            {
                (Some(first.to_string()), rest)
            }
            _ => (None, remainder),
        };

        // A colon after the last slash separates the tag
        let last_segment_start = path.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match path[last_segment_start..].rfind(':') {
            Some(i) => {
                let split = last_segment_start + i;
                (&path[..split], Some(path[split + 1..].to_string()))
            }
            None => (path, None),
        };

        if name.is_empty() || tag.as_deref() == Some("") {
            return Err(ImageReferenceError::InvalidFormat(s.to_string()));
        }

        let tag = match (tag, &digest) {
            (None, None) => Some("latest".to_string()),
            (tag, _) => tag,
        };

        Ok(ImageReference {
            hostname,
            name: name.to_string(),
            tag,
            digest,
        })
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.locator())?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_name_defaults_to_latest() {
        let reference: ImageReference = "alpine".parse().unwrap();
        assert_eq!(reference.hostname, None);
        assert_eq!(reference.name, "alpine");
        assert_eq!(reference.tag.as_deref(), Some("latest"));
        assert_eq!(reference.object(), "latest");
    }

    #[test]
    fn test_parse_registry_with_port_and_tag() {
        let reference: ImageReference = "localhost:5000/team/app:v1.2".parse().unwrap();
        assert_eq!(reference.hostname.as_deref(), Some("localhost:5000"));
        assert_eq!(reference.name, "team/app");
        assert_eq!(reference.tag.as_deref(), Some("v1.2"));
        assert_eq!(reference.to_string(), "localhost:5000/team/app:v1.2");
    }

    #[test]
    fn test_parse_digest_reference() {
        let digest = "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";
        let reference: ImageReference = format!("ghcr.io/org/tool@{digest}").parse().unwrap();
        assert_eq!(reference.tag, None);
        assert_eq!(reference.object(), digest);
        assert_eq!(reference.locator(), "ghcr.io/org/tool");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<ImageReference>().is_err());
        assert!("app:".parse::<ImageReference>().is_err());
        assert!("app@sha256:nothex".parse::<ImageReference>().is_err());
    }
}
