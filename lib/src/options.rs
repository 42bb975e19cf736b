//! The fully-resolved option set a worker runs with.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Environment variable carrying the source endpoint.
pub const ENV_ENDPOINT: &str = "IMPORTER_ENDPOINT";
/// Environment variable carrying the access key (or user name).
pub const ENV_ACCESS_KEY: &str = "IMPORTER_ACCESS_KEY_ID";
/// Environment variable carrying the secret key (or password).
pub const ENV_SECRET_KEY: &str = "IMPORTER_SECRET_KEY";
/// Environment variable carrying the source kind.
pub const ENV_SOURCE: &str = "IMPORTER_SOURCE";
/// Environment variable carrying the content type.
pub const ENV_CONTENT_TYPE: &str = "IMPORTER_CONTENTTYPE";
/// Environment variable carrying the requested capacity.
pub const ENV_IMAGE_SIZE: &str = "IMPORTER_IMAGE_SIZE";
/// Environment variable carrying the directory of trust anchors.
pub const ENV_CERT_DIR: &str = "IMPORTER_CERT_DIR";
/// Environment variable set to `true` to skip registry TLS verification.
pub const ENV_INSECURE_TLS: &str = "IMPORTER_INSECURE_TLS";

/// Where the bytes of an import come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    /// An HTTP or HTTPS server.
    #[default]
    Http,
    /// An S3-compatible object store.
    #[serde(rename = "s3", alias = "object-storage")]
    ObjectStorage,
    /// A container image registry.
    Registry,
    /// A stream pushed by an upload server.
    Upload,
    /// Nothing to import.
    None,
}

impl SourceKind {
    /// The canonical string form, as used in annotations and the environment.
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Http => "http",
            SourceKind::ObjectStorage => "s3",
            SourceKind::Registry => "registry",
            SourceKind::Upload => "upload",
            SourceKind::None => "none",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let r = match s {
            "" | "http" => SourceKind::Http,
            "s3" | "object-storage" => SourceKind::ObjectStorage,
            "registry" => SourceKind::Registry,
            "upload" => SourceKind::Upload,
            "none" => SourceKind::None,
            o => return Err(anyhow!("Unknown source kind: {o}")),
        };
        Ok(r)
    }
}

/// How the fetched content should be interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentType {
    /// A (possibly compressed or encoded) disk image.
    #[default]
    DiskImage,
    /// A tar archive holding the disk image.
    Archive,
}

impl ContentType {
    /// The canonical string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::DiskImage => "disk-image",
            ContentType::Archive => "archive",
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let r = match s {
            "" | "kubevirt" | "disk-image" => ContentType::DiskImage,
            "archive" => ContentType::Archive,
            o => return Err(anyhow!("Unknown content type: {o}")),
        };
        Ok(r)
    }
}

/// Options for one import invocation. Immutable once built; everything a
/// worker needs is resolved before it starts.
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportOptions {
    /// Path of the destination file.
    pub dest: Utf8PathBuf,
    /// The source location.
    pub endpoint: String,
    /// Access key or user name; empty for anonymous access.
    pub access_key: String,
    /// Secret key or password.
    pub secret_key: String,
    /// Which transport to use.
    pub source: SourceKind,
    /// How to interpret the content.
    pub content_type: ContentType,
    /// Upper bound in bytes for the destination; `None` is unbounded.
    pub capacity: Option<u64>,
    /// Directory holding PEM trust anchors for the endpoint.
    pub cert_dir: Option<Utf8PathBuf>,
    /// Skip TLS verification for a registry endpoint.
    pub insecure_tls: bool,
}

// Hand-written so secrets never end up in logs.
impl fmt::Debug for ImportOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImportOptions")
            .field("dest", &self.dest)
            .field("endpoint", &self.endpoint)
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("source", &self.source)
            .field("content_type", &self.content_type)
            .field("capacity", &self.capacity)
            .field("cert_dir", &self.cert_dir)
            .field("insecure_tls", &self.insecure_tls)
            .finish()
    }
}

impl ImportOptions {
    /// Build options from a map of worker environment variables.
    pub fn from_vars(dest: Utf8PathBuf, vars: &BTreeMap<String, String>) -> Result<Self> {
        let get = |k: &str| vars.get(k).map(|s| s.as_str()).unwrap_or_default();
        let capacity = parse_capacity(get(ENV_IMAGE_SIZE))
            .with_context(|| format!("Parsing {ENV_IMAGE_SIZE}"))?;
        let cert_dir = Some(get(ENV_CERT_DIR))
            .filter(|s| !s.is_empty())
            .map(Utf8PathBuf::from);
        let insecure_tls = match get(ENV_INSECURE_TLS) {
            "" | "false" => false,
            "true" => true,
            o => anyhow::bail!("Invalid {ENV_INSECURE_TLS}: {o}"),
        };
        Ok(Self {
            dest,
            endpoint: get(ENV_ENDPOINT).to_owned(),
            access_key: get(ENV_ACCESS_KEY).to_owned(),
            secret_key: get(ENV_SECRET_KEY).to_owned(),
            source: get(ENV_SOURCE).parse()?,
            content_type: get(ENV_CONTENT_TYPE).parse()?,
            capacity,
            cert_dir,
            insecure_tls,
        })
    }

    /// Render these options as worker environment variables; the inverse of
    /// [`Self::from_vars`]. The destination is not part of the environment.
    pub fn to_vars(&self) -> BTreeMap<String, String> {
        let mut r = BTreeMap::new();
        r.insert(ENV_ENDPOINT.to_owned(), self.endpoint.clone());
        r.insert(ENV_ACCESS_KEY.to_owned(), self.access_key.clone());
        r.insert(ENV_SECRET_KEY.to_owned(), self.secret_key.clone());
        r.insert(ENV_SOURCE.to_owned(), self.source.to_string());
        r.insert(ENV_CONTENT_TYPE.to_owned(), self.content_type.to_string());
        if let Some(capacity) = self.capacity {
            r.insert(ENV_IMAGE_SIZE.to_owned(), capacity.to_string());
        }
        if let Some(cert_dir) = self.cert_dir.as_ref() {
            r.insert(ENV_CERT_DIR.to_owned(), cert_dir.to_string());
        }
        if self.insecure_tls {
            r.insert(ENV_INSECURE_TLS.to_owned(), "true".to_owned());
        }
        r
    }
}

/// Parse a Kubernetes-style storage quantity such as `20M`, `1Gi` or `4096`.
///
/// Decimal and binary suffixes both use power-of-two multipliers: volumes
/// are provisioned in binary units, so a `20M` request holds a 20MiB image.
/// An empty string means no bound.
pub fn parse_capacity(s: &str) -> Result<Option<u64>> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(split);
    if digits.is_empty() {
        anyhow::bail!("Invalid quantity: {s}");
    }
    let n: u64 = digits
        .parse()
        .with_context(|| format!("Invalid quantity: {s}"))?;
    let shift = match suffix {
        "" => 0,
        "k" | "K" | "Ki" => 10,
        "M" | "Mi" => 20,
        "G" | "Gi" => 30,
        "T" | "Ti" => 40,
        "P" | "Pi" => 50,
        o => anyhow::bail!("Unknown quantity suffix {o:?} in {s}"),
    };
    n.checked_mul(1u64 << shift)
        .map(Some)
        .ok_or_else(|| anyhow!("Quantity overflows: {s}"))
}
