//! Import intent declared as annotations on a volume request.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::k8sapitypes::ObjectMeta;
use crate::options::{ContentType, SourceKind};

/// The source endpoint.
pub const ANN_ENDPOINT: &str = "import.vmimport.dev/endpoint";
/// Name of the secret holding access and secret keys.
pub const ANN_SECRET: &str = "import.vmimport.dev/secret-name";
/// Name of the config map holding the trust anchor bundle.
pub const ANN_CERT_CONFIG_MAP: &str = "import.vmimport.dev/cert-config-map";
/// The source kind.
pub const ANN_SOURCE: &str = "import.vmimport.dev/source";
/// The content type.
pub const ANN_CONTENT_TYPE: &str = "import.vmimport.dev/content-type";
/// Set to `true` to skip registry TLS verification.
pub const ANN_INSECURE_REGISTRY: &str = "import.vmimport.dev/insecure-registry";

/// The import intent of a request. This is only ever read by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportAnnotations {
    /// Where to fetch from.
    pub endpoint: String,
    /// Reference to a secret with credentials.
    pub secret_ref: Option<String>,
    /// Reference to a certificate bundle.
    pub cert_bundle_ref: Option<String>,
    /// The transport to use.
    pub source: SourceKind,
    /// How to interpret the content.
    pub content_type: ContentType,
    /// Skip registry TLS verification.
    pub insecure_registry: bool,
}

impl ImportAnnotations {
    /// Derive the import intent from object metadata. Returns `Ok(None)` when
    /// no import is intended, and an error when the annotations are present
    /// but malformed.
    pub fn from_meta(meta: &ObjectMeta) -> Result<Option<Self>> {
        let Some(annotations) = meta.annotations.as_ref() else {
            return Ok(None);
        };
        Self::from_annotations(annotations)
    }

    /// Like [`Self::from_meta`], operating on a bare annotation map.
    pub fn from_annotations(annotations: &BTreeMap<String, String>) -> Result<Option<Self>> {
        let get = |k: &str| {
            annotations
                .get(k)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
        };
        let source = get(ANN_SOURCE)
            .map(|s| s.parse::<SourceKind>())
            .transpose()
            .with_context(|| format!("Parsing {ANN_SOURCE}"))?;
        let endpoint = get(ANN_ENDPOINT);
        let source = match (source, endpoint) {
            (None, None) | (Some(SourceKind::None), _) => return Ok(None),
            (Some(s), _) => s,
            (None, Some(_)) => SourceKind::Http,
        };
        let endpoint = match (source, endpoint) {
            (_, Some(e)) => e.to_owned(),
            // Upload streams are pushed to us; nothing to point at.
            (SourceKind::Upload, None) => String::new(),
            (s, None) => anyhow::bail!("Source {s} requires {ANN_ENDPOINT}"),
        };
        let content_type = get(ANN_CONTENT_TYPE)
            .map(|s| s.parse::<ContentType>())
            .transpose()
            .with_context(|| format!("Parsing {ANN_CONTENT_TYPE}"))?
            .unwrap_or_default();
        let insecure_registry = match get(ANN_INSECURE_REGISTRY) {
            None | Some("false") => false,
            Some("true") => true,
            Some(o) => anyhow::bail!("Invalid {ANN_INSECURE_REGISTRY}: {o}"),
        };
        Ok(Some(Self {
            endpoint,
            secret_ref: get(ANN_SECRET).map(ToOwned::to_owned),
            cert_bundle_ref: get(ANN_CERT_CONFIG_MAP).map(ToOwned::to_owned),
            source,
            content_type,
            insecure_registry,
        }))
    }

    /// A stable digest of this intent. Workers record the fingerprint they
    /// were created for so that a changed intent can be told apart from the
    /// one an outcome refers to.
    pub fn fingerprint(&self) -> Result<String> {
        let buf = serde_json::to_vec(self)?;
        let digest = openssl::sha::sha256(&buf);
        Ok(format!("sha256:{}", hex::encode(digest)))
    }
}
