//! Fetch over HTTP(S), optionally with basic authentication.

use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::{Client, ClientBuilder, Response};
use reqwest::{StatusCode, Url};

use super::{error_chain_is_tls, FetchReader, FetchRequest, TransportProvider, TransportStream};
use crate::error::ImportError;

/// Connection establishment never waits longer than this, even when the
/// overall fetch budget is larger.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// What an `https` endpoint without a trust anchor directory is checked
/// against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DefaultTrust {
    /// Refuse the endpoint.
    Reject,
    /// Use the system certificate store.
    SystemRoots,
}

/// Fetches a single URL. Plain `http` needs nothing else; `https` is only
/// accepted together with a trust anchor directory, and the server
/// certificate is then validated against those anchors alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct HttpProvider;

impl TransportProvider for HttpProvider {
    fn fetch(&self, req: &FetchRequest<'_>) -> Result<TransportStream, ImportError> {
        let url = parse_url(req.endpoint)?;
        let client = client_for(&url, req, DefaultTrust::Reject)?;
        let mut rb = client.get(url);
        if req.has_credentials() {
            rb = rb.basic_auth(req.access_key, Some(req.secret_key));
        }
        tracing::debug!("GET {}", req.endpoint);
        let resp = rb.send().map_err(|e| classify(req.endpoint, e))?;
        let resp = check_status(req.endpoint, resp)?;
        Ok(Box::new(FetchReader::new(resp, req.endpoint)))
    }
}

pub(crate) fn parse_url(endpoint: &str) -> Result<Url, ImportError> {
    Url::parse(endpoint).map_err(|e| ImportError::Fetch {
        endpoint: endpoint.to_owned(),
        message: format!("invalid endpoint URL: {e}"),
    })
}

/// Build a client for `url`, enforcing the trust policy for its scheme.
/// When `req` names a trust anchor directory, `https` servers are validated
/// against those anchors alone; otherwise `default_trust` applies.
pub(crate) fn client_for(
    url: &Url,
    req: &FetchRequest<'_>,
    default_trust: DefaultTrust,
) -> Result<Client, ImportError> {
    let mut builder = ClientBuilder::new()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .timeout(req.timeout)
        .connect_timeout(req.timeout.min(CONNECT_TIMEOUT));
    match url.scheme() {
        "http" => {}
        "https" => match (req.cert_dir, default_trust) {
            (Some(cert_dir), _) => {
                builder = builder.tls_built_in_root_certs(false);
                for cert in load_trust_anchors(req.endpoint, cert_dir)? {
                    builder = builder.add_root_certificate(cert);
                }
            }
            (None, DefaultTrust::SystemRoots) => {}
            (None, DefaultTrust::Reject) => {
                return Err(ImportError::FetchTls {
                    endpoint: req.endpoint.to_owned(),
                    message: "https endpoint requires a trust anchor".into(),
                });
            }
        },
        o => {
            return Err(ImportError::Fetch {
                endpoint: req.endpoint.to_owned(),
                message: format!("unsupported URL scheme {o}"),
            })
        }
    }
    builder.build().map_err(|e| ImportError::Fetch {
        endpoint: req.endpoint.to_owned(),
        message: format!("{:#}", anyhow::Error::new(e)),
    })
}

/// Load every PEM certificate found directly inside `dir`.
pub(crate) fn load_trust_anchors(
    endpoint: &str,
    dir: &Utf8Path,
) -> Result<Vec<reqwest::Certificate>, ImportError> {
    let tls_err = |message: String| ImportError::FetchTls {
        endpoint: endpoint.to_owned(),
        message,
    };
    let entries = dir
        .read_dir_utf8()
        .map_err(|e| tls_err(format!("reading trust anchors in {dir}: {e}")))?;
    let mut r = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| tls_err(format!("reading {dir}: {e}")))?;
        let path = entry.path();
        if !path.is_file() || path.file_name().is_some_and(|n| n.starts_with('.')) {
            continue;
        }
        let buf = std::fs::read(path).map_err(|e| tls_err(format!("reading {path}: {e}")))?;
        let cert = reqwest::Certificate::from_pem(&buf)
            .map_err(|e| tls_err(format!("parsing {path}: {e}")))?;
        r.push(cert);
    }
    if r.is_empty() {
        return Err(tls_err(format!("no trust anchors found in {dir}")));
    }
    Ok(r)
}

/// Map a request failure onto the fetch error taxonomy.
pub(crate) fn classify(endpoint: &str, e: reqwest::Error) -> ImportError {
    let endpoint = endpoint.to_owned();
    if e.is_timeout() {
        return ImportError::FetchTimeout { endpoint };
    }
    if let Some(status) = e.status() {
        return status_error(endpoint, status);
    }
    if error_chain_is_tls(&e) {
        return ImportError::FetchTls {
            endpoint,
            message: format!("{:#}", anyhow::Error::new(e)),
        };
    }
    ImportError::Fetch {
        endpoint,
        message: format!("{:#}", anyhow::Error::new(e)),
    }
}

/// Fail on any non-success status.
pub(crate) fn check_status(endpoint: &str, resp: Response) -> Result<Response, ImportError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(status_error(endpoint.to_owned(), status))
    }
}

fn status_error(endpoint: String, status: StatusCode) -> ImportError {
    let message = format!("HTTP status {status}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ImportError::FetchAuth { endpoint, message }
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => ImportError::FetchNotFound { endpoint, message },
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            ImportError::FetchTimeout { endpoint }
        }
        _ => ImportError::Fetch { endpoint, message },
    }
}
