//! Test fixtures: image builders, a loopback HTTP(S) server that can stand
//! in for an object store, and a fake registry. Should only be used by this library and its tests.

#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslMethod};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Builder, X509Name, X509NameBuilder, X509};

use crate::transport::{CopyRequest, ImageCopier};

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut e = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    e.write_all(data).unwrap();
    e.finish().unwrap()
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut e = xz2::write::XzEncoder::new(Vec::new(), 1);
    e.write_all(data).unwrap();
    e.finish().unwrap()
}

pub fn append_file<W: Write>(b: &mut tar::Builder<W>, path: &str, data: &[u8]) {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Regular);
    h.set_mode(0o644);
    h.set_size(data.len() as u64);
    b.append_data(&mut h, path, data).unwrap();
}

pub fn append_dir<W: Write>(b: &mut tar::Builder<W>, path: &str) {
    let mut h = tar::Header::new_gnu();
    h.set_entry_type(tar::EntryType::Directory);
    h.set_mode(0o755);
    h.set_size(0);
    b.append_data(&mut h, path, std::io::empty()).unwrap();
}

/// A tar archive with a single regular file.
pub fn tar_with_entry(path: &str, data: &[u8]) -> Vec<u8> {
    let mut b = tar::Builder::new(Vec::new());
    append_file(&mut b, path, data);
    b.into_inner().unwrap()
}

#[derive(Debug, Clone, Copy)]
pub struct Qcow2Options {
    pub cluster_bits: u32,
    pub compress: bool,
}

impl Default for Qcow2Options {
    fn default() -> Self {
        Self {
            cluster_bits: 16,
            compress: false,
        }
    }
}

/// Encode `data` as a version 3 qcow2 image. All-zero clusters are left
/// unallocated. Layout: header, refcount table, L1 table, L2 tables, data.
pub fn qcow2_image(data: &[u8], opts: Qcow2Options) -> Vec<u8> {
    let cs = 1usize << opts.cluster_bits;
    let l2_entries = cs / 8;
    let clusters = data.len().div_ceil(cs);
    let l2_tables = clusters.div_ceil(l2_entries).max(1);
    let l1_entries = l2_tables;
    assert!(l1_entries * 8 <= cs);

    let refcount_off = cs;
    let l1_off = 2 * cs;
    let l2_off = 3 * cs;
    let mut img = vec![0u8; (3 + l2_tables) * cs];

    let put32 = |img: &mut Vec<u8>, off: usize, v: u32| {
        img[off..off + 4].copy_from_slice(&v.to_be_bytes())
    };
    let put64 = |img: &mut Vec<u8>, off: usize, v: u64| {
        img[off..off + 8].copy_from_slice(&v.to_be_bytes())
    };
    img[..4].copy_from_slice(b"QFI\xfb");
    put32(&mut img, 4, 3);
    put32(&mut img, 20, opts.cluster_bits);
    put64(&mut img, 24, data.len() as u64);
    put32(&mut img, 36, l1_entries as u32);
    put64(&mut img, 40, l1_off as u64);
    put64(&mut img, 48, refcount_off as u64);
    put32(&mut img, 56, 1);
    put32(&mut img, 96, 4);
    put32(&mut img, 100, 104);
    for t in 0..l2_tables {
        put64(&mut img, l1_off + t * 8, (l2_off + t * cs) as u64 | 1 << 63);
    }

    for (i, chunk) in data.chunks(cs).enumerate() {
        if chunk.iter().all(|&b| b == 0) {
            continue;
        }
        let entry_off = l2_off + i * 8;
        let mut cluster = chunk.to_vec();
        cluster.resize(cs, 0);
        let host = img.len();
        if opts.compress {
            let mut e = flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::best());
            e.write_all(&cluster).unwrap();
            let compressed = e.finish().unwrap();
            let sectors = compressed.len().div_ceil(512) as u64;
            let x = 62 - (opts.cluster_bits - 8);
            let desc = host as u64 | (sectors - 1) << x | 1 << 62;
            put64(&mut img, entry_off, desc);
            img.extend_from_slice(&compressed);
            img.resize(host + sectors as usize * 512, 0);
        } else {
            put64(&mut img, entry_off, host as u64 | 1 << 63);
            img.extend_from_slice(&cluster);
        }
    }
    img
}

/// Write a `dir:` image layout holding `layers`, bottom first.
pub fn write_image_dir(dir: &Utf8Path, layers: &[Vec<u8>]) -> Result<()> {
    let mut descriptors = Vec::new();
    for layer in layers {
        let digest = hex::encode(openssl::sha::sha256(layer));
        std::fs::write(dir.join(&digest), layer)?;
        descriptors.push(serde_json::json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
            "digest": format!("sha256:{digest}"),
            "size": layer.len(),
        }));
    }
    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "layers": descriptors,
    });
    std::fs::write(dir.join("manifest.json"), serde_json::to_vec(&manifest)?)?;
    Ok(())
}

/// An in-process registry. Certificate checks succeed only for the
/// configured trust anchor directory, unless TLS verification is skipped.
#[derive(Debug)]
pub struct FakeRegistry {
    layers: Vec<Vec<u8>>,
    trusted_cert_dir: Option<Utf8PathBuf>,
    credentials: Option<(String, String)>,
    copies: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(layers: Vec<Vec<u8>>) -> Self {
        Self {
            layers,
            trusted_cert_dir: None,
            credentials: None,
            copies: AtomicUsize::new(0),
        }
    }

    pub fn trusting(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.trusted_cert_dir = Some(dir.into());
        self
    }

    pub fn requiring_credentials(mut self, user: &str, pass: &str) -> Self {
        self.credentials = Some((user.into(), pass.into()));
        self
    }

    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }
}

impl ImageCopier for FakeRegistry {
    fn copy_image(&self, req: &CopyRequest<'_>) -> Result<()> {
        self.copies.fetch_add(1, Ordering::SeqCst);
        if !req.insecure_tls && req.cert_dir != self.trusted_cert_dir.as_deref() {
            anyhow::bail!("pinging container registry: x509: certificate signed by unknown authority");
        }
        if let Some((user, pass)) = self.credentials.as_ref() {
            if req.access_key != user.as_str() || req.secret_key != pass.as_str() {
                anyhow::bail!("reading manifest: unauthorized: authentication required");
            }
        }
        write_image_dir(req.dest_dir, &self.layers)
    }
}

/// Credentials a loopback server demands.
#[derive(Debug, Clone, Default)]
pub enum HttpAuth {
    #[default]
    None,
    /// HTTP basic authentication.
    Basic { user: String, pass: String },
    /// AWS Signature V4, checked by recomputing the signature.
    SigV4 {
        access_key: String,
        secret_key: String,
        region: String,
    },
}

/// How the loopback server answers.
#[derive(Debug, Clone)]
pub enum HttpBehavior {
    /// Serve the body, if the request carries the expected credentials.
    Serve { body: Arc<Vec<u8>>, auth: HttpAuth },
    /// Accept connections and never answer.
    Hang,
}

/// A certificate authority and a server certificate it issued for
/// `127.0.0.1` and `localhost`.
pub struct TlsIdentity {
    ca: X509,
    cert: X509,
    key: PKey<Private>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity").finish_non_exhaustive()
    }
}

fn ec_key() -> Result<PKey<Private>> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

fn name(cn: &str) -> Result<X509Name> {
    let mut b = X509NameBuilder::new()?;
    b.append_entry_by_text("CN", cn)?;
    Ok(b.build())
}

fn cert_builder(
    subject: &X509Name,
    issuer: &X509Name,
    key: &PKey<Private>,
    serial: u32,
) -> Result<X509Builder> {
    let mut b = X509Builder::new()?;
    b.set_version(2)?;
    let serial = BigNum::from_u32(serial)?.to_asn1_integer()?;
    b.set_serial_number(&serial)?;
    b.set_subject_name(subject)?;
    b.set_issuer_name(issuer)?;
    b.set_pubkey(key)?;
    let not_before: Asn1Time = Asn1Time::days_from_now(0)?;
    let not_after: Asn1Time = Asn1Time::days_from_now(1)?;
    b.set_not_before(&not_before)?;
    b.set_not_after(&not_after)?;
    Ok(b)
}

impl TlsIdentity {
    pub fn generate() -> Result<Self> {
        let ca_key = ec_key()?;
        let ca_name = name("vmimport test CA")?;
        let mut b = cert_builder(&ca_name, &ca_name, &ca_key, 1)?;
        b.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        b.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
        let ski = SubjectKeyIdentifier::new().build(&b.x509v3_context(None, None))?;
        b.append_extension(ski)?;
        b.sign(&ca_key, MessageDigest::sha256())?;
        let ca = b.build();

        let key = ec_key()?;
        let mut b = cert_builder(&name("127.0.0.1")?, &ca_name, &key, 2)?;
        b.append_extension(BasicConstraints::new().build()?)?;
        b.append_extension(KeyUsage::new().critical().digital_signature().build()?)?;
        b.append_extension(ExtendedKeyUsage::new().server_auth().build()?)?;
        let san = SubjectAlternativeName::new()
            .ip("127.0.0.1")
            .dns("localhost")
            .build(&b.x509v3_context(Some(&*ca), None))?;
        b.append_extension(san)?;
        b.sign(&ca_key, MessageDigest::sha256())?;
        let cert = b.build();
        Ok(Self { ca, cert, key })
    }

    /// Write the CA certificate into `dir`, as a trust anchor directory.
    pub fn write_ca(&self, dir: &Utf8Path) -> Result<()> {
        std::fs::write(dir.join("ca.pem"), self.ca.to_pem()?)?;
        Ok(())
    }

    fn acceptor(&self) -> Result<SslAcceptor> {
        let mut b = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls())?;
        b.set_private_key(&self.key)?;
        b.set_certificate(&self.cert)?;
        b.add_extra_chain_cert(self.ca.clone())?;
        Ok(b.build())
    }
}

const DISK_PATH: &str = "/disk.img";
const OBJECT_PATH: &str = "/images/disk.img";

/// A loopback HTTP/1.1 server serving one file.
#[derive(Debug)]
pub struct HttpFixture {
    addr: SocketAddr,
    scheme: &'static str,
    path: &'static str,
    requests: Arc<AtomicUsize>,
    // Held so hanging connections stay open for the fixture's lifetime.
    _held: Arc<Mutex<Vec<TcpStream>>>,
}

impl HttpFixture {
    pub fn serve(body: Vec<u8>) -> Result<Self> {
        Self::start(HttpBehavior::Serve {
            body: Arc::new(body),
            auth: HttpAuth::None,
        })
    }

    pub fn serve_with_auth(body: Vec<u8>, user: &str, pass: &str) -> Result<Self> {
        Self::start(HttpBehavior::Serve {
            body: Arc::new(body),
            auth: HttpAuth::Basic {
                user: user.into(),
                pass: pass.into(),
            },
        })
    }

    /// Serve `body` over TLS with the certificate of `identity`.
    pub fn serve_tls(body: Vec<u8>, identity: &TlsIdentity) -> Result<Self> {
        let behavior = HttpBehavior::Serve {
            body: Arc::new(body),
            auth: HttpAuth::None,
        };
        Self::spawn(behavior, Some(identity.acceptor()?), DISK_PATH)
    }

    /// Serve `body` as an object in bucket `images`, accepting only
    /// requests signed with the given key pair for the default region.
    pub fn serve_object(body: Vec<u8>, access_key: &str, secret_key: &str) -> Result<Self> {
        let behavior = HttpBehavior::Serve {
            body: Arc::new(body),
            auth: HttpAuth::SigV4 {
                access_key: access_key.into(),
                secret_key: secret_key.into(),
                region: crate::transport::DEFAULT_REGION.into(),
            },
        };
        Self::spawn(behavior, None, OBJECT_PATH)
    }

    pub fn start(behavior: HttpBehavior) -> Result<Self> {
        Self::spawn(behavior, None, DISK_PATH)
    }

    fn spawn(
        behavior: HttpBehavior,
        tls: Option<SslAcceptor>,
        path: &'static str,
    ) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("Binding loopback listener")?;
        let addr = listener.local_addr()?;
        let scheme = if tls.is_some() { "https" } else { "http" };
        let tls = tls.map(Arc::new);
        let requests = Arc::new(AtomicUsize::new(0));
        let held = Arc::new(Mutex::new(Vec::new()));
        {
            let requests = Arc::clone(&requests);
            let held = Arc::clone(&held);
            std::thread::spawn(move || {
                for conn in listener.incoming() {
                    let Ok(conn) = conn else { break };
                    requests.fetch_add(1, Ordering::SeqCst);
                    match &behavior {
                        HttpBehavior::Hang => held.lock().unwrap().push(conn),
                        HttpBehavior::Serve { body, auth } => {
                            let body = Arc::clone(body);
                            let auth = auth.clone();
                            let tls = tls.clone();
                            std::thread::spawn(move || {
                                let _ = serve_conn(conn, tls.as_deref(), addr, path, &body, &auth);
                            });
                        }
                    }
                }
            });
        }
        Ok(Self {
            addr,
            scheme,
            path,
            requests,
            _held: held,
        })
    }

    /// The URL of the served file.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.addr, self.path)
    }

    /// A URL on this server that doesn't exist.
    pub fn missing_url(&self) -> String {
        format!("{}://{}/missing.img", self.scheme, self.addr)
    }

    /// Number of connections accepted so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn serve_conn(
    conn: TcpStream,
    tls: Option<&SslAcceptor>,
    addr: SocketAddr,
    path: &str,
    body: &[u8],
    auth: &HttpAuth,
) -> Result<()> {
    conn.set_read_timeout(Some(Duration::from_secs(10)))?;
    match tls {
        Some(acceptor) => {
            let conn = acceptor
                .accept(conn)
                .map_err(|e| anyhow::anyhow!("TLS handshake: {e}"))?;
            respond(conn, "https", addr, path, body, auth)
        }
        None => respond(conn, "http", addr, path, body, auth),
    }
}

fn authorized(
    auth: &HttpAuth,
    url: &str,
    headers: &BTreeMap<String, String>,
) -> Result<bool> {
    let header = |k: &str| headers.get(k).map(|s| s.as_str()).unwrap_or_default();
    let r = match auth {
        HttpAuth::None => true,
        HttpAuth::Basic { user, pass } => {
            let expected = format!(
                "Basic {}",
                openssl::base64::encode_block(format!("{user}:{pass}").as_bytes())
            );
            header("authorization") == expected
        }
        HttpAuth::SigV4 {
            access_key,
            secret_key,
            region,
        } => {
            let url = reqwest::Url::parse(url)?;
            header("x-amz-content-sha256") == "UNSIGNED-PAYLOAD"
                && crate::transport::verify_signed_get(
                    &url,
                    header("x-amz-date"),
                    header("authorization"),
                    access_key,
                    secret_key,
                    region,
                )
        }
    };
    Ok(r)
}

fn respond<S: Read + Write>(
    conn: S,
    scheme: &str,
    addr: SocketAddr,
    path: &str,
    body: &[u8],
    auth: &HttpAuth,
) -> Result<()> {
    let mut reader = BufReader::new(conn);
    let mut request_line = String::new();
    reader.read_line(&mut request_line)?;
    let requested = request_line.split_whitespace().nth(1).unwrap_or_default().to_owned();
    let mut headers = BTreeMap::new();
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 || line == "\r\n" {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_owned());
        }
    }
    let url = format!("{scheme}://{addr}{requested}");
    let (status, body) = if !authorized(auth, &url, &headers)? {
        match auth {
            HttpAuth::SigV4 { .. } => ("403 Forbidden", &b""[..]),
            _ => ("401 Unauthorized", &b""[..]),
        }
    } else if requested != path {
        ("404 Not Found", &b""[..])
    } else {
        ("200 OK", body)
    };
    let conn = reader.get_mut();
    write!(
        conn,
        "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    )?;
    conn.write_all(body)?;
    conn.flush()?;
    Ok(())
}
