use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use tokio_util::sync::CancellationToken;

use vmimport_lib::annotations::{ANN_ENDPOINT, ANN_SECRET};
use vmimport_lib::controller::memory::{MemoryCluster, StaticCredentials};
use vmimport_lib::controller::{
    worker_name, Controller, ReconcileAction, RequestKey, VolumeRequest, WorkerPhase,
};
use vmimport_lib::fixture::{
    self, FakeRegistry, HttpBehavior, HttpFixture, Qcow2Options, TlsIdentity,
};
use vmimport_lib::format::Format;
use vmimport_lib::k8sapitypes::ObjectMeta;
use vmimport_lib::options::{ContentType, SourceKind};
use vmimport_lib::transport::{Providers, UploadSlot};
use vmimport_lib::worker::{run_import, TerminationMessage};
use vmimport_lib::{CopyEngine, ImportError, ImportOptions};

const MIB: usize = 1024 * 1024;

struct Workdir {
    _tempdir: tempfile::TempDir,
    path: Utf8PathBuf,
}

impl Workdir {
    fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir()?;
        let path = Utf8Path::from_path(tempdir.path()).unwrap().to_owned();
        Ok(Self {
            _tempdir: tempdir,
            path,
        })
    }

    fn dest(&self) -> Utf8PathBuf {
        self.path.join("disk.img")
    }
}

/// An ISO 9660 image of `size` bytes with scattered non-zero content.
fn iso_image(size: usize) -> Vec<u8> {
    let mut img = vec![0u8; size];
    img[0x8001..0x8006].copy_from_slice(b"CD001");
    for (i, off) in (0..size).step_by(MIB + 4093).enumerate() {
        img[off] = (i % 251) as u8 + 1;
    }
    img
}

fn http_opts(dest: Utf8PathBuf, endpoint: String) -> ImportOptions {
    ImportOptions {
        dest,
        endpoint,
        source: SourceKind::Http,
        ..Default::default()
    }
}

fn copy(engine: &CopyEngine, opts: &ImportOptions) -> Result<vmimport_lib::CopyOutcome, ImportError> {
    engine.copy(opts, &CancellationToken::new())
}

#[test]
fn test_http_import_fills_capacity() -> Result<()> {
    let w = Workdir::new()?;
    let img = iso_image(20 * MIB);
    let server = HttpFixture::serve(img.clone())?;
    let mut opts = http_opts(w.dest(), server.url());
    opts.capacity = Some(20 * MIB as u64);
    let outcome = copy(&CopyEngine::default(), &opts)?;
    assert_eq!(outcome.bytes_written, img.len() as u64);
    assert_eq!(outcome.formats, vec![Format::Iso]);
    assert!(std::fs::read(w.dest())? == img);
    Ok(())
}

#[test]
fn test_http_import_over_capacity() -> Result<()> {
    let w = Workdir::new()?;
    let server = HttpFixture::serve(iso_image(20 * MIB))?;
    let mut opts = http_opts(w.dest(), server.url());
    opts.capacity = Some(10 * MIB as u64);
    match copy(&CopyEngine::default(), &opts) {
        Err(ImportError::CapacityExceeded { capacity }) => assert_eq!(capacity, 10 * MIB as u64),
        o => panic!("unexpected {o:?}"),
    }
    assert!(!w.dest().exists());
    Ok(())
}

#[test]
fn test_http_auth_rejected_leaves_dest() -> Result<()> {
    let w = Workdir::new()?;
    std::fs::write(w.dest(), b"previous")?;
    let server = HttpFixture::serve_with_auth(iso_image(MIB * 2), "user", "pass")?;
    let mut opts = http_opts(w.dest(), server.url());
    opts.access_key = "user".into();
    opts.secret_key = "wrong".into();
    let err = copy(&CopyEngine::default(), &opts).unwrap_err();
    assert_eq!(err.reason(), "FetchAuthError");
    assert_eq!(std::fs::read(w.dest())?, b"previous");

    opts.secret_key = "pass".into();
    copy(&CopyEngine::default(), &opts)?;
    assert_eq!(std::fs::metadata(w.dest())?.len(), 2 * MIB as u64);
    assert_eq!(server.requests(), 2);
    Ok(())
}

#[test]
fn test_http_not_found() -> Result<()> {
    let w = Workdir::new()?;
    let server = HttpFixture::serve(Vec::new())?;
    let opts = http_opts(w.dest(), server.missing_url());
    let err = copy(&CopyEngine::default(), &opts).unwrap_err();
    assert!(matches!(err, ImportError::FetchNotFound { .. }), "{err:?}");
    assert!(!w.dest().exists());
    Ok(())
}

#[test]
fn test_http_timeout() -> Result<()> {
    let w = Workdir::new()?;
    let server = HttpFixture::start(HttpBehavior::Hang)?;
    let opts = http_opts(w.dest(), server.url());
    let engine = CopyEngine::default().with_fetch_timeout(Duration::from_secs(1));
    let err = copy(&engine, &opts).unwrap_err();
    assert_eq!(err.reason(), "FetchTimeoutError");
    assert!(!w.dest().exists());
    Ok(())
}

#[test]
fn test_https_trust_anchor() -> Result<()> {
    let w = Workdir::new()?;
    let img = iso_image(2 * MIB);
    let identity = TlsIdentity::generate()?;
    let server = HttpFixture::serve_tls(img.clone(), &identity)?;
    let trusted = w.path.join("trusted");
    std::fs::create_dir(&trusted)?;
    identity.write_ca(&trusted)?;
    let other = w.path.join("other");
    std::fs::create_dir(&other)?;
    TlsIdentity::generate()?.write_ca(&other)?;

    let mut opts = http_opts(w.dest(), server.url());
    assert!(opts.endpoint.starts_with("https://"));
    let err = copy(&CopyEngine::default(), &opts).unwrap_err();
    assert_eq!(err.reason(), "FetchTLSError");

    opts.cert_dir = Some(other);
    let err = copy(&CopyEngine::default(), &opts).unwrap_err();
    assert_eq!(err.reason(), "FetchTLSError", "{err}");
    assert!(!w.dest().exists());

    opts.cert_dir = Some(trusted);
    copy(&CopyEngine::default(), &opts)?;
    assert!(std::fs::read(w.dest())? == img);
    Ok(())
}

#[test]
fn test_object_storage_signed_request() -> Result<()> {
    let w = Workdir::new()?;
    let img = iso_image(3 * MIB);
    let server = HttpFixture::serve_object(fixture::gzip(&img), "AKID", "secret")?;
    let mut opts = ImportOptions {
        dest: w.dest(),
        endpoint: server.url(),
        source: SourceKind::ObjectStorage,
        access_key: "AKID".into(),
        secret_key: "wrong".into(),
        ..Default::default()
    };
    let err = copy(&CopyEngine::default(), &opts).unwrap_err();
    assert_eq!(err.reason(), "FetchAuthError");

    opts.secret_key = "secret".into();
    let outcome = copy(&CopyEngine::default(), &opts)?;
    assert_eq!(outcome.formats, vec![Format::Gzip, Format::Iso]);
    assert!(std::fs::read(w.dest())? == img);
    assert_eq!(server.requests(), 2);
    Ok(())
}

#[test]
fn test_reimport_overwrites() -> Result<()> {
    let w = Workdir::new()?;
    let first = HttpFixture::serve(iso_image(4 * MIB))?;
    copy(&CopyEngine::default(), &http_opts(w.dest(), first.url()))?;
    let mut smaller = iso_image(MIB * 3);
    smaller[MIB * 2] = 0x42;
    let second = HttpFixture::serve(smaller.clone())?;
    copy(&CopyEngine::default(), &http_opts(w.dest(), second.url()))?;
    assert!(std::fs::read(w.dest())? == smaller);
    Ok(())
}

#[test]
fn test_compressed_archive_of_qcow2() -> Result<()> {
    let w = Workdir::new()?;
    let raw = iso_image(3 * MIB);
    let qcow2 = fixture::qcow2_image(
        &raw,
        Qcow2Options {
            compress: true,
            ..Default::default()
        },
    );
    let body = fixture::xz(&fixture::tar_with_entry("disk/tinyCore.qcow2", &qcow2));
    let server = HttpFixture::serve(body)?;
    let mut opts = http_opts(w.dest(), server.url());
    opts.content_type = ContentType::Archive;
    let engine = CopyEngine::default().with_scratch_dir(w.path.clone());
    let outcome = copy(&engine, &opts)?;
    assert_eq!(outcome.formats, vec![Format::Xz, Format::Tar, Format::Qcow2]);
    assert!(std::fs::read(w.dest())? == raw);
    Ok(())
}

#[test]
fn test_archive_without_tar_is_rejected() -> Result<()> {
    let w = Workdir::new()?;
    let server = HttpFixture::serve(fixture::gzip(&iso_image(MIB)))?;
    let mut opts = http_opts(w.dest(), server.url());
    opts.content_type = ContentType::Archive;
    let err = copy(&CopyEngine::default(), &opts).unwrap_err();
    assert_eq!(err.reason(), "ConversionError");
    Ok(())
}

#[test]
fn test_registry_trust() -> Result<()> {
    let w = Workdir::new()?;
    let raw = iso_image(2 * MIB);
    let layer = fixture::gzip(&fixture::tar_with_entry(
        "disk/disk.qcow2",
        &fixture::qcow2_image(&raw, Default::default()),
    ));
    let certs = w.path.join("certs");
    std::fs::create_dir(&certs)?;
    let registry = Arc::new(FakeRegistry::new(vec![layer]).trusting(certs.clone()));
    let engine = CopyEngine::new(Providers::default().with_image_copier(registry.clone()));
    let mut opts = ImportOptions {
        dest: w.dest(),
        endpoint: "docker://registry.example.com/tinycore:latest".into(),
        source: SourceKind::Registry,
        cert_dir: Some(w.path.join("elsewhere")),
        ..Default::default()
    };

    let err = copy(&engine, &opts).unwrap_err();
    assert_eq!(err.reason(), "FetchTLSError");
    assert!(!w.dest().exists());

    opts.cert_dir = Some(certs);
    let outcome = copy(&engine, &opts)?;
    assert_eq!(outcome.formats, vec![Format::Qcow2]);
    assert!(std::fs::read(w.dest())? == raw);

    opts.cert_dir = None;
    opts.insecure_tls = true;
    copy(&engine, &opts)?;
    assert!(std::fs::read(w.dest())? == raw);
    assert_eq!(registry.copies(), 3);
    Ok(())
}

#[test]
fn test_registry_credentials_rejected() -> Result<()> {
    let w = Workdir::new()?;
    let raw = iso_image(MIB);
    let layer = fixture::gzip(&fixture::tar_with_entry("disk/disk.img", &raw));
    let registry = Arc::new(FakeRegistry::new(vec![layer]).requiring_credentials("user", "pass"));
    let engine = CopyEngine::new(Providers::default().with_image_copier(registry.clone()))
        .with_scratch_dir(w.path.clone());
    let mut opts = ImportOptions {
        dest: w.dest(),
        endpoint: "docker://registry.example.com/tinycore:latest".into(),
        source: SourceKind::Registry,
        insecure_tls: true,
        access_key: "user".into(),
        secret_key: "wrong".into(),
        ..Default::default()
    };
    let err = copy(&engine, &opts).unwrap_err();
    assert_eq!(err.reason(), "FetchAuthError");
    assert!(!w.dest().exists());

    opts.secret_key = "pass".into();
    copy(&engine, &opts)?;
    assert!(std::fs::read(w.dest())? == raw);
    assert_eq!(registry.copies(), 2);
    // Scratch space is released once the import is done.
    let left: Vec<_> = w.path.read_dir_utf8()?.collect::<std::io::Result<_>>()?;
    assert_eq!(left.len(), 1, "{left:?}");
    Ok(())
}

#[test]
fn test_upload() -> Result<()> {
    let w = Workdir::new()?;
    let raw = iso_image(MIB);
    let slot = UploadSlot::new();
    let engine = CopyEngine::new(Providers::default().with_upload_slot(slot.clone()))
        .with_fetch_timeout(Duration::from_secs(5));
    slot.submit(Box::new(std::io::Cursor::new(fixture::gzip(&raw))))?;
    let opts = ImportOptions {
        dest: w.dest(),
        source: SourceKind::Upload,
        ..Default::default()
    };
    let outcome = copy(&engine, &opts)?;
    assert_eq!(outcome.formats, vec![Format::Gzip, Format::Iso]);
    assert!(std::fs::read(w.dest())? == raw);
    Ok(())
}

/// An upload pushed over a connection to a worker run from the command
/// line.
#[tokio::test(flavor = "multi_thread")]
async fn test_cli_upload_listener() -> Result<()> {
    let w = Workdir::new()?;
    let raw = iso_image(2 * MIB);
    let addr = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?;
    let body = fixture::xz(&raw);
    let sender = std::thread::spawn(move || -> std::io::Result<()> {
        let mut conn = None;
        for _ in 0..500 {
            match TcpStream::connect(addr) {
                Ok(c) => {
                    conn = Some(c);
                    break;
                }
                Err(_) => std::thread::sleep(Duration::from_millis(20)),
            }
        }
        let mut conn = conn.ok_or_else(|| std::io::Error::other("upload listener never came up"))?;
        conn.write_all(&body)?;
        conn.shutdown(Shutdown::Write)
    });
    let dest = w.dest();
    let addr = addr.to_string();
    vmimport_lib::cli::run_from_iter([
        "vmimport",
        "import",
        "--dest",
        dest.as_str(),
        "--source",
        "upload",
        "--upload-listen",
        addr.as_str(),
        "--fetch-timeout",
        "30",
    ])
    .await?;
    sender.join().unwrap()?;
    assert!(std::fs::read(&dest)? == raw);
    Ok(())
}

/// The full loop: a request is reconciled into a worker, the worker runs the
/// import from its environment, and its outcome lands on the request.
#[tokio::test]
async fn test_request_to_ready_volume() -> Result<()> {
    let w = Workdir::new()?;
    let raw = iso_image(4 * MIB);
    let server = HttpFixture::serve_with_auth(raw.clone(), "user", "pass")?;

    let cluster = Arc::new(MemoryCluster::new());
    let creds = StaticCredentials::new().with_secret("creds", "user", "pass");
    let controller = Controller::new(cluster.clone(), Arc::new(creds), Default::default());
    let key = cluster.put_request(VolumeRequest {
        metadata: ObjectMeta {
            name: Some("tinycore".into()),
            annotations: Some(
                [(ANN_ENDPOINT, server.url()), (ANN_SECRET, "creds".to_owned())]
                    .into_iter()
                    .map(|(k, v)| (k.to_owned(), v))
                    .collect(),
            ),
            ..Default::default()
        },
        requested_capacity: Some("4Mi".into()),
        ..Default::default()
    });
    assert_eq!(key, RequestKey::new("default", "tinycore"));

    assert_eq!(controller.reconcile(&key).await?, ReconcileAction::Created);
    let name = worker_name("tinycore");
    let worker = cluster.worker("default", &name).unwrap();
    cluster.set_worker_phase("default", &name, WorkerPhase::Running, None);
    assert_eq!(controller.reconcile(&key).await?, ReconcileAction::Waiting);

    let opts = ImportOptions::from_vars(w.dest(), &worker.spec.env)?;
    let r = run_import(Arc::new(CopyEngine::default()), opts, &CancellationToken::new()).await?;
    let log = w.path.join("termination-log");
    TerminationMessage::from_result(&r).write_to(&log)?;
    let phase = if r.is_ok() {
        WorkerPhase::Succeeded
    } else {
        WorkerPhase::Failed
    };
    cluster.set_worker_phase("default", &name, phase, Some(std::fs::read_to_string(&log)?));

    assert_eq!(controller.reconcile(&key).await?, ReconcileAction::Succeeded);
    let status = cluster.request(&key).unwrap().status;
    assert!(status.ready, "{status:?}");
    assert!(std::fs::read(w.dest())? == raw);
    assert_eq!(cluster.worker_count(), 0);
    assert_eq!(cluster.workers_created(), 1);
    Ok(())
}
