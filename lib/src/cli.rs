//! # Disk image importer CLI
//!
//! Command line entrypoints: run one import as a worker, inspect an image,
//! and show the controller configuration.

use std::ffi::OsString;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use fn_error_context::context;
use tokio_util::sync::CancellationToken;

use crate::config::{load_config, ConfigToplevel};
use crate::copy::CopyEngine;
use crate::format;
use crate::options::{
    parse_capacity, ContentType, ImportOptions, SourceKind, ENV_ACCESS_KEY, ENV_CERT_DIR,
    ENV_CONTENT_TYPE, ENV_ENDPOINT, ENV_IMAGE_SIZE, ENV_INSECURE_TLS, ENV_SECRET_KEY, ENV_SOURCE,
};
use crate::transport::{ObjectStorageProvider, Providers, UploadSlot, DEFAULT_REGION};
use crate::worker::{
    run_import, TerminationMessage, ENV_FETCH_TIMEOUT, ENV_S3_REGION, ENV_UPLOAD_LISTEN,
};

/// Import a disk image into a file
#[derive(Debug, Parser)]
pub(crate) struct ImportOpts {
    /// Path of the destination image
    #[clap(long)]
    pub(crate) dest: Utf8PathBuf,

    /// Source location
    #[clap(long, env = ENV_ENDPOINT, default_value = "")]
    pub(crate) endpoint: String,

    /// Access key or user name
    #[clap(long, env = ENV_ACCESS_KEY, default_value = "", hide_env_values = true)]
    pub(crate) access_key: String,

    /// Secret key or password
    #[clap(long, env = ENV_SECRET_KEY, default_value = "", hide_env_values = true)]
    pub(crate) secret_key: String,

    /// Source kind: http, s3, registry, upload or none
    #[clap(long, env = ENV_SOURCE, default_value = "http")]
    pub(crate) source: SourceKind,

    /// Content type: disk-image or archive
    #[clap(long, env = ENV_CONTENT_TYPE, default_value = "disk-image")]
    pub(crate) content_type: ContentType,

    /// Capacity of the destination, as a storage quantity such as `20M`
    #[clap(long, env = ENV_IMAGE_SIZE, default_value = "")]
    pub(crate) image_size: String,

    /// Directory holding PEM trust anchors for the endpoint
    #[clap(long, env = ENV_CERT_DIR)]
    pub(crate) cert_dir: Option<Utf8PathBuf>,

    /// Skip TLS verification for a registry endpoint
    #[clap(long, env = ENV_INSECURE_TLS)]
    pub(crate) insecure_tls: bool,

    /// Upper bound on the fetch, in seconds
    #[clap(long, env = ENV_FETCH_TIMEOUT)]
    pub(crate) fetch_timeout: Option<u64>,

    /// Region object storage requests are signed for
    #[clap(long, env = ENV_S3_REGION, default_value = DEFAULT_REGION)]
    pub(crate) s3_region: String,

    /// Receive an upload as the content of one connection to this address,
    /// instead of from standard input
    #[clap(long, env = ENV_UPLOAD_LISTEN)]
    pub(crate) upload_listen: Option<String>,

    /// Directory for intermediate files
    #[clap(long)]
    pub(crate) scratch_dir: Option<Utf8PathBuf>,

    /// Write the outcome here when done
    #[clap(long)]
    pub(crate) termination_log: Option<Utf8PathBuf>,
}

impl ImportOpts {
    fn to_options(&self) -> Result<ImportOptions> {
        let capacity = parse_capacity(&self.image_size).context("Parsing --image-size")?;
        Ok(ImportOptions {
            dest: self.dest.clone(),
            endpoint: self.endpoint.clone(),
            access_key: self.access_key.clone(),
            secret_key: self.secret_key.clone(),
            source: self.source,
            content_type: self.content_type,
            capacity,
            cert_dir: self.cert_dir.clone(),
            insecure_tls: self.insecure_tls,
        })
    }
}

/// Print the format chain of an image
#[derive(Debug, Parser)]
pub(crate) struct DetectOpts {
    /// Image to inspect
    pub(crate) file: Utf8PathBuf,

    /// Content type: disk-image or archive
    #[clap(long, default_value = "disk-image")]
    pub(crate) content_type: ContentType,
}

/// Show the effective controller configuration
#[derive(Debug, Parser)]
pub(crate) struct ConfigShowOpts {
    /// Configuration file; defaults apply if it doesn't exist
    #[clap(long)]
    pub(crate) config: Option<Utf8PathBuf>,
}

/// Populate storage volumes from virtual machine disk images.
#[derive(Debug, Parser)]
#[clap(name = "vmimport")]
#[clap(rename_all = "kebab-case")]
pub(crate) enum Opt {
    /// Run one import, as a worker does.
    ///
    /// Options default to the worker environment, so a worker runs this
    /// with only `--dest` and `--termination-log` given.
    Import(ImportOpts),
    /// Detect the formats of a local image, outermost first.
    Detect(DetectOpts),
    /// Print the effective controller configuration as TOML.
    ConfigShow(ConfigShowOpts),
}

/// Cancel `token` on SIGINT or SIGTERM.
fn cancel_on_signal(token: &CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).context("Installing SIGTERM handler")?;
    let token = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
        tracing::info!("Received termination signal, cancelling");
        token.cancel();
    });
    Ok(())
}

/// The providers for this import. For uploads, starts receiving the body.
fn providers_for(opts: &ImportOpts) -> Result<Providers> {
    let providers = Providers::default().with(
        SourceKind::ObjectStorage,
        Arc::new(ObjectStorageProvider::with_region(&opts.s3_region)),
    );
    if opts.source != SourceKind::Upload {
        return Ok(providers);
    }
    let slot = UploadSlot::new();
    match opts.upload_listen.as_deref() {
        Some(addr) => {
            let listener =
                TcpListener::bind(addr).with_context(|| format!("Binding upload listener {addr}"))?;
            tracing::info!("Waiting for upload on {}", listener.local_addr()?);
            let receiver = slot.clone();
            // Not joined: the import may time out before a peer connects.
            std::thread::spawn(move || {
                if let Err(e) = receiver.accept(listener) {
                    tracing::warn!("Upload receiver failed: {e:#}");
                }
            });
        }
        None => slot.submit(Box::new(std::io::stdin()))?,
    }
    Ok(providers.with_upload_slot(slot))
}

#[context("Importing")]
async fn import(opts: ImportOpts) -> Result<()> {
    let import_opts = opts.to_options()?;
    let mut engine = CopyEngine::new(providers_for(&opts)?);
    if let Some(dir) = opts.scratch_dir.as_ref() {
        engine = engine.with_scratch_dir(dir.clone());
    }
    if let Some(secs) = opts.fetch_timeout {
        engine = engine.with_fetch_timeout(Duration::from_secs(secs));
    }
    let token = CancellationToken::new();
    cancel_on_signal(&token)?;
    let r = run_import(Arc::new(engine), import_opts, &token).await?;
    if let Some(path) = opts.termination_log.as_deref() {
        TerminationMessage::from_result(&r).write_to(path)?;
    }
    let outcome = r?;
    tracing::info!("Wrote {} bytes to {}", outcome.bytes_written, opts.dest);
    Ok(())
}

fn detect(opts: DetectOpts) -> Result<()> {
    let f = std::fs::File::open(&opts.file).with_context(|| format!("Opening {}", opts.file))?;
    let scratch = tempfile::tempdir()?;
    let scratch_dir = camino::Utf8Path::from_path(scratch.path())
        .ok_or_else(|| anyhow::anyhow!("Non-UTF-8 temporary directory"))?;
    let converted = format::convert(
        Box::new(f),
        opts.content_type,
        Some(scratch_dir),
        &CancellationToken::new(),
    )
        .with_context(|| format!("Detecting format of {}", opts.file))?;
    let chain = converted
        .formats
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(" -> ");
    println!("{chain}");
    Ok(())
}

fn config_show(opts: ConfigShowOpts) -> Result<()> {
    let controller = load_config(opts.config.as_deref())?;
    let buf = toml::to_string(&ConfigToplevel { controller })?;
    print!("{buf}");
    Ok(())
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    match opt {
        Opt::Import(opts) => import(opts).await,
        Opt::Detect(opts) => detect(opts),
        Opt::ConfigShow(opts) => config_show(opts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_import_args() {
        let o = Opt::try_parse_from([
            "vmimport",
            "import",
            "--dest",
            "/data/disk.img",
            "--endpoint",
            "docker://registry.example.com/tinycore",
            "--source",
            "registry",
            "--image-size",
            "1Gi",
            "--insecure-tls",
        ])
        .unwrap();
        let o = match o {
            Opt::Import(o) => o,
            o => panic!("Expected import opts, not {o:?}"),
        };
        let opts = o.to_options().unwrap();
        assert_eq!(opts.source, SourceKind::Registry);
        assert_eq!(opts.capacity, Some(1 << 30));
        assert!(opts.insecure_tls);
        assert_eq!(opts.dest.as_str(), "/data/disk.img");
    }

    #[test]
    fn test_upload_providers() {
        let parse = |extra: &[&str]| {
            let args = ["vmimport", "import", "--dest", "/x"].iter().chain(extra);
            match Opt::try_parse_from(args).unwrap() {
                Opt::Import(o) => o,
                o => panic!("Expected import opts, not {o:?}"),
            }
        };
        let o = parse(&["--source", "http"]);
        assert_eq!(o.s3_region, DEFAULT_REGION);
        assert!(providers_for(&o).unwrap().get(SourceKind::Upload).is_err());
        let o = parse(&["--source", "s3", "--s3-region", "eu-west-1"]);
        assert_eq!(o.s3_region, "eu-west-1");
        let o = parse(&["--source", "upload", "--upload-listen", "127.0.0.1:0"]);
        assert!(providers_for(&o).unwrap().get(SourceKind::Upload).is_ok());
        let o = parse(&["--source", "upload", "--upload-listen", "not an address"]);
        assert!(providers_for(&o).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_source() {
        assert!(Opt::try_parse_from(["vmimport", "import", "--dest", "/x", "--source", "ftp"]).is_err());
    }

    #[test]
    fn test_detect_file() {
        let td = tempfile::tempdir().unwrap();
        let p = Utf8PathBuf::try_from(td.path().join("disk.img.gz")).unwrap();
        std::fs::write(&p, crate::fixture::gzip(&[0u8; 4096])).unwrap();
        detect(DetectOpts {
            file: p,
            content_type: ContentType::DiskImage,
        })
        .unwrap();
    }
}
