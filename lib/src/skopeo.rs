//! Fork skopeo as a subprocess

use std::process::Stdio;

use anyhow::Result;
use fn_error_context::context;
use vmimport_utils::CommandRunExt;

use crate::transport::{CopyRequest, ImageCopier};

/// Create a Command builder for skopeo.
pub(crate) fn new_cmd() -> std::process::Command {
    let mut cmd = std::process::Command::new("skopeo");
    cmd.stdin(Stdio::null());
    cmd
}

/// Build the `skopeo copy` invocation for `req`.
fn copy_cmd(req: &CopyRequest<'_>) -> std::process::Command {
    let mut cmd = new_cmd();
    // Global option; bounds the whole copy including registry round trips.
    cmd.arg(format!("--command-timeout={}s", req.timeout.as_secs().max(1)));
    cmd.args(["copy", "--quiet"]);
    if let Some(cert_dir) = req.cert_dir {
        cmd.arg("--src-cert-dir");
        cmd.arg(cert_dir);
    }
    if req.insecure_tls {
        cmd.arg("--src-tls-verify=false");
    }
    if !req.access_key.is_empty() || !req.secret_key.is_empty() {
        cmd.arg("--src-creds");
        cmd.arg(format!("{}:{}", req.access_key, req.secret_key));
    }
    cmd.arg(req.endpoint);
    cmd.arg(format!("dir:{}", req.dest_dir));
    cmd
}

/// Copies images by forking `skopeo copy` into a `dir:` destination.
#[derive(Debug, Default, Clone, Copy)]
pub struct SkopeoCopier;

impl ImageCopier for SkopeoCopier {
    #[context("Skopeo copy")]
    fn copy_image(&self, req: &CopyRequest<'_>) -> Result<()> {
        copy_cmd(req).run_capture_stderr()
    }
}
