//! The main entrypoint for vmimport, which just performs global initialization
//! and then calls out into the library.

use anyhow::Result;

async fn run() -> Result<()> {
    vmimport_utils::initialize_tracing();
    tracing::trace!("starting");
    vmimport_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
