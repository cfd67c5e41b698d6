//! Coordinator binary
//!
//! Wires configuration, logging, the sealer, and the quote capabilities
//! into the core, then serves the client and marble listeners.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use palisade_core::quote::{Issuer, MockIssuer, MockValidator, Validator};
use palisade_core::seal::{AesGcmSealer, Sealer};
use palisade_coordinator::{
    create_client_router, create_marble_router, AppState, Config, Core, VERSION,
};

/// File inside the seal directory holding the sealing key material.
///
/// Outside an enclave the material is generated once and stored next to
/// the sealed state; an enclave build derives it from the platform instead.
const KEY_MATERIAL_FILE: &str = "sealing_key_material";

#[tokio::main]
async fn main() {
    let config = Config::from_env();

    let level = if config.dev_mode { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("failed to set tracing subscriber");

    info!(version = VERSION, dev_mode = config.dev_mode, "starting coordinator");

    fs::create_dir_all(&config.seal_dir)
        .expect("cannot create or access the seal directory; check its permissions");
    let sealer: Arc<dyn Sealer> =
        Arc::new(load_sealer(&config.seal_dir).expect("cannot initialize the sealer"));

    // Non-enclave build: the mock quote pair stands in for the platform
    // attestation stack.
    let validator: Arc<dyn Validator> = Arc::new(MockValidator::new());
    let issuer: Arc<dyn Issuer> = Arc::new(MockIssuer::new());

    let core = Core::new(
        &config.dns_names,
        validator,
        issuer,
        sealer,
        &config.seal_dir,
    )
    .expect("cannot create the coordinator core");
    let state = Arc::new(AppState { core: Arc::new(core) });

    let marble_router = create_marble_router(state.clone());
    let mesh_addr = config.mesh_addr.clone();
    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&mesh_addr)
            .await
            .expect("failed to bind the mesh address");
        info!(addr = %mesh_addr, "marble server listening");
        axum::serve(listener, marble_router)
            .await
            .expect("marble server error");
    });

    let client_router = create_client_router(state);
    let listener = tokio::net::TcpListener::bind(&config.client_addr)
        .await
        .expect("failed to bind the client address");
    info!(addr = %config.client_addr, "client server listening");
    axum::serve(listener, client_router)
        .await
        .expect("client server error");
}

fn load_sealer(seal_dir: &Path) -> std::io::Result<AesGcmSealer> {
    let path = seal_dir.join(KEY_MATERIAL_FILE);
    let material = if path.exists() {
        fs::read(&path)?
    } else {
        use rand::RngCore;
        let mut material = vec![0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut material);
        fs::write(&path, &material)?;
        material
    };
    AesGcmSealer::from_key_material(&material)
        .map_err(|e| std::io::Error::other(e.to_string()))
}
