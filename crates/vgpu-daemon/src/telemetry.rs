//! Tracing initialisation.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install a global subscriber: `RUST_LOG` when set, otherwise
/// `<default_level>` for the vgpu crates.
///
/// Returns `false` if a subscriber was already installed, in which case the
/// existing one is kept.
pub fn init_tracing(default_level: &str) -> bool {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("vgpu_core={default_level},vgpu_storage={default_level},vgpu_daemon={default_level}").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
