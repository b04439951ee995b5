//! Site panel file manager and live log streaming.
//!
//! Every site hosted by the panel gets a file manager confined to its own
//! root directory, plus a live view of its service unit's journal. The core
//! components are synchronous or stream based and can be embedded without the
//! HTTP layer; `routes` and `handlers` expose them over axum.

pub mod config;
pub mod error;
pub mod handlers;
pub mod logs;
pub mod ops;
pub mod paths;
pub mod registry;
pub mod routes;

use std::sync::Arc;

pub use config::Config;
pub use error::{PanelError, PanelResult};
pub use logs::{FollowerCommand, Journalctl, LogChunk, LogStreamSession, LogStreamer};
pub use ops::{FileManager, FileOpRequest, FileOpResponse};
pub use registry::{JsonSiteRegistry, OwnerOrSuperAdmin, Principal, SiteRegistry, TenantAuthz};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    /// Scoped file operations
    pub files: FileManager,
    /// Live log sessions
    pub logs: LogStreamer,
    /// Configuration
    pub config: Arc<Config>,
}

impl AppState {
    /// Create state backed by the JSON site registry named in the config.
    pub fn new(config: Config) -> Self {
        let registry = JsonSiteRegistry::new(config.sites_file.clone());
        let authz = OwnerOrSuperAdmin::new(registry.clone(), config.super_admins.clone());
        let follower = Journalctl::from_config(&config.logs);

        Self::with_parts(
            config,
            Arc::new(registry),
            Arc::new(authz),
            Arc::new(follower),
        )
    }

    /// Create state from explicit collaborators.
    pub fn with_parts(
        config: Config,
        registry: Arc<dyn SiteRegistry>,
        authz: Arc<dyn TenantAuthz>,
        follower: Arc<dyn FollowerCommand>,
    ) -> Self {
        let files = FileManager::new(registry.clone(), authz.clone())
            .with_max_upload_size(config.max_upload_size);
        let logs = LogStreamer::new(registry, authz, follower, config.logs.clone());

        Self {
            files,
            logs,
            config: Arc::new(config),
        }
    }
}
