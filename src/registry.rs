//! Site registry and authorization seams.
//!
//! The file manager and log streamer never persist site records. They read
//! what they need through [`SiteRegistry`] and ask [`TenantAuthz`] whether the
//! acting principal may touch a site.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::AppState;
use crate::error::{PanelError, PanelResult};

/// Authenticated identity passed in by the fronting auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal(pub String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromRequestParts<AppState> for Principal {
    type Rejection = PanelError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let name = parts
            .headers
            .get(state.config.principal_header.as_str())
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or(PanelError::Unauthenticated)?;

        Ok(Principal::new(name))
    }
}

/// Lookup of site records.
pub trait SiteRegistry: Send + Sync {
    /// Absolute root directory of the site's files.
    fn lookup_tenant_root(&self, tenant: &str) -> PanelResult<PathBuf>;

    /// Site that owns the given service unit.
    fn lookup_service_owner(&self, service: &str) -> PanelResult<String>;

    /// Principal that owns the site, if recorded.
    fn lookup_owner(&self, tenant: &str) -> PanelResult<Option<String>>;
}

/// Permission check for a principal acting on a site.
pub trait TenantAuthz: Send + Sync {
    fn authorize(&self, tenant: &str, principal: &Principal) -> bool;
}

/// One site record as stored by the panel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    pub domain: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub service_name: Option<String>,
    #[serde(default)]
    pub created_by_user: Option<String>,
}

impl SiteRecord {
    /// Directory the file manager is rooted at.
    ///
    /// Static sites use their document root; process-backed sites fall back to
    /// their working directory.
    pub fn files_root(&self) -> Option<&str> {
        self.path
            .as_deref()
            .or(self.workdir.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    /// Service unit name, as recorded or as the panel would derive it.
    pub fn service(&self) -> Option<String> {
        match &self.service_name {
            Some(name) if !name.is_empty() => Some(name.clone()),
            _ if self.kind == "python" || self.kind == "node" => {
                Some(service_name_for_domain(&self.domain))
            }
            _ => None,
        }
    }
}

/// Unit name the panel assigns to a process-backed site.
pub fn service_name_for_domain(domain: &str) -> String {
    format!("site-{}.service", domain.replace('.', "-"))
}

/// Site registry backed by the panel's JSON site list.
///
/// The file is re-read on every lookup, so each request sees the registry as
/// it is when the request starts.
#[derive(Debug, Clone)]
pub struct JsonSiteRegistry {
    path: PathBuf,
}

impl JsonSiteRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> PanelResult<Vec<SiteRecord>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!("Site registry {} missing, treating as empty", self.path.display());
                return Ok(Vec::new());
            }
            Err(err) => {
                warn!("Failed to read site registry {}: {}", self.path.display(), err);
                return Err(PanelError::Internal("site registry unreadable".to_string()));
            }
        };

        serde_json::from_str(&content).map_err(|err| {
            warn!("Malformed site registry {}: {}", self.path.display(), err);
            PanelError::Internal("site registry is malformed".to_string())
        })
    }

    fn find(&self, tenant: &str) -> PanelResult<SiteRecord> {
        self.load()?
            .into_iter()
            .find(|site| site.domain == tenant)
            .ok_or_else(|| PanelError::NotFound(format!("site {tenant}")))
    }
}

impl SiteRegistry for JsonSiteRegistry {
    fn lookup_tenant_root(&self, tenant: &str) -> PanelResult<PathBuf> {
        let site = self.find(tenant)?;
        let root = site
            .files_root()
            .ok_or_else(|| PanelError::NotFound(format!("site {tenant} has no file root")))?;

        let root = PathBuf::from(root);
        if !root.is_absolute() {
            warn!("Site {} has a relative root in the registry", tenant);
            return Err(PanelError::Internal(format!(
                "site {tenant} has an invalid file root"
            )));
        }
        Ok(root)
    }

    fn lookup_service_owner(&self, service: &str) -> PanelResult<String> {
        self.load()?
            .into_iter()
            .find(|site| site.service().as_deref() == Some(service))
            .map(|site| site.domain)
            .ok_or_else(|| PanelError::NotFound(format!("service {service}")))
    }

    fn lookup_owner(&self, tenant: &str) -> PanelResult<Option<String>> {
        Ok(self.find(tenant)?.created_by_user)
    }
}

/// Grants access to a site's owner and to super-admin principals.
pub struct OwnerOrSuperAdmin<R> {
    registry: R,
    super_admins: HashSet<String>,
}

impl<R: SiteRegistry> OwnerOrSuperAdmin<R> {
    pub fn new(registry: R, super_admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            registry,
            super_admins: super_admins.into_iter().collect(),
        }
    }
}

impl<R: SiteRegistry> TenantAuthz for OwnerOrSuperAdmin<R> {
    fn authorize(&self, tenant: &str, principal: &Principal) -> bool {
        if self.super_admins.contains(principal.as_str()) {
            return true;
        }

        match self.registry.lookup_owner(tenant) {
            Ok(Some(owner)) => owner == principal.as_str(),
            Ok(None) => false,
            Err(err) => {
                debug!("Owner lookup for {} failed: {}", tenant, err);
                false
            }
        }
    }
}
