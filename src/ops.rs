//! File operations on a site's confined directory tree.
//!
//! Every operation runs the same gate before touching the filesystem: site
//! lookup, authorization, path confinement. A failure there aborts the whole
//! request. Inside batch operations each item succeeds or fails on its own and
//! the result reports both sides.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::error::{PanelError, PanelResult};
use crate::paths::{
    ConfinedPath, TenantRoot, sanitize_filename, upload_basename, validate_item_name,
};
use crate::registry::{Principal, SiteRegistry, TenantAuthz};

/// One child of a listed directory.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
    pub modified_at: DateTime<Utc>,
}

/// A file received for upload.
#[derive(Debug, Clone)]
pub struct UploadFile {
    /// Name as sent by the client; directory parts are ignored.
    pub file_name: String,
    pub data: Bytes,
    /// Bytes the client sent. Larger than `data` when the transport stopped
    /// buffering at the size limit.
    pub size: u64,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            file_name: file_name.into(),
            size: data.len() as u64,
            data,
        }
    }
}

#[derive(Debug)]
pub enum FileOpRequest {
    List {
        tenant: String,
        path: String,
        folders_only: bool,
    },
    Upload {
        tenant: String,
        path: String,
        files: Vec<UploadFile>,
    },
    CreateFolder {
        tenant: String,
        path: String,
        name: String,
    },
    Rename {
        tenant: String,
        path: String,
        old_name: String,
        new_name: String,
    },
    Delete {
        tenant: String,
        path: String,
        names: Vec<String>,
    },
    Copy {
        tenant: String,
        path: String,
        names: Vec<String>,
        destination: String,
    },
    Move {
        tenant: String,
        path: String,
        names: Vec<String>,
        destination: String,
    },
}

#[derive(Debug, Serialize)]
pub struct ListResult {
    pub success: bool,
    pub message: String,
    pub path: String,
    pub entries: Vec<DirEntry>,
}

/// Response for single-item operations
#[derive(Debug, Serialize)]
pub struct OpResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Response for operations over several items
#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub success: bool,
    pub message: String,
    pub succeeded: Vec<String>,
    pub errors: Vec<String>,
}

impl BatchResult {
    fn new(verb: &str, succeeded: Vec<String>, errors: Vec<String>) -> Self {
        let message = if errors.is_empty() {
            format!("{verb} {} item(s)", succeeded.len())
        } else {
            format!(
                "{verb} {} item(s), {} failed",
                succeeded.len(),
                errors.len()
            )
        };
        Self {
            success: errors.is_empty(),
            message,
            succeeded,
            errors,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum FileOpResponse {
    Listing(ListResult),
    Single(OpResult),
    Batch(BatchResult),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Copy,
    Move,
}

impl Transfer {
    fn verb(self) -> &'static str {
        match self {
            Transfer::Copy => "copy",
            Transfer::Move => "move",
        }
    }
}

/// The per-site file manager.
#[derive(Clone)]
pub struct FileManager {
    registry: Arc<dyn SiteRegistry>,
    authz: Arc<dyn TenantAuthz>,
    max_upload_size: u64,
}

impl FileManager {
    pub fn new(registry: Arc<dyn SiteRegistry>, authz: Arc<dyn TenantAuthz>) -> Self {
        Self {
            registry,
            authz,
            max_upload_size: u64::MAX,
        }
    }

    pub fn with_max_upload_size(mut self, limit: u64) -> Self {
        self.max_upload_size = limit;
        self
    }

    pub fn execute(
        &self,
        principal: &Principal,
        request: FileOpRequest,
    ) -> PanelResult<FileOpResponse> {
        match request {
            FileOpRequest::List {
                tenant,
                path,
                folders_only,
            } => self
                .list(principal, &tenant, &path, folders_only)
                .map(FileOpResponse::Listing),
            FileOpRequest::Upload {
                tenant,
                path,
                files,
            } => self
                .upload(principal, &tenant, &path, files)
                .map(FileOpResponse::Batch),
            FileOpRequest::CreateFolder { tenant, path, name } => self
                .create_folder(principal, &tenant, &path, &name)
                .map(FileOpResponse::Single),
            FileOpRequest::Rename {
                tenant,
                path,
                old_name,
                new_name,
            } => self
                .rename(principal, &tenant, &path, &old_name, &new_name)
                .map(FileOpResponse::Single),
            FileOpRequest::Delete {
                tenant,
                path,
                names,
            } => self
                .delete(principal, &tenant, &path, &names)
                .map(FileOpResponse::Batch),
            FileOpRequest::Copy {
                tenant,
                path,
                names,
                destination,
            } => self
                .copy(principal, &tenant, &path, &names, &destination)
                .map(FileOpResponse::Batch),
            FileOpRequest::Move {
                tenant,
                path,
                names,
                destination,
            } => self
                .move_items(principal, &tenant, &path, &names, &destination)
                .map(FileOpResponse::Batch),
        }
    }

    /// List the direct children of a directory.
    ///
    /// Entries that cannot be stat'ed, and symlinks pointing outside the site
    /// root, are skipped rather than failing the listing.
    pub fn list(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        folders_only: bool,
    ) -> PanelResult<ListResult> {
        let root = self.open_site(tenant, principal)?;
        let dir = open_dir(&root, path)?;

        let read_dir =
            fs::read_dir(dir.path()).map_err(|err| PanelError::from_io(dir.relative(), err))?;

        let mut entries = Vec::new();
        for entry in read_dir {
            let Ok(entry) = entry else {
                continue;
            };
            let name = entry.file_name().to_string_lossy().to_string();

            // Symlinks are described by their target only when it stays inside
            // the site root.
            let mut stat_path = entry.path();
            if entry.file_type().is_ok_and(|t| t.is_symlink()) {
                match fs::canonicalize(&stat_path) {
                    Ok(target) if target.starts_with(root.path()) => stat_path = target,
                    Ok(_) => {
                        debug!("Skipping symlink {:?} that leaves the site root", name);
                        continue;
                    }
                    Err(err) => {
                        debug!("Skipping unresolvable symlink {:?}: {}", name, err);
                        continue;
                    }
                }
            }

            let metadata = match fs::metadata(&stat_path) {
                Ok(metadata) => metadata,
                Err(err) => {
                    debug!("Skipping unreadable entry {:?}: {}", name, err);
                    continue;
                }
            };
            let Ok(modified) = metadata.modified() else {
                continue;
            };

            let is_directory = metadata.is_dir();
            if folders_only && !is_directory {
                continue;
            }

            entries.push(DirEntry {
                name,
                is_directory,
                size_bytes: (!is_directory).then_some(metadata.len()),
                modified_at: DateTime::<Utc>::from(modified),
            });
        }

        Ok(ListResult {
            success: true,
            message: format!("{} entries", entries.len()),
            path: dir.display(),
            entries,
        })
    }

    /// Write uploaded files into a directory.
    pub fn upload(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        files: Vec<UploadFile>,
    ) -> PanelResult<BatchResult> {
        let root = self.open_site(tenant, principal)?;
        let dir = open_dir(&root, path)?;
        ensure_writable(&dir)?;

        // Resolve every target before writing anything.
        let mut planned = Vec::with_capacity(files.len());
        for file in files {
            let target = match sanitize_filename(upload_basename(&file.file_name)) {
                Some(name) => Some(root.resolve_child(&dir, &name)?),
                None => None,
            };
            planned.push((file, target));
        }

        let mut succeeded = Vec::new();
        let mut errors = Vec::new();
        for (file, target) in planned {
            let Some(target) = target else {
                warn!("Rejected upload filename {:?}", file.file_name);
                errors.push(format!("{}: invalid filename", file.file_name));
                continue;
            };

            match self.store_upload(&dir, &target, &file) {
                Ok(()) => {
                    info!(
                        tenant,
                        path = %target.display(),
                        bytes = file.size,
                        "Uploaded file"
                    );
                    succeeded.push(entry_name(&target));
                }
                Err(err) => {
                    warn!(tenant, path = %target.display(), "Upload failed: {}", err);
                    errors.push(format!("{}: {}", file.file_name, err));
                }
            }
        }

        Ok(BatchResult::new("Uploaded", succeeded, errors))
    }

    fn store_upload(
        &self,
        dir: &ConfinedPath,
        target: &ConfinedPath,
        file: &UploadFile,
    ) -> PanelResult<()> {
        if file.size > self.max_upload_size || file.data.len() as u64 > self.max_upload_size {
            return Err(PanelError::InvalidArgument(format!(
                "file too large: {} bytes exceeds limit of {} bytes",
                file.size, self.max_upload_size
            )));
        }

        if let Ok(metadata) = fs::symlink_metadata(target.entry()) {
            if metadata.file_type().is_symlink() {
                return Err(PanelError::Conflict(format!(
                    "{} is a symlink",
                    target.display()
                )));
            }
            if metadata.is_dir() {
                return Err(PanelError::Conflict(format!(
                    "{} is a directory",
                    target.display()
                )));
            }
        }

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let temp_path = dir
            .path()
            .join(format!(".upload-{}-{}", entry_name(target), nonce));

        if let Err(err) = fs::write(&temp_path, &file.data) {
            let _ = fs::remove_file(&temp_path);
            return Err(PanelError::from_io(target.relative(), err));
        }
        fs::rename(&temp_path, target.entry()).map_err(|err| {
            let _ = fs::remove_file(&temp_path);
            PanelError::from_io(target.relative(), err)
        })
    }

    /// Create one directory.
    pub fn create_folder(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        name: &str,
    ) -> PanelResult<OpResult> {
        validate_item_name(name)?;
        let root = self.open_site(tenant, principal)?;
        let dir = open_dir(&root, path)?;
        let target = root.resolve_child(&dir, name)?;

        if fs::symlink_metadata(target.entry()).is_ok() {
            return Err(PanelError::Conflict(target.display()));
        }
        ensure_writable(&dir)?;

        fs::create_dir(target.entry()).map_err(|err| PanelError::from_io(target.relative(), err))?;
        info!(tenant, path = %target.display(), "Created folder");

        Ok(OpResult {
            success: true,
            message: format!("Created folder: {}", target.display()),
            path: Some(target.display()),
        })
    }

    /// Rename an item within its directory.
    pub fn rename(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        old_name: &str,
        new_name: &str,
    ) -> PanelResult<OpResult> {
        validate_item_name(old_name)?;
        validate_item_name(new_name)?;
        if old_name == new_name {
            return Err(PanelError::InvalidArgument(
                "new name is the same as the old name".to_string(),
            ));
        }

        let root = self.open_site(tenant, principal)?;
        let dir = open_dir(&root, path)?;
        let source = root.resolve_child(&dir, old_name)?;
        let target = root.resolve_child(&dir, new_name)?;

        if fs::symlink_metadata(source.entry()).is_err() {
            return Err(PanelError::NotFound(source.display()));
        }
        if fs::symlink_metadata(target.entry()).is_ok() {
            return Err(PanelError::Conflict(target.display()));
        }
        ensure_writable(&dir)?;

        fs::rename(source.entry(), target.entry())
            .map_err(|err| PanelError::from_io(source.relative(), err))?;
        info!(
            tenant,
            from = %source.display(),
            to = %target.display(),
            "Renamed"
        );

        Ok(OpResult {
            success: true,
            message: format!("Renamed: {} -> {}", source.display(), target.display()),
            path: Some(target.display()),
        })
    }

    /// Remove files and directory trees. Names that do not exist are skipped.
    pub fn delete(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        names: &[String],
    ) -> PanelResult<BatchResult> {
        validate_names(names)?;
        let root = self.open_site(tenant, principal)?;
        let dir = open_dir(&root, path)?;
        let targets = names
            .iter()
            .map(|name| root.resolve_child(&dir, name))
            .collect::<Result<Vec<_>, _>>()?;
        ensure_writable(&dir)?;

        let mut succeeded = Vec::new();
        let mut errors = Vec::new();
        for (name, target) in names.iter().zip(targets) {
            let metadata = match fs::symlink_metadata(target.entry()) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    debug!("Delete skipped missing item {}", target.display());
                    continue;
                }
                Err(err) => {
                    errors.push(format!("{name}: {}", PanelError::from_io(target.relative(), err)));
                    continue;
                }
            };

            let removed = if metadata.is_dir() {
                fs::remove_dir_all(target.entry())
            } else {
                fs::remove_file(target.entry())
            };

            match removed {
                Ok(()) => {
                    info!(tenant, path = %target.display(), "Deleted");
                    succeeded.push(name.clone());
                }
                Err(err) => {
                    warn!(tenant, path = %target.display(), "Delete failed: {}", err);
                    errors.push(format!("{name}: {}", PanelError::from_io(target.relative(), err)));
                }
            }
        }

        Ok(BatchResult::new("Deleted", succeeded, errors))
    }

    pub fn copy(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        names: &[String],
        destination: &str,
    ) -> PanelResult<BatchResult> {
        self.transfer(principal, tenant, path, names, destination, Transfer::Copy)
    }

    pub fn move_items(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        names: &[String],
        destination: &str,
    ) -> PanelResult<BatchResult> {
        self.transfer(principal, tenant, path, names, destination, Transfer::Move)
    }

    fn transfer(
        &self,
        principal: &Principal,
        tenant: &str,
        path: &str,
        names: &[String],
        destination: &str,
        mode: Transfer,
    ) -> PanelResult<BatchResult> {
        validate_names(names)?;
        let root = self.open_site(tenant, principal)?;
        let source_dir = open_dir(&root, path)?;
        let dest_dir = open_dir(&root, destination)?;

        let mut pairs = Vec::with_capacity(names.len());
        for name in names {
            let source = root.resolve_child(&source_dir, name)?;
            let target = root.resolve_child(&dest_dir, name)?;
            pairs.push((name, source, target));
        }

        ensure_writable(&dest_dir)?;
        if mode == Transfer::Move {
            ensure_writable(&source_dir)?;
        }

        let mut succeeded = Vec::new();
        let mut errors = Vec::new();
        for (name, source, target) in pairs {
            match transfer_one(&source, &target, mode) {
                Ok(()) => {
                    info!(
                        tenant,
                        from = %source.display(),
                        to = %target.display(),
                        "{} complete",
                        mode.verb()
                    );
                    succeeded.push(name.clone());
                }
                Err(err) => {
                    warn!(tenant, item = %source.display(), "{} failed: {}", mode.verb(), err);
                    errors.push(format!("{name}: {err}"));
                }
            }
        }

        let verb = match mode {
            Transfer::Copy => "Copied",
            Transfer::Move => "Moved",
        };
        Ok(BatchResult::new(verb, succeeded, errors))
    }

    /// Look up, authorize and open a site's root.
    fn open_site(&self, tenant: &str, principal: &Principal) -> PanelResult<TenantRoot> {
        let root_path = self.registry.lookup_tenant_root(tenant)?;

        if !self.authz.authorize(tenant, principal) {
            warn!(tenant, principal = principal.as_str(), "File access denied");
            return Err(PanelError::PermissionDenied(format!(
                "{} may not manage files of {}",
                principal.as_str(),
                tenant
            )));
        }

        TenantRoot::open(&root_path).map_err(|err| {
            error!("Failed to open site root {}: {}", root_path.display(), err);
            PanelError::Internal(format!("root directory of {tenant} is unavailable: {err}"))
        })
    }
}

fn open_dir(root: &TenantRoot, relative: &str) -> PanelResult<ConfinedPath> {
    let dir = root.resolve(relative)?;
    if !dir.path().is_dir() {
        return Err(PanelError::NotFound(format!(
            "directory {}",
            dir.display()
        )));
    }
    Ok(dir)
}

fn validate_names(names: &[String]) -> PanelResult<()> {
    if names.is_empty() {
        return Err(PanelError::InvalidArgument("no items given".to_string()));
    }
    for name in names {
        validate_item_name(name)?;
    }
    Ok(())
}

fn entry_name(path: &ConfinedPath) -> String {
    path.entry()
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Whether the running process may create and remove entries in `dir`.
fn is_writable(dir: &Path) -> bool {
    let Ok(c_path) = CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}

fn ensure_writable(dir: &ConfinedPath) -> PanelResult<()> {
    if is_writable(dir.path()) {
        Ok(())
    } else {
        warn!("Directory not writable: {}", dir.path().display());
        Err(PanelError::PermissionDenied(format!(
            "directory {} is not writable",
            dir.display()
        )))
    }
}

fn transfer_one(source: &ConfinedPath, target: &ConfinedPath, mode: Transfer) -> PanelResult<()> {
    let metadata = fs::symlink_metadata(source.entry())
        .map_err(|err| PanelError::from_io(source.relative(), err))?;

    if fs::symlink_metadata(target.entry()).is_ok() {
        return Err(PanelError::Conflict(format!(
            "{} already exists at destination",
            target.display()
        )));
    }

    if metadata.is_dir()
        && (target.entry().starts_with(source.entry()) || target.path().starts_with(source.path()))
    {
        return Err(PanelError::InvalidArgument(format!(
            "cannot {} {} into itself",
            mode.verb(),
            source.display()
        )));
    }

    let result = match mode {
        Transfer::Copy => copy_item(source.entry(), target.entry()).inspect_err(|err| {
            // The target was absent when checked above; a racing creator owns it.
            if err.kind() == io::ErrorKind::AlreadyExists {
                return;
            }
            match remove_item(target.entry()) {
                Err(err) if err.kind() != io::ErrorKind::NotFound => {
                    warn!("Could not remove partial copy {:?}: {}", target.entry(), err);
                }
                _ => {}
            }
        }),
        Transfer::Move => move_item(source.entry(), target.entry()),
    };
    result.map_err(|err| PanelError::from_io(source.relative(), err))
}

fn move_item(source: &Path, target: &Path) -> io::Result<()> {
    match fs::rename(source, target) {
        Ok(()) => Ok(()),
        Err(err) if err.raw_os_error() == Some(libc::EXDEV) => {
            debug!("Cross-device move, copying {:?}", source);
            if let Err(err) = copy_item(source, target) {
                let _ = remove_item(target);
                return Err(err);
            }
            remove_item(source)
        }
        Err(err) => Err(err),
    }
}

fn remove_item(path: &Path) -> io::Result<()> {
    if fs::symlink_metadata(path)?.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Copy a file, symlink or directory tree. Symlinks are recreated, never
/// followed.
fn copy_item(source: &Path, target: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(source)?;
    let file_type = metadata.file_type();

    if file_type.is_symlink() {
        return std::os::unix::fs::symlink(fs::read_link(source)?, target);
    }
    if !file_type.is_dir() {
        if !file_type.is_file() {
            return Err(special_file_error(source));
        }
        fs::copy(source, target)?;
        preserve_mtime(target, &metadata);
        return Ok(());
    }

    fs::create_dir(target)?;
    let mut dirs = vec![(target.to_path_buf(), metadata)];

    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let dest = target.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &dest)?;
        } else if file_type.is_dir() {
            fs::create_dir(&dest)?;
            dirs.push((dest, entry.metadata().map_err(io::Error::from)?));
        } else if !file_type.is_file() {
            return Err(special_file_error(entry.path()));
        } else {
            fs::copy(entry.path(), &dest)?;
            preserve_mtime(&dest, &entry.metadata().map_err(io::Error::from)?);
        }
    }

    // Directory times last; creating children bumps them.
    for (dir, metadata) in dirs.iter().rev() {
        preserve_mtime(dir, metadata);
    }
    Ok(())
}

/// Sockets, FIFOs and device nodes are never copied; reading a FIFO would
/// block forever.
fn special_file_error(path: &Path) -> io::Error {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default();
    io::Error::new(
        io::ErrorKind::Unsupported,
        format!("{name} is not a regular file, directory or symlink"),
    )
}

fn preserve_mtime(path: &Path, metadata: &fs::Metadata) {
    let Ok(modified) = metadata.modified() else {
        return;
    };
    let result = fs::File::open(path).and_then(|file| file.set_modified(modified));
    if let Err(err) = result {
        debug!("Could not preserve mtime on {:?}: {}", path, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::fs::FileTypeExt;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    struct FixedRegistry {
        roots: HashMap<String, PathBuf>,
    }

    impl SiteRegistry for FixedRegistry {
        fn lookup_tenant_root(&self, tenant: &str) -> PanelResult<PathBuf> {
            self.roots
                .get(tenant)
                .cloned()
                .ok_or_else(|| PanelError::NotFound(format!("site {tenant}")))
        }

        fn lookup_service_owner(&self, service: &str) -> PanelResult<String> {
            Err(PanelError::NotFound(service.to_string()))
        }

        fn lookup_owner(&self, _tenant: &str) -> PanelResult<Option<String>> {
            Ok(Some("owner".to_string()))
        }
    }

    struct OnlyOwner;

    impl TenantAuthz for OnlyOwner {
        fn authorize(&self, _tenant: &str, principal: &Principal) -> bool {
            principal.as_str() == "owner"
        }
    }

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        manager: FileManager,
        owner: Principal,
    }

    fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("example.com");
        let registry = FixedRegistry {
            roots: HashMap::from([("example.com".to_string(), root.clone())]),
        };
        let manager = FileManager::new(Arc::new(registry), Arc::new(OnlyOwner));
        Fixture {
            _temp: temp,
            root,
            manager,
            owner: Principal::new("owner"),
        }
    }

    fn names(list: &ListResult) -> Vec<String> {
        let mut names: Vec<String> = list.entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        names
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn is_root_user() -> bool {
        unsafe { libc::geteuid() == 0 }
    }

    #[test]
    fn test_list_creates_missing_root() {
        let f = fixture();
        let listing = f.manager.list(&f.owner, "example.com", "", false).unwrap();
        assert!(listing.entries.is_empty());
        assert!(f.root.is_dir());
    }

    #[test]
    fn test_list_reports_files_and_dirs() {
        let f = fixture();
        fs::create_dir_all(f.root.join("docs")).unwrap();
        fs::write(f.root.join("index.php"), "<?php").unwrap();

        let listing = f.manager.list(&f.owner, "example.com", "/", false).unwrap();
        assert_eq!(names(&listing), vec!["docs", "index.php"]);

        let file = listing.entries.iter().find(|e| e.name == "index.php").unwrap();
        assert!(!file.is_directory);
        assert_eq!(file.size_bytes, Some(5));

        let dir = listing.entries.iter().find(|e| e.name == "docs").unwrap();
        assert!(dir.is_directory);
        assert_eq!(dir.size_bytes, None);

        let folders = f.manager.list(&f.owner, "example.com", "", true).unwrap();
        assert_eq!(names(&folders), vec!["docs"]);
    }

    #[test]
    fn test_list_is_repeatable() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        for name in ["a", "b", "c"] {
            fs::write(f.root.join(name), name).unwrap();
        }
        let first = f.manager.list(&f.owner, "example.com", "", false).unwrap();
        let second = f.manager.list(&f.owner, "example.com", "", false).unwrap();
        assert_eq!(names(&first), names(&second));
    }

    #[test]
    fn test_list_skips_dangling_symlink() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        fs::write(f.root.join("ok.txt"), "x").unwrap();
        std::os::unix::fs::symlink(f.root.join("gone"), f.root.join("dangling")).unwrap();

        let listing = f.manager.list(&f.owner, "example.com", "", false).unwrap();
        assert_eq!(names(&listing), vec!["ok.txt"]);
    }

    #[test]
    fn test_list_hides_symlinks_leaving_root() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        fs::write(f.root.join("ok.txt"), "x").unwrap();
        let outside = f._temp.path().join("secret.txt");
        fs::write(&outside, "0123456789").unwrap();
        std::os::unix::fs::symlink(&outside, f.root.join("peek")).unwrap();
        std::os::unix::fs::symlink("ok.txt", f.root.join("alias")).unwrap();

        let listing = f.manager.list(&f.owner, "example.com", "", false).unwrap();
        assert_eq!(names(&listing), vec!["alias", "ok.txt"]);
        let alias = listing.entries.iter().find(|e| e.name == "alias").unwrap();
        assert_eq!(alias.size_bytes, Some(1));
        assert!(listing.entries.iter().all(|e| e.size_bytes != Some(10)));
    }

    #[test]
    fn test_list_on_file_is_not_found() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        fs::write(f.root.join("file.txt"), "x").unwrap();
        let result = f.manager.list(&f.owner, "example.com", "file.txt", false);
        assert!(matches!(result, Err(PanelError::NotFound(_))));
    }

    #[test]
    fn test_unknown_site_and_unauthorized_principal() {
        let f = fixture();
        assert!(matches!(
            f.manager.list(&f.owner, "other.com", "", false),
            Err(PanelError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.list(&Principal::new("mallory"), "example.com", "", false),
            Err(PanelError::PermissionDenied(_))
        ));
        assert!(!f.root.exists());
    }

    #[test]
    fn test_escape_is_rejected() {
        let f = fixture();
        let result = f.manager.list(&f.owner, "example.com", "../", false);
        assert!(matches!(result, Err(PanelError::PathEscape(_))));

        let result = f
            .manager
            .delete(&f.owner, "example.com", "../..", &strings(&["etc"]));
        assert!(matches!(result, Err(PanelError::PathEscape(_))));
    }

    #[test]
    fn test_error_messages_hide_absolute_paths() {
        let f = fixture();
        let err = f
            .manager
            .list(&f.owner, "example.com", "missing/dir", false)
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("/missing/dir"));
        assert!(!message.contains(f.root.to_str().unwrap()));
    }

    #[test]
    fn test_create_folder() {
        let f = fixture();
        let result = f
            .manager
            .create_folder(&f.owner, "example.com", "", "photos")
            .unwrap();
        assert!(result.success);
        assert!(f.root.join("photos").is_dir());

        let again = f.manager.create_folder(&f.owner, "example.com", "", "photos");
        assert!(matches!(again, Err(PanelError::Conflict(_))));

        for bad in ["", ".", ".."] {
            let result = f.manager.create_folder(&f.owner, "example.com", "", bad);
            assert!(matches!(result, Err(PanelError::InvalidArgument(_))));
        }
    }

    #[test]
    fn test_rename() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        fs::write(f.root.join("a.txt"), "a").unwrap();
        fs::write(f.root.join("taken.txt"), "t").unwrap();

        assert!(matches!(
            f.manager.rename(&f.owner, "example.com", "", "a.txt", "a.txt"),
            Err(PanelError::InvalidArgument(_))
        ));
        assert!(matches!(
            f.manager.rename(&f.owner, "example.com", "", "nope.txt", "b.txt"),
            Err(PanelError::NotFound(_))
        ));
        assert!(matches!(
            f.manager.rename(&f.owner, "example.com", "", "a.txt", "taken.txt"),
            Err(PanelError::Conflict(_))
        ));
        assert_eq!(fs::read_to_string(f.root.join("taken.txt")).unwrap(), "t");

        f.manager
            .rename(&f.owner, "example.com", "", "a.txt", "b.txt")
            .unwrap();
        assert!(!f.root.join("a.txt").exists());
        assert_eq!(fs::read_to_string(f.root.join("b.txt")).unwrap(), "a");
    }

    #[test]
    fn test_rename_symlink_renames_link_only() {
        let f = fixture();
        fs::create_dir_all(f.root.join("real")).unwrap();
        std::os::unix::fs::symlink(f.root.join("real"), f.root.join("link")).unwrap();

        f.manager
            .rename(&f.owner, "example.com", "", "link", "link2")
            .unwrap();
        assert!(f.root.join("real").is_dir());
        assert!(fs::symlink_metadata(f.root.join("link2"))
            .unwrap()
            .file_type()
            .is_symlink());
    }

    #[test]
    fn test_delete_skips_missing_items() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        fs::write(f.root.join("a.txt"), "a").unwrap();
        fs::write(f.root.join("b.txt"), "b").unwrap();

        let result = f
            .manager
            .delete(
                &f.owner,
                "example.com",
                "",
                &strings(&["a.txt", "missing.txt", "b.txt"]),
            )
            .unwrap();

        assert_eq!(result.succeeded, strings(&["a.txt", "b.txt"]));
        assert!(result.errors.is_empty());
        assert!(result.success);
        assert!(!f.root.join("a.txt").exists());
        assert!(!f.root.join("b.txt").exists());
    }

    #[test]
    fn test_delete_directory_tree() {
        let f = fixture();
        fs::create_dir_all(f.root.join("dir/nested")).unwrap();
        fs::write(f.root.join("dir/nested/f.txt"), "x").unwrap();

        let result = f
            .manager
            .delete(&f.owner, "example.com", "", &strings(&["dir"]))
            .unwrap();
        assert_eq!(result.succeeded, strings(&["dir"]));
        assert!(!f.root.join("dir").exists());
    }

    #[test]
    fn test_delete_invalid_name_aborts_everything() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        fs::write(f.root.join("a.txt"), "a").unwrap();

        let result = f
            .manager
            .delete(&f.owner, "example.com", "", &strings(&["a.txt", ".."]));
        assert!(matches!(result, Err(PanelError::InvalidArgument(_))));
        assert!(f.root.join("a.txt").exists());
    }

    #[test]
    fn test_delete_in_readonly_dir_is_denied() {
        if is_root_user() {
            return;
        }
        use std::os::unix::fs::PermissionsExt;

        let f = fixture();
        fs::create_dir_all(f.root.join("locked")).unwrap();
        fs::write(f.root.join("locked/a.txt"), "a").unwrap();
        fs::set_permissions(f.root.join("locked"), fs::Permissions::from_mode(0o555)).unwrap();

        let result = f
            .manager
            .delete(&f.owner, "example.com", "locked", &strings(&["a.txt"]));
        assert!(matches!(result, Err(PanelError::PermissionDenied(_))));

        fs::set_permissions(f.root.join("locked"), fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_copy_preserves_source_and_mtime() {
        let f = fixture();
        fs::create_dir_all(f.root.join("src/tree/inner")).unwrap();
        fs::create_dir_all(f.root.join("dst")).unwrap();
        fs::write(f.root.join("src/a.txt"), "a").unwrap();
        fs::write(f.root.join("src/tree/inner/b.txt"), "b").unwrap();

        let old = SystemTime::now() - Duration::from_secs(86_400);
        fs::File::options()
            .write(true)
            .open(f.root.join("src/a.txt"))
            .unwrap()
            .set_modified(old)
            .unwrap();

        let result = f
            .manager
            .copy(&f.owner, "example.com", "src", &strings(&["a.txt", "tree"]), "dst")
            .unwrap();
        assert_eq!(result.succeeded, strings(&["a.txt", "tree"]));

        assert!(f.root.join("src/a.txt").exists());
        assert!(f.root.join("src/tree/inner/b.txt").exists());
        assert_eq!(fs::read_to_string(f.root.join("dst/a.txt")).unwrap(), "a");
        assert_eq!(
            fs::read_to_string(f.root.join("dst/tree/inner/b.txt")).unwrap(),
            "b"
        );

        let copied = fs::metadata(f.root.join("dst/a.txt")).unwrap().modified().unwrap();
        let drift = copied
            .duration_since(old)
            .unwrap_or_else(|e| e.duration());
        assert!(drift < Duration::from_secs(1));
    }

    fn make_fifo(path: &Path) {
        let c_path = CString::new(path.as_os_str().as_bytes()).unwrap();
        assert_eq!(unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) }, 0);
    }

    #[test]
    fn test_failed_copy_leaves_no_partial_tree() {
        let f = fixture();
        fs::create_dir_all(f.root.join("src/deeper")).unwrap();
        fs::create_dir_all(f.root.join("dst")).unwrap();
        fs::write(f.root.join("src/a.txt"), "a").unwrap();
        fs::write(f.root.join("src/deeper/b.txt"), "b").unwrap();
        let _socket =
            std::os::unix::net::UnixListener::bind(f.root.join("src/deeper/app.sock")).unwrap();

        let result = f
            .manager
            .copy(&f.owner, "example.com", "", &strings(&["src"]), "dst")
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("not a regular file"));
        assert!(!f.root.join("dst/src").exists());
        assert!(f.root.join("src/deeper/b.txt").is_file());

        // A retry fails the same way instead of hitting a leftover tree.
        let retry = f
            .manager
            .copy(&f.owner, "example.com", "", &strings(&["src"]), "dst")
            .unwrap();
        assert!(!retry.errors[0].contains("already exists"));
        assert!(!f.root.join("dst/src").exists());
    }

    #[test]
    fn test_copy_refuses_fifo() {
        let f = fixture();
        fs::create_dir_all(f.root.join("dst")).unwrap();
        fs::write(f.root.join("ok.txt"), "ok").unwrap();
        make_fifo(&f.root.join("pipe"));

        let result = f
            .manager
            .copy(&f.owner, "example.com", "", &strings(&["pipe", "ok.txt"]), "dst")
            .unwrap();
        assert_eq!(result.succeeded, strings(&["ok.txt"]));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("pipe: "));
        assert!(!f.root.join("dst/pipe").exists());
        assert!(
            fs::symlink_metadata(f.root.join("pipe"))
                .unwrap()
                .file_type()
                .is_fifo()
        );
    }

    #[test]
    fn test_copy_never_overwrites() {
        let f = fixture();
        fs::create_dir_all(f.root.join("dst")).unwrap();
        fs::write(f.root.join("a.txt"), "new").unwrap();
        fs::write(f.root.join("b.txt"), "b").unwrap();
        fs::write(f.root.join("dst/a.txt"), "old").unwrap();

        let result = f
            .manager
            .copy(&f.owner, "example.com", "", &strings(&["a.txt", "b.txt"]), "dst")
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.succeeded, strings(&["b.txt"]));
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("a.txt:"));
        assert_eq!(fs::read_to_string(f.root.join("dst/a.txt")).unwrap(), "old");
    }

    #[test]
    fn test_move_and_missing_source() {
        let f = fixture();
        fs::create_dir_all(f.root.join("dst")).unwrap();
        fs::write(f.root.join("a.txt"), "a").unwrap();

        let result = f
            .manager
            .move_items(&f.owner, "example.com", "", &strings(&["a.txt", "ghost"]), "dst")
            .unwrap();
        assert_eq!(result.succeeded, strings(&["a.txt"]));
        assert_eq!(result.errors.len(), 1);
        assert!(!f.root.join("a.txt").exists());
        assert!(f.root.join("dst/a.txt").exists());
    }

    #[test]
    fn test_move_into_itself_is_rejected() {
        let f = fixture();
        fs::create_dir_all(f.root.join("foo/bar")).unwrap();
        fs::write(f.root.join("foo/keep.txt"), "k").unwrap();

        let result = f
            .manager
            .move_items(&f.owner, "example.com", "", &strings(&["foo"]), "foo/bar")
            .unwrap();
        assert!(!result.success);
        assert!(result.succeeded.is_empty());
        assert!(result.errors[0].contains("into itself"));
        assert!(f.root.join("foo/keep.txt").exists());
        assert!(!f.root.join("foo/bar/foo").exists());

        let result = f
            .manager
            .copy(&f.owner, "example.com", "", &strings(&["foo"]), "foo")
            .unwrap();
        assert!(!result.success);
        assert!(!f.root.join("foo/foo").exists());
    }

    #[test]
    fn test_move_failure_leaves_source() {
        let f = fixture();
        fs::create_dir_all(f.root.join("dst")).unwrap();
        fs::write(f.root.join("a.txt"), "mine").unwrap();
        fs::write(f.root.join("dst/a.txt"), "theirs").unwrap();

        let result = f
            .manager
            .move_items(&f.owner, "example.com", "", &strings(&["a.txt"]), "dst")
            .unwrap();
        assert!(!result.success);
        assert_eq!(fs::read_to_string(f.root.join("a.txt")).unwrap(), "mine");
        assert_eq!(fs::read_to_string(f.root.join("dst/a.txt")).unwrap(), "theirs");
    }

    #[test]
    fn test_copy_recreates_symlinks() {
        let f = fixture();
        fs::create_dir_all(f.root.join("src")).unwrap();
        fs::create_dir_all(f.root.join("dst")).unwrap();
        fs::write(f.root.join("src/target.txt"), "t").unwrap();
        std::os::unix::fs::symlink("target.txt", f.root.join("src/alias")).unwrap();

        f.manager
            .copy(&f.owner, "example.com", "", &strings(&["src"]), "dst")
            .unwrap();
        let link = f.root.join("dst/src/alias");
        assert!(fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("target.txt"));
    }

    #[test]
    fn test_upload_strips_directories_and_reports_partial_success() {
        let f = fixture();
        fs::create_dir_all(f.root.join("photos")).unwrap();

        let files = vec![
            UploadFile::new("../../evil/cat.png", &b"png"[..]),
            UploadFile::new("..", &b"x"[..]),
            UploadFile::new("notes.txt", &b"hello"[..]),
        ];
        let result = f
            .manager
            .upload(&f.owner, "example.com", "photos", files)
            .unwrap();

        assert_eq!(result.succeeded, strings(&["cat.png", "notes.txt"]));
        assert_eq!(result.errors.len(), 1);
        assert_eq!(fs::read(f.root.join("photos/cat.png")).unwrap(), b"png");
        assert!(!f.root.join("evil").exists());
    }

    #[test]
    fn test_upload_size_limit_and_directory_clash() {
        let f = fixture();
        let manager = f.manager.clone().with_max_upload_size(4);
        fs::create_dir_all(f.root.join("sub")).unwrap();

        let files = vec![
            UploadFile::new("big.bin", &b"too large"[..]),
            UploadFile::new("sub", &b"x"[..]),
            UploadFile::new("ok.bin", &b"ok"[..]),
        ];
        let result = manager.upload(&f.owner, "example.com", "", files).unwrap();
        assert_eq!(result.succeeded, strings(&["ok.bin"]));
        assert_eq!(result.errors.len(), 2);
        assert!(!f.root.join("big.bin").exists());
        assert!(f.root.join("sub").is_dir());
    }

    #[test]
    fn test_upload_replaces_existing_file() {
        let f = fixture();
        fs::create_dir_all(&f.root).unwrap();
        fs::write(f.root.join("a.txt"), "old").unwrap();

        f.manager
            .upload(&f.owner, "example.com", "", vec![UploadFile::new("a.txt", &b"new"[..])])
            .unwrap();
        assert_eq!(fs::read_to_string(f.root.join("a.txt")).unwrap(), "new");
    }

    #[test]
    fn test_end_to_end_folder_upload_rename_delete() {
        let f = fixture();
        let site = "example.com";

        f.manager.create_folder(&f.owner, site, "", "photos").unwrap();
        f.manager
            .upload(&f.owner, site, "photos", vec![UploadFile::new("cat.png", &b"meow"[..])])
            .unwrap();

        let listing = f.manager.list(&f.owner, site, "photos", false).unwrap();
        assert_eq!(listing.entries.len(), 1);
        assert_eq!(listing.entries[0].name, "cat.png");
        assert!(!listing.entries[0].is_directory);

        f.manager
            .rename(&f.owner, site, "photos", "cat.png", "kitten.png")
            .unwrap();
        let listing = f.manager.list(&f.owner, site, "photos", false).unwrap();
        assert_eq!(names(&listing), vec!["kitten.png"]);

        f.manager
            .delete(&f.owner, site, "photos", &strings(&["kitten.png"]))
            .unwrap();
        let listing = f.manager.list(&f.owner, site, "photos", false).unwrap();
        assert!(listing.entries.is_empty());
    }

    #[test]
    fn test_execute_dispatches() {
        let f = fixture();
        let response = f
            .manager
            .execute(
                &f.owner,
                FileOpRequest::CreateFolder {
                    tenant: "example.com".to_string(),
                    path: "/".to_string(),
                    name: "assets".to_string(),
                },
            )
            .unwrap();
        assert!(matches!(response, FileOpResponse::Single(ref r) if r.success));

        let response = f
            .manager
            .execute(
                &f.owner,
                FileOpRequest::List {
                    tenant: "example.com".to_string(),
                    path: String::new(),
                    folders_only: true,
                },
            )
            .unwrap();
        match response {
            FileOpResponse::Listing(listing) => assert_eq!(names(&listing), vec!["assets"]),
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
