//! Test utilities and common setup.

use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use serde_json::json;
use sitepanel::{
    AppState, Config, FollowerCommand, JsonSiteRegistry, OwnerOrSuperAdmin, routes,
};
use tempfile::TempDir;
use tokio::process::Command;

pub const OWNER: &str = "alice";
pub const OTHER_USER: &str = "bob";
pub const SUPER_ADMIN: &str = "root";
pub const SITE: &str = "example.com";
pub const SERVICE: &str = "site-api-example-com.service";

/// Follower that runs a fixed shell script instead of journalctl.
pub struct ScriptFollower(pub &'static str);

impl FollowerCommand for ScriptFollower {
    fn command(&self, _service: &str, _backlog_lines: u32) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(self.0);
        cmd
    }

    fn program(&self) -> &str {
        "sh"
    }
}

/// A panel backed by a temporary site registry.
pub struct TestPanel {
    pub app: Router,
    pub site_root: PathBuf,
    _dir: TempDir,
}

/// Create a panel whose log follower runs `script`.
pub fn test_panel_with_script(script: &'static str) -> TestPanel {
    let dir = TempDir::new().expect("create temp dir");
    let site_root = dir.path().join("www").join(SITE);
    let api_root = dir.path().join("srv").join("api");
    std::fs::create_dir_all(&site_root).expect("create site root");
    std::fs::create_dir_all(&api_root).expect("create api root");

    let sites_file = dir.path().join("sites_data.json");
    let sites = json!([
        {
            "domain": SITE,
            "type": "php",
            "path": site_root,
            "created_by_user": OWNER
        },
        {
            "domain": "api.example.com",
            "type": "python",
            "port": 8001,
            "workdir": api_root,
            "service_name": SERVICE,
            "created_by_user": OTHER_USER
        }
    ]);
    std::fs::write(&sites_file, sites.to_string()).expect("write registry");

    let mut config = Config {
        sites_file: sites_file.clone(),
        super_admins: vec![SUPER_ADMIN.to_string()],
        max_upload_size: 1024,
        ..Config::default()
    };
    config.logs.kill_grace_ms = 500;

    let registry = JsonSiteRegistry::new(sites_file);
    let authz = OwnerOrSuperAdmin::new(registry.clone(), config.super_admins.clone());
    let state = AppState::with_parts(
        config,
        Arc::new(registry),
        Arc::new(authz),
        Arc::new(ScriptFollower(script)),
    );

    TestPanel {
        app: routes::app(state),
        site_root: site_root
            .canonicalize()
            .expect("canonicalize site root"),
        _dir: dir,
    }
}

/// Create a panel with a follower that prints a few lines and exits.
pub fn test_panel() -> TestPanel {
    test_panel_with_script("printf 'service started\\nERROR database unreachable\\n'")
}
