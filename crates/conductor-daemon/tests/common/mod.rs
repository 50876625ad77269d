#![allow(dead_code, clippy::unwrap_used)]

//! Shared setup for the integration tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use conductor_core::Config;
use conductor_daemon::Orchestrator;
use conductor_daemon::session::SessionSettings;
use conductor_daemon::storage::Database;
use conductor_daemon::subprocess::FakeRunner;

pub struct TestSystem {
    pub orchestrator: Orchestrator,
    pub runner: Arc<FakeRunner>,
    pub db_path: PathBuf,
    _dir: tempfile::TempDir,
}

pub fn settings(working_directory: &Path) -> SessionSettings {
    SessionSettings {
        program: PathBuf::from("claude"),
        default_model: "sonnet".to_string(),
        working_directory: working_directory.to_path_buf(),
        env: vec![("PATH".to_string(), "/usr/bin:/bin".to_string())],
        terminate_timeout: Duration::from_millis(300),
    }
}

pub async fn system() -> TestSystem {
    let dir = tempfile::TempDir::new().unwrap();
    let db_path = dir.path().join("conductor.db");
    let db = Database::open(&db_path).await.unwrap();
    let runner = Arc::new(FakeRunner::new());
    let orchestrator = Orchestrator::with_settings(
        &Config::default(),
        settings(dir.path()),
        db,
        runner.clone(),
    );
    TestSystem {
        orchestrator,
        runner,
        db_path,
        _dir: dir,
    }
}

/// A second orchestrator on the same database file and processes, as a
/// separate `conductor` invocation would open them.
pub async fn attach(sys: &TestSystem) -> Orchestrator {
    let db = Database::open(&sys.db_path).await.unwrap();
    Orchestrator::with_settings(
        &Config::default(),
        settings(sys._dir.path()),
        db,
        sys.runner.clone(),
    )
}
