//! Commands whose name looks like a shell option

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;

use burrow_jobs::{CancellationToken, JobRef, JobRegistry, ShellKind, SpawnRequest};

#[test]
fn test_dash_prefixed_command_is_found_in_path() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("-script");
    fs::write(&script, "#!/bin/sh\necho dashed\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
    let path = dir.path().to_string_lossy().to_string();

    let registry = JobRegistry::default();
    registry
        .run_request_and_collect_errors(
            SpawnRequest::new("-script")
                .shell(ShellKind::App)
                .env("PATH", path.as_str()),
            &CancellationToken::none(),
        )
        .unwrap();

    let job = JobRef::adopt(
        registry
            .spawn_request(
                SpawnRequest::new("-script")
                    .shell(ShellKind::App)
                    .capture_output(true)
                    .env("PATH", path.as_str()),
            )
            .unwrap(),
    );
    assert_eq!(job.wait().unwrap(), 0);
    assert_eq!(job.output().unwrap().read_lines(), vec!["dashed"]);
    assert!(job.errors().is_empty());
}
