use crate::common::file::{FileSpec, write_file};
use crate::common::redirect_temp_dir;
use assert_cmd::Command;
use assert_fs::TempDir;
use rstest::fixture;
use std::path::Path;

#[fixture]
pub fn repository_dir() -> TempDir {
    redirect_temp_dir();
    TempDir::new().expect("Failed to create temp dir")
}

/// An initialized repository tracking one directory and one standalone
/// file:
///
/// ```text
/// data/a.txt   "hello"
/// data/b.txt   "world"
/// model.bin    "weights"
/// ```
#[fixture]
pub fn tracked_repository_dir(repository_dir: TempDir) -> TempDir {
    run_stash_command(repository_dir.path(), &["init"])
        .assert()
        .success();

    write_file(FileSpec::new(
        repository_dir.path().join("data").join("a.txt"),
        "hello".to_string(),
    ));
    write_file(FileSpec::new(
        repository_dir.path().join("data").join("b.txt"),
        "world".to_string(),
    ));
    write_file(FileSpec::new(
        repository_dir.path().join("model.bin"),
        "weights".to_string(),
    ));

    run_stash_command(repository_dir.path(), &["add", "data", "model.bin"])
        .assert()
        .success();

    repository_dir
}

pub fn run_stash_command(dir: &Path, args: &[&str]) -> Command {
    let mut cmd = Command::cargo_bin("stash").expect("Failed to find stash binary");
    cmd.current_dir(dir);
    for arg in args {
        cmd.arg(arg);
    }
    cmd
}

/// Fan-out path of an object inside the local cache.
pub fn cache_object_path(dir: &Path, digest: &str) -> std::path::PathBuf {
    dir.join(".stash")
        .join("cache")
        .join(&digest[..2])
        .join(&digest[2..])
}
