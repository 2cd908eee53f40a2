//! End-to-end coverage of the Namespace Model and Filesystem Frontend against synthetic SquashFS
//! images, built in memory with `backhand`'s own writer (§2.1's test tooling, §8's concrete
//! scenarios) — no real kernel FUSE mount involved.

use std::ffi::OsStr;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use backhand::{FilesystemWriter, NodeHeader};
use tempfile::TempDir;

use distrifs::control::{self, ControlService, ScanConfig};
use distrifs::frontend::Frontend;
use distrifs::inode::ROOT_INODE;
use distrifs::namespace::Namespace;
use distrifs::scanner;

fn header() -> NodeHeader {
    NodeHeader {
        permissions: 0o755,
        ..Default::default()
    }
}

/// Writes `<name>.squashfs` (containing one regular file per `(path, contents)` pair, with
/// parent directories created as needed) and its `<name>.meta.textproto` sidecar into `repo`.
fn write_package(repo: &Path, name: &str, files: &[(&str, &[u8])], meta: &str) {
    let mut writer = FilesystemWriter::default();
    for (path, contents) in files {
        if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
            writer.push_dir_all(parent, header()).unwrap();
        }
        writer.push_file(Cursor::new(*contents), path, header()).unwrap();
    }
    let mut out = Cursor::new(Vec::new());
    writer.write(&mut out).unwrap();
    fs::write(repo.join(format!("{name}.squashfs")), out.into_inner()).unwrap();
    fs::write(repo.join(format!("{name}.meta.textproto")), meta).unwrap();
}

fn resolve_path(frontend: &Frontend, path: &str) -> distrifs::Result<u64> {
    let mut ino = ROOT_INODE;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        ino = frontend.resolve(ino, OsStr::new(component))?;
    }
    Ok(ino)
}

#[test]
fn two_version_coexistence_shadows_to_the_later_package() {
    let repo = TempDir::new().unwrap();
    write_package(
        repo.path(),
        "less-amd64-530",
        &[("bin/less", b"v1")],
        r#"source_pkg: "less" version: "530""#,
    );
    write_package(
        repo.path(),
        "less-amd64-530-2",
        &[("bin/less", b"v2")],
        r#"source_pkg: "less" version: "530-2""#,
    );

    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), repo.path().to_path_buf());
    let exchange_dirs = vec![PathBuf::from("/bin")];
    scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();

    let v1_less = resolve_path(&frontend, "less-amd64-530/bin/less").unwrap();
    frontend.stat(v1_less).unwrap();
    let v2_less = resolve_path(&frontend, "less-amd64-530-2/bin/less").unwrap();
    frontend.stat(v2_less).unwrap();

    let bin_less = resolve_path(&frontend, "bin/less").unwrap();
    let target = frontend.read_link(bin_less).unwrap();
    assert_eq!(target, Path::new("../less-amd64-530-2/bin/less"));
}

#[test]
fn live_add_via_scan_packages_does_not_disturb_existing_entries() {
    let repo = TempDir::new().unwrap();
    write_package(
        repo.path(),
        "less-amd64-530",
        &[("bin/less", b"v1")],
        r#"source_pkg: "less" version: "530""#,
    );
    write_package(
        repo.path(),
        "less-amd64-530-2",
        &[("bin/less", b"v2")],
        r#"source_pkg: "less" version: "530-2""#,
    );

    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), repo.path().to_path_buf());
    let exchange_dirs = vec![PathBuf::from("/bin")];
    scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();

    // Scenario 2: drop a new package into the store after the initial scan.
    write_package(
        repo.path(),
        "bash-amd64-1",
        &[("bin/bash", b"bash")],
        r#"source_pkg: "bash" version: "1""#,
    );
    let newly_scanned =
        scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();
    assert_eq!(newly_scanned, 1);

    let bin_bash = resolve_path(&frontend, "bin/bash").unwrap();
    assert_eq!(
        frontend.read_link(bin_bash).unwrap(),
        Path::new("../bash-amd64-1/bin/bash")
    );
    // Scenario 2's "no existing less entry changes":
    let bin_less = resolve_path(&frontend, "bin/less").unwrap();
    assert_eq!(
        frontend.read_link(bin_less).unwrap(),
        Path::new("../less-amd64-530-2/bin/less")
    );

    // Scenario 3: a newer version lands and a second scan shadows again.
    write_package(
        repo.path(),
        "less-amd64-530-3",
        &[("bin/less", b"v3")],
        r#"source_pkg: "less" version: "530-3""#,
    );
    scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();
    let bin_less = resolve_path(&frontend, "bin/less").unwrap();
    assert_eq!(
        frontend.read_link(bin_less).unwrap(),
        Path::new("../less-amd64-530-3/bin/less")
    );
}

#[test]
fn scan_is_idempotent() {
    let repo = TempDir::new().unwrap();
    write_package(
        repo.path(),
        "less-amd64-530",
        &[("bin/less", b"v1")],
        r#"source_pkg: "less" version: "530""#,
    );

    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), repo.path().to_path_buf());
    let exchange_dirs = vec![PathBuf::from("/bin")];
    let first = scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();
    let second = scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();
    assert_eq!(first, 1);
    assert_eq!(second, 0);
}

#[test]
fn runtime_union_concatenates_source_then_target_listing() {
    let repo = TempDir::new().unwrap();
    // Scanned first (alphabetically) so it's a known package by the time the union is resolved.
    write_package(
        repo.path(),
        "aaa-libc-amd64-1",
        &[("out/x/libfile", b"from libc")],
        r#"source_pkg: "libc" version: "1""#,
    );
    write_package(
        repo.path(),
        "zzz-app-amd64-1",
        &[("out/x/appfile", b"from app")],
        r#"source_pkg: "app" version: "1"
           runtime_union {
               pkg: "aaa-libc-amd64-1"
               dir: "x"
           }"#,
    );

    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), repo.path().to_path_buf());
    scanner::scan_all(&namespace, &frontend, repo.path(), &[], None).unwrap();

    let x_ino = resolve_path(&frontend, "zzz-app-amd64-1/out/x").unwrap();
    let listing = frontend.list_dir(x_ino).unwrap();
    let names: Vec<String> = listing
        .iter()
        .map(|(name, _, _)| name.to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["appfile".to_string(), "libfile".to_string()]);
}

#[test]
fn root_listing_includes_packages_ctl_and_exchange_dirs() {
    let repo = TempDir::new().unwrap();
    write_package(
        repo.path(),
        "less-amd64-530",
        &[("bin/less", b"v1")],
        r#"source_pkg: "less" version: "530""#,
    );

    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), repo.path().to_path_buf());
    namespace.install_ctl_symlink(Path::new("/tmp/distrifs-test.sock"));
    let exchange_dirs = vec![PathBuf::from("/bin")];
    scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();

    let root_listing = frontend.list_dir(ROOT_INODE).unwrap();
    let names: Vec<String> = root_listing
        .iter()
        .map(|(name, _, _)| name.to_string_lossy().into_owned())
        .collect();
    assert!(names.contains(&"less-amd64-530".to_string()));
    assert!(names.contains(&"ctl".to_string()));
    assert!(names.contains(&"bin".to_string()));
}

#[test]
fn out_prefixed_exchange_dir_symlink_targets_the_stripped_image_path() {
    let repo = TempDir::new().unwrap();
    write_package(
        repo.path(),
        "glibc-amd64-2.38",
        &[("lib/libfoo.so", b"shared object")],
        r#"source_pkg: "glibc" version: "2.38""#,
    );

    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), repo.path().to_path_buf());
    let exchange_dirs = vec![PathBuf::from("/out/lib")];
    scanner::scan_all(&namespace, &frontend, repo.path(), &exchange_dirs, None).unwrap();

    let link = resolve_path(&frontend, "out/lib/libfoo.so").unwrap();
    let target = frontend.read_link(link).unwrap();
    assert_eq!(target, Path::new("../../glibc-amd64-2.38/lib/libfoo.so"));

    // The target must resolve to a path that actually exists inside the package image, not
    // one still carrying the `/out` prefix.
    let resolved = resolve_path(&frontend, "glibc-amd64-2.38/lib/libfoo.so").unwrap();
    frontend.stat(resolved).unwrap();
}

#[test]
fn control_socket_ping_and_mkdir_all_round_trip() {
    let socket_path = std::env::temp_dir().join(format!(
        "distrifs-test-{}.sock",
        std::process::id()
    ));
    let _ = fs::remove_file(&socket_path);

    let repo = TempDir::new().unwrap();
    let namespace = Arc::new(Namespace::new());
    let frontend = Frontend::new(namespace.clone(), repo.path().to_path_buf());
    let service = Arc::new(ControlService::new(
        namespace.clone(),
        frontend.clone(),
        ScanConfig {
            repo: repo.path().to_path_buf(),
            exchange_dirs: vec![],
            libc_pkg: "glibc-amd64".to_string(),
            libc_loader_path: "lib/ld-linux-x86-64.so.2".to_string(),
        },
    ));
    let serve_path = socket_path.clone();
    let handle = std::thread::spawn(move || {
        let _ = service.serve(&serve_path);
    });

    // Give the listener a moment to bind; connect retries a few times rather than sleeping long.
    let mut stream_ok = false;
    for _ in 0..50 {
        if socket_path.exists() {
            stream_ok = true;
            break;
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
    }
    assert!(stream_ok, "control socket was never created");

    let pong = control::request(&socket_path, r#"{"op":"ping"}"#).unwrap();
    assert_eq!(pong, r#"{"ok":true}"#);

    let mkdir_ok = control::request(&socket_path, r#"{"op":"mkdir_all","name":"extra"}"#).unwrap();
    assert_eq!(mkdir_ok, r#"{"ok":true}"#);
    assert!(namespace
        .lookup(ROOT_INODE, OsStr::new("extra"))
        .is_ok());

    let mkdir_bad = control::request(&socket_path, r#"{"op":"mkdir_all","name":"a/b"}"#).unwrap();
    assert!(mkdir_bad.contains("\"ok\":false"));

    drop(handle); // the listener thread is daemon-like for this test; process exit reaps it
    let _ = fs::remove_file(&socket_path);
}
