//! End-to-end agent tests: gzip the compiled agent binary, register it,
//! bootstrap it over the local machine, and drive it over RPC.

use std::collections::HashMap;
use std::io::Write;
use std::sync::Once;

use flate2::{Compression, write::GzEncoder};
use resonance_host::agent::{AgentHost, Arch, registry};
use resonance_host::host::{Cmd, Host, HostError, LocalHost, OutputBuffer};
use tokio::io::AsyncReadExt;

fn ensure_registry() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let binary =
            std::fs::read(env!("CARGO_BIN_EXE_resonance-agent")).expect("read agent binary");
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&binary).expect("compress agent binary");
        let compressed = encoder.finish().expect("finish gzip stream");

        let uname = std::process::Command::new("uname")
            .arg("-m")
            .output()
            .expect("run uname -m");
        let machine = String::from_utf8_lossy(&uname.stdout).trim().to_string();
        let arch = Arch::from_uname(&machine).expect("supported test architecture");

        let mut binaries = HashMap::new();
        binaries.insert(registry::key("linux", arch), compressed);
        registry::init(binaries).expect("initialize agent registry");
    });
}

async fn spawn_agent() -> AgentHost {
    ensure_registry();
    AgentHost::spawn(Box::new(LocalHost::new()))
        .await
        .expect("bootstrap agent")
}

async fn write(host: &AgentHost, path: &str, data: &[u8], mode: u32) {
    host.write_file(path, &mut &data[..], mode)
        .await
        .unwrap_or_else(|e| panic!("write_file {path}: {e}"));
}

async fn read_all(host: &AgentHost, path: &str) -> Vec<u8> {
    let mut reader = host
        .read_file(path)
        .await
        .unwrap_or_else(|e| panic!("read_file {path}: {e}"));
    let mut content = Vec::new();
    reader.read_to_end(&mut content).await.unwrap();
    content
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bootstrap_ping_and_clean_close() {
    let host = spawn_agent().await;
    assert_eq!(host.kind(), "agent");
    assert_eq!(host.target(), "localhost");

    // The agent unlinked its own staged binary at startup.
    assert!(
        !std::path::Path::new(host.remote_path()).exists(),
        "staged binary should be self-unlinked"
    );

    host.close().await.expect("close agent");
    host.close().await.expect("close is idempotent");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_file_roundtrip() {
    let host = spawn_agent().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t1").display().to_string();

    write(&host, &path, b"foo", 0o644).await;
    assert_eq!(read_all(&host, &path).await, b"foo");
    assert_eq!(host.lstat(&path).await.unwrap().mode & 0o777, 0o644);

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mode_preserved_across_overwrites() {
    let host = spawn_agent().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t2").display().to_string();

    write(&host, &path, b"", 0o1607).await;
    assert_eq!(host.lstat(&path).await.unwrap().permissions(), 0o1607);

    write(&host, &path, b"foo", 0o2675).await;
    assert_eq!(host.lstat(&path).await.unwrap().permissions(), 0o2675);
    assert_eq!(read_all(&host, &path).await, b"foo");

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_streaming_survives_chunked_transfers() {
    let host = spawn_agent().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big").display().to_string();

    // Spans many 1 KiB write chunks and many 8 KiB read chunks.
    let payload: Vec<u8> = (0..300 * 1024).map(|i| (i % 251) as u8).collect();
    write(&host, &path, &payload, 0o600).await;
    assert_eq!(read_all(&host, &path).await, payload);

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_reader_cancels_stream_but_not_the_host() {
    let host = spawn_agent().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("big").display().to_string();

    // Large enough that the server is still mid-stream when the reader
    // goes away.
    let payload: Vec<u8> = (0..2 * 1024 * 1024).map(|i| (i % 199) as u8).collect();
    write(&host, &path, &payload, 0o600).await;

    let mut reader = host.read_file(&path).await.unwrap();
    let mut first = vec![0u8; 1024];
    reader.read_exact(&mut first).await.unwrap();
    assert_eq!(&first[..], &payload[..1024]);
    drop(reader);

    // The cancelled stream must not disturb the connection: sibling calls
    // and a fresh full read still work, and shutdown is clean.
    assert_eq!(host.lstat(&path).await.unwrap().size, payload.len() as i64);
    assert_eq!(read_all(&host, &path).await, payload);

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_read_dir_over_agent() {
    let host = spawn_agent().await;
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();

    std::fs::write(base.join("regular"), b"x").unwrap();
    std::fs::create_dir(base.join("directory")).unwrap();
    std::os::unix::fs::symlink("regular", base.join("symlink")).unwrap();
    nix::unistd::mkfifo(&base.join("fifo"), nix::sys::stat::Mode::from_bits_truncate(0o600))
        .unwrap();
    let _socket = std::os::unix::net::UnixListener::bind(base.join("socket")).unwrap();

    let mut entries = host.read_dir(&base.display().to_string()).await.unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["directory", "fifo", "regular", "socket", "symlink"]);

    let kind_of = |n: &str| entries.iter().find(|e| e.name == n).unwrap().kind;
    assert_eq!(kind_of("regular"), libc::DT_REG);
    assert_eq!(kind_of("directory"), libc::DT_DIR);
    assert_eq!(kind_of("symlink"), libc::DT_LNK);
    assert_eq!(kind_of("fifo"), libc::DT_FIFO);
    assert_eq!(kind_of("socket"), libc::DT_SOCK);

    let mut inodes: Vec<u64> = entries.iter().map(|e| e.ino).collect();
    inodes.sort_unstable();
    inodes.dedup();
    assert_eq!(inodes.len(), entries.len());

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_captures_streams() {
    let host = spawn_agent().await;
    let stdout = OutputBuffer::new();
    let stderr = OutputBuffer::new();
    let cmd = Cmd::new("ls")
        .args(["-d", "/tmp", "/non-existent"])
        .stdout(stdout.writer())
        .stderr(stderr.writer());

    let status = host.run(cmd).await.unwrap();
    assert!(status.exited);
    assert_eq!(status.exit_code, 2);
    assert_eq!(status.signal, "");
    assert!(stdout.utf8_lossy().contains("/tmp\n"));
    assert!(stderr.utf8_lossy().contains("No such file or directory"));

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_feeds_buffered_stdin() {
    let host = spawn_agent().await;
    let stdout = OutputBuffer::new();
    let cmd = Cmd::new("cat")
        .stdin(Box::new(&b"over the wire"[..]))
        .stdout(stdout.writer());

    let status = host.run(cmd).await.unwrap();
    assert!(status.success());
    assert_eq!(stdout.take(), b"over the wire");

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_symlink_and_lookup_roundtrip() {
    let host = spawn_agent().await;
    let dir = tempfile::tempdir().unwrap();
    let link = dir.path().join("l").display().to_string();

    host.symlink("relative target", &link).await.unwrap();
    assert_eq!(host.read_link(&link).await.unwrap(), "relative target");
    assert!(host.lstat(&link).await.unwrap().is_symlink());

    let root = host.lookup("root").await.unwrap();
    assert_eq!(root.uid, 0);
    assert_eq!(
        host.lookup("foobar-resonance-missing").await.unwrap_err(),
        HostError::UnknownUser("foobar-resonance-missing".to_string())
    );
    assert_eq!(
        host.lookup_group("foobar-resonance-missing")
            .await
            .unwrap_err(),
        HostError::UnknownGroup("foobar-resonance-missing".to_string())
    );

    assert_eq!(
        host.geteuid().await.unwrap(),
        nix::unistd::geteuid().as_raw()
    );

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_errors_cross_the_wire_as_kinds() {
    let host = spawn_agent().await;

    assert_eq!(
        host.lstat("/non-existent-resonance-test").await.unwrap_err(),
        HostError::NotExist
    );
    assert_eq!(
        host.read_file("/non-existent-resonance-test").await.err(),
        Some(HostError::NotExist)
    );
    let dir = tempfile::tempdir().unwrap();
    let sub = dir.path().join("d").display().to_string();
    host.mkdir(&sub, 0o755).await.unwrap();
    assert_eq!(host.mkdir(&sub, 0o755).await.unwrap_err(), HostError::Exist);

    if !nix::unistd::geteuid().is_root() {
        assert_eq!(
            host.chmod("/tmp", 0).await.unwrap_err(),
            HostError::PermissionDenied
        );
        if std::path::Path::new("/etc/shadow").exists() {
            assert_eq!(
                host.read_file("/etc/shadow").await.err(),
                Some(HostError::PermissionDenied)
            );
        }
    }

    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_non_absolute_path_fails_without_touching_the_wire() {
    let host = spawn_agent().await;
    assert_eq!(
        host.chmod("foo/bar", 0o644).await.unwrap_err(),
        HostError::PathNotAbsolute {
            op: "Chmod",
            path: "foo/bar".to_string()
        }
    );
    host.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_calls_share_one_connection() {
    let host = spawn_agent().await;
    let dir = tempfile::tempdir().unwrap();

    let mut paths = Vec::new();
    for i in 0..8 {
        let path = dir.path().join(format!("f{i}")).display().to_string();
        write(&host, &path, format!("content {i}").as_bytes(), 0o644).await;
        paths.push(path);
    }

    let (c0, c1, c2, c3, s4, s5, uid, gid) = tokio::join!(
        read_all(&host, &paths[0]),
        read_all(&host, &paths[1]),
        read_all(&host, &paths[2]),
        read_all(&host, &paths[3]),
        host.lstat(&paths[4]),
        host.lstat(&paths[5]),
        host.geteuid(),
        host.getegid(),
    );
    assert_eq!(c0, b"content 0");
    assert_eq!(c1, b"content 1");
    assert_eq!(c2, b"content 2");
    assert_eq!(c3, b"content 3");
    assert_eq!(s4.unwrap().size, "content 4".len() as i64);
    assert_eq!(s5.unwrap().mode & 0o777, 0o644);
    assert_eq!(uid.unwrap(), nix::unistd::geteuid().as_raw());
    assert_eq!(gid.unwrap(), nix::unistd::getegid().as_raw());

    host.close().await.unwrap();
}
