//! Cmd-over-shell fallback host.
//!
//! Emulates the full host contract on transports that expose only command
//! execution (SSH, Docker, the local machine as commands) by spawning POSIX
//! utilities and translating their stderr into the error taxonomy. This is
//! what carries the agent bootstrap onto a raw target, and a usable if slow
//! fallback when the agent cannot run at all.
//!
//! Correctness hinges on stable utility behavior (GNU coreutils / busybox
//! compatible `stat`, `find`, `cat`, `chmod`, `ln`, `readlink`, `rm`,
//! `mkdir`, `mknod`, `id`) across common Linux distributions.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

use crate::shell::shell_quote;

use super::error::{HostError, HostResult, check_absolute};
use super::types::{Cmd, DirEnt, Group, OutputBuffer, Stat, Timespec, User, WaitStatus};
use super::{CloseFuture, FileReader, Host, Runner, run_capture};

/// Field order handed to `stat --format`, kept in lockstep with
/// [`parse_stat`]: device, inode, nlink, raw hex mode, uid, gid, rdev,
/// size, blksize, blocks, atime, mtime, ctime.
const STAT_FORMAT: &str = "%d,%i,%h,%f,%u,%g,%r,%s,%B,%b,%x,%y,%z";

/// `chrono` layout for `stat` timestamps such as
/// `2006-01-02 15:04:05.999999999 -0700`.
const STAT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f %z";

/// Read size for the synchronous first chunk of a streaming `cat`.
const CAT_CHUNK: usize = 8 * 1024;

/// A host that drives POSIX utilities through a [`Runner`].
pub struct ShellHost {
    runner: Arc<dyn Runner>,
}

impl ShellHost {
    pub fn new(runner: impl Runner + 'static) -> Self {
        Self {
            runner: Arc::new(runner),
        }
    }

    pub fn from_arc(runner: Arc<dyn Runner>) -> Self {
        Self { runner }
    }

    /// Run a utility, expecting success; classify stderr on failure.
    async fn output(&self, op: &'static str, cmd: Cmd<'_>) -> HostResult<Vec<u8>> {
        trace!(cmd = %cmd.command_line(), "shell fallback exec");
        let (status, stdout, stderr) = run_capture(&*self.runner, cmd).await?;
        if status.success() {
            Ok(stdout)
        } else {
            Err(classify(op, &String::from_utf8_lossy(&stderr)))
        }
    }

    async fn expect_ok(&self, op: &'static str, cmd: Cmd<'_>) -> HostResult<()> {
        self.output(op, cmd).await.map(|_| ())
    }
}

/// Translate utility stderr into the error taxonomy.
fn classify(op: &'static str, stderr: &str) -> HostError {
    if stderr.contains("Operation not permitted") || stderr.contains("Permission denied") {
        HostError::PermissionDenied
    } else if stderr.contains("No such file or directory")
        || stderr.contains("Directory nonexistent")
    {
        HostError::NotExist
    } else if stderr.contains("File exists") {
        HostError::Exist
    } else if stderr.contains("Is a directory") {
        HostError::IsADirectory
    } else if stderr.contains("Not a directory") {
        HostError::NotADirectory
    } else {
        HostError::Other(format!("{op}: {}", stderr.trim()))
    }
}

fn parse_stat_time(s: &str) -> HostResult<Timespec> {
    let dt = chrono::DateTime::parse_from_str(s, STAT_TIME_FORMAT)
        .map_err(|e| HostError::other(format!("parse stat time {s:?}: {e}")))?;
    Ok(Timespec {
        sec: dt.timestamp(),
        nsec: i64::from(dt.timestamp_subsec_nanos()),
    })
}

fn parse_stat(out: &str) -> HostResult<Stat> {
    let line = out.trim();
    let fields: Vec<&str> = line.split(',').collect();
    if fields.len() != 13 {
        return Err(HostError::other(format!(
            "unexpected stat output ({} fields): {line:?}",
            fields.len()
        )));
    }
    let uint = |i: usize| -> HostResult<u64> {
        fields[i]
            .parse()
            .map_err(|e| HostError::other(format!("parse stat field {i} {:?}: {e}", fields[i])))
    };
    let int = |i: usize| -> HostResult<i64> {
        fields[i]
            .parse()
            .map_err(|e| HostError::other(format!("parse stat field {i} {:?}: {e}", fields[i])))
    };
    // `%r` prints `?` for files without a device type.
    let rdev = if fields[6] == "?" { 0 } else { uint(6)? };
    Ok(Stat {
        dev: uint(0)?,
        ino: uint(1)?,
        nlink: uint(2)?,
        mode: u32::from_str_radix(fields[3], 16)
            .map_err(|e| HostError::other(format!("parse stat mode {:?}: {e}", fields[3])))?,
        uid: uint(4)? as u32,
        gid: uint(5)? as u32,
        rdev,
        size: int(7)?,
        blksize: int(8)?,
        blocks: int(9)?,
        atim: parse_stat_time(fields[10])?,
        mtim: parse_stat_time(fields[11])?,
        ctim: parse_stat_time(fields[12])?,
    })
}

fn dt_from_find(c: char) -> u8 {
    match c {
        'f' => libc::DT_REG,
        'd' => libc::DT_DIR,
        'l' => libc::DT_LNK,
        'b' => libc::DT_BLK,
        'c' => libc::DT_CHR,
        'p' => libc::DT_FIFO,
        's' => libc::DT_SOCK,
        _ => libc::DT_UNKNOWN,
    }
}

/// Parse NUL-terminated `find -printf '%i %y %p\0'` records, skipping the
/// directory itself.
fn parse_find_output(dir: &str, out: &[u8]) -> HostResult<Vec<DirEnt>> {
    let mut entries = Vec::new();
    let mut self_kind = None;
    for record in out.split(|b| *b == 0) {
        if record.is_empty() {
            continue;
        }
        let record = String::from_utf8_lossy(record);
        let mut parts = record.splitn(3, ' ');
        let (ino, kind, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(ino), Some(kind), Some(path)) => (ino, kind, path),
            _ => return Err(HostError::other(format!("unexpected find record: {record:?}"))),
        };
        let ino: u64 = ino
            .parse()
            .map_err(|e| HostError::other(format!("parse find inode {ino:?}: {e}")))?;
        let kind = dt_from_find(kind.chars().next().unwrap_or('?'));
        if path == dir {
            self_kind = Some(kind);
            continue;
        }
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        entries.push(DirEnt { ino, kind, name });
    }
    match self_kind {
        Some(kind) if kind != libc::DT_DIR => Err(HostError::NotADirectory),
        _ => Ok(entries),
    }
}

#[async_trait]
impl Host for ShellHost {
    async fn chmod(&self, path: &str, mode: u32) -> HostResult<()> {
        check_absolute("Chmod", path)?;
        let mode = format!("{:04o}", mode & 0o7777);
        self.expect_ok("Chmod", Cmd::new("chmod").arg(mode).arg(path))
            .await
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> HostResult<()> {
        check_absolute("Chown", path)?;
        self.expect_ok(
            "Chown",
            Cmd::new("chown").arg(format!("{uid}:{gid}")).arg(path),
        )
        .await
    }

    async fn lookup(&self, username: &str) -> HostResult<User> {
        let out = self
            .output("Lookup", Cmd::new("cat").arg("/etc/passwd"))
            .await?;
        for line in String::from_utf8_lossy(&out).lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 || fields[0] != username {
                continue;
            }
            return Ok(User {
                uid: fields[2]
                    .parse()
                    .map_err(|e| HostError::other(format!("parse passwd uid: {e}")))?,
                gid: fields[3]
                    .parse()
                    .map_err(|e| HostError::other(format!("parse passwd gid: {e}")))?,
                username: username.to_string(),
                name: fields[4].to_string(),
                home: fields[5].to_string(),
            });
        }
        Err(HostError::UnknownUser(username.to_string()))
    }

    async fn lookup_group(&self, name: &str) -> HostResult<Group> {
        let out = self
            .output("LookupGroup", Cmd::new("cat").arg("/etc/group"))
            .await?;
        for line in String::from_utf8_lossy(&out).lines() {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 3 || fields[0] != name {
                continue;
            }
            return Ok(Group {
                gid: fields[2]
                    .parse()
                    .map_err(|e| HostError::other(format!("parse group gid: {e}")))?,
                name: name.to_string(),
            });
        }
        Err(HostError::UnknownGroup(name.to_string()))
    }

    async fn lstat(&self, path: &str) -> HostResult<Stat> {
        check_absolute("Lstat", path)?;
        let out = self
            .output(
                "Lstat",
                Cmd::new("stat")
                    .arg(format!("--format={STAT_FORMAT}"))
                    .arg(path),
            )
            .await?;
        parse_stat(&String::from_utf8_lossy(&out))
    }

    async fn read_dir(&self, path: &str) -> HostResult<Vec<DirEnt>> {
        check_absolute("ReadDir", path)?;
        let out = self
            .output(
                "ReadDir",
                Cmd::new("find")
                    .arg(path)
                    .args(["-maxdepth", "1", "-printf", "%i %y %p\\0"]),
            )
            .await?;
        parse_find_output(path, &out)
    }

    async fn mkdir(&self, path: &str, mode: u32) -> HostResult<()> {
        check_absolute("Mkdir", path)?;
        self.expect_ok("Mkdir", Cmd::new("mkdir").arg(path)).await?;
        self.chmod(path, mode & 0o7777).await
    }

    async fn read_file(&self, path: &str) -> HostResult<FileReader> {
        check_absolute("ReadFile", path)?;

        let (ours, theirs) = tokio::io::duplex(CAT_CHUNK);
        let stderr = OutputBuffer::new();
        let cmd = Cmd::new("cat")
            .arg(path)
            .stdout(Box::new(theirs))
            .stderr(stderr.writer());
        let runner = Arc::clone(&self.runner);
        let cat = tokio::spawn(async move { runner.run(cmd).await });

        // Pre-read the first chunk so open-time errors, which cat reports on
        // stderr with a nonzero wait status, translate before a reader is
        // handed out.
        let mut reader = ours;
        let mut first = vec![0u8; CAT_CHUNK];
        let n = reader
            .read(&mut first)
            .await
            .map_err(|e| HostError::other(format!("ReadFile {path}: {e}")))?;
        if n == 0 {
            let status = cat
                .await
                .map_err(|e| HostError::other(format!("join cat: {e}")))??;
            if !status.success() {
                return Err(classify("ReadFile", &stderr.utf8_lossy()));
            }
            return Ok(FileReader::plain(Box::new(tokio::io::empty())));
        }
        first.truncate(n);

        let chained = AsyncReadExt::chain(std::io::Cursor::new(first), reader);
        let closer = Box::new(move || -> CloseFuture {
            Box::pin(async move {
                let status = cat
                    .await
                    .map_err(|e| HostError::other(format!("join cat: {e}")))??;
                if status.success() {
                    Ok(())
                } else {
                    Err(classify("ReadFile", &stderr.utf8_lossy()))
                }
            })
        });
        Ok(FileReader::with_closer(Box::new(chained), closer))
    }

    async fn write_file(
        &self,
        path: &str,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mode: u32,
    ) -> HostResult<()> {
        check_absolute("WriteFile", path)?;
        let receiver = format!("cat > {}", shell_quote(path));
        let cmd = Cmd::new("sh")
            .args(["-c", receiver.as_str()])
            .stdin(Box::new(src));
        self.expect_ok("WriteFile", cmd).await?;
        self.chmod(path, mode & 0o7777).await
    }

    async fn symlink(&self, oldname: &str, newname: &str) -> HostResult<()> {
        check_absolute("Symlink", newname)?;
        self.expect_ok("Symlink", Cmd::new("ln").arg("-s").arg(oldname).arg(newname))
            .await
    }

    async fn read_link(&self, path: &str) -> HostResult<String> {
        check_absolute("ReadLink", path)?;
        let out = self
            .output("ReadLink", Cmd::new("readlink").arg("-vn").arg(path))
            .await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    async fn remove(&self, path: &str) -> HostResult<()> {
        check_absolute("Remove", path)?;
        match self.expect_ok("Remove", Cmd::new("rm").arg(path)).await {
            Err(HostError::IsADirectory) => {
                self.expect_ok("Remove", Cmd::new("rmdir").arg(path)).await
            }
            other => other,
        }
    }

    async fn mknod(&self, path: &str, mode: u32, dev: u64) -> HostResult<()> {
        check_absolute("Mknod", path)?;
        let (letter, with_dev) = match mode & libc::S_IFMT {
            libc::S_IFCHR => ("c", true),
            libc::S_IFBLK => ("b", true),
            libc::S_IFIFO => ("p", false),
            other => {
                return Err(HostError::other(format!(
                    "Mknod {path}: unsupported file type {other:o}"
                )));
            }
        };
        let mut cmd = Cmd::new("mknod").arg(path).arg(letter);
        if with_dev {
            let dev = dev as libc::dev_t;
            cmd = cmd
                .arg(nix::sys::stat::major(dev).to_string())
                .arg(nix::sys::stat::minor(dev).to_string());
        }
        self.expect_ok("Mknod", cmd).await?;
        self.chmod(path, mode & 0o7777).await
    }

    async fn run(&self, cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        self.runner.run(cmd).await
    }

    async fn geteuid(&self) -> HostResult<u32> {
        let out = self.output("Geteuid", Cmd::new("id").arg("-u")).await?;
        String::from_utf8_lossy(&out)
            .trim()
            .parse()
            .map_err(|e| HostError::other(format!("parse id -u output: {e}")))
    }

    async fn getegid(&self) -> HostResult<u32> {
        let out = self.output("Getegid", Cmd::new("id").arg("-g")).await?;
        String::from_utf8_lossy(&out)
            .trim()
            .parse()
            .map_err(|e| HostError::other(format!("parse id -g output: {e}")))
    }

    async fn close(&self) -> HostResult<()> {
        self.runner.close().await
    }

    fn kind(&self) -> &'static str {
        self.runner.kind()
    }

    fn target(&self) -> String {
        self.runner.target()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records command lines instead of executing anything.
    struct MockRunner {
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Runner for MockRunner {
        async fn run(&self, cmd: Cmd<'_>) -> HostResult<WaitStatus> {
            self.calls.lock().unwrap().push(cmd.command_line());
            Ok(WaitStatus {
                exit_code: 0,
                exited: true,
                signal: String::new(),
            })
        }

        async fn close(&self) -> HostResult<()> {
            Ok(())
        }

        fn kind(&self) -> &'static str {
            "mock"
        }

        fn target(&self) -> String {
            "mock".to_string()
        }
    }

    fn mock_host() -> (ShellHost, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let host = ShellHost::new(MockRunner {
            calls: Arc::clone(&calls),
        });
        (host, calls)
    }

    #[tokio::test]
    async fn test_relative_path_rejected_without_running_anything() {
        let (host, calls) = mock_host();
        let err = host.chmod("foo/bar", 0o644).await.unwrap_err();
        assert_eq!(
            err,
            HostError::PathNotAbsolute {
                op: "Chmod",
                path: "foo/bar".to_string()
            }
        );
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chmod_formats_octal_mode() {
        let (host, calls) = mock_host();
        host.chmod("/tmp/x", 0o1607).await.unwrap();
        assert_eq!(calls.lock().unwrap().as_slice(), ["chmod 1607 /tmp/x"]);
    }

    #[tokio::test]
    async fn test_mkdir_applies_mode_after_creation() {
        let (host, calls) = mock_host();
        host.mkdir("/tmp/newdir", 0o750).await.unwrap();
        assert_eq!(
            calls.lock().unwrap().as_slice(),
            ["mkdir /tmp/newdir", "chmod 0750 /tmp/newdir"]
        );
    }

    #[test]
    fn test_classify_stderr() {
        assert_eq!(
            classify("Chmod", "chmod: changing permissions of '/tmp': Operation not permitted"),
            HostError::PermissionDenied
        );
        assert_eq!(
            classify("Lstat", "stat: cannot statx '/nope': No such file or directory"),
            HostError::NotExist
        );
        assert_eq!(
            classify("Mkdir", "mkdir: cannot create directory '/tmp/x': File exists"),
            HostError::Exist
        );
        assert_eq!(
            classify("Remove", "rm: cannot remove '/tmp/d': Is a directory"),
            HostError::IsADirectory
        );
        assert_eq!(
            classify("WriteFile", "sh: 1: cannot create /x/y: Directory nonexistent"),
            HostError::NotExist
        );
        assert_eq!(
            classify("Chmod", "chmod: oddball failure"),
            HostError::Other("Chmod: chmod: oddball failure".to_string())
        );
    }

    #[test]
    fn test_parse_stat_regular_file() {
        let line = "64769,393219,2,81a4,1000,100,?,42,512,8,\
                    2025-07-01 10:00:00.123456789 +0000,\
                    2025-07-01 10:00:01.000000000 +0000,\
                    2025-07-01 10:00:02.500000000 +0200";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.dev, 64769);
        assert_eq!(stat.ino, 393219);
        assert_eq!(stat.nlink, 2);
        assert_eq!(stat.mode, 0o100644);
        assert_eq!(stat.uid, 1000);
        assert_eq!(stat.gid, 100);
        assert_eq!(stat.rdev, 0);
        assert_eq!(stat.size, 42);
        assert_eq!(stat.blksize, 512);
        assert_eq!(stat.blocks, 8);
        assert_eq!(
            stat.atim,
            Timespec {
                sec: 1751364000,
                nsec: 123456789
            }
        );
        assert_eq!(stat.mtim.nsec, 0);
        // +0200 offset shifts the epoch seconds back two hours.
        assert_eq!(stat.ctim.sec, 1751364002 - 7200);
        assert_eq!(stat.ctim.nsec, 500000000);
    }

    #[test]
    fn test_parse_stat_rejects_malformed_output() {
        assert!(parse_stat("not,enough,fields").is_err());
    }

    #[test]
    fn test_parse_find_output() {
        let mut out = Vec::new();
        for record in ["11 d /tmp/d", "12 f /tmp/d/file", "13 l /tmp/d/link", "14 p /tmp/d/fifo"] {
            out.extend_from_slice(record.as_bytes());
            out.push(0);
        }
        let entries = parse_find_output("/tmp/d", &out).unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["file", "link", "fifo"]);
        assert_eq!(entries[0].kind, libc::DT_REG);
        assert_eq!(entries[1].kind, libc::DT_LNK);
        assert_eq!(entries[2].kind, libc::DT_FIFO);
        assert_eq!(entries[0].ino, 12);
    }

    #[test]
    fn test_parse_find_output_on_non_directory() {
        let out = b"21 f /tmp/file\0";
        assert_eq!(
            parse_find_output("/tmp/file", out).unwrap_err(),
            HostError::NotADirectory
        );
    }
}
