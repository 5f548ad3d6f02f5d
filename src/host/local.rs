//! Native host for the local machine.
//!
//! Filesystem operations call the OS directly (`tokio::fs` where it exists,
//! `nix` in `spawn_blocking` elsewhere); processes run under
//! `tokio::process`. The agent server executes its operations through this
//! type, so it doubles as the machine-side implementation of the wire
//! protocol.

use std::os::unix::fs::{DirEntryExt, FileTypeExt, PermissionsExt};
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use nix::unistd::{Gid, Uid};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::trace;

use super::error::{HostError, HostResult, check_absolute, joined_result};
use super::types::{Cmd, DirEnt, Group, Stat, Timespec, User, WaitStatus};
use super::{FileReader, Host, Runner};

/// The local machine as a [`Host`] (and as a [`Runner`] for the fallback
/// and the agent bootstrap).
#[derive(Debug, Default)]
pub struct LocalHost;

impl LocalHost {
    pub fn new() -> Self {
        Self
    }

    pub(crate) async fn run_cmd(&self, mut cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        let dir = cmd.effective_dir().to_string();
        check_absolute("Run", &dir)?;
        trace!(cmd = %cmd.command_line(), dir = %dir, "run start");

        let mut command = tokio::process::Command::new(&cmd.path);
        command.args(&cmd.args).env_clear().current_dir(&dir);
        for kv in cmd.effective_env() {
            match kv.split_once('=') {
                Some((key, value)) => command.env(key, value),
                None => command.env(kv, ""),
            };
        }
        command
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if cmd.stdout.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(if cmd.stderr.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| HostError::other(format!("run {}: {e}", cmd.path)))?;

        let child_stdin = child.stdin.take();
        let child_stdout = child.stdout.take();
        let child_stderr = child.stderr.take();
        let src = cmd.stdin.take();
        let out_sink = cmd.stdout.take();
        let err_sink = cmd.stderr.take();

        let stdin_fut = async {
            if let (Some(mut src), Some(mut dst)) = (src, child_stdin) {
                match tokio::io::copy(&mut src, &mut dst).await {
                    Ok(_) => dst
                        .shutdown()
                        .await
                        .map_err(|e| HostError::other(format!("close stdin: {e}"))),
                    // The child stopped reading; its exit status is the story.
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
                    Err(e) => Err(HostError::other(format!("stream stdin: {e}"))),
                }
            } else {
                Ok(())
            }
        };
        let stdout_fut = async {
            if let (Some(mut out), Some(mut sink)) = (child_stdout, out_sink) {
                tokio::io::copy(&mut out, &mut sink)
                    .await
                    .map_err(|e| HostError::other(format!("stream stdout: {e}")))?;
                sink.flush()
                    .await
                    .map_err(|e| HostError::other(format!("flush stdout: {e}")))
            } else {
                Ok(())
            }
        };
        let stderr_fut = async {
            if let (Some(mut err), Some(mut sink)) = (child_stderr, err_sink) {
                tokio::io::copy(&mut err, &mut sink)
                    .await
                    .map_err(|e| HostError::other(format!("stream stderr: {e}")))?;
                sink.flush()
                    .await
                    .map_err(|e| HostError::other(format!("flush stderr: {e}")))
            } else {
                Ok(())
            }
        };

        let (r_in, r_out, r_err, waited) =
            tokio::join!(stdin_fut, stdout_fut, stderr_fut, child.wait());
        let status = waited.map_err(|e| HostError::other(format!("wait {}: {e}", cmd.path)))?;
        joined_result([r_in, r_out, r_err].into_iter().filter_map(Result::err))?;

        let status = WaitStatus::from(status);
        trace!(cmd = %cmd.path, status = %status, "run done");
        Ok(status)
    }
}

/// Run a synchronous OS call off the async executor.
async fn blocking<T, F>(f: F) -> HostResult<T>
where
    F: FnOnce() -> HostResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| HostError::other(format!("blocking task: {e}")))?
}

fn stat_from_sys(st: nix::sys::stat::FileStat) -> Stat {
    Stat {
        dev: st.st_dev as u64,
        ino: st.st_ino as u64,
        nlink: st.st_nlink as u64,
        mode: st.st_mode as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u64,
        size: st.st_size as i64,
        blksize: st.st_blksize as i64,
        blocks: st.st_blocks as i64,
        atim: Timespec {
            sec: st.st_atime as i64,
            nsec: st.st_atime_nsec as i64,
        },
        mtim: Timespec {
            sec: st.st_mtime as i64,
            nsec: st.st_mtime_nsec as i64,
        },
        ctim: Timespec {
            sec: st.st_ctime as i64,
            nsec: st.st_ctime_nsec as i64,
        },
    }
}

fn dirent_kind(ft: std::fs::FileType) -> u8 {
    if ft.is_dir() {
        libc::DT_DIR
    } else if ft.is_symlink() {
        libc::DT_LNK
    } else if ft.is_block_device() {
        libc::DT_BLK
    } else if ft.is_char_device() {
        libc::DT_CHR
    } else if ft.is_fifo() {
        libc::DT_FIFO
    } else if ft.is_socket() {
        libc::DT_SOCK
    } else if ft.is_file() {
        libc::DT_REG
    } else {
        libc::DT_UNKNOWN
    }
}

#[async_trait]
impl Host for LocalHost {
    async fn chmod(&self, path: &str, mode: u32) -> HostResult<()> {
        check_absolute("Chmod", path)?;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(HostError::from)
    }

    async fn chown(&self, path: &str, uid: u32, gid: u32) -> HostResult<()> {
        check_absolute("Chown", path)?;
        let path = PathBuf::from(path);
        blocking(move || {
            nix::unistd::chown(&path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
                .map_err(HostError::from)
        })
        .await
    }

    async fn lookup(&self, username: &str) -> HostResult<User> {
        let username = username.to_string();
        blocking(move || match nix::unistd::User::from_name(&username) {
            Ok(Some(u)) => Ok(User {
                uid: u.uid.as_raw(),
                gid: u.gid.as_raw(),
                username: u.name,
                name: u.gecos.to_string_lossy().into_owned(),
                home: u.dir.display().to_string(),
            }),
            Ok(None) => Err(HostError::UnknownUser(username)),
            Err(e) => Err(HostError::from(e)),
        })
        .await
    }

    async fn lookup_group(&self, name: &str) -> HostResult<Group> {
        let name = name.to_string();
        blocking(move || match nix::unistd::Group::from_name(&name) {
            Ok(Some(g)) => Ok(Group {
                gid: g.gid.as_raw(),
                name: g.name,
            }),
            Ok(None) => Err(HostError::UnknownGroup(name)),
            Err(e) => Err(HostError::from(e)),
        })
        .await
    }

    async fn lstat(&self, path: &str) -> HostResult<Stat> {
        check_absolute("Lstat", path)?;
        let path = PathBuf::from(path);
        blocking(move || {
            nix::sys::stat::lstat(&path)
                .map(stat_from_sys)
                .map_err(HostError::from)
        })
        .await
    }

    async fn read_dir(&self, path: &str) -> HostResult<Vec<DirEnt>> {
        check_absolute("ReadDir", path)?;
        let path = PathBuf::from(path);
        blocking(move || {
            let mut entries = Vec::new();
            for entry in std::fs::read_dir(&path)? {
                let entry = entry?;
                let kind = dirent_kind(entry.file_type()?);
                entries.push(DirEnt {
                    ino: entry.ino(),
                    kind,
                    name: entry.file_name().to_string_lossy().into_owned(),
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn mkdir(&self, path: &str, mode: u32) -> HostResult<()> {
        check_absolute("Mkdir", path)?;
        tokio::fs::create_dir(path).await.map_err(HostError::from)?;
        // Second chmod, so the umask has no say in the final bits.
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(HostError::from)
    }

    async fn read_file(&self, path: &str) -> HostResult<FileReader> {
        check_absolute("ReadFile", path)?;
        let file = tokio::fs::File::open(path).await.map_err(HostError::from)?;
        Ok(FileReader::plain(Box::new(file)))
    }

    async fn write_file(
        &self,
        path: &str,
        src: &mut (dyn AsyncRead + Send + Unpin),
        mode: u32,
    ) -> HostResult<()> {
        check_absolute("WriteFile", path)?;
        let mut file = tokio::fs::File::create(path).await.map_err(HostError::from)?;
        tokio::io::copy(src, &mut file)
            .await
            .map_err(|e| HostError::other(format!("write {path}: {e}")))?;
        file.flush()
            .await
            .map_err(|e| HostError::other(format!("write {path}: {e}")))?;
        drop(file);
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
            .await
            .map_err(HostError::from)
    }

    async fn symlink(&self, oldname: &str, newname: &str) -> HostResult<()> {
        check_absolute("Symlink", newname)?;
        tokio::fs::symlink(oldname, newname)
            .await
            .map_err(HostError::from)
    }

    async fn read_link(&self, path: &str) -> HostResult<String> {
        check_absolute("ReadLink", path)?;
        let target = tokio::fs::read_link(path).await.map_err(HostError::from)?;
        target
            .into_os_string()
            .into_string()
            .map_err(|_| HostError::other(format!("readlink {path}: non-UTF-8 target")))
    }

    async fn remove(&self, path: &str) -> HostResult<()> {
        check_absolute("Remove", path)?;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => {
                tokio::fs::remove_dir(path).await.map_err(HostError::from)
            }
            Err(e) => Err(HostError::from(e)),
        }
    }

    async fn mknod(&self, path: &str, mode: u32, dev: u64) -> HostResult<()> {
        check_absolute("Mknod", path)?;
        let path = PathBuf::from(path);
        blocking(move || {
            let kind = nix::sys::stat::SFlag::from_bits_truncate(mode & libc::S_IFMT);
            let perm = nix::sys::stat::Mode::from_bits_truncate(mode & 0o7777);
            nix::sys::stat::mknod(&path, kind, perm, dev as libc::dev_t).map_err(HostError::from)
        })
        .await
    }

    async fn run(&self, cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        self.run_cmd(cmd).await
    }

    async fn geteuid(&self) -> HostResult<u32> {
        Ok(nix::unistd::geteuid().as_raw())
    }

    async fn getegid(&self) -> HostResult<u32> {
        Ok(nix::unistd::getegid().as_raw())
    }

    async fn close(&self) -> HostResult<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "localhost"
    }

    fn target(&self) -> String {
        "localhost".to_string()
    }
}

#[async_trait]
impl Runner for LocalHost {
    async fn run(&self, cmd: Cmd<'_>) -> HostResult<WaitStatus> {
        self.run_cmd(cmd).await
    }

    async fn close(&self) -> HostResult<()> {
        Ok(())
    }

    fn kind(&self) -> &'static str {
        "localhost"
    }

    fn target(&self) -> String {
        "localhost".to_string()
    }
}
