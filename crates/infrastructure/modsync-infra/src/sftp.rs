//! Blocking SFTP transport over ssh2, behind object-safe traits so the sync
//! engine and modlist poller can run against fakes. Sessions are per-call;
//! there is no pooling at this layer.

use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

use sha2::{Digest, Sha256};
use ssh2::{ErrorCode, FileStat, RenameFlags};

use modsync_config::{ServerSftpConfig, SftpAuthType};
use modsync_core::plan::TreeEntry;

#[derive(Debug, thiserror::Error)]
pub enum SftpError {
    #[error("sftp dial {address}: {reason}")]
    Dial { address: String, reason: String },
    #[error("sftp auth for {user}: {reason}")]
    Auth { user: String, reason: String },
    #[error("host key mismatch: expected sha256 {expected}, got {actual}")]
    HostKeyMismatch { expected: String, actual: String },
    #[error("remote {path}: {reason}")]
    Remote { path: String, reason: String },
    #[error("local i/o: {0}")]
    Local(#[from] std::io::Error),
}

impl SftpError {
    fn remote(path: &str, err: &ssh2::Error) -> Self {
        SftpError::Remote {
            path: path.to_string(),
            reason: err.to_string(),
        }
    }
}

/// One live SFTP session. All operations are blocking; callers drive them
/// from a blocking task and check cancellation between operations.
pub trait SftpSession: Send {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError>;
    /// Enumerate the tree under `root` into slash-relative entries with
    /// second-truncated mtimes. A missing root is an empty tree.
    fn walk_tree(&self, root: &str) -> Result<Vec<TreeEntry>, SftpError>;
    fn mkdir_all(&self, path: &str) -> Result<(), SftpError>;
    fn create(&self, path: &str) -> Result<Box<dyn std::io::Write + Send + '_>, SftpError>;
    fn rename(&self, from: &str, to: &str) -> Result<(), SftpError>;
    fn set_times(&self, path: &str, unix_secs: i64) -> Result<(), SftpError>;
    fn remove_file(&self, path: &str) -> Result<(), SftpError>;
    fn remove_dir(&self, path: &str) -> Result<(), SftpError>;
}

pub trait SftpConnector: Send + Sync {
    fn connect(&self, config: &ServerSftpConfig) -> Result<Box<dyn SftpSession>, SftpError>;
}

/// The production connector: TCP + SSH handshake + optional host key pin +
/// password or private-key auth.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ssh2Connector;

impl SftpConnector for Ssh2Connector {
    fn connect(&self, config: &ServerSftpConfig) -> Result<Box<dyn SftpSession>, SftpError> {
        let address = format!("{}:{}", config.host, config.port);
        let timeout = config.operation_timeout();
        let dial_err = |reason: String| SftpError::Dial {
            address: address.clone(),
            reason,
        };

        let addr = address
            .to_socket_addrs()
            .map_err(|e| dial_err(e.to_string()))?
            .next()
            .ok_or_else(|| dial_err("no resolved address".to_string()))?;
        let stream =
            TcpStream::connect_timeout(&addr, timeout).map_err(|e| dial_err(e.to_string()))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| dial_err(e.to_string()))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| dial_err(e.to_string()))?;

        let mut session = ssh2::Session::new().map_err(|e| dial_err(e.to_string()))?;
        session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
        session.set_tcp_stream(stream);
        session.handshake().map_err(|e| dial_err(e.to_string()))?;

        // Host keys are accepted unverified unless the config pins one.
        if let Some(expected) = &config.auth.host_key_sha256 {
            let (key, _) = session
                .host_key()
                .ok_or_else(|| dial_err("server sent no host key".to_string()))?;
            let actual = hex_sha256(key);
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SftpError::HostKeyMismatch {
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        let auth_err = |reason: String| SftpError::Auth {
            user: config.user.clone(),
            reason,
        };
        match config.auth.auth_type {
            SftpAuthType::Password => {
                let password = config.auth.password.as_deref().unwrap_or_default();
                session
                    .userauth_password(&config.user, password)
                    .map_err(|e| auth_err(e.to_string()))?;
            }
            SftpAuthType::PrivateKey => {
                let key_path = config
                    .auth
                    .private_key_path
                    .as_ref()
                    .ok_or_else(|| auth_err("missing private key path".to_string()))?;
                session
                    .userauth_pubkey_file(
                        &config.user,
                        None,
                        key_path.as_std_path(),
                        config.auth.passphrase.as_deref(),
                    )
                    .map_err(|e| auth_err(e.to_string()))?;
            }
        }

        let sftp = session
            .sftp()
            .map_err(|e| dial_err(format!("open sftp channel: {e}")))?;
        Ok(Box::new(Ssh2Session {
            _session: session,
            sftp,
        }))
    }
}

struct Ssh2Session {
    // Keeps the SSH connection alive for as long as the SFTP channel is used.
    _session: ssh2::Session,
    sftp: ssh2::Sftp,
}

fn is_not_found(err: &ssh2::Error) -> bool {
    // LIBSSH2_FX_NO_SUCH_FILE / LIBSSH2_FX_NO_SUCH_PATH
    matches!(err.code(), ErrorCode::SFTP(2) | ErrorCode::SFTP(10))
}

impl SftpSession for Ssh2Session {
    fn read_file(&self, path: &str) -> Result<Vec<u8>, SftpError> {
        let mut file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| SftpError::remote(path, &e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| SftpError::Remote {
                path: path.to_string(),
                reason: e.to_string(),
            })?;
        Ok(bytes)
    }

    fn walk_tree(&self, root: &str) -> Result<Vec<TreeEntry>, SftpError> {
        match self.sftp.stat(Path::new(root)) {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(SftpError::remote(root, &e)),
        }

        let mut entries = Vec::new();
        let mut pending = vec![String::new()];
        while let Some(rel_dir) = pending.pop() {
            let abs_dir = join_remote(root, &rel_dir);
            let listing = self
                .sftp
                .readdir(Path::new(&abs_dir))
                .map_err(|e| SftpError::remote(&abs_dir, &e))?;
            for (child, stat) in listing {
                let Some(name) = child.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let rel = if rel_dir.is_empty() {
                    name.to_string()
                } else {
                    format!("{rel_dir}/{name}")
                };
                let is_dir = stat.is_dir();
                entries.push(TreeEntry {
                    path: rel.clone(),
                    is_dir,
                    size: stat.size.unwrap_or(0),
                    mtime: stat.mtime.unwrap_or(0) as i64,
                });
                if is_dir {
                    pending.push(rel);
                }
            }
        }
        Ok(entries)
    }

    fn mkdir_all(&self, path: &str) -> Result<(), SftpError> {
        let mut prefix = String::new();
        for component in path.split('/').filter(|c| !c.is_empty()) {
            if prefix.is_empty() && path.starts_with('/') {
                prefix = format!("/{component}");
            } else if prefix.is_empty() {
                prefix = component.to_string();
            } else {
                prefix = format!("{prefix}/{component}");
            }
            match self.sftp.stat(Path::new(&prefix)) {
                Ok(stat) if stat.is_dir() => continue,
                Ok(_) => {
                    return Err(SftpError::Remote {
                        path: prefix,
                        reason: "exists and is not a directory".to_string(),
                    })
                }
                Err(e) if is_not_found(&e) => {
                    self.sftp
                        .mkdir(Path::new(&prefix), 0o755)
                        .map_err(|e| SftpError::remote(&prefix, &e))?;
                }
                Err(e) => return Err(SftpError::remote(&prefix, &e)),
            }
        }
        Ok(())
    }

    fn create(&self, path: &str) -> Result<Box<dyn std::io::Write + Send + '_>, SftpError> {
        let file = self
            .sftp
            .create(Path::new(path))
            .map_err(|e| SftpError::remote(path, &e))?;
        Ok(Box::new(file))
    }

    fn rename(&self, from: &str, to: &str) -> Result<(), SftpError> {
        self.sftp
            .rename(Path::new(from), Path::new(to), Some(RenameFlags::OVERWRITE))
            .map_err(|e| SftpError::remote(from, &e))
    }

    fn set_times(&self, path: &str, unix_secs: i64) -> Result<(), SftpError> {
        let stamp = unix_secs.max(0) as u64;
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: None,
            atime: Some(stamp),
            mtime: Some(stamp),
        };
        self.sftp
            .setstat(Path::new(path), stat)
            .map_err(|e| SftpError::remote(path, &e))
    }

    fn remove_file(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| SftpError::remote(path, &e))
    }

    fn remove_dir(&self, path: &str) -> Result<(), SftpError> {
        self.sftp
            .rmdir(Path::new(path))
            .map_err(|e| SftpError::remote(path, &e))
    }
}

/// Join a slash-relative suffix onto a remote root without doubling
/// separators.
pub fn join_remote(root: &str, rel: &str) -> String {
    if rel.is_empty() {
        return root.to_string();
    }
    let trimmed = root.trim_end_matches('/');
    format!("{trimmed}/{rel}")
}

fn hex_sha256(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_remote_normalizes_separators() {
        assert_eq!(join_remote("/mods", "cf/addons"), "/mods/cf/addons");
        assert_eq!(join_remote("/mods/", "cf"), "/mods/cf");
        assert_eq!(join_remote("/mods", ""), "/mods");
    }

    #[test]
    fn hex_sha256_is_lowercase_hex() {
        let digest = hex_sha256(b"abc");
        assert_eq!(
            digest,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
