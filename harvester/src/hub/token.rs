//! Bearer token held in memory and persisted under the data directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use zeroize::{Zeroize, ZeroizeOnDrop};

/// File name of the persisted bearer token inside the data directory.
pub const TOKEN_FILE_NAME: &str = "jwt-token";
const TOKEN_TMP_FILE_NAME: &str = "jwt-token.tmp";

/// Opaque credential issued by the hub. Never printed.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct BearerToken(String);

impl BearerToken {
    /// Wraps a token, returning `None` if it is empty.
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into();
        if token.is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    /// Returns the raw token for request decoration.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BearerToken(<redacted>)")
    }
}

/// Single-writer, multi-reader home of the bearer token.
///
/// Readers clone the token under a shared lock. A replacement swaps the token
/// under the exclusive lock and then rewrites `<data_dir>/jwt-token` outside
/// of it, so the file always holds either the previous or the new token.
#[derive(Debug)]
pub struct TokenStore {
    path: PathBuf,
    current: Arc<RwLock<Option<BearerToken>>>,
    persist: Arc<Mutex<()>>,
}

impl TokenStore {
    /// Opens the token file in `data_dir`, creating it empty with owner-only
    /// permissions if missing.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the directory is not writable or the file
    /// cannot be read.
    pub fn open(data_dir: &Path) -> io::Result<Self> {
        let path = data_dir.join(TOKEN_FILE_NAME);
        let current = match fs::read_to_string(&path) {
            Ok(contents) => BearerToken::new(contents.trim()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                create_owner_only(&path)?;
                None
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            path,
            current: Arc::new(RwLock::new(current)),
            persist: Arc::new(Mutex::new(())),
        })
    }

    /// Path of the persisted token.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns a copy of the current token.
    pub fn current(&self) -> Option<BearerToken> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publishes a new token in memory and persists it atomically.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the token could not be written. The in-memory
    /// token is replaced regardless.
    pub async fn replace(&self, token: BearerToken) -> io::Result<()> {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(token);

        let path = self.path.clone();
        let current = Arc::clone(&self.current);
        let lock = Arc::clone(&self.persist);
        // The write lock lives in the blocking task, so it is held until the
        // write finishes even if this future is dropped. Each writer persists
        // the token current at the time it acquires the lock.
        tokio::task::spawn_blocking(move || {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            let newest = current.read().unwrap_or_else(PoisonError::into_inner).clone();
            match newest {
                Some(token) => persist(&path, token.expose()),
                None => Ok(()),
            }
        })
        .await
        .map_err(io::Error::other)?
    }
}

fn create_owner_only(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let file = options.open(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    Ok(file)
}

fn persist(path: &Path, token: &str) -> io::Result<()> {
    let tmp = path.with_file_name(TOKEN_TMP_FILE_NAME);
    let mut file = create_owner_only(&tmp)?;
    file.write_all(token.as_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, path)?;

    #[cfg(unix)]
    if let Some(dir) = path.parent() {
        File::open(dir)?.sync_all()?;
    }
    Ok(())
}
