//! Password stores in the `htpasswd` and `htdigest` file formats.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Looks up stored password hashes.
pub trait UserDb: Send + Sync {
    /// The stored hash for `user` in `realm`.
    ///
    /// With `reload` set, a file backed store first picks up changes made
    /// to its file.
    fn get_passwd(&self, realm: &str, user: &str, reload: bool) -> io::Result<Option<String>>;
}

/// Look `user` up in `db`, off the executor when the lookup may read a file.
pub(crate) async fn lookup(
    db: &Arc<dyn UserDb>,
    realm: &str,
    user: &str,
    reload: bool,
) -> io::Result<Option<String>> {
    if !reload {
        return db.get_passwd(realm, user, false);
    }
    let db = db.clone();
    let realm = realm.to_owned();
    let user = user.to_owned();
    blocking::unblock(move || db.get_passwd(&realm, &user, true)).await
}

/// How [`Htpasswd::set_passwd`] hashes new passwords.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasswordHash {
    /// `$2y$` bcrypt.
    Bcrypt,
    /// `{SSHA256}`: salted SHA-256, base64 encoded with the salt appended.
    Ssha256,
}

pub(crate) const SSHA256_PREFIX: &str = "{SSHA256}";
const SALT_LEN: usize = 8;

/// Hash `password` with a fresh salt in the `{SSHA256}` format.
pub(crate) fn ssha256(password: &str) -> String {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    ssha256_with_salt(password, &salt)
}

fn ssha256_with_salt(password: &str, salt: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    hasher.update(salt);
    let mut raw = hasher.finalize().to_vec();
    raw.extend_from_slice(salt);
    format!("{}{}", SSHA256_PREFIX, STANDARD.encode(raw))
}

/// Check `password` against an `{SSHA256}` hash.
pub(crate) fn verify_ssha256(password: &str, hash: &str) -> bool {
    let encoded = match hash.strip_prefix(SSHA256_PREFIX) {
        Some(encoded) => encoded,
        None => return false,
    };
    let raw = match STANDARD.decode(encoded) {
        Ok(raw) if raw.len() > 32 => raw,
        _ => return false,
    };
    ssha256_with_salt(password, &raw[32..]) == hash
}

/// The lower-case hex MD5 digest of `data`.
pub(crate) fn md5_hex(data: impl AsRef<[u8]>) -> String {
    let digest = Md5::digest(data.as_ref());
    let mut out = String::with_capacity(32);
    for byte in digest.iter() {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}

/// The file a store is backed by, and when it was last read.
#[derive(Debug)]
struct Backing {
    path: PathBuf,
    mtime: Option<SystemTime>,
}

impl Backing {
    fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn is_stale(&self) -> bool {
        self.modified() != self.mtime
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn malformed(path: &Path, line: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}:{}: malformed entry", path.display(), line),
    )
}

/// Write `contents` next to `path` and move it into place.
fn replace_file(path: &Path, contents: &str) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

/// `user:hash` lines, as written by `htpasswd`.
///
/// Hashes are bcrypt (`$2a$`, `$2b$` or `$2y$`) or `{SSHA256}`. Files with
/// `{SHA}` or `$apr1$` entries are refused when read.
#[derive(Debug)]
pub struct Htpasswd {
    backing: Option<Mutex<Backing>>,
    users: Mutex<BTreeMap<String, String>>,
    password_hash: PasswordHash,
}

impl Htpasswd {
    /// Read the file at `path`. A missing file is an empty store that
    /// [`flush`](Self::flush) creates.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut backing = Backing {
            path: path.into(),
            mtime: None,
        };
        let users = Self::read(&mut backing)?;
        Ok(Self {
            backing: Some(Mutex::new(backing)),
            users: Mutex::new(users),
            password_hash: PasswordHash::Bcrypt,
        })
    }

    /// A store that lives in memory only.
    pub fn in_memory() -> Self {
        Self {
            backing: None,
            users: Mutex::new(BTreeMap::new()),
            password_hash: PasswordHash::Bcrypt,
        }
    }

    /// Hash new passwords with `hash`.
    pub fn with_password_hash(mut self, hash: PasswordHash) -> Self {
        self.password_hash = hash;
        self
    }

    fn read(backing: &mut Backing) -> io::Result<BTreeMap<String, String>> {
        let mtime = backing.modified();
        let contents = match fs::read_to_string(&backing.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };
        let mut users = BTreeMap::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (user, hash) = line
                .split_once(':')
                .ok_or_else(|| malformed(&backing.path, n + 1))?;
            if hash.starts_with("{SHA}") || hash.starts_with("$apr1$") {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!(
                        "{}:{}: unsupported password hash for {}",
                        backing.path.display(),
                        n + 1,
                        user
                    ),
                ));
            }
            users.insert(user.to_owned(), hash.to_owned());
        }
        backing.mtime = mtime;
        Ok(users)
    }

    /// Re-read the backing file if it changed since it was last read.
    pub fn reload(&mut self) -> io::Result<()> {
        if let Some(backing) = self.backing.as_mut() {
            let backing = backing.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
            if backing.is_stale() {
                let users = Self::read(backing)?;
                *lock(&self.users) = users;
            }
        }
        Ok(())
    }

    /// Like [`reload`](Self::reload), through a shared reference.
    fn refresh(&self) -> io::Result<()> {
        if let Some(backing) = &self.backing {
            let mut backing = lock(backing);
            if backing.is_stale() {
                let users = Self::read(&mut backing)?;
                *lock(&self.users) = users;
            }
        }
        Ok(())
    }

    /// Hash and store a password.
    pub fn set_passwd(&self, user: &str, password: &str) -> io::Result<()> {
        let hash = match self.password_hash {
            PasswordHash::Bcrypt => bcrypt::hash(password, bcrypt::DEFAULT_COST)
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?,
            PasswordHash::Ssha256 => ssha256(password),
        };
        self.set_hash(user, hash);
        Ok(())
    }

    /// Store an already hashed password.
    pub fn set_hash(&self, user: &str, hash: impl Into<String>) {
        lock(&self.users).insert(user.to_owned(), hash.into());
    }

    /// Remove a user. Returns whether it existed.
    pub fn delete_passwd(&self, user: &str) -> bool {
        lock(&self.users).remove(user).is_some()
    }

    /// The stored user names, sorted.
    pub fn users(&self) -> Vec<String> {
        lock(&self.users).keys().cloned().collect()
    }

    /// Write the store back to its file.
    pub fn flush(&mut self) -> io::Result<()> {
        let contents: String = lock(&self.users)
            .iter()
            .map(|(user, hash)| format!("{}:{}\n", user, hash))
            .collect();
        if let Some(backing) = self.backing.as_mut() {
            let backing = backing.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
            replace_file(&backing.path, &contents)?;
            backing.mtime = backing.modified();
        }
        Ok(())
    }
}

impl UserDb for Htpasswd {
    fn get_passwd(&self, _realm: &str, user: &str, reload: bool) -> io::Result<Option<String>> {
        if reload {
            self.refresh()?;
        }
        Ok(lock(&self.users).get(user).cloned())
    }
}

/// `user:realm:ha1` lines, as written by `htdigest`, where `ha1` is the hex
/// MD5 of `user:realm:password`.
#[derive(Debug)]
pub struct Htdigest {
    backing: Option<Mutex<Backing>>,
    users: Mutex<BTreeMap<(String, String), String>>,
}

impl Htdigest {
    /// Read the file at `path`. A missing file is an empty store.
    pub fn open(path: impl Into<PathBuf>) -> io::Result<Self> {
        let mut backing = Backing {
            path: path.into(),
            mtime: None,
        };
        let users = Self::read(&mut backing)?;
        Ok(Self {
            backing: Some(Mutex::new(backing)),
            users: Mutex::new(users),
        })
    }

    /// A store that lives in memory only.
    pub fn in_memory() -> Self {
        Self {
            backing: None,
            users: Mutex::new(BTreeMap::new()),
        }
    }

    fn read(backing: &mut Backing) -> io::Result<BTreeMap<(String, String), String>> {
        let mtime = backing.modified();
        let contents = match fs::read_to_string(&backing.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err),
        };
        let mut users = BTreeMap::new();
        for (n, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(user), Some(realm), Some(ha1)) => {
                    users.insert((realm.to_owned(), user.to_owned()), ha1.to_owned());
                }
                _ => return Err(malformed(&backing.path, n + 1)),
            }
        }
        backing.mtime = mtime;
        Ok(users)
    }

    /// Re-read the backing file if it changed since it was last read.
    pub fn reload(&mut self) -> io::Result<()> {
        if let Some(backing) = self.backing.as_mut() {
            let backing = backing.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
            if backing.is_stale() {
                let users = Self::read(backing)?;
                *lock(&self.users) = users;
            }
        }
        Ok(())
    }

    /// Like [`reload`](Self::reload), through a shared reference.
    fn refresh(&self) -> io::Result<()> {
        if let Some(backing) = &self.backing {
            let mut backing = lock(backing);
            if backing.is_stale() {
                let users = Self::read(&mut backing)?;
                *lock(&self.users) = users;
            }
        }
        Ok(())
    }

    /// Store the digest of a password.
    pub fn set_passwd(&self, realm: &str, user: &str, password: &str) {
        let ha1 = md5_hex(format!("{}:{}:{}", user, realm, password));
        lock(&self.users).insert((realm.to_owned(), user.to_owned()), ha1);
    }

    /// Remove a user from a realm. Returns whether it existed.
    pub fn delete_passwd(&self, realm: &str, user: &str) -> bool {
        lock(&self.users)
            .remove(&(realm.to_owned(), user.to_owned()))
            .is_some()
    }

    /// The stored `(realm, user)` pairs, sorted.
    pub fn users(&self) -> Vec<(String, String)> {
        lock(&self.users).keys().cloned().collect()
    }

    /// Write the store back to its file.
    pub fn flush(&mut self) -> io::Result<()> {
        let contents: String = lock(&self.users)
            .iter()
            .map(|((realm, user), ha1)| format!("{}:{}:{}\n", user, realm, ha1))
            .collect();
        if let Some(backing) = self.backing.as_mut() {
            let backing = backing.get_mut().unwrap_or_else(|poisoned| poisoned.into_inner());
            replace_file(&backing.path, &contents)?;
            backing.mtime = backing.modified();
        }
        Ok(())
    }
}

impl UserDb for Htdigest {
    fn get_passwd(&self, realm: &str, user: &str, reload: bool) -> io::Result<Option<String>> {
        let key = (realm.to_owned(), user.to_owned());
        if reload {
            self.refresh()?;
        }
        Ok(lock(&self.users).get(&key).cloned())
    }
}
