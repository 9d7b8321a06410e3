pub mod check_url;
pub mod credentials_cmd;
pub mod run_cmd;
pub mod tools_cmd;

use std::io::BufRead;
use std::sync::Arc;
use taskgate_core::{Config, Paths};
use taskgate_storage::{AuthCredentialStore, EncryptedFileStore};
use tracing::debug;
use zeroize::Zeroizing;

/// Config from `~/.taskgate/config.json`, with the directories created.
pub(crate) fn load_environment() -> anyhow::Result<(Config, Paths)> {
    let paths = Paths::new();
    paths.ensure_dirs()?;
    let config = Config::load_or_default(&paths)?;
    Ok((config, paths))
}

/// The encrypted credential store for one command. Hand out views with
/// [`Credentials::store`]; [`Credentials::close`] wipes the key.
pub(crate) struct Credentials {
    file: Arc<EncryptedFileStore>,
}

impl Credentials {
    pub(crate) fn open(paths: &Paths) -> anyhow::Result<Self> {
        let file = EncryptedFileStore::open(paths.credentials_dir(), &paths.credential_key_file())?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    pub(crate) fn store(&self) -> AuthCredentialStore {
        AuthCredentialStore::new(self.file.clone())
    }

    /// Views still alive keep the key until the last one drops.
    pub(crate) fn close(self) {
        match Arc::try_unwrap(self.file) {
            Ok(file) => file.close(),
            Err(_) => debug!("Credential store still referenced, key wiped on last drop"),
        }
    }
}

/// Reads up to `count` lines from `reader`, trailing newline stripped.
/// Missing lines come back empty.
pub(crate) fn read_secret_lines<R: BufRead>(
    mut reader: R,
    count: usize,
) -> anyhow::Result<Vec<Zeroizing<String>>> {
    let mut lines = Vec::with_capacity(count);
    for _ in 0..count {
        let mut line = Zeroizing::new(String::new());
        reader.read_line(&mut line)?;
        let trimmed = line.trim_end_matches(['\r', '\n']).len();
        line.truncate(trimmed);
        lines.push(line);
    }
    Ok(lines)
}

pub(crate) fn read_secrets_from_stdin(count: usize) -> anyhow::Result<Vec<Zeroizing<String>>> {
    let stdin = std::io::stdin();
    read_secret_lines(stdin.lock(), count)
}
