use std::collections::BTreeMap;
use taskgate_storage::auth::TWO_FACTOR_KEY;
use taskgate_storage::AuthCredentialStore;

use super::{load_environment, read_secrets_from_stdin, Credentials};

/// Runs `f` against the store, then closes it whatever `f` returned.
fn with_store<T>(f: impl FnOnce(&AuthCredentialStore) -> anyhow::Result<T>) -> anyhow::Result<T> {
    let (_, paths) = load_environment()?;
    let credentials = Credentials::open(&paths)?;
    let result = f(&credentials.store());
    credentials.close();
    result
}

pub fn save(reference: &str, username: &str, two_factor: bool) -> anyhow::Result<()> {
    let prompt = if two_factor {
        "Reading password, then two-factor secret, from stdin..."
    } else {
        "Reading password from stdin..."
    };
    eprintln!("{}", prompt);
    let secrets = read_secrets_from_stdin(if two_factor { 2 } else { 1 })?;

    with_store(|store| {
        let mut extra = BTreeMap::new();
        if two_factor {
            extra.insert(TWO_FACTOR_KEY.to_string(), secrets[1].to_string());
        }
        let info = store.save_auth(reference, username, &secrets[0], &extra);
        // The map is plain String; clear it before it drops.
        for value in extra.values_mut() {
            zeroize::Zeroize::zeroize(value);
        }
        let info = info?;

        println!("Saved '{}' ({} fields)", reference, info.keys.len());
        Ok(())
    })
}

pub fn list() -> anyhow::Result<()> {
    with_store(|store| {
        let refs = store.list_auth()?;
        if refs.is_empty() {
            println!("No stored logins.");
            return Ok(());
        }
        println!("Stored logins ({}):", refs.len());
        for reference in refs {
            println!("  {}", reference);
        }
        Ok(())
    })
}

pub fn info(reference: &str) -> anyhow::Result<()> {
    with_store(|store| {
        let info = store
            .auth_info(reference)?
            .ok_or_else(|| anyhow::anyhow!("No stored login named '{}'", reference))?;
        println!("{}", serde_json::to_string_pretty(&info)?);
        Ok(())
    })
}

pub fn delete(reference: &str) -> anyhow::Result<()> {
    with_store(|store| {
        if store.delete_auth(reference)? {
            println!("Deleted '{}'", reference);
        } else {
            println!("No stored login named '{}'", reference);
        }
        Ok(())
    })
}

pub fn set_key(provider: &str) -> anyhow::Result<()> {
    eprintln!("Reading {} API key from stdin...", provider);
    let secrets = read_secrets_from_stdin(1)?;
    with_store(|store| {
        store.save_api_key(provider, &secrets[0])?;
        println!("Saved API key for {}", provider);
        Ok(())
    })
}

pub fn delete_key(provider: &str) -> anyhow::Result<()> {
    with_store(|store| {
        if store.delete_api_key(provider)? {
            println!("Deleted API key for {}", provider);
        } else {
            println!("No stored API key for {}", provider);
        }
        Ok(())
    })
}
