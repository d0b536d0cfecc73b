//! Credential resolution for fetches.
//!
//! Resolution order, for whatever the transport allows: explicit SSH key,
//! SSH agent, bare username, credentials file, `GIT_USERNAME`/`GIT_PASSWORD`
//! environment variables, then the library default. The credentials file is
//! read lazily on the first callback that needs a password; environment
//! variables are read on every callback so runtime changes take effect.

use git2::{Cred, CredentialType};
use std::cell::OnceCell;
use std::path::PathBuf;

#[derive(Debug, Clone, Default)]
pub struct CredentialConfig {
    pub ssh_public_key: PathBuf,
    pub ssh_private_key: PathBuf,
    pub credential_file: PathBuf,
}

/// First two non-empty-stripped lines of the credentials file: username then
/// password.
fn read_credential_file(path: &PathBuf) -> Option<(String, String)> {
    let contents = std::fs::read_to_string(path).ok()?;
    let mut lines = contents.lines();
    let user = lines.next()?.trim().to_string();
    let pass = lines.next()?.trim().to_string();
    if user.is_empty() {
        return None;
    }
    Some((user, pass))
}

/// Build the callback handed to libgit2 for one fetch.
pub fn credential_callback(
    cfg: &CredentialConfig,
) -> impl FnMut(&str, Option<&str>, CredentialType) -> Result<Cred, git2::Error> + '_ {
    let file_creds: OnceCell<Option<(String, String)>> = OnceCell::new();
    move |_url, username_from_url, allowed| {
        let env_user = std::env::var("GIT_USERNAME").ok();
        let env_pass = std::env::var("GIT_PASSWORD").ok();
        let user = username_from_url
            .map(str::to_string)
            .or_else(|| env_user.clone());

        if allowed.contains(CredentialType::SSH_KEY) {
            if let Some(user) = &user {
                if !cfg.ssh_private_key.as_os_str().is_empty() {
                    let public = if cfg.ssh_public_key.as_os_str().is_empty() {
                        None
                    } else {
                        Some(cfg.ssh_public_key.as_path())
                    };
                    if let Ok(cred) = Cred::ssh_key(user, public, &cfg.ssh_private_key, None) {
                        return Ok(cred);
                    }
                }
                if let Ok(cred) = Cred::ssh_key_from_agent(user) {
                    return Ok(cred);
                }
            }
        }
        if allowed.contains(CredentialType::USERNAME) {
            if let Some(user) = &user {
                if let Ok(cred) = Cred::username(user) {
                    return Ok(cred);
                }
            }
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) {
            if !cfg.credential_file.as_os_str().is_empty() {
                let cached =
                    file_creds.get_or_init(|| read_credential_file(&cfg.credential_file));
                if let Some((user, pass)) = cached {
                    return Cred::userpass_plaintext(user, pass);
                }
            }
            if let (Some(user), Some(pass)) = (&env_user, &env_pass) {
                return Cred::userpass_plaintext(user, pass);
            }
        }
        Cred::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_file_parsing() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("creds");
        std::fs::write(&file, "alice\nsecret\nextra line ignored\n").unwrap();
        assert_eq!(
            read_credential_file(&file),
            Some(("alice".to_string(), "secret".to_string()))
        );
    }

    #[test]
    fn credential_file_requires_two_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("creds");
        std::fs::write(&file, "only-user\n").unwrap();
        assert_eq!(read_credential_file(&file), None);
        assert_eq!(read_credential_file(&tmp.path().join("missing")), None);
    }

    #[test]
    fn callback_yields_username_credential_when_allowed() {
        let cfg = CredentialConfig::default();
        let mut cb = credential_callback(&cfg);
        let cred = cb("https://example.com/r.git", Some("bob"), CredentialType::USERNAME);
        assert!(cred.is_ok());
    }

    #[test]
    fn callback_uses_credential_file_for_userpass() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("creds");
        std::fs::write(&file, "alice\nsecret\n").unwrap();
        let cfg = CredentialConfig {
            credential_file: file,
            ..CredentialConfig::default()
        };
        let mut cb = credential_callback(&cfg);
        let cred = cb(
            "https://example.com/r.git",
            None,
            CredentialType::USER_PASS_PLAINTEXT,
        );
        assert!(cred.is_ok());
    }
}
