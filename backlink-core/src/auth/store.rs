use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use russh::keys::PublicKey;
use tracing::*;

use super::{acl, AuthError};

/// Options attached to one accepted key in an authorized-keys file.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct KeyOptions {
    pub comment: String,
    pub allow_list: Vec<IpNet>,
    pub deny_list: Vec<IpNet>,
    pub owners: Vec<String>,
}

impl fmt::Display for KeyOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if !self.allow_list.is_empty() || !self.deny_list.is_empty() {
            let tokens = self
                .allow_list
                .iter()
                .map(ToString::to_string)
                .chain(self.deny_list.iter().map(|net| format!("!{net}")))
                .collect::<Vec<_>>();
            parts.push(format!("from=\"{}\"", tokens.join(",")));
        }

        if !self.owners.is_empty() {
            let owners = serde_json::to_string(&self.owners).map_err(|_| fmt::Error)?;
            parts.push(format!("owner={owners}"));
        }

        write!(f, "{}", parts.join(","))
    }
}

/// One key store, loaded fresh from disk. The map key is the wire
/// encoding of the public key, so two keys collide exactly when their
/// marshalled form is byte-identical.
pub type KeyStore = HashMap<Vec<u8>, KeyOptions>;

/// Check one store for `key` presented from `src`.
///
/// `insecure` bypasses the store entirely and admits the key with
/// default options. A store whose file does not exist is treated as a
/// miss; an unreadable or malformed file is a hard error.
pub async fn check_store(
    path: &Path,
    key: &PublicKey,
    src: IpAddr,
    insecure: bool,
) -> Result<KeyOptions, AuthError> {
    if insecure {
        return Ok(KeyOptions::default());
    }

    if !path.is_file() {
        return Err(AuthError::KeyNotInList);
    }

    let store = load_key_file(path).await?;
    let blob = key_blob(key)?;
    let opts = store.get(&blob).ok_or(AuthError::KeyNotInList)?;

    acl::evaluate(opts, src)?;
    Ok(opts.clone())
}

pub async fn load_key_file(path: &Path) -> Result<KeyStore, AuthError> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| AuthError::UnreadableKeyFile {
            path: path.to_path_buf(),
            source,
        })?;

    let mut store = KeyStore::new();

    for (index, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (blob, opts) =
            parse_line(line)
                .await
                .map_err(|reason| AuthError::MalformedKeyLine {
                    path: path.to_path_buf(),
                    line: index + 1,
                    reason,
                })?;
        store.insert(blob, opts);
    }

    Ok(store)
}

pub(super) fn key_blob(key: &PublicKey) -> Result<Vec<u8>, AuthError> {
    key.to_bytes()
        .map_err(|e| AuthError::KeyEncoding(e.to_string()))
}

async fn parse_line(line: &str) -> Result<(Vec<u8>, KeyOptions), String> {
    let fields = tokenize(line);

    let key_index = fields
        .iter()
        .position(|f| {
            f.starts_with("ssh-") || f.starts_with("ecdsa-") || f.starts_with("sk-")
        })
        .ok_or_else(|| "no key type token".to_string())?;

    let mut opts = match key_index {
        0 => KeyOptions::default(),
        1 => parse_options(&fields[0]).await,
        _ => return Err("unrecognized options prefix".to_string()),
    };

    let blob64 = fields
        .get(key_index + 1)
        .ok_or_else(|| "missing key data".to_string())?;
    let key = PublicKey::from_openssh(&format!("{} {}", fields[key_index], blob64))
        .map_err(|e| e.to_string())?;

    if fields.len() > key_index + 2 {
        opts.comment = fields[key_index + 2..].join(" ");
    }

    let blob = key.to_bytes().map_err(|e| e.to_string())?;
    Ok((blob, opts))
}

/// Parse a comma-separated option list. Only `from=` and `owner=` are
/// recognized; everything else is ignored.
async fn parse_options(options: &str) -> KeyOptions {
    let mut opts = KeyOptions::default();

    for option in split_option_list(options) {
        let Some((name, value)) = option.split_once('=') else {
            continue;
        };
        let value = value
            .trim_matches('\'')
            .trim_matches('"');

        match name {
            "from" => {
                let (deny, allow) = acl::parse_from_directive(value).await;
                opts.deny_list.extend(deny);
                opts.allow_list.extend(allow);
            }
            "owner" => opts.owners = parse_owner_directive(value),
            _ => {}
        }
    }

    opts
}

fn parse_owner_directive(value: &str) -> Vec<String> {
    match serde_json::from_str(value) {
        Ok(owners) => owners,
        Err(error) => {
            warn!(%error, value, "Unable to parse owner directive");
            Vec::new()
        }
    }
}

/// Split a line into whitespace-separated fields, keeping quoted spans
/// (either quote style) intact.
fn tokenize(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_double = false;
    let mut in_single = false;

    for ch in line.chars() {
        match ch {
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_double && !in_single => {
                if !current.is_empty() {
                    fields.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        fields.push(current);
    }
    fields
}

/// Split an option list on commas that sit outside quotes and brackets.
fn split_option_list(options: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_double = false;
    let mut in_single = false;
    let mut depth = 0usize;

    for ch in options.chars() {
        match ch {
            '"' if !in_single => {
                in_double = !in_double;
                current.push(ch);
            }
            '\'' if !in_double => {
                in_single = !in_single;
                current.push(ch);
            }
            '[' if !in_double && !in_single => {
                depth += 1;
                current.push(ch);
            }
            ']' if !in_double && !in_single => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if !in_double && !in_single && depth == 0 => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
