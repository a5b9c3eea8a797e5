#![cfg_attr(not(test), warn(clippy::pedantic))]
#![cfg_attr(not(test), warn(clippy::expect_used))]

use std::{
    env,
    io::Read,
    str::FromStr,
};

use anyhow::{bail, Context, Result};
use base64::Engine;
use nostr::JsonUtil;
use nostr_sdk::{Kind, Tag, TagKind};
use zeroize::Zeroize;

use protocol::{resolve_target, CredentialRequest};

mod protocol;

/// Environment variables consulted for the signing key, in order.
const KEY_ENV_VARS: [&str; 4] = [
    "NOSTRGIT_SECRET_KEY_CLIENT",
    "NOSTRGIT_SECRET_KEY",
    "NOSTR_PRIVATE_KEY",
    "NSEC",
];

fn main() -> Result<()> {
    let subcommand = env::args().nth(1).unwrap_or_default();
    match subcommand.as_str() {
        "get" => get(),
        // credentials are minted per request; there is nothing to cache
        "store" | "erase" => Ok(()),
        other => bail!("unknown subcommand '{other}'; expected get, store or erase"),
    }
}

fn get() -> Result<()> {
    let mut input = String::new();
    std::io::stdin()
        .read_to_string(&mut input)
        .context("failed to read credential request from stdin")?;
    let request = CredentialRequest::parse(&input);
    let target = resolve_target(&request, path_from_local_remote)?;

    let keys = load_keys()?;
    let event = nostr_sdk::EventBuilder::new(Kind::Custom(27235), "")
        .tags(vec![
            Tag::custom(
                TagKind::Custom(std::borrow::Cow::Borrowed("u")),
                vec![target.url.clone()],
            ),
            Tag::custom(
                TagKind::Custom(std::borrow::Cow::Borrowed("method")),
                vec![target.method.to_string()],
            ),
        ])
        .sign_with_keys(&keys)
        .context("failed to sign authorization event")?;

    print!(
        "username=nostr\npassword={}\n",
        base64::engine::general_purpose::STANDARD.encode(event.as_json())
    );
    Ok(())
}

fn load_keys() -> Result<nostr::Keys> {
    for var in KEY_ENV_VARS {
        if let Ok(mut raw) = env::var(var) {
            let keys = nostr::Keys::from_str(raw.trim())
                .context(format!("{var} is not a valid nsec or hex key"));
            raw.zeroize();
            return keys;
        }
    }
    bail!(
        "no signing key found; set one of {}",
        KEY_ENV_VARS.join(", ")
    );
}

/// When git offers no `path` attribute (some auth retries), recover it from
/// the repository the user is standing in: the first remote URL on the
/// given host.
fn path_from_local_remote(host: &str) -> Option<String> {
    let repo = git2::Repository::discover(env::current_dir().ok()?).ok()?;
    let remotes = repo.remotes().ok()?;
    for remote_name in remotes.iter().flatten() {
        let Ok(remote) = repo.find_remote(remote_name) else {
            continue;
        };
        let Some(url) = remote.url() else {
            continue;
        };
        if let Some((_, rest)) = url.split_once("://") {
            if let Some(path) = rest.strip_prefix(&format!("{host}/")) {
                return Some(path.to_string());
            }
        }
    }
    None
}
