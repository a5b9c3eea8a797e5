use std::collections::HashMap;

use anyhow::{bail, Context, Result};

/// Attributes of one git credential-protocol request: `key=value` lines
/// terminated by a blank line. `wwwauth[]` may repeat.
#[derive(Debug, Default)]
pub struct CredentialRequest {
    pub attributes: HashMap<String, String>,
    pub wwwauth: Vec<String>,
}

impl CredentialRequest {
    pub fn parse(input: &str) -> Self {
        let mut request = CredentialRequest::default();
        for line in input.lines() {
            if line.is_empty() {
                break;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            if key == "wwwauth[]" {
                request.wwwauth.push(value.to_string());
            } else {
                request
                    .attributes
                    .insert(key.to_string(), value.to_string());
            }
        }
        request
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// The request git is actually about to send, recovered from the
/// credential attributes: full URL plus the HTTP method to bind into the
/// signed event.
#[derive(Debug, PartialEq, Eq)]
pub struct SignedTarget {
    pub url: String,
    pub method: &'static str,
}

/// Work out the URL and method to sign for. git will not re-invoke the
/// helper between the receive-pack advertisement and the push POST, so an
/// advertisement for git-receive-pack is signed for the eventual push
/// endpoint instead.
pub fn resolve_target(
    request: &CredentialRequest,
    local_remote_path: impl Fn(&str) -> Option<String>,
) -> Result<SignedTarget> {
    let url = match request.get("url") {
        Some(url) => url.to_string(),
        None => {
            let protocol = request
                .get("protocol")
                .context("credential request has no protocol")?;
            let host = request.get("host").context("credential request has no host")?;
            let path = match request.get("path") {
                Some(path) => path.trim_start_matches('/').to_string(),
                None if !request.wwwauth.is_empty() => local_remote_path(host)
                    .context("no path attribute and no matching local remote")?,
                None => bail!("credential request has no path"),
            };
            let query = request
                .get("query")
                .map(|q| format!("?{q}"))
                .unwrap_or_default();
            format!("{protocol}://{host}/{path}{query}")
        }
    };

    Ok(select_method(&url))
}

fn select_method(url: &str) -> SignedTarget {
    if let Some(prefix) = url.strip_suffix("/info/refs?service=git-receive-pack") {
        return SignedTarget {
            url: format!("{prefix}/git-receive-pack"),
            method: "POST",
        };
    }
    if url.contains("git-receive-pack") {
        SignedTarget {
            url: url.to_string(),
            method: "POST",
        }
    } else {
        // upload-pack and everything else is a read
        SignedTarget {
            url: url.to_string(),
            method: "GET",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_local_remote(_host: &str) -> Option<String> {
        None
    }

    #[test]
    fn parses_attributes_and_wwwauth() {
        let request = CredentialRequest::parse(
            "protocol=https\nhost=example.org\nwwwauth[]=Basic realm=\"GitRepublic\"\nwwwauth[]=Negotiate\n\nignored=after-blank\n",
        );
        assert_eq!(request.get("protocol"), Some("https"));
        assert_eq!(request.wwwauth.len(), 2);
        assert!(request.get("ignored").is_none());
    }

    #[test]
    fn push_path_selects_post() {
        let request = CredentialRequest::parse(
            "protocol=https\nhost=example.org\npath=npub1abc/repo.git/git-receive-pack\n",
        );
        let target = resolve_target(&request, no_local_remote).unwrap();
        assert_eq!(
            target,
            SignedTarget {
                url: "https://example.org/npub1abc/repo.git/git-receive-pack".to_string(),
                method: "POST",
            }
        );
    }

    #[test]
    fn fetch_path_selects_get() {
        let request = CredentialRequest::parse(
            "protocol=https\nhost=example.org\npath=npub1abc/repo.git/git-upload-pack\n",
        );
        let target = resolve_target(&request, no_local_remote).unwrap();
        assert_eq!(target.method, "GET");
    }

    #[test]
    fn receive_pack_advertisement_is_rewritten_to_the_push_endpoint() {
        let request = CredentialRequest::parse(
            "protocol=https\nhost=example.org\npath=npub1abc/repo.git/info/refs\nquery=service=git-receive-pack\n",
        );
        let target = resolve_target(&request, no_local_remote).unwrap();
        assert_eq!(
            target,
            SignedTarget {
                url: "https://example.org/npub1abc/repo.git/git-receive-pack".to_string(),
                method: "POST",
            }
        );
    }

    #[test]
    fn explicit_url_attribute_wins() {
        let request = CredentialRequest::parse(
            "url=https://example.org/npub1abc/repo.git/git-receive-pack\nprotocol=http\nhost=wrong\n",
        );
        let target = resolve_target(&request, no_local_remote).unwrap();
        assert_eq!(
            target.url,
            "https://example.org/npub1abc/repo.git/git-receive-pack"
        );
    }

    #[test]
    fn missing_path_recovers_from_local_remote_when_challenged() {
        let request =
            CredentialRequest::parse("protocol=https\nhost=example.org\nwwwauth[]=Basic realm=\"GitRepublic\"\n");
        let target = resolve_target(&request, |host| {
            assert_eq!(host, "example.org");
            Some("npub1abc/repo.git".to_string())
        })
        .unwrap();
        assert_eq!(target.url, "https://example.org/npub1abc/repo.git");
    }

    #[test]
    fn missing_path_without_challenge_is_an_error() {
        let request = CredentialRequest::parse("protocol=https\nhost=example.org\n");
        assert!(resolve_target(&request, no_local_remote).is_err());
    }
}
