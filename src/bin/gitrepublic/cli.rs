use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(
    author,
    version,
    help_template = "{name} {version}\nnostr-authenticated git hosting gateway\n - serves git smart-HTTP under /<npub>/<repo>.git\n - authorizes pushes with NIP-98 events signed by the repo owner or maintainers\n - ownership, maintainer lists and branch protection live on nostr relays\n\n{usage}\n{all-args}"
)]
#[command(propagate_version = true)]
pub struct Cli {
    /// address to listen on
    #[arg(short, long, default_value = "0.0.0.0:3030")]
    pub listen: String,
    /// root directory for bare repositories (overrides GIT_REPO_ROOT)
    #[arg(long)]
    pub repo_root: Option<PathBuf>,
    /// public domain requests are signed against (overrides GIT_DOMAIN)
    #[arg(long)]
    pub domain: Option<String>,
    /// relays consulted when announcements carry no hints
    #[arg(long = "relay")]
    pub relays: Vec<String>,
    /// nsec or hex private key for relay AUTH and server-side publishing
    #[arg(short, long)]
    pub nsec: Option<String>,
}
