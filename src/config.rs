//! Environment configuration for the krakend daemon and the krakenctl CLI.

use std::env;

use anyhow::{bail, Context};
use url::Url;

/// Address to bind the admin API to.
pub const ENV_KRAKEN_ADDR: &str = "KRAKEN_ADDR";
/// Base URL the admin API is reachable on; used for `Location` headers and
/// by the CLI.
pub const ENV_KRAKEN_URL: &str = "KRAKEN_URL";

pub const DEFAULT_ADDR: &str = "localhost:4214";
pub const DEFAULT_URL: &str = "http://localhost:4214";

/// Daemon configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Admin bind address.
    pub addr: String,
    /// Base URL override; when absent the daemon derives it from the bound
    /// address.
    pub base_url: Option<Url>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let addr = env::var(ENV_KRAKEN_ADDR)
            .ok()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let base_url = match env::var(ENV_KRAKEN_URL).ok().filter(|v| !v.is_empty()) {
            Some(raw) => Some(parse_base_url(&raw)?),
            None => None,
        };
        Ok(Self { addr, base_url })
    }
}

/// The API URL the CLI talks to: `KRAKEN_URL`, or the default.
pub fn client_url() -> anyhow::Result<Url> {
    let raw = env::var(ENV_KRAKEN_URL)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_URL.to_string());
    parse_base_url(&raw)
}

fn parse_base_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid URL {:?}", raw))?;
    if url.cannot_be_a_base() || !url.has_host() {
        bail!("{} is not an absolute URL", url);
    }
    if url.path() != "/" && !url.path().is_empty() {
        bail!("{} has a path, which is not allowed", url);
    }
    Ok(url)
}
