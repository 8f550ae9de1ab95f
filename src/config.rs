//! Configuration file loading and CLI merging
//!
//! Values come from three layers: command-line arguments (or their
//! environment variables), an optional YAML file, then built-in defaults.
//! The first layer that sets a value wins.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use toh_client::ClientConfig;
use toh_server::{normalize_path, ServerConfig};
use url::Url;

/// Configuration file format
#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub client: ClientSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub path: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ClientSection {
    pub port: Option<u16>,
    pub url: Option<String>,
    pub target: Option<String>,
    pub max_chain: Option<usize>,
}

/// Server values given on the command line
#[derive(Debug, Default)]
pub struct ServerArgs {
    pub port: Option<u16>,
    pub path: Option<String>,
}

/// Client values given on the command line
#[derive(Debug, Default)]
pub struct ClientArgs {
    pub port: Option<u16>,
    pub url: Option<String>,
    pub target: Option<String>,
    pub max_chain: Option<usize>,
}

/// Load configuration from a YAML file
pub fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn listen_on(port: u16) -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], port))
}

pub fn build_server_config(args: ServerArgs, file: ServerSection) -> ServerConfig {
    let defaults = ServerConfig::default();

    let port = args
        .port
        .or(file.port)
        .unwrap_or(defaults.listen_addr.port());
    let path = args.path.or(file.path).unwrap_or(defaults.path);

    ServerConfig {
        listen_addr: listen_on(port),
        path: normalize_path(&path),
    }
}

pub fn build_client_config(args: ClientArgs, file: ClientSection) -> Result<ClientConfig> {
    let defaults = ClientConfig::default();

    let port = args
        .port
        .or(file.port)
        .unwrap_or(defaults.listen_addr.port());
    let url = args.url.or(file.url).unwrap_or_default();
    let target = args.target.or(file.target).unwrap_or(defaults.target);
    let max_chain = args
        .max_chain
        .or(file.max_chain)
        .unwrap_or(defaults.max_chain);

    if url.is_empty() {
        anyhow::bail!(
            "Proxy server url is required (use --url, TOH_URL or config file), \
             example: http://localhost:9000/proxy"
        );
    }
    validate_url(&url)?;
    validate_address(&target, "target")?;

    Ok(ClientConfig {
        listen_addr: listen_on(port),
        url,
        target,
        max_chain,
        ..defaults
    })
}

/// Validate the proxy url (http or https with a host)
fn validate_url(url: &str) -> Result<()> {
    let parsed = Url::parse(url).with_context(|| format!("Invalid proxy url '{}'", url))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("Invalid proxy url '{}' (expected http:// or https://)", url);
    }

    if parsed.host_str().map_or(true, str::is_empty) {
        anyhow::bail!("Invalid proxy url '{}' (host cannot be empty)", url);
    }

    Ok(())
}

/// Validate address format (should be host:port)
pub fn validate_address(addr: &str, addr_type: &str) -> Result<()> {
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
        anyhow::anyhow!(
            "Invalid {} address format: '{}' (expected format: host:port)",
            addr_type,
            addr
        )
    })?;

    if host.is_empty() {
        anyhow::bail!(
            "Invalid {} address format: '{}' (host cannot be empty)",
            addr_type,
            addr
        );
    }

    port.parse::<u16>()
        .with_context(|| format!("Invalid port in {} address: {}", addr_type, addr))?;

    Ok(())
}
