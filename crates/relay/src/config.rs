use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use clap::Parser;
use thiserror::Error;

/// Invalid user input caught at config construction; never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid bind address \"{0}\": expected host:port or [v6]:port")]
    MalformedBindSpec(String),
    #[error("invalid port in bind address \"{0}\"")]
    InvalidPort(String),
    #[error("could not resolve host in bind address \"{0}\"")]
    UnresolvableHost(String),
    #[error("no bind addresses given; at least one --bind is required")]
    NoBindAddresses,
}

/// Relays a remote named-pipe session to a local SOCKS-over-TCP listener.
#[derive(Debug, Parser)]
#[command(name = "relay", version, about)]
pub struct Cli {
    /// Remote host exposing the named-pipe server (UNC form: \\<host>\pipe\<name>).
    #[arg(long)]
    pub host: String,

    /// Named pipe base name, shared by both the read and write instances.
    #[arg(long, default_value = "rpc2socks")]
    pub pipe_name: String,

    /// Local address(es) to accept SOCKS/TCP clients on. May be repeated.
    /// Accepts `host:port` or `[v6]:port`; `*` or an empty host means wildcard.
    #[arg(long = "bind", required = true)]
    pub bind_specs: Vec<String>,

    /// Keep-alive ping interval in seconds. Omit to disable keep-alive pings.
    #[arg(long)]
    pub keep_alive_secs: Option<u64>,

    /// Log filter, passed to `tracing_subscriber::EnvFilter` (e.g. "debug",
    /// "relay_bridge=trace,info"). Overridden by the `RUST_LOG` env var.
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn read_pipe_name(&self) -> String {
        format!("\\\\{}\\pipe\\{}-in", self.host, self.pipe_name)
    }

    pub fn write_pipe_name(&self) -> String {
        format!("\\\\{}\\pipe\\{}-out", self.host, self.pipe_name)
    }

    pub fn bind_addrs(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        if self.bind_specs.is_empty() {
            return Err(ConfigError::NoBindAddresses);
        }
        self.bind_specs.iter().map(|spec| BindSpec::parse(spec)).collect()
    }
}

/// Parses a user-supplied `host:port` / `[v6]:port` bind specification into
/// a concrete [`SocketAddr`], resolving named hosts via the OS resolver and
/// preferring IPv4 when a name resolves to both families.
pub struct BindSpec;

impl BindSpec {
    pub fn parse(spec: &str) -> Result<SocketAddr, ConfigError> {
        let (host, port_str) = split_host_port(spec)?;
        let port: u16 = port_str
            .parse()
            .ok()
            .filter(|&p: &u16| p != 0)
            .ok_or_else(|| ConfigError::InvalidPort(spec.to_string()))?;

        if host.is_empty() || host == "*" {
            return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }

        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        resolve_preferring_v4(host, port).ok_or_else(|| ConfigError::UnresolvableHost(spec.to_string()))
    }
}

fn split_host_port(spec: &str) -> Result<(&str, &str), ConfigError> {
    if let Some(rest) = spec.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| ConfigError::MalformedBindSpec(spec.to_string()))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| ConfigError::MalformedBindSpec(spec.to_string()))?;
        return Ok((host, port));
    }

    spec.rsplit_once(':').ok_or_else(|| ConfigError::MalformedBindSpec(spec.to_string()))
}

fn resolve_preferring_v4(host: &str, port: u16) -> Option<SocketAddr> {
    let candidates = (host, port).to_socket_addrs().ok()?;
    let mut first_v6: Option<SocketAddr> = None;
    for addr in candidates {
        match addr.ip() {
            IpAddr::V4(_) => return Some(addr),
            IpAddr::V6(_) => first_v6.get_or_insert(addr),
        };
    }
    first_v6
}
