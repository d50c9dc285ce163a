//! Command-line configuration.
//!
//! The binary takes five positional arguments:
//! `web-cache <listen-addr> <proxy-addr> <policy> <cache-size-mb>
//! <expiration-seconds>`. Both addresses must resolve; the proxy address is
//! the authority substituted into rewritten URLs. Cache size is megabytes
//! and becomes the byte budget here, so the rest of the crate only ever
//! deals in bytes. Any invalid argument is fatal at startup.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};

use crate::policy::PolicyKind;

pub const USAGE: &str = "Usage: web-cache [listen-addr] [proxy-addr] [replacement-policy] [cache-size-mb] [expiration-seconds]";

/// Parsed and validated startup configuration.
#[derive(Clone, Debug)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub proxy_addr: SocketAddr,
    pub policy: PolicyKind,
    /// Byte budget for the memory cache.
    pub max_capacity: u64,
    /// TTL stamped onto every entry at admission.
    pub expiration: Duration,
    /// Directory holding the disk cache, journal, and index files.
    pub cache_root: PathBuf,
}

impl Config {
    /// Parses the positional arguments (program name excluded).
    pub fn from_args(args: impl IntoIterator<Item = String>) -> Result<Self> {
        let args: Vec<String> = args.into_iter().collect();
        if args.len() != 5 {
            bail!("{USAGE}");
        }

        let listen_addr = resolve(&args[0]).context("invalid [listen-addr]")?;
        let proxy_addr = resolve(&args[1]).context("invalid [proxy-addr]")?;
        let policy: PolicyKind = args[2].parse()?;
        let size_mb: u64 = args[3].parse().context("invalid parameter [cache-size-mb]")?;
        let expiration_secs: u64 = args[4]
            .parse()
            .context("invalid value for [expiration-seconds]")?;

        Ok(Self {
            listen_addr,
            proxy_addr,
            policy,
            max_capacity: size_mb * 1_000_000,
            expiration: Duration::from_secs(expiration_secs),
            cache_root: PathBuf::from("cache"),
        })
    }
}

fn resolve(addr: &str) -> Result<SocketAddr> {
    addr.to_socket_addrs()
        .with_context(|| format!("resolving {addr}"))?
        .next()
        .ok_or_else(|| anyhow!("address {addr} did not resolve"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_valid_arguments() {
        let config = Config::from_args(args(&[
            "127.0.0.1:8080",
            "127.0.0.1:9000",
            "LRU",
            "10",
            "300",
        ]))
        .unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.proxy_addr.port(), 9000);
        assert_eq!(config.policy, PolicyKind::Lru);
        assert_eq!(config.max_capacity, 10_000_000);
        assert_eq!(config.expiration, Duration::from_secs(300));
    }

    #[test]
    fn rejects_wrong_argument_count() {
        let err = Config::from_args(args(&["127.0.0.1:8080"])).unwrap_err();
        assert!(err.to_string().contains("Usage"));
    }

    #[test]
    fn rejects_unknown_policy() {
        assert!(
            Config::from_args(args(&[
                "127.0.0.1:8080",
                "127.0.0.1:9000",
                "FIFO",
                "10",
                "300",
            ]))
            .is_err()
        );
    }

    #[test]
    fn rejects_negative_or_garbage_numbers() {
        for bad in ["-1", "ten", ""] {
            assert!(
                Config::from_args(args(&[
                    "127.0.0.1:8080",
                    "127.0.0.1:9000",
                    "LRU",
                    bad,
                    "300",
                ]))
                .is_err()
            );
        }
    }

    #[test]
    fn rejects_unresolvable_address() {
        assert!(
            Config::from_args(args(&["not an address", "127.0.0.1:9000", "LRU", "10", "0"]))
                .is_err()
        );
    }
}
