//! Daemon configuration: environment snapshot, optionally overridden by CLI
//! flags before the server starts.
use std::env;
use std::path::PathBuf;

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_BIND_HOST: &str = "127.0.0.1";
pub const DEFAULT_IMAGE: &str = "adz/cli-runner:latest";

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind_host: String,
    pub image: String,
    /// Seconds of inactivity before a run is reaped; 0 disables the reaper.
    pub idle_timeout_sec: u64,
    pub allow_workspace_roots: Vec<PathBuf>,
    pub allow_creds_roots: Vec<PathBuf>,
    pub verbose: bool,
}

fn parse_roots(raw: &str) -> Vec<PathBuf> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .collect()
}

fn default_roots() -> Vec<PathBuf> {
    home::home_dir().map(|h| vec![h]).unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Config {
        let port = env::var("PORT")
            .ok()
            .and_then(|s| s.trim().parse::<u16>().ok())
            .unwrap_or(DEFAULT_PORT);
        let bind_host =
            env::var("BIND_HOST").unwrap_or_else(|_| DEFAULT_BIND_HOST.to_string());
        let image =
            env::var("CLI_RUNNER_IMAGE").unwrap_or_else(|_| DEFAULT_IMAGE.to_string());
        let idle_timeout_sec = env::var("IDLE_TIMEOUT_SEC")
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0);

        let allow_workspace_roots = env::var("ALLOW_WORKSPACE_ROOTS")
            .ok()
            .map(|s| parse_roots(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_roots);
        let allow_creds_roots = env::var("ALLOW_CREDS_ROOTS")
            .ok()
            .map(|s| parse_roots(&s))
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_roots);

        Config {
            port,
            bind_host,
            image,
            idle_timeout_sec,
            allow_workspace_roots,
            allow_creds_roots,
            verbose: env::var("ADZ_RUNNER_VERBOSE").ok().as_deref() == Some("1"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_roots_splits_and_trims() {
        let roots = parse_roots("/a, /b/c ,,/d");
        assert_eq!(
            roots,
            vec![PathBuf::from("/a"), PathBuf::from("/b/c"), PathBuf::from("/d")]
        );
    }

    #[test]
    fn test_parse_roots_empty() {
        assert!(parse_roots("").is_empty());
        assert!(parse_roots(" , ").is_empty());
    }
}
