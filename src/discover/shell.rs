//! Shell-probe discovery: run every executable in a probe directory
//! and treat each non-empty line of standard output as a candidate
//! host.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::lookup_host;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::options::{bin_dir, service_ports};

use super::{run_probe, DiscoveryOptions, ProbeContext, CONNECT_TIMEOUT};

/// Where and how to look for probe commands.
#[derive(Clone, Debug)]
pub struct ShellOptions {
    /// Directory of executable probe scripts.
    pub path: PathBuf,
    /// Restrict the run to one command basename.
    pub command: Option<String>,
    pub timeout: Duration,
    pub max_workers: Option<usize>,
}

impl Default for ShellOptions {
    fn default() -> ShellOptions {
        ShellOptions {
            path: bin_dir().join("discover"),
            command: None,
            timeout: CONNECT_TIMEOUT,
            max_workers: None,
        }
    }
}

impl ShellOptions {
    /// Parse a mechanism string:
    /// `shell[,path=<dir>][,command=<name>][,timeout=<sec>][,maxThreads=<n>]`.
    pub fn parse(mechanism: &str) -> Result<ShellOptions> {
        let mut options = ShellOptions::default();
        for field in mechanism.split(',').skip(1) {
            if let Some(value) = field.strip_prefix("path=") {
                options.path = PathBuf::from(value);
            } else if let Some(value) = field.strip_prefix("command=") {
                options.command = Some(value.to_string());
            } else if let Some(value) = field.strip_prefix("timeout=") {
                let seconds: f64 = value
                    .parse()
                    .map_err(|_| Error::Config(format!("timeout '{}' is not valid", value)))?;
                options.timeout = Duration::from_secs_f64(seconds);
            } else if let Some(value) = field.strip_prefix("maxThreads=") {
                let count: usize = value
                    .parse()
                    .map_err(|_| Error::Config(format!("maxThreads '{}' is not valid", value)))?;
                if count == 0 {
                    return Err(Error::Config("maxThreads must be positive".to_string()));
                }
                options.max_workers = Some(count - 1);
            } else {
                return Err(Error::Config(format!("option '{}' is not valid", field)));
            }
        }
        Ok(options)
    }
}

/// Run one probe command and collect candidate hosts from its output.
async fn run_script(path: &Path, targets: &mut Vec<String>) {
    let output = match Command::new(path).output().await {
        Ok(output) => output,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "probe command failed to run");
            return;
        }
    };
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        let candidate = line.trim();
        if candidate.is_empty() {
            continue;
        }
        trace!(path = %path.display(), candidate, "probe candidate");
        if !targets.iter().any(|t| t == candidate) {
            targets.push(candidate.to_string());
        }
    }
}

/// Collect candidates from the probe directory, resolve each host
/// once, and sweep the resulting (address, port) pairs.
pub async fn shell_probe(
    service: &str,
    shell: &ShellOptions,
    options: &DiscoveryOptions,
) -> Result<Vec<String>> {
    let ports = service_ports(service);
    if ports.is_empty() {
        return Err(Error::Config(format!(
            "could not find ports for service '{}'",
            service
        )));
    }

    let mut targets: Vec<String> = Vec::new();
    let dir = match std::fs::read_dir(&shell.path) {
        Ok(dir) => dir,
        // no probe directory means no candidates, not a failure
        Err(_) => return Ok(Vec::new()),
    };
    for entry in dir.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if let Some(only) = &shell.command {
            if *only != name {
                continue;
            }
        }
        run_script(&entry.path(), &mut targets).await;
    }
    if targets.is_empty() {
        return Ok(Vec::new());
    }

    // resolve once per host, then enumerate every (address, port)
    let mut candidates: Vec<SocketAddr> = Vec::new();
    for target in &targets {
        for port in &ports {
            match lookup_host((target.as_str(), *port)).await {
                Ok(addrs) => candidates.extend(addrs),
                Err(e) => {
                    debug!(target = %target, error = %e, "candidate did not resolve");
                }
            }
        }
    }

    let total = candidates.len();
    let mut opts = options.clone();
    if let Some(bound) = shell.max_workers {
        opts.max_workers = opts.max_workers.min(bound);
    }
    let ctx = ProbeContext::new(
        service,
        Box::new(candidates.into_iter()),
        shell.timeout,
        opts,
    );
    run_probe(ctx, total).await
}
