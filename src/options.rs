//! Canonicalisation of environment and command-line inputs consumed by
//! the archive, request-port and context layers.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::timestamp::Timestamp;

/// Default client request ports for the known services.
pub const PMCD_PORT: u16 = 44321;
pub const PMPROXY_PORT: u16 = 44322;
pub const PMWEBAPI_PORT: u16 = 44323;

/// Candidate ports for a service: the comma-separated list from the
/// service's environment variable, with the default appended when
/// nothing parses.
pub fn service_ports(service: &str) -> Vec<u16> {
    let (var, default) = match service {
        "pmcd" => ("PMCD_PORT".to_string(), Some(PMCD_PORT)),
        "pmproxy" => ("PMPROXY_PORT".to_string(), Some(PMPROXY_PORT)),
        "pmwebapi" => ("PMWEBAPI_PORT".to_string(), Some(PMWEBAPI_PORT)),
        other => (format!("{}_PORT", other.to_uppercase()), None),
    };
    let mut ports: Vec<u16> = Vec::new();
    if let Ok(value) = std::env::var(&var) {
        for field in value.split(',') {
            match field.trim().parse::<u16>() {
                Ok(port) if port != 0 => {
                    if !ports.contains(&port) {
                        ports.push(port);
                    }
                }
                _ => warn!(var = %var, field, "ignoring unparsable port"),
            }
        }
    }
    if ports.is_empty() {
        if let Some(default) = default {
            ports.push(default);
        }
    }
    ports
}

fn env_dir(var: &str, fallback: &str) -> PathBuf {
    std::env::var_os(var)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(fallback))
}

pub fn log_dir() -> PathBuf {
    env_dir("PCP_LOG_DIR", "/var/log/pcp")
}

pub fn run_dir() -> PathBuf {
    env_dir("PCP_RUN_DIR", "/run/pcp")
}

pub fn bin_dir() -> PathBuf {
    env_dir("PCP_BIN_DIR", "/usr/libexec/pcp/bin")
}

/// The debug facilities named in `PCP_DEBUG`, comma separated.
pub fn debug_flags() -> Vec<String> {
    match std::env::var("PCP_DEBUG") {
        Err(_) => Vec::new(),
        Ok(value) => value
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

/// What kind of context the canonicalised options will open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    Host,
    Archive,
    Local,
}

/// A collector connection target, canonicalised from a host
/// specification.
///
/// Accepted forms: `hostname` (candidate ports from the pmcd port
/// list), `hostname:port`, a bare or bracketed IPv6 literal, `local:`
/// (the default local socket under the run directory), and
/// `unix:/path`.
#[derive(Clone, Debug, PartialEq)]
pub enum HostSpec {
    Inet { host: String, ports: Vec<u16> },
    Local { path: PathBuf },
}

/// Filename of the default local-filesystem socket.
pub const LOCAL_SOCKET: &str = "pmcd.socket";

impl HostSpec {
    pub fn parse(spec: &str) -> Result<HostSpec> {
        if let Some(path) = spec.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(Error::Config("empty local socket path".to_string()));
            }
            return Ok(HostSpec::Local {
                path: PathBuf::from(path),
            });
        }
        if let Some(path) = spec.strip_prefix("local:") {
            let path = if path.is_empty() {
                run_dir().join(LOCAL_SOCKET)
            } else {
                PathBuf::from(path)
            };
            return Ok(HostSpec::Local { path });
        }

        // bracketed IPv6 literal, with or without a port
        if let Some(rest) = spec.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| Error::Config(format!("bad host specification: {}", spec)))?;
            let ports = match tail.strip_prefix(':') {
                None if tail.is_empty() => service_ports("pmcd"),
                Some(port) => vec![parse_port(spec, port)?],
                _ => return Err(Error::Config(format!("bad host specification: {}", spec))),
            };
            return HostSpec::inet(spec, host, ports);
        }
        // a bare IPv6 literal has more than one colon and no port
        if spec.matches(':').count() > 1 {
            return HostSpec::inet(spec, spec, service_ports("pmcd"));
        }
        match spec.rsplit_once(':') {
            Some((host, port)) => HostSpec::inet(spec, host, vec![parse_port(spec, port)?]),
            None => HostSpec::inet(spec, spec, service_ports("pmcd")),
        }
    }

    fn inet(spec: &str, host: &str, ports: Vec<u16>) -> Result<HostSpec> {
        if host.is_empty() {
            return Err(Error::Config(format!("bad host specification: {}", spec)));
        }
        Ok(HostSpec::Inet {
            host: host.to_string(),
            ports,
        })
    }
}

fn parse_port(spec: &str, port: &str) -> Result<u16> {
    port.parse::<u16>()
        .map_err(|_| Error::Config(format!("bad port in host specification: {}", spec)))
}

/// Time-zone selection: the collector host's zone, or an explicit one.
#[derive(Clone, Debug, PartialEq)]
pub enum TimeZone {
    HostZone,
    Named(String),
}

/// The canonicalised option record.
#[derive(Clone, Debug, Default)]
pub struct Options {
    pub hosts: Vec<String>,
    pub archives: Vec<String>,
    pub timezone: Option<TimeZone>,
    pub start: Option<Timestamp>,
    pub finish: Option<Timestamp>,
    pub origin: Option<Timestamp>,
    pub samples: Option<u32>,
    pub interval: Option<f64>,
}

impl Options {
    pub fn new() -> Options {
        Options::default()
    }

    pub fn add_host(&mut self, host: &str) -> Result<()> {
        if !self.archives.is_empty() {
            return Err(Error::Config(
                "only one of hosts or archives allowed".to_string(),
            ));
        }
        self.hosts.push(host.to_string());
        Ok(())
    }

    pub fn add_archive(&mut self, path: &str) -> Result<()> {
        if !self.hosts.is_empty() {
            return Err(Error::Config(
                "only one of hosts or archives allowed".to_string(),
            ));
        }
        if !self.archives.iter().any(|a| a == path) {
            self.archives.push(path.to_string());
        }
        Ok(())
    }

    /// `-Z zone`: mutually exclusive with `-z`.
    pub fn set_timezone(&mut self, zone: &str) -> Result<()> {
        match self.timezone {
            Some(TimeZone::HostZone) => Err(Error::Config(
                "at most one of -Z and -z allowed".to_string(),
            )),
            _ => {
                self.timezone = Some(TimeZone::Named(zone.to_string()));
                Ok(())
            }
        }
    }

    /// `-z`: use the zone of the collector host.
    pub fn set_hostzone(&mut self) -> Result<()> {
        match self.timezone {
            Some(TimeZone::Named(_)) => Err(Error::Config(
                "at most one of -Z and -z allowed".to_string(),
            )),
            _ => {
                self.timezone = Some(TimeZone::HostZone);
                Ok(())
            }
        }
    }

    /// Read an archive folio and add every archive it names, resolved
    /// relative to the folio's directory.
    pub fn add_folio(&mut self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot open archive folio: {}", e)))?;
        let mut lines = content.lines();
        match lines.next() {
            Some(first) if first.starts_with("PCPFolio") => {}
            _ => return Err(Error::Config("archive folio has bad magic".to_string())),
        }
        match lines.next() {
            Some(second) if second.starts_with("Version: 1") => {}
            _ => {
                return Err(Error::Config(
                    "unknown version archive folio".to_string(),
                ))
            }
        }
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        for (lineno, line) in lines.enumerate() {
            let mut fields = line.split_whitespace();
            if fields.next() != Some("Archive:") {
                continue;
            }
            let _host = fields.next().ok_or_else(|| {
                Error::Config(format!("missing host on archive folio line {}", lineno + 3))
            })?;
            let log = fields.next().ok_or_else(|| {
                Error::Config(format!("missing path on archive folio line {}", lineno + 3))
            })?;
            let resolved = dir.join(log);
            self.add_archive(&resolved.to_string_lossy())?;
        }
        Ok(())
    }

    /// Canonicalise the argument-list subset consumed by the core:
    /// `-a` archive, `-F` folio, `-h` host, `-Z`/`-z` zones, `-S`/`-T`/
    /// `-O` window edges (seconds since the epoch), `-s` samples and
    /// `-t` interval.  Returns the arguments left over.  With
    /// `POSIXLY_CORRECT` set, parsing stops at the first non-option.
    pub fn parse_args(&mut self, args: &[String]) -> Result<Vec<String>> {
        fn seconds(value: &str) -> Result<Timestamp> {
            let secs: f64 = value
                .parse()
                .map_err(|_| Error::Config(format!("bad time specification: {}", value)))?;
            Ok(Timestamp::new(secs as i64, (secs.fract() * 1e9) as u32))
        }

        let posixly = std::env::var_os("POSIXLY_CORRECT").is_some();
        let mut rest = Vec::new();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            let (flag, inline) = match arg.strip_prefix('-') {
                Some(flag) if !flag.is_empty() => {
                    let (head, tail) = flag.split_at(1);
                    (head, if tail.is_empty() { None } else { Some(tail) })
                }
                _ => {
                    if posixly {
                        rest.push(arg.clone());
                        rest.extend(iter.cloned());
                        return Ok(rest);
                    }
                    rest.push(arg.clone());
                    continue;
                }
            };
            let mut value = || -> Result<String> {
                match inline {
                    Some(v) => Ok(v.to_string()),
                    None => iter
                        .next()
                        .cloned()
                        .ok_or_else(|| Error::Config(format!("-{} requires an argument", flag))),
                }
            };
            match flag {
                "a" => self.add_archive(&value()?)?,
                "F" => self.add_folio(Path::new(&value()?))?,
                "h" => self.add_host(&value()?)?,
                "Z" => self.set_timezone(&value()?)?,
                "z" => self.set_hostzone()?,
                "S" => self.start = Some(seconds(&value()?)?),
                "T" => self.finish = Some(seconds(&value()?)?),
                "O" => self.origin = Some(seconds(&value()?)?),
                "s" => {
                    self.samples = Some(value()?.parse().map_err(|_| {
                        Error::Config("bad sample count".to_string())
                    })?)
                }
                "t" => {
                    self.interval = Some(value()?.parse().map_err(|_| {
                        Error::Config("bad sampling interval".to_string())
                    })?)
                }
                other => {
                    return Err(Error::Config(format!("unknown option -{}", other)));
                }
            }
        }
        Ok(rest)
    }

    /// Validate against the context kind about to be opened.  The time
    /// window options are only legal for archive contexts.
    pub fn finalize(&self, kind: ContextKind) -> Result<()> {
        if kind != ContextKind::Archive
            && (self.start.is_some() || self.finish.is_some() || self.origin.is_some())
        {
            return Err(Error::Config(
                "time window options are only valid with archives".to_string(),
            ));
        }
        Ok(())
    }
}

/// Write the server's PID file under the run directory.  The caller
/// removes it at exit via [`remove_pid_file`].
pub fn create_pid_file(service: &str) -> Result<PathBuf> {
    let path = run_dir().join(format!("{}.pid", service));
    std::fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(path)
}

pub fn remove_pid_file(service: &str) {
    let path = run_dir().join(format!("{}.pid", service));
    if let Err(e) = std::fs::remove_file(&path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "cannot remove pid file");
        }
    }
}

/// Service-manager readiness: a datagram to `NOTIFY_SOCKET` when the
/// manager provided one, otherwise a no-op.
pub async fn notify_service_manager(message: &str) -> Result<()> {
    let path = match std::env::var_os("NOTIFY_SOCKET") {
        None => return Ok(()),
        Some(path) => path,
    };
    let socket = tokio::net::UnixDatagram::unbound()?;
    socket.send_to(message.as_bytes(), PathBuf::from(path)).await?;
    debug!(message, "notified service manager");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    #[serial(options_env)]
    fn port_lists_from_environment() {
        std::env::remove_var("PMCD_PORT");
        assert_eq!(service_ports("pmcd"), vec![PMCD_PORT]);

        std::env::set_var("PMCD_PORT", "9001,9002,bogus,9001");
        assert_eq!(service_ports("pmcd"), vec![9001, 9002]);

        std::env::set_var("PMCD_PORT", "nonsense");
        assert_eq!(service_ports("pmcd"), vec![PMCD_PORT]);
        std::env::remove_var("PMCD_PORT");

        assert!(service_ports("unheard-of").is_empty());
    }

    #[test]
    #[serial(options_env)]
    fn debug_flag_list() {
        std::env::set_var("PCP_DEBUG", "pdu, derive,indom");
        assert_eq!(debug_flags(), vec!["pdu", "derive", "indom"]);
        std::env::remove_var("PCP_DEBUG");
        assert!(debug_flags().is_empty());
    }

    #[test]
    #[serial(options_env)]
    fn argument_parsing() {
        std::env::remove_var("POSIXLY_CORRECT");
        let args: Vec<String> = ["-a", "/logs/one", "-z", "-S", "100.5", "-t", "2.5", "left"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut opts = Options::new();
        let rest = opts.parse_args(&args).unwrap();
        assert_eq!(opts.archives, vec!["/logs/one"]);
        assert_eq!(opts.timezone, Some(TimeZone::HostZone));
        assert_eq!(opts.start.unwrap().sec, 100);
        assert_eq!(opts.interval, Some(2.5));
        assert_eq!(rest, vec!["left"]);

        let mut opts = Options::new();
        assert!(opts.parse_args(&["-Q".to_string()]).is_err());
    }

    #[test]
    #[serial(options_env)]
    fn posixly_correct_stops_at_first_non_option() {
        std::env::set_var("POSIXLY_CORRECT", "1");
        let args: Vec<String> = ["-z", "target", "-a", "/logs/one"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut opts = Options::new();
        let rest = opts.parse_args(&args).unwrap();
        assert_eq!(rest, vec!["target", "-a", "/logs/one"]);
        assert!(opts.archives.is_empty());
        std::env::remove_var("POSIXLY_CORRECT");
    }

    #[test]
    #[serial(options_env)]
    fn host_specifications() {
        std::env::remove_var("PMCD_PORT");
        assert_eq!(
            HostSpec::parse("collector1").unwrap(),
            HostSpec::Inet {
                host: "collector1".to_string(),
                ports: vec![PMCD_PORT],
            }
        );
        assert_eq!(
            HostSpec::parse("collector1:9090").unwrap(),
            HostSpec::Inet {
                host: "collector1".to_string(),
                ports: vec![9090],
            }
        );
        assert_eq!(
            HostSpec::parse("::1").unwrap(),
            HostSpec::Inet {
                host: "::1".to_string(),
                ports: vec![PMCD_PORT],
            }
        );
        assert_eq!(
            HostSpec::parse("[::1]:9090").unwrap(),
            HostSpec::Inet {
                host: "::1".to_string(),
                ports: vec![9090],
            }
        );
        assert_eq!(
            HostSpec::parse("unix:/run/pm.socket").unwrap(),
            HostSpec::Local {
                path: PathBuf::from("/run/pm.socket"),
            }
        );
        match HostSpec::parse("local:").unwrap() {
            HostSpec::Local { path } => assert!(path.ends_with(LOCAL_SOCKET)),
            other => panic!("expected a local socket, got {:?}", other),
        }
        assert!(HostSpec::parse("").is_err());
        assert!(HostSpec::parse("unix:").is_err());
        assert!(HostSpec::parse("host:notaport").is_err());
        assert!(HostSpec::parse("[::1").is_err());
    }

    #[test]
    fn timezone_exclusivity() {
        let mut opts = Options::new();
        opts.set_hostzone().unwrap();
        assert!(opts.set_timezone("UTC").is_err());

        let mut opts = Options::new();
        opts.set_timezone("UTC").unwrap();
        assert!(opts.set_hostzone().is_err());
    }

    #[test]
    fn hosts_and_archives_are_exclusive() {
        let mut opts = Options::new();
        opts.add_host("collector1").unwrap();
        assert!(opts.add_archive("/logs/a").is_err());
    }

    #[test]
    fn window_only_for_archives() {
        let mut opts = Options::new();
        opts.start = Some(Timestamp::new(0, 0));
        assert!(opts.finalize(ContextKind::Host).is_err());
        assert!(opts.finalize(ContextKind::Archive).is_ok());
    }

    #[test]
    fn folio_parsing() {
        let dir = tempfile::tempdir().unwrap();
        let folio = dir.path().join("archives.folio");
        {
            let mut f = std::fs::File::create(&folio).unwrap();
            writeln!(f, "PCPFolio").unwrap();
            writeln!(f, "Version: 1").unwrap();
            writeln!(f, "Created: somewhen").unwrap();
            writeln!(f, "Archive: web1 20260801.0").unwrap();
            writeln!(f, "Archive: web2 sub/20260801.1").unwrap();
        }
        let mut opts = Options::new();
        opts.add_folio(&folio).unwrap();
        assert_eq!(opts.archives.len(), 2);
        assert!(opts.archives[0].ends_with("20260801.0"));
        assert!(opts.archives[1].ends_with("sub/20260801.1"));
    }

    #[test]
    fn folio_bad_magic() {
        let dir = tempfile::tempdir().unwrap();
        let folio = dir.path().join("bad.folio");
        std::fs::write(&folio, "NotAFolio\nVersion: 1\n").unwrap();
        let mut opts = Options::new();
        assert!(opts.add_folio(&folio).is_err());
    }

    #[test]
    fn folio_missing_path_field() {
        let dir = tempfile::tempdir().unwrap();
        let folio = dir.path().join("short.folio");
        std::fs::write(&folio, "PCPFolio\nVersion: 1\nArchive: onlyhost\n").unwrap();
        let mut opts = Options::new();
        assert!(opts.add_folio(&folio).is_err());
    }

    #[test]
    #[serial(options_env)]
    fn pid_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("PCP_RUN_DIR", dir.path());
        let path = create_pid_file("pmtestd").unwrap();
        assert!(path.exists());
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        remove_pid_file("pmtestd");
        assert!(!path.exists());
        std::env::remove_var("PCP_RUN_DIR");
    }

    #[tokio::test]
    #[serial(options_env)]
    async fn notify_without_socket_is_noop() {
        std::env::remove_var("NOTIFY_SOCKET");
        notify_service_manager("READY=1").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    #[serial(options_env)]
    async fn notify_sends_datagram() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notify.socket");
        let receiver = tokio::net::UnixDatagram::bind(&path).unwrap();
        std::env::set_var("NOTIFY_SOCKET", &path);
        notify_service_manager("READY=1").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"READY=1");
        std::env::remove_var("NOTIFY_SOCKET");
    }
}
