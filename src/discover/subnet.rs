//! Subnet sweep: enumerate every address of `addr/maskbits` and try
//! each candidate port.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::options::service_ports;

use super::{run_probe, DiscoveryOptions, ProbeContext, CONNECT_TIMEOUT};

/// The probed subnet plus per-sweep tuning.
#[derive(Clone, Debug)]
pub struct SubnetOptions {
    pub addr: IpAddr,
    pub mask_bits: u32,
    pub timeout: Duration,
    pub max_workers: Option<usize>,
}

impl SubnetOptions {
    /// Parse a mechanism string of the form
    /// `probe=<addr>/<maskbits>[,timeout=<sec>][,maxThreads=<n>]`.
    pub fn parse(mechanism: &str) -> Result<SubnetOptions> {
        let spec = mechanism
            .strip_prefix("probe=")
            .ok_or_else(|| Error::Config("probe mechanism without an argument".to_string()))?;
        let mut fields = spec.split(',');
        let subnet = fields
            .next()
            .ok_or_else(|| Error::Config("no subnet provided".to_string()))?;
        let (addr, bits) = match subnet.split_once('/') {
            Some(pair) => pair,
            None => return Err(Error::Config("no subnet mask provided".to_string())),
        };
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| Error::Config(format!("address '{}' is not valid", addr)))?;
        let mask_bits: u32 = bits
            .parse()
            .map_err(|_| Error::Config(format!("subnet mask '{}' is not valid", bits)))?;

        let mut options = SubnetOptions {
            addr,
            mask_bits,
            timeout: CONNECT_TIMEOUT,
            max_workers: None,
        };
        for field in fields {
            if let Some(value) = field.strip_prefix("timeout=") {
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
                // the calling task participates too
                options.max_workers = Some(count - 1);
            } else {
                return Err(Error::Config(format!("option '{}' is not valid", field)));
            }
        }
        options.validate()?;
        Ok(options)
    }

    fn validate(&self) -> Result<()> {
        let limit = match self.addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        if self.mask_bits > limit {
            return Err(Error::Config(format!(
                "subnet mask must be <= {} bits",
                limit
            )));
        }
        Ok(())
    }

    fn subnet_size(&self) -> u128 {
        let host_bits = match self.addr {
            IpAddr::V4(_) => 32 - self.mask_bits,
            IpAddr::V6(_) => 128 - self.mask_bits,
        };
        if host_bits >= 127 {
            u128::MAX
        } else {
            1u128 << host_bits
        }
    }
}

/// Iterator over every address in the subnet.
enum SubnetIter {
    V4 { next: u64, last: u32 },
    V6 { next: u128, last: u128, done: bool },
}

impl SubnetIter {
    fn new(options: &SubnetOptions) -> SubnetIter {
        match options.addr {
            IpAddr::V4(addr) => {
                let base = u32::from(addr);
                let mask = if options.mask_bits == 0 {
                    0
                } else {
                    u32::MAX << (32 - options.mask_bits)
                };
                SubnetIter::V4 {
                    next: (base & mask) as u64,
                    last: base | !mask,
                }
            }
            IpAddr::V6(addr) => {
                let base = u128::from(addr);
                let mask = if options.mask_bits == 0 {
                    0
                } else {
                    u128::MAX << (128 - options.mask_bits)
                };
                SubnetIter::V6 {
                    next: base & mask,
                    last: base | !mask,
                    done: false,
                }
            }
        }
    }
}

impl Iterator for SubnetIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        match self {
            SubnetIter::V4 { next, last } => {
                if *next > *last as u64 {
                    return None;
                }
                let addr = Ipv4Addr::from(*next as u32);
                *next += 1;
                Some(IpAddr::V4(addr))
            }
            SubnetIter::V6 { next, last, done } => {
                if *done {
                    return None;
                }
                let addr = Ipv6Addr::from(*next);
                if *next >= *last {
                    *done = true;
                } else {
                    *next += 1;
                }
                Some(IpAddr::V6(addr))
            }
        }
    }
}

/// Probe the subnet for the requested service; discovered endpoints
/// come back as URLs.
pub async fn subnet_probe(
    service: &str,
    subnet: &SubnetOptions,
    options: &DiscoveryOptions,
) -> Result<Vec<String>> {
    subnet.validate()?;
    let ports = service_ports(service);
    if ports.is_empty() {
        return Err(Error::Config(format!(
            "could not find ports for service '{}'",
            service
        )));
    }

    let nports = ports.len();
    let addrs = SubnetIter::new(subnet);
    let targets = addrs
        .flat_map(move |addr| ports.clone().into_iter().map(move |p| SocketAddr::new(addr, p)));

    let candidates = (subnet.subnet_size().min(1 << 20) as usize) * nports;
    let mut opts = options.clone();
    if let Some(bound) = subnet.max_workers {
        opts.max_workers = opts.max_workers.min(bound);
    }
    // no point running more workers than addresses
    opts.max_workers = opts
        .max_workers
        .min(subnet.subnet_size().saturating_sub(1).min(usize::MAX as u128) as usize);

    let ctx = ProbeContext::new(service, Box::new(targets), subnet.timeout, opts);
    run_probe(ctx, candidates).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mechanism_parsing() {
        let opts = SubnetOptions::parse("probe=192.168.1.0/24").unwrap();
        assert_eq!(opts.mask_bits, 24);
        assert_eq!(opts.timeout, CONNECT_TIMEOUT);

        let opts = SubnetOptions::parse("probe=10.0.0.0/8,timeout=0.5,maxThreads=4").unwrap();
        assert_eq!(opts.timeout, Duration::from_millis(500));
        assert_eq!(opts.max_workers, Some(3));

        assert!(SubnetOptions::parse("probe=10.0.0.0").is_err());
        assert!(SubnetOptions::parse("probe=10.0.0.0/33").is_err());
        assert!(SubnetOptions::parse("probe=::1/129").is_err());
        assert!(SubnetOptions::parse("nonsense").is_err());
        assert!(SubnetOptions::parse("probe=10.0.0.0/8,bogus=1").is_err());
    }

    #[test]
    fn v4_enumeration_covers_the_subnet() {
        let opts = SubnetOptions {
            addr: "192.168.1.17".parse().unwrap(),
            mask_bits: 30,
            timeout: CONNECT_TIMEOUT,
            max_workers: None,
        };
        let addrs: Vec<IpAddr> = SubnetIter::new(&opts).collect();
        assert_eq!(
            addrs,
            vec![
                "192.168.1.16".parse::<IpAddr>().unwrap(),
                "192.168.1.17".parse().unwrap(),
                "192.168.1.18".parse().unwrap(),
                "192.168.1.19".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn v6_enumeration() {
        let opts = SubnetOptions {
            addr: "fe80::4".parse().unwrap(),
            mask_bits: 126,
            timeout: CONNECT_TIMEOUT,
            max_workers: None,
        };
        let addrs: Vec<IpAddr> = SubnetIter::new(&opts).collect();
        assert_eq!(addrs.len(), 4);
        assert_eq!(addrs[0], "fe80::4".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn sweep_finds_a_listener_on_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        std::env::set_var("PMTEST_PORT", port.to_string());
        let subnet = SubnetOptions {
            addr: "127.0.0.1".parse().unwrap(),
            mask_bits: 32,
            timeout: Duration::from_millis(100),
            max_workers: None,
        };
        let urls = subnet_probe("pmtest", &subnet, &DiscoveryOptions::default())
            .await
            .unwrap();
        assert_eq!(urls, vec![format!("pmtest://127.0.0.1:{}", port)]);
        std::env::remove_var("PMTEST_PORT");
    }
}
