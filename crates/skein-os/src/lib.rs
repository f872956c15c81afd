#![deny(unsafe_code)]

//! Host platform queries over a skein bridge.
//!
//! Platform, architecture and kind are fetched once and cached; network
//! interfaces are shaped from the flat per-family listings the native side
//! reports into full interface records.

use parking_lot::Mutex;
use skein_session::{Bridge, BridgeError};
use skein_wire::{IpFamily, Method, Reply};

/// One address record of a network interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub address: String,
    pub netmask: String,
    pub family: IpFamily,
    pub internal: bool,
    pub cidr: String,
    pub mac: Option<String>,
}

#[derive(Default)]
struct PlatformCache {
    os: Option<String>,
    arch: Option<String>,
    kind: Option<String>,
}

/// Cached front for host queries.
pub struct Os {
    bridge: Bridge,
    cache: Mutex<PlatformCache>,
}

impl Os {
    pub fn new(bridge: Bridge) -> Self {
        Self {
            bridge,
            cache: Mutex::new(PlatformCache::default()),
        }
    }

    async fn fill_cache(&self) -> Result<(), BridgeError> {
        if self.cache.lock().os.is_some() {
            return Ok(());
        }
        let reply = self.bridge.submit(Method::PlatformInfo).await?;
        match reply {
            Reply::Platform { os, arch, kind } => {
                let mut cache = self.cache.lock();
                cache.os = Some(os);
                cache.arch = Some(normalize_arch(&arch));
                cache.kind = Some(proper_case(&kind));
                Ok(())
            }
            _ => Err(BridgeError::UnexpectedReply),
        }
    }

    /// Operating system name (`"linux"`, `"darwin"`, `"win32"`, ...).
    pub async fn platform(&self) -> Result<String, BridgeError> {
        self.fill_cache().await?;
        Ok(self.cache.lock().os.clone().unwrap_or_default())
    }

    /// Normalized processor architecture (`"x64"`, `"ia32"`, `"arm"`,
    /// `"arm64"`, ...).
    pub async fn arch(&self) -> Result<String, BridgeError> {
        self.fill_cache().await?;
        Ok(self.cache.lock().arch.clone().unwrap_or_default())
    }

    /// Proper-cased OS kind (`"Linux"`, `"Darwin"`, `"Windows"`, ...).
    pub async fn kind(&self) -> Result<String, BridgeError> {
        self.fill_cache().await?;
        Ok(self.cache.lock().kind.clone().unwrap_or_default())
    }

    /// Line terminator for the host platform.
    pub async fn eol(&self) -> Result<&'static str, BridgeError> {
        let kind = self.kind().await?;
        if kind.to_ascii_lowercase().contains("win") {
            Ok("\r\n")
        } else {
            Ok("\n")
        }
    }

    /// Network interfaces as shaped records.
    pub async fn network_interfaces(&self) -> Result<Vec<Interface>, BridgeError> {
        let reply = self.bridge.submit(Method::NetworkInterfaces).await?;
        let (ipv4, ipv6) = match reply {
            Reply::Interfaces { ipv4, ipv6 } => (ipv4, ipv6),
            _ => return Err(BridgeError::UnexpectedReply),
        };

        let mut out = Vec::with_capacity(ipv4.len() + ipv6.len());
        for (name, address) in ipv4 {
            out.push(shape_ipv4(name, address));
        }
        for (name, address) in ipv6 {
            out.push(shape_ipv6(name, address));
        }
        Ok(out)
    }
}

fn shape_ipv4(name: String, address: String) -> Interface {
    let mut internal = false;
    let mut netmask = "255.255.255.0".to_string();
    let mut cidr = format!("{address}/24");
    let mut mac = None;

    if address == "127.0.0.1" || address == "0.0.0.0" {
        internal = true;
        mac = Some("00:00:00:00:00:00".to_string());
        if address == "127.0.0.1" {
            cidr = "127.0.0.1/8".into();
            netmask = "255.0.0.0".into();
        } else {
            cidr = "0.0.0.0/0".into();
            netmask = "0.0.0.0".into();
        }
    }

    Interface {
        name,
        address,
        netmask,
        family: IpFamily::V4,
        internal,
        cidr,
        mac,
    }
}

fn shape_ipv6(name: String, address: String) -> Interface {
    let mut internal = false;
    let mut netmask = "ffff:ffff:ffff:ffff::".to_string();
    let mut cidr = format!("{address}/64");
    let mut mac = None;

    if address == "::1" {
        internal = true;
        netmask = "ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff".into();
        cidr = "::1/128".into();
        mac = Some("00:00:00:00:00:00".to_string());
    }

    Interface {
        name,
        address,
        netmask,
        family: IpFamily::V6,
        internal,
        cidr,
        mac,
    }
}

/// Normalize a raw architecture string to the conventional names.
///
/// `arm64` passes through untouched; `x86_64` becomes `x64`, `x86` becomes
/// `ia32`, and any other `arm*` collapses to `arm`.
pub fn normalize_arch(arch: &str) -> String {
    if arch == "arm64" {
        return arch.to_string();
    }
    match arch {
        "x86_64" => "x64".to_string(),
        "x86" => "ia32".to_string(),
        other if other.starts_with("arm") => "arm".to_string(),
        other => other.to_string(),
    }
}

fn proper_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_normalization_matches_convention() {
        assert_eq!(normalize_arch("x86_64"), "x64");
        assert_eq!(normalize_arch("x86"), "ia32");
        assert_eq!(normalize_arch("arm64"), "arm64");
        assert_eq!(normalize_arch("armv7l"), "arm");
        assert_eq!(normalize_arch("riscv64"), "riscv64");
    }

    #[test]
    fn loopback_v4_is_internal_with_class_a_mask() {
        let iface = shape_ipv4("lo".into(), "127.0.0.1".into());
        assert!(iface.internal);
        assert_eq!(iface.netmask, "255.0.0.0");
        assert_eq!(iface.cidr, "127.0.0.1/8");
        assert_eq!(iface.mac.as_deref(), Some("00:00:00:00:00:00"));
    }

    #[test]
    fn routable_v4_gets_slash_24_default() {
        let iface = shape_ipv4("en0".into(), "192.168.1.20".into());
        assert!(!iface.internal);
        assert_eq!(iface.cidr, "192.168.1.20/24");
        assert_eq!(iface.netmask, "255.255.255.0");
        assert!(iface.mac.is_none());
    }

    #[test]
    fn loopback_v6_is_internal_with_full_mask() {
        let iface = shape_ipv6("lo".into(), "::1".into());
        assert!(iface.internal);
        assert_eq!(iface.cidr, "::1/128");
    }

    #[test]
    fn proper_case_capitalizes_first_letter() {
        assert_eq!(proper_case("linux"), "Linux");
        assert_eq!(proper_case(""), "");
    }
}
