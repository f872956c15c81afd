//! Host-name resolution seam.
//!
//! DNS is an external collaborator, not part of this crate. The default
//! [`LiteralResolver`] accepts address literals and fails anything else;
//! applications wire a real resolver through
//! [`EndpointConfig::resolver`](crate::EndpointConfig).

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;

use crate::error::DgramError;

/// Resolve a destination host to an address literal before dispatch.
pub trait Resolve: Send + Sync {
    /// Resolve `host` to an address string the native side accepts.
    fn lookup<'a>(
        &'a self,
        host: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, DgramError>> + Send + 'a>>;
}

/// Accepts IPv4/IPv6 literals verbatim; anything needing actual DNS fails
/// with a resolution error.
pub struct LiteralResolver;

impl Resolve for LiteralResolver {
    fn lookup<'a>(
        &'a self,
        host: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, DgramError>> + Send + 'a>> {
        Box::pin(async move {
            if host.parse::<IpAddr>().is_ok() {
                Ok(host.to_string())
            } else {
                Err(DgramError::Resolution(host.to_string()))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literals_pass_through() {
        let r = LiteralResolver;
        assert_eq!(r.lookup("127.0.0.1").await.unwrap(), "127.0.0.1");
        assert_eq!(r.lookup("::1").await.unwrap(), "::1");
    }

    #[tokio::test]
    async fn host_names_fail_resolution() {
        let r = LiteralResolver;
        assert_eq!(
            r.lookup("example.com").await,
            Err(DgramError::Resolution("example.com".into()))
        );
    }
}
