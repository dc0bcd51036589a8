//! Validating DNS resolver plugged into the `reqwest::Client`.
//!
//! This is the only place sockets get an address: resolving here and letting
//! reqwest connect to exactly what we resolved closes the TOCTOU window
//! between "checked an address" and "connected to an address" (§3 invariant,
//! §8 law). A resolver that rejected the hostname but let a later, separate
//! lookup pick a different address would reopen it.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use reqwest::dns::{Addrs, Name, Resolve, Resolving};

use crate::blocklist::is_blocked;

#[derive(Debug)]
pub(crate) struct DnsFailedMarker;

impl fmt::Display for DnsFailedMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns resolution failed")
    }
}
impl std::error::Error for DnsFailedMarker {}

#[derive(Debug)]
pub(crate) struct BlockedAddressMarker;

impl fmt::Display for BlockedAddressMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "resolved address is in a blocked range")
    }
}
impl std::error::Error for BlockedAddressMarker {}

/// Walks a `reqwest::Error`'s source chain looking for one of the markers
/// above, so the caller can recover `DnsFailed` / `BlockedAddress` from what
/// reqwest otherwise reports as an opaque connect error.
pub(crate) fn classify_source(err: &(dyn std::error::Error + 'static)) -> Option<&'static str> {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if e.downcast_ref::<DnsFailedMarker>().is_some() {
            return Some("dns_failed");
        }
        if e.downcast_ref::<BlockedAddressMarker>().is_some() {
            return Some("blocked_address");
        }
        cur = e.source();
    }
    None
}

#[derive(Clone, Default)]
pub(crate) struct ValidatingResolver;

impl Resolve for ValidatingResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let lookup = format!("{host}:0");
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host(lookup)
                .await
                .map_err(|_| Box::new(DnsFailedMarker) as Box<dyn std::error::Error + Send + Sync>)?
                .collect();

            if resolved.is_empty() {
                return Err(Box::new(DnsFailedMarker) as Box<dyn std::error::Error + Send + Sync>);
            }
            if resolved.iter().any(|a| is_blocked(a.ip())) {
                return Err(Box::new(BlockedAddressMarker) as Box<dyn std::error::Error + Send + Sync>);
            }

            let addrs: Addrs = Box::new(resolved.into_iter());
            Ok(addrs)
        })
    }
}

pub(crate) fn resolver() -> Arc<dyn Resolve> {
    Arc::new(ValidatingResolver)
}
