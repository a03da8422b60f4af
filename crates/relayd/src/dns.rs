use hickory_resolver::TokioAsyncResolver;
use std::net::IpAddr;
use std::sync::LazyLock;

static RESOLVER: LazyLock<Option<TokioAsyncResolver>> = LazyLock::new(|| {
    match TokioAsyncResolver::tokio_from_system_conf() {
        Ok(resolver) => Some(resolver),
        Err(err) => {
            tracing::warn!("no usable system DNS configuration, reverse lookups disabled: {err:#}");
            None
        }
    }
});

/// Best-effort PTR lookup for the XCLIENT NAME attribute. Any failure
/// is reported as None; the caller substitutes the unavailable marker.
pub async fn reverse_lookup(ip: IpAddr) -> Option<String> {
    let resolver = RESOLVER.as_ref()?;
    match resolver.reverse_lookup(ip).await {
        Ok(names) => names
            .iter()
            .next()
            .map(|ptr| ptr.0.to_utf8().trim_end_matches('.').to_string()),
        Err(err) => {
            tracing::debug!("reverse lookup for {ip} failed: {err:#}");
            None
        }
    }
}
