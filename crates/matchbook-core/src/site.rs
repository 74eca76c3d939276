//! Origin and site extraction for rate-limit keys and ledger rows.
//!
//! App URIs (`android-app://com.example.shop`) key on the package
//! base; web URIs key on scheme + registrable domain. Registrable
//! domains are approximated by the last two host labels, which is
//! sufficient for rate-limit bucketing without carrying a public
//! suffix list.

use url::Url;

use crate::source::Surface;

/// Scheme + authority, with path/query/fragment stripped.
pub fn base_origin(uri: &str) -> Option<String> {
    let url = Url::parse(uri).ok()?;
    let host = url.host_str()?;
    Some(format!("{}://{}", url.scheme(), host))
}

/// The rate-limit site for a URI on the given surface.
pub fn top_private_site(uri: &str, surface: Surface) -> Option<String> {
    match surface {
        Surface::App => base_origin(uri),
        Surface::Web => {
            let url = Url::parse(uri).ok()?;
            let host = url.host_str()?;
            Some(format!("{}://{}", url.scheme(), registrable_domain(host)))
        }
    }
}

fn registrable_domain(host: &str) -> &str {
    if host.parse::<std::net::IpAddr>().is_ok() {
        return host;
    }
    let mut labels = host.rsplitn(3, '.');
    match (labels.next(), labels.next()) {
        (Some(tld), Some(domain)) => &host[host.len() - domain.len() - tld.len() - 1..],
        _ => host,
    }
}
