use std::net::IpAddr;

use ipnet::IpNet;
use tracing::*;

use super::store::KeyOptions;
use super::AuthError;

/// Resolve one `from=` token into CIDR ranges.
///
/// `*` covers both address families, CIDR literals pass through, bare
/// IP literals widen to a host route, and anything else goes through
/// the system resolver (one host route per returned address).
pub async fn parse_address(token: &str) -> Result<Vec<IpNet>, AuthError> {
    if token == "*" {
        return Ok(vec!["0.0.0.0/0".parse().unwrap(), "::/0".parse().unwrap()]);
    }

    if let Ok(net) = token.parse::<IpNet>() {
        return Ok(vec![net]);
    }

    // A scoped IPv6 literal keeps only its address portion.
    let bare = token.split('%').next().unwrap_or(token);
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return Ok(vec![IpNet::from(ip)]);
    }

    let addrs = tokio::net::lookup_host((token, 0))
        .await
        .map_err(|_| AuthError::UnresolvableAddress(token.to_string()))?
        .map(|addr| IpNet::from(addr.ip()))
        .collect::<Vec<_>>();

    if addrs.is_empty() {
        return Err(AuthError::UnresolvableAddress(token.to_string()));
    }
    Ok(addrs)
}

/// Split a `from=` value into deny (`!`-prefixed) and allow ranges.
/// Tokens that fail to resolve are logged and skipped.
pub async fn parse_from_directive(value: &str) -> (Vec<IpNet>, Vec<IpNet>) {
    let mut deny = Vec::new();
    let mut allow = Vec::new();

    for token in value.trim_matches('"').split(',') {
        if token.is_empty() {
            continue;
        }
        if let Some(negated) = token.strip_prefix('!') {
            match parse_address(negated).await {
                Ok(nets) => deny.extend(nets),
                Err(error) => warn!(%error, token = negated, "Unusable deny list entry"),
            }
        } else {
            match parse_address(token).await {
                Ok(nets) => allow.extend(nets),
                Err(error) => warn!(%error, token, "Unusable allow list entry"),
            }
        }
    }

    (deny, allow)
}

/// Deny entries win outright; an empty allow list admits any source.
pub fn evaluate(opts: &KeyOptions, src: IpAddr) -> Result<(), AuthError> {
    if opts.deny_list.iter().any(|net| net.contains(&src)) {
        return Err(AuthError::DeniedIp);
    }

    if opts.allow_list.is_empty() || opts.allow_list.iter().any(|net| net.contains(&src)) {
        return Ok(());
    }

    Err(AuthError::NotOnAllowList)
}
