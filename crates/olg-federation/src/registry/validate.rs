//! Input validation for registry fields.

use super::RegistryError;

const MAX_DOMAIN_LEN: usize = 253;

/// Lowercase and validate a peer domain, optionally with a `:port` suffix.
pub fn normalize_domain(raw: &str) -> Result<String, RegistryError> {
    let domain = raw.trim().to_ascii_lowercase();
    if domain.is_empty() || domain.len() > MAX_DOMAIN_LEN {
        return Err(RegistryError::InvalidDomain(raw.to_string()));
    }

    let (host, port) = match domain.rsplit_once(':') {
        Some((host, port)) => (host, Some(port)),
        None => (domain.as_str(), None),
    };
    if port.is_some_and(|p| p.parse::<u16>().map_or(true, |p| p == 0)) {
        return Err(RegistryError::InvalidDomain(raw.to_string()));
    }

    let labels_ok = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !labels_ok {
        return Err(RegistryError::InvalidDomain(raw.to_string()));
    }

    Ok(domain)
}

/// Validate a peer API base URL and strip any trailing slash.
pub fn normalize_endpoint(raw: &str) -> Result<String, RegistryError> {
    let endpoint = raw.trim().trim_end_matches('/');
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))
        .ok_or_else(|| RegistryError::InvalidEndpoint(raw.to_string()))?;
    if rest.is_empty() || rest.chars().any(char::is_whitespace) {
        return Err(RegistryError::InvalidEndpoint(raw.to_string()));
    }
    Ok(endpoint.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn domains_are_lowercased() {
        assert_eq!(normalize_domain(" Peer.Example ").unwrap(), "peer.example");
        assert_eq!(normalize_domain("localhost:8443").unwrap(), "localhost:8443");
    }

    #[test]
    fn bad_domains_are_rejected() {
        for bad in ["", "peer..example", "-peer.example", "peer.example:0", "pe er.example", "peer.example:http"] {
            assert!(normalize_domain(bad).is_err(), "{bad:?} accepted");
        }
    }

    #[test]
    fn endpoints_need_http_scheme() {
        assert_eq!(
            normalize_endpoint("https://peer.example/").unwrap(),
            "https://peer.example"
        );
        assert!(normalize_endpoint("ftp://peer.example").is_err());
        assert!(normalize_endpoint("https://").is_err());
        assert!(normalize_endpoint("peer.example").is_err());
    }
}
