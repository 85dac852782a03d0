//! Download URL rewriting through mirrors and proxies.

/// Canonical upstream prefix that mirrors and proxies stand in for.
pub const UPSTREAM_PREFIX: &str = "https://github.com/";

/// Rewrites `url` through a mirror prefix.
///
/// Only a leading `https://github.com/` is replaced; URLs on other hosts, or
/// URLs that merely mention the host later on, are returned unchanged.
pub fn resolve(url: &str, mirror_prefix: Option<&str>) -> String {
    match (mirror_prefix, url.strip_prefix(UPSTREAM_PREFIX)) {
        (Some(prefix), Some(rest)) if !prefix.is_empty() => format!("{prefix}{rest}"),
        _ => url.to_string(),
    }
}

/// Builds the ordered list of URLs a runtime install tries for one file.
///
/// The direct URL always comes first. With `use_proxy` set and an upstream
/// URL, the extra proxy (if any) follows, then each built-in proxy, each in
/// the `<proxy>/<full url>` form.
pub fn candidate_urls<S: AsRef<str>>(
    url: &str,
    use_proxy: bool,
    extra_proxy: Option<&str>,
    builtin_proxies: &[S],
) -> Vec<String> {
    let mut out = vec![url.to_string()];
    if !use_proxy || !url.starts_with(UPSTREAM_PREFIX) {
        return out;
    }

    if let Some(custom) = extra_proxy.map(|p| p.trim().trim_end_matches('/')) {
        if !custom.is_empty() {
            out.push(format!("{custom}/{url}"));
        }
    }
    for proxy in builtin_proxies {
        out.push(format!("{}/{}", proxy.as_ref().trim_end_matches('/'), url));
    }
    out
}
