//! URL canonicalization and decomposition.
//!
//! The service indexes URLs by the SHA-256 hashes of *expressions*: the
//! cartesian product of a URL's host suffixes and path prefixes, computed
//! over its canonical form. Two textually different URLs that refer to the
//! same resource must canonicalize identically, so the rules here are strict
//! and deliberately forgiving of malformed input: escape cycles are unwound
//! to a fixed point, numeric hosts in any radix collapse to dotted-quad
//! IPv4, and dot segments resolve before hashing.

use crate::error::Error;
use crate::hash::FullHash;

/// The most host labels a lookup suffix may keep.
const MAX_HOST_LABELS: usize = 5;

/// The most path prefixes generated per URL, the root included.
const MAX_PATH_PREFIXES: usize = 4;

//----------- Hash generation --------------------------------------------------

/// Map a URL to the full hash of every expression that must be checked.
///
/// The returned map carries the originating pattern per hash, which is what
/// a lookup reports back to the caller on a hit.
pub fn generate_hashes(url: &str) -> Result<foldhash::HashMap<FullHash, String>, Error> {
    let mut hashes = foldhash::HashMap::default();
    for pattern in generate_patterns(url)? {
        hashes.insert(FullHash::from_pattern(&pattern), pattern);
    }
    Ok(hashes)
}

/// Enumerate the lookup expressions for a URL.
fn generate_patterns(url: &str) -> Result<Vec<String>, Error> {
    let parts = canonicalize(url)?;
    let hosts = lookup_hosts(&parts.host, parts.host_is_ip);
    let paths = lookup_paths(&parts.path, parts.query.as_deref());

    let mut patterns = Vec::with_capacity(hosts.len() * paths.len());
    for host in &hosts {
        for path in &paths {
            patterns.push(format!("{host}{path}"));
        }
    }
    Ok(patterns)
}

/// Canonicalize a URL, reassembled as `scheme://host/path[?query]`.
///
/// Canonicalization is idempotent: feeding the output back in reproduces it.
pub fn canonical_url(url: &str) -> Result<String, Error> {
    let parts = canonicalize(url)?;
    let mut out = format!("{}://{}{}", parts.scheme, parts.host, parts.path);
    if let Some(query) = &parts.query {
        out.push('?');
        out.push_str(query);
    }
    Ok(out)
}

//----------- Canonicalization -------------------------------------------------

/// The canonical pieces of a URL.
struct CanonicalParts {
    scheme: String,
    host: String,
    host_is_ip: bool,
    path: String,
    query: Option<String>,
}

fn canonicalize(url: &str) -> Result<CanonicalParts, Error> {
    // Embedded tabs and newlines are stripped wherever they occur, and the
    // fragment is dropped before any unescaping so that only literal `#`
    // characters terminate the URL.
    let url: String = url
        .trim()
        .chars()
        .filter(|c| !matches!(c, '\t' | '\r' | '\n'))
        .collect();
    let url = url.split('#').next().unwrap_or_default();

    // Split off the scheme; a URL without one is plain HTTP.
    let (scheme, rest) = match url.find("://") {
        Some(i) if !url[..i].contains(['/', '?']) => (url[..i].to_ascii_lowercase(), &url[i + 3..]),
        _ => ("http".to_string(), url),
    };

    // Split the authority from the path, and the query from the path. A `?`
    // before the first `/` attaches an empty path.
    let (authority, path, query) = match (rest.find('/'), rest.find('?')) {
        (_, Some(q)) if rest.find('/').is_none_or(|s| q < s) => {
            (&rest[..q], "", Some(&rest[q + 1..]))
        }
        (Some(s), Some(q)) => (&rest[..s], &rest[s..q], Some(&rest[q + 1..])),
        (Some(s), None) => (&rest[..s], &rest[s..], None),
        (None, None) => (rest, "", None),
        (None, Some(q)) => (&rest[..q], "", Some(&rest[q + 1..])),
    };

    // Credentials and the port do not participate in hashing.
    let host = match authority.rfind('@') {
        Some(i) => &authority[i + 1..],
        None => authority,
    };
    let host = match host.rfind(':') {
        Some(i) if host[i + 1..].bytes().all(|b| b.is_ascii_digit()) => &host[..i],
        _ => host,
    };

    let (host, host_is_ip) = canonical_host(host)?;
    let path = escape(&canonical_path(&unescape(path.as_bytes())));
    let query = query.map(|q| escape(&unescape(q.as_bytes())));

    Ok(CanonicalParts {
        scheme,
        host,
        host_is_ip,
        path,
        query,
    })
}

/// Canonicalize a host.
fn canonical_host(raw: &str) -> Result<(String, bool), Error> {
    let mut host = Vec::new();
    for &b in unescape(raw.as_bytes()).iter() {
        match b {
            // Leading dots drop; consecutive dots collapse.
            b'.' if host.is_empty() || host.ends_with(b".") => {}
            _ => host.push(b.to_ascii_lowercase()),
        }
    }
    while host.ends_with(b".") {
        host.pop();
    }
    if host.is_empty() {
        return Err(Error::InvalidUrl("no host".to_string()));
    }

    if let Ok(host) = std::str::from_utf8(&host) {
        if let Some(ip) = parse_ip_address(host) {
            return Ok((ip, true));
        }
        if !host.is_ascii() {
            if let Ok(ascii) = idna::domain_to_ascii(host) {
                return Ok((escape(ascii.as_bytes()), false));
            }
        }
    }
    Ok((escape(&host), false))
}

/// Canonicalize a path: resolve dot segments and collapse empty ones.
fn canonical_path(path: &[u8]) -> Vec<u8> {
    let trailing_slash =
        path.ends_with(b"/") || path.ends_with(b"/.") || path.ends_with(b"/..") || path.is_empty();

    let mut segments: Vec<&[u8]> = Vec::new();
    for segment in path.split(|&b| b == b'/') {
        match segment {
            b"" | b"." => {}
            b".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    let mut out = vec![b'/'];
    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            out.push(b'/');
        }
        out.extend_from_slice(segment);
    }
    if trailing_slash && !out.ends_with(b"/") {
        out.push(b'/');
    }
    out
}

/// Normalize a numeric host to dotted-quad IPv4, if it is one.
///
/// Components may be decimal, octal (leading `0`), or hex (leading `0x`);
/// one to four components are allowed, with the final component supplying
/// the remaining bytes of the address. Values wider than their slot keep
/// their low-order bytes. Hosts that merely resemble an address (alphabetic
/// labels, too many components, malformed numbers) are not addresses.
fn parse_ip_address(host: &str) -> Option<String> {
    // A quirk inherited from the Windows resolver: a dotted address may be
    // followed by a space and arbitrary text, as long as the whole host
    // stays within 15 characters.
    let host = match host.split_once(' ') {
        Some((lead, _)) if host.len() <= 15 => lead,
        Some(_) => return None,
        None => host,
    };
    let host = host.strip_suffix('.').unwrap_or(host);

    let components: Vec<&str> = host.split('.').collect();
    if components.is_empty() || components.len() > 4 {
        return None;
    }

    let mut bytes = Vec::with_capacity(4);
    for (i, component) in components.iter().enumerate() {
        let slots = if i == components.len() - 1 {
            5 - components.len()
        } else {
            1
        };
        let value = parse_ip_component(component)?;
        for slot in (0..slots).rev() {
            bytes.push(((value >> (8 * slot)) & 0xff) as u8);
        }
    }

    Some(
        bytes
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join("."),
    )
}

fn parse_ip_component(s: &str) -> Option<u64> {
    // The integer parsers below accept sign characters; an address
    // component never carries one.
    if !s.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else if s.is_empty() {
        None
    } else {
        s.parse().ok()
    }
}

//----------- Escaping ---------------------------------------------------------

/// Percent-unescape to a fixed point.
fn unescape(input: &[u8]) -> Vec<u8> {
    fn hex_digit(b: u8) -> Option<u8> {
        match b {
            b'0'..=b'9' => Some(b - b'0'),
            b'a'..=b'f' => Some(b - b'a' + 10),
            b'A'..=b'F' => Some(b - b'A' + 10),
            _ => None,
        }
    }

    let mut current = input.to_vec();
    loop {
        let mut out = Vec::with_capacity(current.len());
        let mut i = 0;
        while i < current.len() {
            match (current.get(i), current.get(i + 1), current.get(i + 2)) {
                (Some(&b'%'), Some(&hi), Some(&lo)) => {
                    if let (Some(hi), Some(lo)) = (hex_digit(hi), hex_digit(lo)) {
                        out.push(hi << 4 | lo);
                        i += 3;
                        continue;
                    }
                    out.push(b'%');
                    i += 1;
                }
                _ => {
                    out.push(current[i]);
                    i += 1;
                }
            }
        }
        if out == current {
            return out;
        }
        current = out;
    }
}

/// Percent-escape everything outside printable ASCII, plus `#` and `%`.
fn escape(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input {
        if b <= 0x20 || b >= 0x7f || b == b'#' || b == b'%' {
            out.push_str(&format!("%{b:02x}"));
        } else {
            out.push(b as char);
        }
    }
    out
}

//----------- Decomposition ----------------------------------------------------

/// The host suffixes to look up.
///
/// The exact host, plus suffixes formed by dropping leading labels: at most
/// the rightmost five labels are kept and no suffix goes below two. IP hosts
/// only match exactly.
fn lookup_hosts(host: &str, host_is_ip: bool) -> Vec<String> {
    if host_is_ip {
        return vec![host.to_string()];
    }

    let labels: Vec<&str> = host.split('.').collect();
    let mut hosts = vec![host.to_string()];
    let start = labels.len().saturating_sub(MAX_HOST_LABELS);
    for i in start..labels.len().saturating_sub(1) {
        let suffix = labels[i..].join(".");
        if suffix != host {
            hosts.push(suffix);
        }
    }
    hosts
}

/// The path prefixes to look up.
///
/// The path with its query (if any), the bare path, and directory prefixes
/// from the root down, each with a trailing slash, capped at
/// [`MAX_PATH_PREFIXES`] including the root itself.
fn lookup_paths(path: &str, query: Option<&str>) -> Vec<String> {
    let mut paths = Vec::new();
    if let Some(query) = query {
        paths.push(format!("{path}?{query}"));
    }
    paths.push(path.to_string());

    let segments: Vec<&str> = path[1..].split('/').collect();
    let mut prefix = String::from("/");
    for segment in std::iter::once("")
        .chain(segments[..segments.len() - 1].iter().copied())
        .take(MAX_PATH_PREFIXES)
    {
        prefix.push_str(segment);
        if !segment.is_empty() {
            prefix.push('/');
        }
        if prefix != path {
            paths.push(prefix.clone());
        }
    }
    paths
}

//============ Tests ===========================================================
