//! Address-header handling for the `address` and `envelope` tests.
//!
//! A deliberately small RFC 5322 address-list scanner: display names,
//! comments, and groups are stripped, leaving the `addr-spec`s. Anything
//! that does not yield a local part is skipped, never an error.

use std::borrow::Cow;

/// One `local-part@domain` extracted from a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedAddress {
    pub local_part: String,
    /// Empty for a local address without a domain.
    pub domain: String,
}

/// Which part of an address a test compares.
pub trait AddressPart: Sync {
    fn name(&self) -> &'static str;

    /// The value to match, or `None` to skip this address.
    fn extract<'a>(&self, address: &'a ParsedAddress) -> Option<Cow<'a, str>>;
}

impl std::fmt::Debug for dyn AddressPart {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "AddressPart(:{})", self.name())
    }
}

#[derive(Debug)]
pub struct All;

impl AddressPart for All {
    fn name(&self) -> &'static str {
        "all"
    }

    fn extract<'a>(&self, address: &'a ParsedAddress) -> Option<Cow<'a, str>> {
        if address.domain.is_empty() {
            Some(Cow::Borrowed(&address.local_part))
        } else {
            Some(Cow::Owned(format!(
                "{}@{}",
                address.local_part, address.domain
            )))
        }
    }
}

#[derive(Debug)]
pub struct LocalPart;

impl AddressPart for LocalPart {
    fn name(&self) -> &'static str {
        "localpart"
    }

    fn extract<'a>(&self, address: &'a ParsedAddress) -> Option<Cow<'a, str>> {
        Some(Cow::Borrowed(&address.local_part))
    }
}

#[derive(Debug)]
pub struct Domain;

impl AddressPart for Domain {
    fn name(&self) -> &'static str {
        "domain"
    }

    fn extract<'a>(&self, address: &'a ParsedAddress) -> Option<Cow<'a, str>> {
        if address.domain.is_empty() {
            None
        } else {
            Some(Cow::Borrowed(&address.domain))
        }
    }
}

pub static ALL: All = All;
pub static LOCAL_PART: LocalPart = LocalPart;
pub static DOMAIN: Domain = Domain;

/// Core address parts, indexed by object code.
pub(crate) static CORE_ADDRESS_PARTS: [&dyn AddressPart; 3] = [&ALL, &LOCAL_PART, &DOMAIN];

/// Split a header value into addresses.
pub fn parse_address_list(header: &str) -> Vec<ParsedAddress> {
    split_top_level(header)
        .into_iter()
        .filter_map(|part| parse_single(&part))
        .collect()
}

/// Parse one address, e.g. an envelope path.
pub fn parse_single(part: &str) -> Option<ParsedAddress> {
    let spec = extract_addr_spec(part)?;
    let spec = spec.trim();
    if spec.is_empty() {
        return None;
    }

    match split_at_domain(spec) {
        Some((local, domain)) => Some(ParsedAddress {
            local_part: unquote(local),
            domain: domain.trim().to_ascii_lowercase(),
        }),
        None => Some(ParsedAddress {
            local_part: unquote(spec),
            domain: String::new(),
        }),
    }
}

/// Split on commas that are not inside quotes, comments, or angle brackets.
fn split_top_level(header: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut comment_depth = 0u32;
    let mut angle = false;
    let mut escaped = false;

    for ch in header.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }

        match ch {
            '\\' if quoted => {
                current.push(ch);
                escaped = true;
            }
            '"' if comment_depth == 0 => {
                quoted = !quoted;
                current.push(ch);
            }
            '(' if !quoted => {
                comment_depth += 1;
                current.push(ch);
            }
            ')' if !quoted && comment_depth > 0 => {
                comment_depth -= 1;
                current.push(ch);
            }
            '<' if !quoted && comment_depth == 0 => {
                angle = true;
                current.push(ch);
            }
            '>' if !quoted && comment_depth == 0 => {
                angle = false;
                current.push(ch);
            }
            ',' if !quoted && comment_depth == 0 && !angle => {
                parts.push(std::mem::take(&mut current));
            }
            ch => current.push(ch),
        }
    }
    parts.push(current);

    parts
        .into_iter()
        .map(|part| part.trim().to_owned())
        .filter(|part| !part.is_empty())
        .collect()
}

/// Reduce `display-name <addr-spec>` / `(comment) addr-spec` to the spec.
fn extract_addr_spec(part: &str) -> Option<String> {
    // Route addresses: take the innermost angle content.
    if let Some(open) = part.rfind('<') {
        let rest = &part[open + 1..];
        let close = rest.find('>')?;
        return Some(rest[..close].to_owned());
    }

    // Group syntax: `name: member, member;` was split earlier; a leftover
    // `name:;` or a bare group terminator carries no address.
    if part.ends_with(':') || part == ";" {
        return None;
    }
    let part = part.strip_suffix(';').unwrap_or(part);
    let part = match find_unquoted(part, ':') {
        Some(colon) => &part[colon + 1..],
        None => part,
    };

    // Strip comments.
    let mut spec = String::new();
    let mut comment_depth = 0u32;
    let mut quoted = false;
    let mut escaped = false;
    for ch in part.chars() {
        if escaped {
            spec.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => {
                spec.push(ch);
                escaped = true;
            }
            '"' if comment_depth == 0 => {
                quoted = !quoted;
                spec.push(ch);
            }
            '(' if !quoted => comment_depth += 1,
            ')' if !quoted && comment_depth > 0 => comment_depth -= 1,
            ch if comment_depth == 0 => spec.push(ch),
            _ => {}
        }
    }

    Some(spec)
}

/// The last unquoted `@` separates local part and domain.
fn split_at_domain(spec: &str) -> Option<(&str, &str)> {
    let mut split = None;
    let mut quoted = false;
    let mut escaped = false;

    for (index, ch) in spec.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            '@' if !quoted => split = Some(index),
            _ => {}
        }
    }

    split.map(|at| (&spec[..at], &spec[at + 1..]))
}

fn find_unquoted(value: &str, needle: char) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;

    for (index, ch) in value.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if quoted => escaped = true,
            '"' => quoted = !quoted,
            ch if ch == needle && !quoted => return Some(index),
            _ => {}
        }
    }
    None
}

fn unquote(local: &str) -> String {
    let local = local.trim();
    let Some(inner) = local
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return local.to_owned();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            ch => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(header: &str) -> ParsedAddress {
        let mut list = parse_address_list(header);
        assert_eq!(list.len(), 1, "{header:?}");
        list.remove(0)
    }

    #[test]
    fn test_bare_address() {
        let addr = one("root@host");
        assert_eq!(addr.local_part, "root");
        assert_eq!(addr.domain, "host");
    }

    #[test]
    fn test_display_name() {
        let addr = one("Root <root@host>");
        assert_eq!(addr.local_part, "root");
        assert_eq!(addr.domain, "host");
    }

    #[test]
    fn test_domain_is_lowercased() {
        assert_eq!(one("x@EXAMPLE.COM").domain, "example.com");
        // The local part keeps its case; comparators decide equivalence.
        assert_eq!(one("Root@host").local_part, "Root");
    }

    #[test]
    fn test_list() {
        let list = parse_address_list("a@x.test, \"Smith, John\" <b@y.test>, (note) c@z.test");
        assert_eq!(
            list,
            vec![
                ParsedAddress {
                    local_part: "a".into(),
                    domain: "x.test".into()
                },
                ParsedAddress {
                    local_part: "b".into(),
                    domain: "y.test".into()
                },
                ParsedAddress {
                    local_part: "c".into(),
                    domain: "z.test".into()
                },
            ]
        );
    }

    #[test]
    fn test_group() {
        let list = parse_address_list("undisclosed-recipients:;");
        assert!(list.is_empty());

        let list = parse_address_list("friends: a@x.test, b@y.test;");
        assert_eq!(list.len(), 2);
        assert_eq!(list[1].local_part, "b");
    }

    #[test]
    fn test_quoted_local_part() {
        let addr = one("\"john doe\"@example.com");
        assert_eq!(addr.local_part, "john doe");
        assert_eq!(addr.domain, "example.com");
    }

    #[test]
    fn test_no_domain() {
        let addr = one("MAILER-DAEMON");
        assert_eq!(addr.local_part, "MAILER-DAEMON");
        assert_eq!(addr.domain, "");
        assert_eq!(DOMAIN.extract(&addr), None);
        assert_eq!(ALL.extract(&addr).unwrap(), "MAILER-DAEMON");
    }

    #[test]
    fn test_empty_and_junk() {
        assert!(parse_address_list("").is_empty());
        assert!(parse_address_list(" , ,").is_empty());
    }
}
