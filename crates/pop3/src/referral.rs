/*
 * SPDX-FileCopyrightText: 2025 the mailgate authors
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Parsing of `[REFERRAL/<authority>]` login replies. The authority
//! follows URI grammar: optional percent-encoded userinfo, then an IPv4
//! literal, a bracketed IPv6 literal, or a DNS name, then an optional
//! port. The closing `]` must follow immediately; anything else makes the
//! reply an ordinary login failure.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use proxy::{is_valid_dns_name, Referral, ReferralHost};

pub fn parse(resp: &str) -> Option<Referral> {
    let rest = resp.strip_prefix("[REFERRAL/")?;

    let (user, rest) = split_userinfo(rest);
    let user = match user {
        Some(encoded) => Some(percent_decode(encoded)?),
        None => None,
    };

    let (host, rest) = parse_host(rest)?;

    let (port, rest) = if let Some(rest) = rest.strip_prefix(':') {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let port: u16 = rest[..digits].parse().ok()?;
        (Some(port), &rest[digits..])
    } else {
        (None, rest)
    };

    if !rest.starts_with(']') {
        return None;
    }
    Some(Referral { user, host, port })
}

fn is_userinfo_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'-' | b'.' | b'_' | b'~' | b'%' | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*'
                | b'+' | b',' | b';' | b'=' | b':'
        )
}

fn split_userinfo(input: &str) -> (Option<&str>, &str) {
    let end = input
        .bytes()
        .position(|b| !is_userinfo_char(b))
        .unwrap_or(input.len());
    if input.as_bytes().get(end) == Some(&b'@') {
        (Some(&input[..end]), &input[end + 1..])
    } else {
        (None, input)
    }
}

fn parse_host(input: &str) -> Option<(ReferralHost, &str)> {
    if let Some(rest) = input.strip_prefix('[') {
        // bracketed IPv6 literal
        let close = rest.find(']')?;
        let ip: Ipv6Addr = rest[..close].parse().ok()?;
        return Some((ReferralHost::Ip(IpAddr::V6(ip)), &rest[close + 1..]));
    }
    let end = input
        .bytes()
        .position(|b| !(b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_'))
        .unwrap_or(input.len());
    if end == 0 {
        return None;
    }
    let name = &input[..end];
    if let Ok(ip) = name.parse::<Ipv4Addr>() {
        return Some((ReferralHost::Ip(IpAddr::V4(ip)), &input[end..]));
    }
    if !is_valid_dns_name(name) {
        return None;
    }
    Some((ReferralHost::Name(name.to_string()), &input[end..]))
}

fn percent_decode(input: &str) -> Option<String> {
    let mut out = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hi = char::from(*bytes.get(i + 1)?).to_digit(16)?;
            let lo = char::from(*bytes.get(i + 2)?).to_digit(16)?;
            out.push((hi * 16 + lo) as u8);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
