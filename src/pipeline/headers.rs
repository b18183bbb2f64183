//! Header helpers: mailbox parsing and `From` rendering.

use mail_parser::MessageParser;

/// RFC 5322 specials that force a display name into quotes.
const SPECIALS: &[char] = &['(', ')', '<', '>', '[', ']', ':', ';', '@', '\\', ',', '.', '"'];

/// A parsed `Name <address>` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mailbox {
    pub name: Option<String>,
    pub address: Option<String>,
}

/// Parse a single mailbox header value such as `"Jane Doe" <jane@x.tld>`.
pub fn parse_mailbox(value: &str) -> Option<Mailbox> {
    let value: String = value.chars().filter(|c| *c != '\r' && *c != '\n').collect();
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    let raw = format!("From: {value}\r\n\r\n");
    let parsed = MessageParser::default().parse(raw.as_bytes())?;
    let addr = parsed.from().and_then(|a| a.first())?;

    Some(Mailbox {
        name: addr
            .name()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string),
        address: addr
            .address()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string),
    })
}

/// Just the address part of a mailbox header value.
pub fn mailbox_address(value: &str) -> Option<String> {
    parse_mailbox(value).and_then(|m| m.address)
}

/// Display name from a `From` header, or `default` when it carries none.
pub fn display_name(from_header: Option<&str>, default: &str) -> String {
    from_header
        .and_then(parse_mailbox)
        .and_then(|m| m.name)
        .map(|n| sanitize_name(&n))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Render `Name <address>`, quoting the name when it needs it.
pub fn format_mailbox(name: &str, address: &str) -> String {
    let name = sanitize_name(name);
    if name.is_empty() {
        return format!("<{address}>");
    }
    if name.contains(SPECIALS) {
        let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
        format!("\"{escaped}\" <{address}>")
    } else {
        format!("{name} <{address}>")
    }
}

fn sanitize_name(name: &str) -> String {
    name.chars()
        .filter(|c| !c.is_control())
        .collect::<String>()
        .trim()
        .to_string()
}
