//! Input validation and sanitization functions for vmfw
//!
//! Everything that ends up in an iptables-restore stream or a virsh argument
//! vector passes through here first.

use std::borrow::Cow;

/// Longest chain name the kernel accepts (`XT_EXTENSION_MAXNAMELEN - 1`)
pub const MAX_CHAIN_NAME: usize = 28;

/// Validates a chain name, including its prefix.
///
/// # Examples
///
/// ```
/// use vmfw::validators::validate_chain_name;
///
/// assert!(validate_chain_name("vmfw-inst-42").is_ok());
/// assert!(validate_chain_name("bad chain").is_err());
/// ```
///
/// # Errors
///
/// Returns `Err` if:
/// - Name is empty
/// - Name exceeds 28 bytes
/// - Name contains anything but ASCII alphanumerics, `-` and `_`
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Chain name cannot be empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME {
        return Err(format!(
            "Chain name '{name}' too long (max {MAX_CHAIN_NAME} bytes)"
        ));
    }

    // SECURITY: ASCII-only so the name can never inject restore syntax
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err(format!("Chain name '{name}' contains invalid characters"));
    }

    Ok(())
}

/// Validates the prefix shared by every chain or filter vmfw owns.
///
/// # Errors
///
/// Returns `Err` if the prefix is empty, longer than 12 bytes (leaving room
/// for `-inst-<id>`), or contains characters other than ASCII alphanumerics
/// and `_`.
pub fn validate_prefix(prefix: &str) -> Result<(), String> {
    if prefix.is_empty() {
        return Err("Prefix cannot be empty".to_string());
    }

    if prefix.len() > 12 {
        return Err("Prefix too long (max 12 characters)".to_string());
    }

    if !prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err("Prefix contains invalid characters".to_string());
    }

    Ok(())
}

/// Validates a hypervisor filter name before it reaches virsh.
///
/// # Errors
///
/// Returns `Err` if the name is empty, longer than 128 bytes, starts with
/// `-`, or contains characters other than ASCII alphanumerics, `-`, `_`
/// and `.`.
pub fn validate_filter_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Filter name cannot be empty".to_string());
    }

    if name.len() > 128 {
        return Err("Filter name too long (max 128 characters)".to_string());
    }

    // A leading dash would be parsed as a virsh option
    if name.starts_with('-') {
        return Err("Filter name cannot start with '-'".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!("Filter name '{name}' contains invalid characters"));
    }

    Ok(())
}

/// Derives the NIC id used in interface filter names from a MAC address.
///
/// # Examples
///
/// ```
/// use vmfw::validators::nic_id;
///
/// assert_eq!(nic_id("56:12:12:12:12:12").unwrap(), "561212121212");
/// ```
///
/// # Errors
///
/// Returns `Err` unless the MAC, with colons removed, is exactly 12 hex digits.
pub fn nic_id(mac: &str) -> Result<String, String> {
    let id: String = mac.chars().filter(|c| *c != ':').collect();

    if id.len() != 12 || !id.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(format!("'{mac}' is not a valid MAC address"));
    }

    Ok(id.to_ascii_lowercase())
}

/// Escapes text for use inside an XML attribute or element.
pub fn escape_xml(input: &str) -> Cow<'_, str> {
    if !input.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(input);
    }

    let mut out = String::with_capacity(input.len() + 8);
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}
