//! Namespaced identifiers and the bundler resource-URI scheme.
//!
//! Tools and prompts are exposed as `alias__original`. Resources keep their
//! original URI inside `mcp-bundler://<alias>/<base64url(original)>` so any
//! URI, including ones with their own scheme and slashes, survives the trip.

use base64::{
    Engine,
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
};

pub const SEPARATOR: &str = "__";
pub const RESOURCE_SCHEME_PREFIX: &str = "mcp-bundler://";

/// Reserved alias whose compatibility tool keeps its bare name.
pub const COMPAT_ALIAS: &str = "skills";
pub const COMPAT_TOOL: &str = "fetch_skill";

/// `alias__name`, except for the `skills` compatibility tool.
pub fn namespace_tool(alias: &str, name: &str) -> String {
    if alias == COMPAT_ALIAS && name == COMPAT_TOOL {
        return name.to_string();
    }
    format!("{alias}{SEPARATOR}{name}")
}

pub fn namespace_prompt(alias: &str, name: &str) -> String {
    format!("{alias}{SEPARATOR}{name}")
}

/// Split `alias__name` at the first separator.
pub fn split_namespaced(namespaced: &str) -> Option<(&str, &str)> {
    namespaced
        .split_once(SEPARATOR)
        .filter(|(alias, name)| !alias.is_empty() && !name.is_empty())
}

pub fn wrap_resource_uri(alias: &str, original: &str) -> String {
    format!(
        "{RESOURCE_SCHEME_PREFIX}{alias}/{}",
        URL_SAFE_NO_PAD.encode(original.as_bytes())
    )
}

/// Recover `(alias, original_uri)`; accepts url-safe or standard base64,
/// padded or not. `None` for anything else.
pub fn unwrap_resource_uri(wrapped: &str) -> Option<(String, String)> {
    let rest = wrapped.strip_prefix(RESOURCE_SCHEME_PREFIX)?;
    let (alias, payload) = rest.split_once('/')?;
    let payload = payload.trim_end_matches('=');

    let bytes = URL_SAFE_NO_PAD
        .decode(payload)
        .or_else(|_| STANDARD_NO_PAD.decode(payload))
        .ok()?;
    let original = String::from_utf8(bytes).ok()?;
    Some((alias.to_string(), original))
}
