//! Embedded static-asset resolver.
//!
//! The real web UI bundle is out of scope; this is a small lookup table
//! standing in for it so the resolver path (content-type lookup, 404
//! fallthrough to the API router) is exercised end-to-end.

/// `(path, content-type, bytes)` triples served before falling through to
/// the API router.
const ASSETS: [(&str, &str, &[u8]); 1] =
    [("/index.html", "text/html; charset=utf-8", b"<!doctype html><title>cirrusd</title>")];

/// Look up a static asset by exact request path.
#[must_use]
pub fn resolve(path: &str) -> Option<(&'static str, &'static [u8])> {
    let path = if path == "/" { "/index.html" } else { path };
    ASSETS
        .iter()
        .find(|(p, _, _)| *p == path)
        .map(|(_, content_type, bytes)| (*content_type, *bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_resolves_to_index() {
        assert!(resolve("/").is_some());
    }

    #[test]
    fn unknown_path_resolves_to_none() {
        assert!(resolve("/nope.js").is_none());
    }
}
