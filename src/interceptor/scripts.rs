//! Script elements injected into proxied HTML documents.

/// Attribute carried by every injected element.
pub const MARKER_ATTRIBUTE: &str = "data-devtools-proxy";

/// Synthesizes a `locationchange` window event for client-side navigation and
/// reports every navigation to the embedding frame.
const NAVIGATION_BRIDGE: &str = r#"(function () {
  if (window.__devtoolsProxyNavigationBridge) return;
  window.__devtoolsProxyNavigationBridge = true;
  var notify = function () {
    window.dispatchEvent(new Event('locationchange'));
  };
  ['pushState', 'replaceState'].forEach(function (name) {
    var original = history[name];
    history[name] = function () {
      var result = original.apply(this, arguments);
      notify();
      return result;
    };
  });
  window.addEventListener('popstate', notify);
  window.addEventListener('hashchange', notify);
  window.addEventListener('locationchange', function () {
    if (window.parent && window.parent !== window) {
      window.parent.postMessage({ type: 'location-change', location: window.location.href }, '*');
    }
  });
})();"#;

/// Markup appended to `<head>`: the backend loader, then the navigation bridge.
pub fn injected_markup(backend_host: &str, backend_port: u16, nonce: Option<&str>) -> String {
    let src = format!("http://{backend_host}:{backend_port}");
    let mut loader = vec![(MARKER_ATTRIBUTE, "loader")];
    let mut navigation = vec![(MARKER_ATTRIBUTE, "navigation")];
    if let Some(nonce) = nonce {
        loader.push(("nonce", nonce));
        navigation.push(("nonce", nonce));
    }
    loader.push(("src", src.as_str()));

    let mut markup = script_tag(&loader, "");
    markup.push_str(&script_tag(&navigation, NAVIGATION_BRIDGE));
    markup
}

/// A `<script>` element. Every attribute value is escaped here, so callers
/// pass raw values.
fn script_tag(attributes: &[(&str, &str)], body: &str) -> String {
    let mut tag = String::from("<script");
    for (name, value) in attributes {
        tag.push(' ');
        tag.push_str(name);
        tag.push_str("=\"");
        tag.push_str(&escape_attribute(value));
        tag.push('"');
    }
    tag.push('>');
    tag.push_str(body);
    tag.push_str("</script>");
    tag
}

/// Escape a value for a double-quoted attribute. Only `&` and `"` are
/// significant there; `<` and `>` are escaped as well.
fn escape_attribute(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_comes_first() {
        let markup = injected_markup("localhost", 8097, None);
        let loader = markup.find(r#"src="http://localhost:8097""#).unwrap();
        let bridge = markup.find("locationchange").unwrap();
        assert!(loader < bridge);
        assert!(!markup.contains("nonce"));
    }

    #[test]
    fn nonce_is_escaped() {
        let markup = injected_markup("localhost", 8097, Some(r#"a"b"#));
        assert!(markup.contains(r#"nonce="a&quot;b""#));
        assert_eq!(markup.matches("nonce=").count(), 2);
    }

    #[test]
    fn every_attribute_value_is_escaped() {
        let markup = injected_markup(r#"evil"><x"#, 8097, Some("n&1"));
        assert!(markup.contains(r#"src="http://evil&quot;&gt;&lt;x:8097""#));
        assert!(markup.contains(r#"nonce="n&amp;1""#));
        assert_eq!(markup.matches("<script ").count(), 2);
        assert!(!markup.contains("<x"));
    }

    #[test]
    fn bridge_posts_location_change() {
        let markup = injected_markup("localhost", 8097, None);
        assert!(markup.contains("type: 'location-change'"));
        assert!(markup.contains("hashchange"));
        assert!(markup.contains("popstate"));
    }
}
