//! Regex-based HTML helpers shared by provider extractors and site resolvers.
//!
//! Pages are scraped, not parsed: each helper targets one attribute shape and
//! tolerates either quote style and arbitrary attribute order.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Compiles a regex at static init; panics on invalid pattern.
pub fn compile_static_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid static regex '{pattern}': {e}"))
}

static FORM_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<form\b([^>]*)>(.*?)</form>"));
static INPUT_RE: LazyLock<Regex> = LazyLock::new(|| compile_static_regex(r"(?is)<input\b([^>]*)>"));
static ANCHOR_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<a\b([^>]*)>(.*?)</a>"));
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"(?is)([a-zA-Z_:][-a-zA-Z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+))"#)
});
static JS_REDIRECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    compile_static_regex(r#"window\.location\.href\s*=\s*['"]([^'"]+)['"]"#)
});
static TITLE_RE: LazyLock<Regex> =
    LazyLock::new(|| compile_static_regex(r"(?is)<title[^>]*>(.*?)</title>"));

/// Attributes of a start tag, in document order.
#[derive(Debug, Clone, Default)]
pub struct Attributes(Vec<(String, String)>);

impl Attributes {
    /// Parses the attribute portion of a start tag.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let pairs = ATTR_RE
            .captures_iter(raw)
            .filter_map(|caps| {
                let name = caps.get(1)?.as_str().to_ascii_lowercase();
                let value = caps
                    .get(2)
                    .or_else(|| caps.get(3))
                    .or_else(|| caps.get(4))
                    .map_or("", |m| m.as_str());
                Some((name, unescape(value)))
            })
            .collect();
        Self(pairs)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// True when the `class` attribute contains every class in `classes`.
    #[must_use]
    pub fn has_classes(&self, classes: &str) -> bool {
        let Some(class_attr) = self.get("class") else {
            return false;
        };
        let present: Vec<&str> = class_attr.split_whitespace().collect();
        classes
            .split_whitespace()
            .all(|wanted| present.contains(&wanted))
    }
}

/// A `<form>` element and its inner HTML.
#[derive(Debug, Clone)]
pub struct Form {
    pub attributes: Attributes,
    pub body: String,
}

impl Form {
    /// Value of the `<input>` named `name` inside this form.
    #[must_use]
    pub fn input_value(&self, name: &str) -> Option<String> {
        INPUT_RE.captures_iter(&self.body).find_map(|caps| {
            let attrs = Attributes::parse(caps.get(1)?.as_str());
            (attrs.get("name")? == name).then(|| attrs.get("value").unwrap_or("").to_string())
        })
    }

    #[must_use]
    pub fn action(&self) -> Option<&str> {
        self.attributes.get("action").filter(|a| !a.trim().is_empty())
    }
}

/// Finds the form whose `id` attribute equals `id`.
#[must_use]
pub fn find_form_by_id(html: &str, id: &str) -> Option<Form> {
    FORM_RE.captures_iter(html).find_map(|caps| {
        let attributes = Attributes::parse(caps.get(1)?.as_str());
        if attributes.get("id")? != id {
            return None;
        }
        Some(Form {
            attributes,
            body: caps.get(2).map_or(String::new(), |m| m.as_str().to_string()),
        })
    })
}

/// `href` of the first anchor carrying all of `classes`.
#[must_use]
pub fn find_anchor_with_classes(html: &str, classes: &str) -> Option<String> {
    anchors(html)
        .find(|attrs| attrs.has_classes(classes))
        .and_then(|attrs| attrs.get("href").map(str::to_string))
}

/// `href` of the first anchor whose href contains `needle`.
#[must_use]
pub fn find_anchor_href_containing(html: &str, needle: &str) -> Option<String> {
    anchors(html)
        .filter_map(|attrs| attrs.get("href").map(str::to_string))
        .find(|href| href.contains(needle))
}

fn anchors(html: &str) -> impl Iterator<Item = Attributes> + '_ {
    ANCHOR_RE
        .captures_iter(html)
        .filter_map(|caps| caps.get(1).map(|m| Attributes::parse(m.as_str())))
}

/// Target of a `window.location.href = '...'` script redirect.
#[must_use]
pub fn find_js_redirect(html: &str) -> Option<String> {
    JS_REDIRECT_RE
        .captures(html)
        .and_then(|caps| caps.get(1).map(|m| m.as_str().to_string()))
}

#[must_use]
pub fn page_title(html: &str) -> Option<String> {
    TITLE_RE
        .captures(html)
        .and_then(|caps| caps.get(1))
        .map(|m| unescape(m.as_str().trim()))
        .filter(|title| !title.is_empty())
}

/// Decodes the handful of entities that show up in attribute values.
#[must_use]
pub fn unescape(value: &str) -> String {
    value
        .replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&#x27;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// Resolves a possibly relative URL string against a base URL.
#[must_use]
pub fn absolutize_url(value: &str, base_url: &Url) -> Option<String> {
    if value.starts_with("http://") || value.starts_with("https://") {
        return Some(value.to_string());
    }
    if value.starts_with("//") {
        return Some(format!("https:{value}"));
    }
    base_url.join(value).ok().map(|url| url.to_string())
}
