//! Locator parsing and rendering.
//!
//! Understands Playwright `getBy*` calls, Playwright selector engines
//! (`role=`, `text=`, `xpath=`), and plain CSS/XPath strings.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// How a locator finds its element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocatorMethod {
    Role,
    Label,
    TestId,
    Placeholder,
    AltText,
    Text,
    /// `#id`
    Id,
    /// `tag[attr="value"]`
    Attribute,
    /// bare tag name
    Tag,
    /// `tag.class`
    Class,
    /// descendant/child/sibling combinators or positional pseudo-classes
    Combinator,
    XPath,
}

impl LocatorMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            LocatorMethod::Role => "role",
            LocatorMethod::Label => "label",
            LocatorMethod::TestId => "test_id",
            LocatorMethod::Placeholder => "placeholder",
            LocatorMethod::AltText => "alt_text",
            LocatorMethod::Text => "text",
            LocatorMethod::Id => "id",
            LocatorMethod::Attribute => "attribute",
            LocatorMethod::Tag => "tag",
            LocatorMethod::Class => "class",
            LocatorMethod::Combinator => "combinator",
            LocatorMethod::XPath => "xpath",
        }
    }
}

impl fmt::Display for LocatorMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locator {
    pub method: LocatorMethod,
    /// Role name, label text, test id, CSS or XPath body.
    pub value: String,
    /// Accessible name filter for role locators.
    pub name: Option<String>,
    pub raw: String,
}

/// `page.locator('...')` / `locator("...")` wrapper.
static LOCATOR_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:page\.)?locator\(\s*(['"`])(?P<inner>.*)(['"`])\s*\)$"#).unwrap()
});

static GET_BY_ROLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:page\.)?getByRole\(\s*['"`](?P<role>[\w-]+)['"`]\s*(?:,\s*\{[^}]*?name\s*:\s*['"`](?P<name>(?:[^'"`\\]|\\.)*)['"`][^}]*\})?\s*\)$"#,
    )
    .unwrap()
});

static GET_BY_OTHER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:page\.)?getBy(?P<kind>Label|TestId|Placeholder|Text|AltText|Title)\(\s*['"`](?P<value>(?:[^'"`\\]|\\.)*)['"`].*\)$"#,
    )
    .unwrap()
});

static ROLE_ENGINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^role=(?P<role>[\w-]+)(?:\[name=['"]?(?P<name>[^'"\]]*)['"]?(?:[is])?\])?$"#).unwrap()
});

static TEST_ID_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"^(?:\w+)?\[(?:data-testid|data-test-id|data-test|data-cy|data-qa)\s*=\s*['"]?(?P<value>[^'"\]]+)['"]?\]$"#,
    )
    .unwrap()
});

static SIMPLE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^(?:\w+)?\[(?P<attr>[\w-]+)\s*[*^$~|]?=\s*['"]?(?P<value>[^'"\]]+)['"]?\]$"#).unwrap()
});

static ID_SELECTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\w+)?#[A-Za-z_][\w-]*$").unwrap());

static TAG_SELECTOR: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[a-zA-Z][\w-]*$").unwrap());

static CLASS_SELECTOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:[a-zA-Z][\w-]*)?(?:\.[\w-]+)+$").unwrap());

fn unquote(s: &str) -> String {
    let trimmed = s.trim();
    let stripped = trimmed
        .strip_prefix(['"', '\'', '`'])
        .and_then(|s| s.strip_suffix(['"', '\'', '`']))
        .unwrap_or(trimmed);
    stripped.replace("\\'", "'").replace("\\\"", "\"")
}

/// True when the CSS uses combinators outside attribute brackets.
fn has_combinator(css: &str) -> bool {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    for c in css.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[' | '(') => depth += 1,
            (None, ']' | ')') => depth = depth.saturating_sub(1),
            (None, ' ' | '>' | '+' | '~') if depth == 0 => return true,
            _ => {}
        }
    }
    false
}

/// True for `:nth-child`, `:first-of-type` and friends, or indexed XPath.
pub fn is_positional(value: &str) -> bool {
    value.contains(":nth-")
        || value.contains(":first-")
        || value.contains(":last-")
        || value.contains(":only-")
        || value.contains(":eq(")
        || (value.starts_with('/') || value.starts_with("(/")) && has_index_predicate(value)
}

/// XPath index predicates such as `div[3]`.
fn has_index_predicate(xpath: &str) -> bool {
    xpath.split('[').skip(1).any(|part| {
        part.split(']')
            .next()
            .is_some_and(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    })
}

impl Locator {
    pub fn new(method: LocatorMethod, value: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            method,
            value: value.into(),
            name: None,
            raw: raw.into(),
        }
    }

    /// Parse any supported locator syntax. Never fails: unknown syntax is
    /// treated as CSS and classified structurally.
    pub fn parse(input: &str) -> Self {
        let raw = input.trim().to_string();

        if let Some(caps) = LOCATOR_CALL.captures(&raw) {
            let mut inner = Self::parse(&caps["inner"]);
            inner.raw = raw;
            return inner;
        }

        if let Some(caps) = GET_BY_ROLE.captures(&raw) {
            return Self {
                method: LocatorMethod::Role,
                value: caps["role"].to_string(),
                name: caps.name("name").map(|m| unquote(m.as_str())),
                raw,
            };
        }

        if let Some(caps) = GET_BY_OTHER.captures(&raw) {
            let method = match &caps["kind"] {
                "Label" | "Title" => LocatorMethod::Label,
                "TestId" => LocatorMethod::TestId,
                "Placeholder" => LocatorMethod::Placeholder,
                "AltText" => LocatorMethod::AltText,
                _ => LocatorMethod::Text,
            };
            let value = unquote(&caps["value"]);
            return Self::new(method, value, raw);
        }

        if let Some(caps) = ROLE_ENGINE.captures(&raw) {
            return Self {
                method: LocatorMethod::Role,
                value: caps["role"].to_string(),
                name: caps.name("name").map(|m| m.as_str().to_string()),
                raw,
            };
        }

        if let Some(rest) = raw.strip_prefix("text=") {
            return Self::new(LocatorMethod::Text, unquote(rest), raw.clone());
        }
        if let Some(rest) = raw.strip_prefix("xpath=") {
            return Self::new(LocatorMethod::XPath, rest.trim(), raw.clone());
        }
        if raw.starts_with("//") || raw.starts_with("(//") {
            return Self::new(LocatorMethod::XPath, raw.clone(), raw.clone());
        }
        if let Some(rest) = raw.strip_prefix("css=") {
            let mut inner = Self::parse_css(rest.trim());
            inner.raw = raw;
            return inner;
        }

        Self::parse_css(&raw)
    }

    fn parse_css(css: &str) -> Self {
        let raw = css.to_string();

        if has_combinator(css) || is_positional(css) {
            return Self::new(LocatorMethod::Combinator, css, raw);
        }
        if let Some(caps) = TEST_ID_ATTR.captures(css) {
            return Self::new(LocatorMethod::TestId, &caps["value"], raw);
        }
        if let Some(caps) = SIMPLE_ATTR.captures(css) {
            let value = caps["value"].to_string();
            return match &caps["attr"] {
                "placeholder" => Self::new(LocatorMethod::Placeholder, value, raw),
                "aria-label" => Self::new(LocatorMethod::Label, value, raw),
                "alt" => Self::new(LocatorMethod::AltText, value, raw),
                "id" => Self::new(LocatorMethod::Id, value, raw),
                "role" => Self::new(LocatorMethod::Role, value, raw),
                _ => Self::new(LocatorMethod::Attribute, css, raw),
            };
        }
        if ID_SELECTOR.is_match(css) {
            let id = css.split('#').nth(1).unwrap_or(css);
            return Self::new(LocatorMethod::Id, id, raw);
        }
        if CLASS_SELECTOR.is_match(css) {
            return Self::new(LocatorMethod::Class, css, raw);
        }
        if TAG_SELECTOR.is_match(css) {
            return Self::new(LocatorMethod::Tag, css, raw);
        }
        // Compound selectors such as `a.btn[href]` or pseudo-classes.
        if css.contains('.') {
            return Self::new(LocatorMethod::Class, css, raw);
        }
        Self::new(LocatorMethod::Attribute, css, raw)
    }

    /// Render as the selector string a client would paste into a test.
    pub fn render(&self) -> String {
        match self.method {
            LocatorMethod::Role => match &self.name {
                Some(name) => format!("getByRole('{}', {{ name: '{}' }})", self.value, escape(name)),
                None => format!("getByRole('{}')", self.value),
            },
            LocatorMethod::Label => format!("getByLabel('{}')", escape(&self.value)),
            // `data-cy` and friends are not what getByTestId matches by default.
            LocatorMethod::TestId if self.raw.starts_with('[') => self.raw.clone(),
            LocatorMethod::TestId => format!("getByTestId('{}')", escape(&self.value)),
            LocatorMethod::Placeholder => format!("getByPlaceholder('{}')", escape(&self.value)),
            LocatorMethod::AltText => format!("getByAltText('{}')", escape(&self.value)),
            LocatorMethod::Text => format!("getByText('{}')", escape(&self.value)),
            LocatorMethod::Id => format!("#{}", self.value),
            LocatorMethod::Attribute
            | LocatorMethod::Tag
            | LocatorMethod::Class
            | LocatorMethod::Combinator
            | LocatorMethod::XPath => self.value.clone(),
        }
    }

    /// Lowercase word tokens of the value and name, for fuzzy element matching.
    pub fn tokens(&self) -> Vec<String> {
        let mut out = tokenize(&self.value);
        if let Some(name) = &self.name {
            out.extend(tokenize(name));
        }
        out.retain(|t| !CSS_NOISE.contains(&t.as_str()));
        out.sort();
        out.dedup();
        out
    }

    /// Tag name the locator pins, if any (`button.primary` → `button`).
    pub fn tag_hint(&self) -> Option<String> {
        match self.method {
            LocatorMethod::Tag | LocatorMethod::Class | LocatorMethod::Attribute => {
                let last = self.value.rsplit([' ', '>']).next().unwrap_or(&self.value);
                let tag: String = last
                    .chars()
                    .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
                    .collect();
                (!tag.is_empty()).then(|| tag.to_ascii_lowercase())
            }
            _ => None,
        }
    }
}

/// Tokens that carry no identity: CSS syntax words and XPath axes.
const CSS_NOISE: &[&str] = &[
    "nth", "child", "of", "type", "first", "last", "only", "contains", "text", "normalize",
    "space", "descendant", "self", "and", "or", "not",
];

pub fn tokenize(s: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for word in s.split(|c: char| !c.is_alphanumeric()) {
        if word.is_empty() {
            continue;
        }
        // Split camelCase so `submitBtn` matches `submit`.
        let mut current = String::new();
        let mut prev_lower = false;
        for c in word.chars() {
            if c.is_uppercase() && prev_lower && !current.is_empty() {
                tokens.push(std::mem::take(&mut current).to_lowercase());
            }
            prev_lower = c.is_lowercase() || c.is_ascii_digit();
            current.push(c);
        }
        if !current.is_empty() {
            tokens.push(current.to_lowercase());
        }
    }
    tokens.retain(|t| t.len() >= 2);
    tokens
}

pub fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
