//! Candidate generation for a broken locator.
//!
//! Resolve the element the original locator most likely meant, generate
//! alternative locators for it from most to least stable, then score, sort,
//! dedupe and cap.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::dom::{ElementInfo, Snapshot};
use super::locator::{tokenize, Locator, LocatorMethod};
use super::score::{self, Ranked};

/// Longest visible text worth turning into a `getByText` locator.
const MAX_TEXT_LEN: usize = 60;

/// One proposed replacement locator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub selector: String,
    pub method: LocatorMethod,
    pub confidence: f64,
    pub score: u8,
}

#[derive(Debug, Clone)]
pub struct Analysis {
    pub original: Locator,
    /// Index of the resolved target in the snapshot.
    pub target: Option<usize>,
    pub candidates: Vec<Candidate>,
}

pub fn analyze(selector: &str, dom: &str, action_type: Option<&str>, max_candidates: usize) -> Analysis {
    let original = Locator::parse(selector);
    let snapshot = Snapshot::parse(dom);

    let Some(target) = resolve_target(&snapshot, &original, action_type) else {
        return Analysis {
            original,
            target: None,
            candidates: Vec::new(),
        };
    };

    let element = &snapshot.elements[target];
    let mut ranked: Vec<Ranked> = generate(&snapshot, element)
        .into_iter()
        .enumerate()
        .map(|(order, locator)| Ranked::new(locator, order))
        .collect();

    let original_rendered = original.render();
    ranked.retain(|r| r.selector != original.raw && r.selector != original_rendered);
    ranked.sort_by(score::compare);

    let mut seen = HashSet::new();
    let candidates = ranked
        .into_iter()
        .filter(|r| seen.insert(r.selector.clone()))
        .take(max_candidates)
        .map(|r| Candidate {
            confidence: score::confidence(r.score),
            method: r.locator.method,
            score: r.score,
            selector: r.selector,
        })
        .collect();

    Analysis {
        original,
        target: Some(target),
        candidates,
    }
}

/// Identity tokens of an element.
fn element_tokens(element: &ElementInfo) -> HashSet<String> {
    let mut tokens = HashSet::new();
    let mut add = |s: &str| tokens.extend(tokenize(s));
    if let Some(id) = element.id() {
        add(id);
    }
    for class in element.classes() {
        add(class);
    }
    if let Some((_, tid)) = element.test_id() {
        add(tid);
    }
    for attr in ["name", "aria-label", "placeholder", "alt", "title", "value"] {
        if let Some(v) = element.attr(attr) {
            add(v);
        }
    }
    if let Some(label) = &element.label {
        add(label);
    }
    if element.text.len() <= MAX_TEXT_LEN * 2 {
        add(&element.text);
    }
    tokens
}

fn affinity(element: &ElementInfo, original: &Locator, wanted: &HashSet<String>) -> usize {
    let shared = element_tokens(element).intersection(wanted).count();
    if shared == 0 {
        return 0;
    }
    let tag_match = original.tag_hint().as_deref() == Some(element.tag.as_str());
    let role_match = original.method == LocatorMethod::Role
        && element.role().as_deref() == Some(original.value.as_str());
    shared + usize::from(tag_match || role_match)
}

/// Elements the action could have targeted.
fn accepts_action(element: &ElementInfo, action_type: Option<&str>) -> bool {
    if !element.is_interactive() {
        return false;
    }
    match action_type.map(str::to_ascii_lowercase).as_deref() {
        Some("fill" | "type" | "press" | "input" | "clear") => {
            matches!(element.tag.as_str(), "input" | "textarea") && element.is_form_field()
        }
        Some("select" | "selectoption" | "select_option") => element.tag == "select",
        Some("check" | "uncheck") => matches!(element.role().as_deref(), Some("checkbox" | "radio" | "switch")),
        Some("click" | "dblclick" | "tap" | "hover") => !element.is_form_field() || element.tag == "select",
        _ => true,
    }
}

/// Highest affinity wins. Ties go to interactive elements, then to the
/// deeper element (a button beats the form that contains its text), then to
/// document order. With no affinity anywhere, the first element compatible
/// with the action is used.
fn resolve_target(snapshot: &Snapshot, original: &Locator, action_type: Option<&str>) -> Option<usize> {
    let wanted: HashSet<String> = original.tokens().into_iter().collect();

    let best = snapshot
        .elements
        .iter()
        .map(|e| (affinity(e, original, &wanted), e))
        .filter(|(a, _)| *a > 0)
        .max_by(|(a1, e1), (a2, e2)| {
            a1.cmp(a2)
                .then(e1.is_interactive().cmp(&e2.is_interactive()))
                .then(e1.depth.cmp(&e2.depth))
                .then(e2.index.cmp(&e1.index))
        })
        .map(|(_, e)| e.index);

    best.or_else(|| {
        snapshot
            .elements
            .iter()
            .find(|e| accepts_action(e, action_type))
            .map(|e| e.index)
    })
}

fn is_css_ident(s: &str) -> bool {
    let mut chars = s.chars();
    chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

fn css_quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Alternatives for `element`, most stable first.
fn generate(snapshot: &Snapshot, element: &ElementInfo) -> Vec<Locator> {
    let mut out = Vec::new();

    if let Some(role) = element.role() {
        match element.accessible_name().filter(|n| n.chars().count() <= MAX_TEXT_LEN) {
            Some(name) => out.push(Locator {
                method: LocatorMethod::Role,
                value: role,
                name: Some(name),
                raw: String::new(),
            }),
            None if snapshot.count_role(&role, None) == 1 => {
                out.push(Locator::new(LocatorMethod::Role, role, ""));
            }
            None => {}
        }
    }

    if let Some(label) = element.label.as_deref().or_else(|| element.attr("aria-label")) {
        out.push(Locator::new(LocatorMethod::Label, label.trim(), ""));
    }

    if let Some((attr, value)) = element.test_id() {
        let raw = if attr == "data-testid" {
            String::new()
        } else {
            format!("[{attr}={}]", css_quote(value))
        };
        out.push(Locator::new(LocatorMethod::TestId, value, raw));
    }

    if let Some(placeholder) = element.attr("placeholder") {
        out.push(Locator::new(LocatorMethod::Placeholder, placeholder, ""));
    }

    if element.tag == "img" {
        if let Some(alt) = element.attr("alt") {
            out.push(Locator::new(LocatorMethod::AltText, alt, ""));
        }
    }

    if !element.is_form_field()
        && !element.text.is_empty()
        && element.text.chars().count() <= MAX_TEXT_LEN
    {
        out.push(Locator::new(LocatorMethod::Text, element.text.clone(), ""));
    }

    if let Some(id) = element.id().filter(|id| is_css_ident(id)) {
        out.push(Locator::new(LocatorMethod::Id, id, ""));
    }

    if let Some(name) = element.attr("name") {
        let css = format!("{}[name={}]", element.tag, css_quote(name));
        out.push(Locator::new(LocatorMethod::Attribute, css.clone(), css));
    }

    let classes: Vec<&str> = element.classes().into_iter().filter(|c| is_css_ident(c)).collect();
    if !classes.is_empty() {
        let css = format!("{}.{}", element.tag, classes.join("."));
        out.push(Locator::new(LocatorMethod::Class, css.clone(), css));
    }

    let parent = match element.parent.and_then(|p| snapshot.get(p)) {
        Some(p) => match p.id().filter(|id| is_css_ident(id)) {
            Some(id) => format!("#{id}"),
            None => p.tag.clone(),
        },
        None => "body".to_string(),
    };
    let css = format!("{parent} > {}:nth-of-type({})", element.tag, element.nth_of_type);
    out.push(Locator::new(LocatorMethod::Combinator, css.clone(), css));

    out
}
