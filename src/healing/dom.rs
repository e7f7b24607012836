//! Flattened view of a captured DOM snapshot.
//!
//! The snapshot is parsed with html5ever into an `RcDom` and then walked once
//! into a flat list of [`ElementInfo`] in document order. Only body content is
//! kept; `head`, scripts and styles never produce candidates.

use std::collections::HashMap;

use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use markup5ever_rcdom::{Handle, NodeData, RcDom};

/// Attributes that carry an explicit test identifier, in preference order.
pub const TEST_ID_ATTRS: &[&str] = &["data-testid", "data-test-id", "data-test", "data-cy", "data-qa"];

const SKIPPED_TAGS: &[&str] = &["head", "script", "style", "noscript", "template", "meta", "link", "title"];

/// Wrapper tags that are walked through but not recorded.
const TRANSPARENT_TAGS: &[&str] = &["html", "body"];

#[derive(Debug, Clone)]
pub struct ElementInfo {
    pub index: usize,
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    /// Whitespace-collapsed text content of the subtree.
    pub text: String,
    pub parent: Option<usize>,
    /// 1-based position among siblings with the same tag.
    pub nth_of_type: usize,
    pub depth: usize,
    /// Text of an associated `<label>`.
    pub label: Option<String>,
}

impl ElementInfo {
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id")
    }

    pub fn classes(&self) -> Vec<&str> {
        self.attr("class")
            .map(|c| c.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// First test-identifier attribute present, as `(attr, value)`.
    pub fn test_id(&self) -> Option<(&'static str, &str)> {
        TEST_ID_ATTRS
            .iter()
            .find_map(|name| self.attr(name).map(|v| (*name, v)))
    }

    fn input_type(&self) -> String {
        self.attr("type").unwrap_or("text").to_ascii_lowercase()
    }

    pub fn is_form_field(&self) -> bool {
        match self.tag.as_str() {
            "input" => !matches!(
                self.input_type().as_str(),
                "hidden" | "submit" | "button" | "reset" | "image"
            ),
            "textarea" | "select" => true,
            _ => false,
        }
    }

    /// ARIA role: explicit `role` attribute, else the implicit role of the tag.
    pub fn role(&self) -> Option<String> {
        if let Some(role) = self.attr("role") {
            return role.split_whitespace().next().map(str::to_string);
        }
        let implicit = match self.tag.as_str() {
            "button" => "button",
            "a" | "area" if self.attr("href").is_some() => "link",
            "input" => match self.input_type().as_str() {
                "button" | "submit" | "reset" | "image" => "button",
                "checkbox" => "checkbox",
                "radio" => "radio",
                "range" => "slider",
                "number" => "spinbutton",
                "search" => "searchbox",
                "hidden" => return None,
                _ => "textbox",
            },
            "textarea" => "textbox",
            "select" if self.attr("multiple").is_some() => "listbox",
            "select" => "combobox",
            "option" => "option",
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => "heading",
            "img" if self.attr("alt").is_some() => "img",
            "nav" => "navigation",
            "main" => "main",
            "dialog" => "dialog",
            "ul" | "ol" => "list",
            "li" => "listitem",
            "table" => "table",
            "tr" => "row",
            "td" => "cell",
            "th" => "columnheader",
            "form" if self.attr("aria-label").is_some() || self.attr("name").is_some() => "form",
            _ => return None,
        };
        Some(implicit.to_string())
    }

    /// Accessible name, following the usual precedence closely enough for
    /// `getByRole(..., { name })` to resolve.
    pub fn accessible_name(&self) -> Option<String> {
        if let Some(name) = self.attr("aria-label") {
            return Some(name.trim().to_string());
        }
        if let Some(label) = self.label.as_deref().filter(|l| !l.is_empty()) {
            return Some(label.to_string());
        }
        match self.tag.as_str() {
            "img" | "area" => return self.attr("alt").map(str::to_string),
            "input" => {
                let kind = self.input_type();
                if matches!(kind.as_str(), "submit" | "button" | "reset") {
                    return self.attr("value").map(str::to_string);
                }
                return self.attr("title").map(str::to_string);
            }
            "textarea" | "select" => return self.attr("title").map(str::to_string),
            _ => {}
        }
        if !self.text.is_empty() {
            return Some(self.text.clone());
        }
        self.attr("title").map(str::to_string)
    }

    pub fn is_interactive(&self) -> bool {
        match self.tag.as_str() {
            "button" | "select" | "textarea" | "summary" => true,
            "a" => self.attr("href").is_some(),
            "input" => self.input_type() != "hidden",
            _ => {
                self.attr("onclick").is_some()
                    || self.attr("tabindex").is_some()
                    || matches!(
                        self.attr("role"),
                        Some("button" | "link" | "checkbox" | "tab" | "menuitem" | "textbox" | "switch" | "option")
                    )
            }
        }
    }
}

/// All body elements of a snapshot in document order.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub elements: Vec<ElementInfo>,
}

impl Snapshot {
    pub fn parse(html: &str) -> Self {
        let dom = parse_document(RcDom::default(), Default::default()).one(html);
        let mut snapshot = Snapshot::default();
        walk(&dom.document, None, 0, &mut snapshot.elements);
        snapshot.associate_labels();
        snapshot
    }

    pub fn get(&self, index: usize) -> Option<&ElementInfo> {
        self.elements.get(index)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Number of elements whose role and accessible name match.
    pub fn count_role(&self, role: &str, name: Option<&str>) -> usize {
        self.elements
            .iter()
            .filter(|e| e.role().as_deref() == Some(role))
            .filter(|e| name.is_none() || e.accessible_name().as_deref() == name)
            .count()
    }

    fn is_descendant(&self, index: usize, ancestor: usize) -> bool {
        let mut cursor = self.elements[index].parent;
        while let Some(p) = cursor {
            if p == ancestor {
                return true;
            }
            cursor = self.elements[p].parent;
        }
        false
    }

    /// Attach `<label>` text to the control it names, either through `for` or
    /// by wrapping the control.
    fn associate_labels(&mut self) {
        let ids: HashMap<String, usize> = self
            .elements
            .iter()
            .filter_map(|e| e.id().map(|id| (id.to_string(), e.index)))
            .collect();

        let labels: Vec<(usize, Option<String>, String)> = self
            .elements
            .iter()
            .filter(|e| e.tag == "label")
            .map(|e| (e.index, e.attr("for").map(str::to_string), e.text.clone()))
            .collect();

        for (label_index, target_id, text) in labels {
            if text.is_empty() {
                continue;
            }
            let target = match target_id {
                Some(id) => ids.get(&id).copied(),
                None => (label_index + 1..self.elements.len())
                    .find(|&i| self.is_descendant(i, label_index) && self.elements[i].is_form_field()),
            };
            if let Some(target) = target {
                let own_text = label_text_without_control(&text, &self.elements[target]);
                self.elements[target].label.get_or_insert(own_text);
            }
        }
    }
}

/// Wrapping labels also contain the control's text (select options). Keep
/// the label's own words only.
fn label_text_without_control(label: &str, control: &ElementInfo) -> String {
    if control.text.is_empty() {
        return label.to_string();
    }
    label.replace(&control.text, "").split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Depth-first walk. Returns the collapsed text of the subtree.
fn walk(handle: &Handle, parent: Option<usize>, depth: usize, out: &mut Vec<ElementInfo>) -> String {
    match &handle.data {
        NodeData::Document => walk_children(handle, parent, depth, out),
        NodeData::Text { contents } => contents.borrow().to_string(),
        NodeData::Element { name, attrs, .. } => {
            let tag = name.local.to_string().to_ascii_lowercase();
            if SKIPPED_TAGS.contains(&tag.as_str()) {
                return String::new();
            }
            if TRANSPARENT_TAGS.contains(&tag.as_str()) {
                return walk_children(handle, parent, depth, out);
            }

            let index = out.len();
            let attrs = attrs
                .borrow()
                .iter()
                .map(|a| (a.name.local.to_string(), a.value.to_string()))
                .collect();
            out.push(ElementInfo {
                index,
                tag,
                attrs,
                text: String::new(),
                parent,
                nth_of_type: 1,
                depth,
                label: None,
            });
            let text = collapse(&walk_children(handle, Some(index), depth + 1, out));
            out[index].text = text.clone();
            text
        }
        _ => String::new(),
    }
}

fn walk_children(handle: &Handle, parent: Option<usize>, depth: usize, out: &mut Vec<ElementInfo>) -> String {
    let mut text = String::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    for child in handle.children.borrow().iter() {
        let first_new = out.len();
        let child_text = walk(child, parent, depth, out);
        if !child_text.is_empty() {
            text.push(' ');
            text.push_str(&child_text);
        }
        // Direct children are the elements whose parent is this node.
        for i in first_new..out.len() {
            if out[i].parent == parent && out[i].depth == depth {
                let count = seen.entry(out[i].tag.clone()).or_insert(0);
                *count += 1;
                out[i].nth_of_type = *count;
            }
        }
    }
    text
}

fn collapse(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGIN: &str = r#"<!doctype html>
        <html><head><title>Login</title><style>.x{}</style></head>
        <body>
          <form id="login-form" class="card auth">
            <label for="email">Email address</label>
            <input id="email" name="email" type="email" placeholder="you@example.com">
            <label>Password <input name="password" type="password"></label>
            <button type="submit" class="btn btn-primary" data-testid="login-submit">Sign in</button>
            <a href="/forgot">Forgot password?</a>
          </form>
          <script>console.log("ignored")</script>
        </body></html>"#;

    fn find<'a>(snap: &'a Snapshot, tag: &str) -> &'a ElementInfo {
        snap.elements.iter().find(|e| e.tag == tag).unwrap()
    }

    #[test]
    fn test_body_elements_in_document_order() {
        let snap = Snapshot::parse(LOGIN);
        let tags: Vec<_> = snap.elements.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, ["form", "label", "input", "label", "input", "button", "a"]);
        assert!(snap.elements.iter().all(|e| e.tag != "script" && e.tag != "title"));
    }

    #[test]
    fn test_labels_attach_by_for_and_wrapping() {
        let snap = Snapshot::parse(LOGIN);
        let email = snap.elements.iter().find(|e| e.id() == Some("email")).unwrap();
        assert_eq!(email.label.as_deref(), Some("Email address"));
        let password = snap
            .elements
            .iter()
            .find(|e| e.attr("name") == Some("password"))
            .unwrap();
        assert_eq!(password.label.as_deref(), Some("Password"));
    }

    #[test]
    fn test_roles_and_names() {
        let snap = Snapshot::parse(LOGIN);
        let button = find(&snap, "button");
        assert_eq!(button.role().as_deref(), Some("button"));
        assert_eq!(button.accessible_name().as_deref(), Some("Sign in"));
        assert_eq!(button.test_id(), Some(("data-testid", "login-submit")));
        assert_eq!(find(&snap, "a").role().as_deref(), Some("link"));
        assert_eq!(snap.count_role("button", Some("Sign in")), 1);
    }

    #[test]
    fn test_nth_of_type_and_parent() {
        let snap = Snapshot::parse(LOGIN);
        let inputs: Vec<_> = snap.elements.iter().filter(|e| e.tag == "input").collect();
        // The password input sits inside its label, so both are first of type.
        assert_eq!(inputs[0].nth_of_type, 1);
        assert_eq!(inputs[1].nth_of_type, 1);
        let labels: Vec<_> = snap.elements.iter().filter(|e| e.tag == "label").collect();
        assert_eq!(labels[1].nth_of_type, 2);
        assert_eq!(find(&snap, "button").parent, Some(0));
    }

    #[test]
    fn test_interactive_detection() {
        let snap = Snapshot::parse(r#"<div>plain</div><div role="button">fake</div><a>no href</a>"#);
        assert!(!snap.elements[0].is_interactive());
        assert!(snap.elements[1].is_interactive());
        assert!(!snap.elements[2].is_interactive());
    }

    #[test]
    fn test_fragment_and_empty_input() {
        assert!(Snapshot::parse("").is_empty());
        let snap = Snapshot::parse("<button>Go</button>");
        assert_eq!(snap.elements.len(), 1);
        assert_eq!(snap.elements[0].text, "Go");
    }
}
