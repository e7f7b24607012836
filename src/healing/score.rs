//! Stability scoring for candidate locators.
//!
//! Scores run from 0 (stable) to 10 (brittle). Confidence is `1 - score/10`.

use std::cmp::Ordering;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::locator::{is_positional, Locator, LocatorMethod};

/// Coarse stability tier used to break confidence ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StabilityClass {
    /// role, label, test id
    Semantic,
    /// placeholder, alt text
    Descriptive,
    Textual,
    /// id and attribute CSS
    Structural,
    /// class, combinator and XPath
    Brittle,
}

impl StabilityClass {
    pub fn of(method: LocatorMethod) -> Self {
        match method {
            LocatorMethod::Role | LocatorMethod::Label | LocatorMethod::TestId => StabilityClass::Semantic,
            LocatorMethod::Placeholder | LocatorMethod::AltText => StabilityClass::Descriptive,
            LocatorMethod::Text => StabilityClass::Textual,
            LocatorMethod::Id | LocatorMethod::Attribute | LocatorMethod::Tag => StabilityClass::Structural,
            LocatorMethod::Class | LocatorMethod::Combinator | LocatorMethod::XPath => StabilityClass::Brittle,
        }
    }
}

/// Three or more consecutive digits, or a long hex run: `btn-48213`, `ember1234`,
/// `a3f9c2e1d0`.
static GENERATED_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(?:\d{3,}|[0-9a-f]{8,}|^:r[0-9a-z]+:$)").unwrap());

/// True for ids produced by frameworks rather than authors.
pub fn looks_generated(id: &str) -> bool {
    GENERATED_ID.is_match(id)
}

pub fn stability_score(locator: &Locator) -> u8 {
    match locator.method {
        LocatorMethod::Role | LocatorMethod::Label | LocatorMethod::TestId => 1,
        LocatorMethod::Placeholder | LocatorMethod::AltText => 2,
        LocatorMethod::Text => 4,
        LocatorMethod::Id if looks_generated(&locator.value) => 5,
        LocatorMethod::Id => 3,
        LocatorMethod::Attribute => 4,
        LocatorMethod::Tag => 5,
        LocatorMethod::Class => {
            if locator.value.matches('.').count() > 2 {
                8
            } else {
                7
            }
        }
        LocatorMethod::Combinator | LocatorMethod::XPath => {
            if is_positional(&locator.value) {
                9
            } else {
                8
            }
        }
    }
}

pub fn confidence(score: u8) -> f64 {
    (10.0 - f64::from(score.min(10))) / 10.0
}

/// Ranking key for a generated candidate.
#[derive(Debug, Clone)]
pub struct Ranked {
    pub locator: Locator,
    pub selector: String,
    pub score: u8,
    /// Position in generation order.
    pub order: usize,
}

impl Ranked {
    pub fn new(locator: Locator, order: usize) -> Self {
        Self {
            score: stability_score(&locator),
            selector: locator.render(),
            locator,
            order,
        }
    }

    pub fn class(&self) -> StabilityClass {
        StabilityClass::of(self.locator.method)
    }
}

/// Lower score first, then more stable class, then generation order.
pub fn compare(a: &Ranked, b: &Ranked) -> Ordering {
    a.score
        .cmp(&b.score)
        .then(a.class().cmp(&b.class()))
        .then(a.order.cmp(&b.order))
        .then_with(|| a.selector.cmp(&b.selector))
}
