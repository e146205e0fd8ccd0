use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};

use anyhow::{bail, Context as _};
use lazy_static::lazy_static;
#[allow(unused_imports)]
use log::debug;
use regex::Regex;

use crate::errors::TraversalError;

// Flat string-to-string parameter dictionary. A BTreeMap rather than a
// HashMap so that fingerprints and dumps come out deterministic.
pub type Params = BTreeMap<String, String>;

pub trait ParamsExt {
    fn get_str(&self, key: &str, default: &str) -> String;
    fn get_numeric(&self, key: &str, default: u64) -> u64;
    fn get_boolean(&self, key: &str) -> bool;
    // All keys of the form "<prefix>_<rest>", yielding (rest, value).
    fn suffixed(&self, prefix: &str) -> Vec<(String, String)>;
}

impl ParamsExt for Params {
    fn get_str(&self, key: &str, default: &str) -> String {
        self.get(key).cloned().unwrap_or_else(|| default.to_owned())
    }

    fn get_numeric(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_boolean(&self, key: &str) -> bool {
        matches!(self.get(key).map(String::as_str), Some("yes") | Some("true"))
    }

    fn suffixed(&self, prefix: &str) -> Vec<(String, String)> {
        let lead = format!("{prefix}_");
        self.iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&lead)
                    .map(|rest| (rest.to_owned(), v.clone()))
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum RestrLine {
    Only(String),
    No(String),
}

lazy_static! {
    // Variant names and thus restriction tokens are dot-joined words.
    static ref TOKEN_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]+(\.[A-Za-z0-9_-]+)*$").unwrap();
}

// A restriction expression over dot-joined variant names. Lines are
// "only <token>" / "no <token>"; an empty expression allows everything.
// Multiple "only" lines must all match (they intersect, like repeated
// filters in the matrix language this mimics).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Restriction {
    lines: Vec<RestrLine>,
}

impl Restriction {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (op, token) = line
                .split_once(' ')
                .with_context(|| format!("malformed restriction line {line:?}"))?;
            let token = token.trim();
            if !TOKEN_REGEX.is_match(token) {
                bail!("restriction line {line:?} names no valid variant");
            }
            match op {
                "only" => lines.push(RestrLine::Only(token.to_owned())),
                "no" => lines.push(RestrLine::No(token.to_owned())),
                _ => bail!("unknown restriction operator {op:?} in {line:?}"),
            }
        }
        Ok(Self { lines })
    }

    // Shorthand for a single "only" line, which is what almost every caller
    // constructs programmatically.
    pub fn only(token: impl Into<String>) -> Self {
        Self {
            lines: vec![RestrLine::Only(token.into())],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    // Re-parse with an additional restriction stacked on top.
    pub fn and_also(&self, other: &Restriction) -> Self {
        let mut lines = self.lines.clone();
        for line in &other.lines {
            if !lines.contains(line) {
                lines.push(line.clone());
            }
        }
        Self { lines }
    }

    // Whether a dot-joined variant name passes this restriction. A token
    // matches when all of its dot components appear, in order, among the
    // name's components.
    pub fn allows(&self, name: &str) -> bool {
        let components: Vec<&str> = name.split('.').collect();
        let contains = |token: &str| {
            let mut at = 0;
            for want in token.split('.') {
                match components[at..].iter().position(|c| *c == want) {
                    Some(i) => at += i + 1,
                    None => return false,
                }
            }
            true
        };
        self.lines.iter().all(|line| match line {
            RestrLine::Only(token) => contains(token),
            RestrLine::No(token) => !contains(token),
        })
    }

    // Select the allowed names out of an iterator, failing with EmptyProduct
    // when nothing survives.
    pub fn filter<'a, I>(&self, names: I) -> Result<Vec<&'a str>, TraversalError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let selected: Vec<&str> = names.into_iter().filter(|n| self.allows(n)).collect();
        if selected.is_empty() {
            return Err(TraversalError::EmptyProduct {
                restriction: self.parsable_form(),
            });
        }
        Ok(selected)
    }

    // The canonical multi-line form, re-parsable by parse.
    pub fn parsable_form(&self) -> String {
        self.lines
            .iter()
            .map(|line| match line {
                RestrLine::Only(t) => format!("only {t}\n"),
                RestrLine::No(t) => format!("no {t}\n"),
            })
            .collect()
    }
}

impl Display for Restriction {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.parsable_form().trim_end())
    }
}

// Overlay params on top of base ones, last writer winning. Used for the
// CLI key=value overrides and for runtime param injection.
pub fn overlay(base: &Params, over: &Params) -> Params {
    let mut merged = base.clone();
    for (k, v) in over {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

// Parse repeated "key=value" arguments into a param dictionary.
pub fn params_from_pairs<S: AsRef<str>>(pairs: &[S]) -> anyhow::Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let (key, value) = pair
            .as_ref()
            .split_once('=')
            .with_context(|| format!("override {:?} is not of the form key=value", pair.as_ref()))?;
        params.insert(key.to_owned(), value.to_owned());
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use test_case::test_case;

    use super::*;

    #[test_case("normal.quicktest.tutorial1.vm1", true; "leaf by last component")]
    #[test_case("internal.automated.customize.vm1", false; "other set")]
    #[test_case("normal.tutorial1again.vm1", false; "no substring matches")]
    fn test_only_allows(name: &str, want: bool) {
        let restr = Restriction::parse("only tutorial1").unwrap();
        assert_eq!(restr.allows(name), want, "for {name}");
    }

    #[googletest::test]
    fn test_dotted_token_matches_in_order() {
        let restr = Restriction::only("quicktest.tutorial2");
        expect_that!(restr.allows("normal.quicktest.tutorial2.vm1"), eq(true));
        // Components present but out of order must not match.
        expect_that!(restr.allows("tutorial2.quicktest.vm1"), eq(false));
    }

    #[googletest::test]
    fn test_no_line_excludes() {
        let restr = Restriction::parse("only quicktest\nno tutorial2\n").unwrap();
        expect_that!(restr.allows("normal.quicktest.tutorial1.vm1"), eq(true));
        expect_that!(restr.allows("normal.quicktest.tutorial2.vm1"), eq(false));
    }

    #[googletest::test]
    fn test_empty_restriction_allows_everything() {
        let restr = Restriction::default();
        expect_that!(restr.allows("anything.at.all"), eq(true));
    }

    #[googletest::test]
    fn test_filter_empty_product() {
        let restr = Restriction::only("nonexistent");
        let err = restr.filter(["a.b", "c.d"]).unwrap_err();
        expect_that!(err.to_string(), contains_substring("empty Cartesian product"));
    }

    #[googletest::test]
    fn test_round_trips_through_parsable_form() {
        let text = "only quicktest\nno tutorial2\n";
        let restr = Restriction::parse(text).unwrap();
        assert_that!(
            Restriction::parse(&restr.parsable_form()).unwrap(),
            eq(&restr)
        );
    }

    #[googletest::test]
    fn test_rejects_garbage() {
        expect_that!(Restriction::parse("sometimes tutorial1"), err(anything()));
        expect_that!(Restriction::parse("only "), err(anything()));
        expect_that!(Restriction::parse("only two words"), err(anything()));
        expect_that!(Restriction::parse("only semi;colon"), err(anything()));
    }

    #[googletest::test]
    fn test_params_from_pairs() {
        let params = params_from_pairs(&["a=1", "b=x=y"]).unwrap();
        expect_that!(params.get("a"), some(eq(&"1".to_owned())));
        // Only the first '=' splits.
        expect_that!(params.get("b"), some(eq(&"x=y".to_owned())));
        expect_that!(params_from_pairs(&["oops"]), err(anything()));
    }
}
