// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Glob-based accept/reject on metric name and tags, tag projection, and the
//! histogram-routing predicate.

use std::collections::HashMap;

use globset::{Glob, GlobMatcher};

use crate::error::NozzleError;

/// Frozen-at-build description of a filter, as read from configuration.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    pub metric_whitelist: Vec<String>,
    pub metric_blacklist: Vec<String>,
    pub histogram_list: Vec<String>,
    pub tag_whitelist: HashMap<String, Vec<String>>,
    pub tag_blacklist: HashMap<String, Vec<String>>,
    pub tag_include: Vec<String>,
    pub tag_exclude: Vec<String>,
}

/// Compiles a pattern list into a single alternation glob, per §4.2:
/// empty entries are discarded, a lone pattern is used directly, otherwise
/// the set is joined as `{pat1,pat2,...}`.
fn compile(patterns: &[String]) -> Result<Option<GlobMatcher>, NozzleError> {
    let cleaned: Vec<&str> = patterns
        .iter()
        .map(|p| p.trim())
        .filter(|p| !p.is_empty())
        .collect();
    if cleaned.is_empty() {
        return Ok(None);
    }
    let joined = if cleaned.len() == 1 {
        cleaned[0].to_string()
    } else {
        format!("{{{}}}", cleaned.join(","))
    };
    let glob = Glob::new(&joined)
        .map_err(|e| NozzleError::Config(format!("invalid glob pattern {joined:?}: {e}")))?;
    Ok(Some(glob.compile_matcher()))
}

fn compile_map(
    patterns: &HashMap<String, Vec<String>>,
) -> Result<HashMap<String, GlobMatcher>, NozzleError> {
    let mut out = HashMap::with_capacity(patterns.len());
    for (tag, pats) in patterns {
        if let Some(m) = compile(pats)? {
            out.insert(tag.clone(), m);
        }
    }
    Ok(out)
}

/// Compiled, immutable filter: glob matching against pre-compiled `GlobSet`s
/// is O(pattern count) but happens once per sample, never per pattern at
/// construction time.
pub struct FilterEngine {
    metric_whitelist: Option<GlobMatcher>,
    metric_blacklist: Option<GlobMatcher>,
    histogram_list: Option<GlobMatcher>,
    tag_whitelist: HashMap<String, GlobMatcher>,
    tag_blacklist: HashMap<String, GlobMatcher>,
    tag_include: Option<GlobMatcher>,
    tag_exclude: Option<GlobMatcher>,
}

impl FilterEngine {
    pub fn new(spec: &FilterSpec) -> Result<Self, NozzleError> {
        Ok(Self {
            metric_whitelist: compile(&spec.metric_whitelist)?,
            metric_blacklist: compile(&spec.metric_blacklist)?,
            histogram_list: compile(&spec.histogram_list)?,
            tag_whitelist: compile_map(&spec.tag_whitelist)?,
            tag_blacklist: compile_map(&spec.tag_blacklist)?,
            tag_include: compile(&spec.tag_include)?,
            tag_exclude: compile(&spec.tag_exclude)?,
        })
    }

    fn tag_set_matches(matchers: &HashMap<String, GlobMatcher>, tags: &HashMap<String, String>) -> bool {
        tags.iter()
            .any(|(k, v)| matchers.get(k).is_some_and(|m| m.is_match(v)))
    }

    /// Implements the seven-step algorithm from §4.2, in order, with the two
    /// projection steps applied in place before returning `true`. `foundation`
    /// is exempt from both projections: it is a mandatory tag on every
    /// accepted sample (§3 invariant, F2), not a user-controlled one the
    /// include/exclude patterns are meant to govern.
    pub fn accepts(&self, name: &str, tags: &mut HashMap<String, String>) -> bool {
        if let Some(m) = &self.metric_whitelist {
            if !m.is_match(name) {
                return false;
            }
        }
        if let Some(m) = &self.metric_blacklist {
            if m.is_match(name) {
                return false;
            }
        }
        if !self.tag_whitelist.is_empty() && !Self::tag_set_matches(&self.tag_whitelist, tags) {
            return false;
        }
        if !self.tag_blacklist.is_empty() && Self::tag_set_matches(&self.tag_blacklist, tags) {
            return false;
        }
        if let Some(m) = &self.tag_include {
            tags.retain(|k, _| k == "foundation" || m.is_match(k));
        }
        if let Some(m) = &self.tag_exclude {
            tags.retain(|k, _| k == "foundation" || !m.is_match(k));
        }
        true
    }

    pub fn is_histogram(&self, name: &str) -> bool {
        self.histogram_list.as_ref().is_some_and(|m| m.is_match(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn whitelist_rejects_non_matching_name() {
        let spec = FilterSpec {
            metric_whitelist: vec!["pcf.rtr.*".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::new(&spec).unwrap();
        let mut t = tags(&[]);
        assert!(!engine.accepts("pcf.uaa.logins.total", &mut t));
    }

    #[test]
    fn tag_include_keeps_matching_keys_and_always_keeps_foundation() {
        let spec = FilterSpec {
            tag_include: vec!["tag[0-9]".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::new(&spec).unwrap();
        let mut t = tags(&[("tag1", "x"), ("tagA", "y"), ("foundation", "fA")]);
        assert!(engine.accepts("anything", &mut t));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get("tag1"), Some(&"x".to_string()));
        assert_eq!(t.get("foundation"), Some(&"fA".to_string()));
        assert!(!t.contains_key("tagA"));
    }

    #[test]
    fn tag_exclude_removes_matching_keys_but_never_foundation() {
        let spec = FilterSpec {
            tag_exclude: vec!["secret*".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::new(&spec).unwrap();
        let mut t = tags(&[("secret_key", "x"), ("keep", "y"), ("foundation", "fA")]);
        assert!(engine.accepts("anything", &mut t));
        assert_eq!(t.len(), 2);
        assert!(t.contains_key("keep"));
        assert_eq!(t.get("foundation"), Some(&"fA".to_string()));
    }

    #[test]
    fn single_pattern_list_matches_same_as_direct() {
        let spec = FilterSpec {
            metric_whitelist: vec!["pcf.rtr.latency".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::new(&spec).unwrap();
        let mut t = tags(&[]);
        assert!(engine.accepts("pcf.rtr.latency", &mut t));
    }

    #[test]
    fn empty_filters_accept_everything() {
        let engine = FilterEngine::new(&FilterSpec::default()).unwrap();
        let mut t = tags(&[("a", "b")]);
        assert!(engine.accepts("anything.at.all", &mut t));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn histogram_routing_hint() {
        let spec = FilterSpec {
            histogram_list: vec!["pcf.rtr.latency".to_string()],
            ..Default::default()
        };
        let engine = FilterEngine::new(&spec).unwrap();
        assert!(engine.is_histogram("pcf.rtr.latency"));
        assert!(!engine.is_histogram("pcf.rtr.other"));
    }
}
