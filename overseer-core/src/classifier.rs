//! Pattern-based blocker classification
//!
//! Rules are plain data: an ordered list of regexes, keywords and context
//! hints per blocker type. They can be loaded from JSON or taken from the
//! built-in defaults. Classification is pure and deterministic.
//!
//! A rule's score is
//!
//! ```text
//! 0.5 if any regex matches
//! + 0.4 * min(keyword hits, 2) / 2
//! + 0.05 per matched context hint
//! ```
//!
//! and only counts when at least one regex or keyword matched the text.
//! The first rule, in list order, whose score exceeds the threshold wins.
//!
//! ```rust
//! use overseer_core::blocker::BlockerType;
//! use overseer_core::classifier::*;
//!
//! let classifier = BlockerClassifier::with_defaults(0.15).unwrap();
//! let verdict = classifier.classify("out of disk space on runner", &ClassificationContext::default());
//! assert_eq!(verdict.blocker_type, BlockerType::Resource);
//! ```

use crate::blocker::BlockerType;
use crate::message::MessageKind;
use crate::{Error, Result};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

const REGEX_WEIGHT: f64 = 0.5;
const KEYWORD_WEIGHT: f64 = 0.4;
const KEYWORD_SATURATION: usize = 2;
const HINT_WEIGHT: f64 = 0.05;

/// Signal outside the text that nudges a rule's score
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "hint", content = "value", rename_all = "snake_case")]
pub enum ContextHint {
    /// The reporting agent recently exchanged a message of this kind
    RecentKind(MessageKind),
    /// The agent previously reported a blocker of this type
    PriorType(BlockerType),
}

/// Serializable form of a classification rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatternRule {
    pub id: String,
    pub blocker_type: BlockerType,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub context_hints: Vec<ContextHint>,
}

impl PatternRule {
    pub fn new<S: Into<String>>(id: S, blocker_type: BlockerType) -> Self {
        Self {
            id: id.into(),
            blocker_type,
            patterns: Vec::new(),
            keywords: Vec::new(),
            context_hints: Vec::new(),
        }
    }

    pub fn patterns<I: IntoIterator<Item = &'static str>>(mut self, patterns: I) -> Self {
        self.patterns.extend(patterns.into_iter().map(String::from));
        self
    }

    pub fn keywords<I: IntoIterator<Item = &'static str>>(mut self, keywords: I) -> Self {
        self.keywords.extend(keywords.into_iter().map(String::from));
        self
    }

    pub fn hint(mut self, hint: ContextHint) -> Self {
        self.context_hints.push(hint);
        self
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    rule: PatternRule,
    regexes: Vec<Regex>,
    keywords: Vec<String>,
}

impl CompiledRule {
    fn compile(rule: PatternRule) -> Result<Self> {
        if rule.id.trim().is_empty() {
            return Err(Error::configuration("Pattern rule id cannot be empty"));
        }
        if rule.patterns.is_empty() && rule.keywords.is_empty() {
            return Err(Error::configuration(format!(
                "Pattern rule '{}' needs at least one pattern or keyword",
                rule.id
            )));
        }
        let regexes = rule
            .patterns
            .iter()
            .map(|p| RegexBuilder::new(p).case_insensitive(true).build())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let keywords = rule.keywords.iter().map(|k| k.to_lowercase()).collect();

        Ok(Self {
            rule,
            regexes,
            keywords,
        })
    }

    fn score(&self, text: &str, lowered: &str, context: &ClassificationContext) -> Option<f64> {
        let regex_hit = self.regexes.iter().any(|r| r.is_match(text));
        let keyword_hits = self
            .keywords
            .iter()
            .filter(|k| lowered.contains(k.as_str()))
            .count();
        if !regex_hit && keyword_hits == 0 {
            return None;
        }

        let hint_hits = self
            .rule
            .context_hints
            .iter()
            .filter(|hint| context.matches(hint))
            .count();

        let mut score = 0.0;
        if regex_hit {
            score += REGEX_WEIGHT;
        }
        score += KEYWORD_WEIGHT * keyword_hits.min(KEYWORD_SATURATION) as f64
            / KEYWORD_SATURATION as f64;
        score += HINT_WEIGHT * hint_hits as f64;
        Some(score.clamp(0.0, 1.0))
    }
}

/// Ordered, compiled rule list
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<PatternRule>) -> Result<Self> {
        let rules = rules
            .into_iter()
            .map(CompiledRule::compile)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { rules })
    }

    /// Parse a JSON array of rules
    pub fn from_json(json: &str) -> Result<Self> {
        let rules: Vec<PatternRule> = serde_json::from_str(json)?;
        Self::new(rules)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.rules())?)
    }

    pub fn rules(&self) -> Vec<PatternRule> {
        self.rules.iter().map(|c| c.rule.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// The stock rule list, one rule per known blocker type
    pub fn default_rules() -> Vec<PatternRule> {
        use BlockerType::*;
        vec![
            PatternRule::new("dependency_wait", Dependency)
                .patterns([r"waiting for .+ to complete", r"blocked by .+", r"depends on .+"])
                .keywords(["waiting", "blocked", "dependency", "prerequisite"])
                .hint(ContextHint::PriorType(Dependency)),
            PatternRule::new("resource_shortage", Resource)
                .patterns([r"out of .+", r"insufficient .+", r"no available .+"])
                .keywords(["memory", "disk", "cpu", "quota", "resources"])
                .hint(ContextHint::PriorType(Resource)),
            PatternRule::new("communication_loss", Communication)
                .patterns([r"not responding", r"timeout", r"unreachable"])
                .keywords(["timeout", "unresponsive", "offline", "disconnected"])
                .hint(ContextHint::RecentKind(MessageKind::Request))
                .hint(ContextHint::PriorType(Communication)),
            PatternRule::new("technical_failure", Technical)
                .patterns([r"error: .+", r"exception .+", r"failed to .+"])
                .keywords(["error", "exception", "crash", "bug", "failure"])
                .hint(ContextHint::PriorType(Technical)),
            PatternRule::new("process_gate", Process)
                .patterns([r"approval needed", r"waiting for sign-?off", r"review required"])
                .keywords(["approval", "review", "sign-off", "permission"])
                .hint(ContextHint::RecentKind(MessageKind::Escalation))
                .hint(ContextHint::PriorType(Process)),
            PatternRule::new("human_absence", Human)
                .patterns([r"developer .+ not available", r"waiting for .+ response"])
                .keywords(["vacation", "sick", "unavailable", "unresponsive", "ignoring"])
                .hint(ContextHint::PriorType(Human)),
            PatternRule::new("existential_doubt", Existential)
                .patterns([r"what'?s the point", r"why are we doing this"])
                .keywords(["meaningless", "pointless", "why", "purpose"])
                .hint(ContextHint::PriorType(Existential)),
        ]
    }
}

impl Default for RuleSet {
    fn default() -> Self {
        // The stock patterns are static and known to compile.
        let rules = RuleSet::default_rules()
            .into_iter()
            .filter_map(|rule| CompiledRule::compile(rule).ok())
            .collect();
        Self { rules }
    }
}

/// What the classifier may know besides the text
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationContext {
    pub recent_kinds: Vec<MessageKind>,
    pub prior_types: Vec<BlockerType>,
}

impl ClassificationContext {
    fn matches(&self, hint: &ContextHint) -> bool {
        match hint {
            ContextHint::RecentKind(kind) => self.recent_kinds.contains(kind),
            ContextHint::PriorType(blocker_type) => self.prior_types.contains(blocker_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub blocker_type: BlockerType,
    pub confidence: f64,
    /// Rule that produced the verdict; `None` on a miss
    pub rule_id: Option<String>,
}

impl Classification {
    pub fn miss() -> Self {
        Self {
            blocker_type: BlockerType::Unknown,
            confidence: 0.0,
            rule_id: None,
        }
    }

    pub fn is_miss(&self) -> bool {
        self.rule_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct BlockerClassifier {
    rules: RuleSet,
    threshold: f64,
}

impl BlockerClassifier {
    pub fn new(rules: RuleSet, threshold: f64) -> Result<Self> {
        if !(0.0..1.0).contains(&threshold) {
            return Err(Error::configuration(format!(
                "Classification threshold must be in [0, 1), got {}",
                threshold
            )));
        }
        Ok(Self { rules, threshold })
    }

    pub fn with_defaults(threshold: f64) -> Result<Self> {
        Self::new(RuleSet::new(RuleSet::default_rules())?, threshold)
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Assign a blocker type to a free-form description
    pub fn classify(&self, raw_description: &str, context: &ClassificationContext) -> Classification {
        let lowered = raw_description.to_lowercase();
        for compiled in &self.rules.rules {
            if let Some(score) = compiled.score(raw_description, &lowered, context) {
                if score > self.threshold {
                    return Classification {
                        blocker_type: compiled.rule.blocker_type,
                        confidence: score,
                        rule_id: Some(compiled.rule.id.clone()),
                    };
                }
            }
        }
        debug!(
            rules = self.rules.len(),
            "No pattern rule matched blocker description"
        );
        Classification::miss()
    }
}

impl Default for BlockerClassifier {
    fn default() -> Self {
        Self {
            rules: RuleSet::default(),
            threshold: 0.15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn classifier() -> BlockerClassifier {
        BlockerClassifier::with_defaults(0.15).unwrap()
    }

    #[rstest]
    #[case("Waiting for the auth service to complete", BlockerType::Dependency)]
    #[case("Out of memory on build box", BlockerType::Resource)]
    #[case("Payments API not responding", BlockerType::Communication)]
    #[case("error: cannot borrow as mutable", BlockerType::Technical)]
    #[case("permission_issue", BlockerType::Process)]
    #[case("Developer Sam not available this week", BlockerType::Human)]
    #[case("What's the point of this refactor", BlockerType::Existential)]
    fn test_default_rules(#[case] text: &str, #[case] expected: BlockerType) {
        let verdict = classifier().classify(text, &ClassificationContext::default());
        assert_eq!(verdict.blocker_type, expected);
        assert!(verdict.confidence > 0.15);
        assert!(verdict.confidence <= 1.0);
    }

    #[test]
    fn test_no_match_is_unknown() {
        let verdict = classifier().classify("lunch", &ClassificationContext::default());
        assert_eq!(verdict, Classification::miss());
        assert!(verdict.is_miss());
    }

    #[test]
    fn test_score_components() {
        let classifier = classifier();
        let context = ClassificationContext::default();

        // one keyword only
        let verdict = classifier.classify("need more quota", &context);
        assert!((verdict.confidence - 0.2).abs() < 1e-9);

        // regex plus two keywords saturates the keyword term
        let verdict = classifier.classify("out of memory, disk and cpu", &context);
        assert!((verdict.confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn test_context_hint_adds_but_needs_text() {
        let classifier = classifier();
        let context = ClassificationContext {
            recent_kinds: vec![],
            prior_types: vec![BlockerType::Resource],
        };
        let verdict = classifier.classify("need more quota", &context);
        assert!((verdict.confidence - 0.25).abs() < 1e-9);

        let verdict = classifier.classify("lunch", &context);
        assert!(verdict.is_miss());
    }

    #[test]
    fn test_threshold_is_strict() {
        let classifier = BlockerClassifier::with_defaults(0.2).unwrap();
        let verdict = classifier.classify("need more quota", &ClassificationContext::default());
        assert!(verdict.is_miss());
    }

    #[test]
    fn test_deterministic() {
        let classifier = classifier();
        let context = ClassificationContext::default();
        let a = classifier.classify("blocked by the db migration", &context);
        let b = classifier.classify("blocked by the db migration", &context);
        assert_eq!(a, b);
    }

    #[test]
    fn test_rules_from_json() {
        let json = r#"[
            {"id": "flaky", "blocker_type": "TECHNICAL", "keywords": ["flaky"]},
            {"id": "vpn", "blocker_type": "COMMUNICATION", "patterns": ["vpn (is )?down"],
             "context_hints": [{"hint": "recent_kind", "value": "REQUEST"}]}
        ]"#;
        let rules = RuleSet::from_json(json).unwrap();
        assert_eq!(rules.len(), 2);

        let classifier = BlockerClassifier::new(rules, 0.15).unwrap();
        let verdict = classifier.classify("VPN is down again", &ClassificationContext::default());
        assert_eq!(verdict.blocker_type, BlockerType::Communication);
        assert_eq!(verdict.rule_id.as_deref(), Some("vpn"));
    }

    #[test]
    fn test_invalid_rules_rejected() {
        assert!(RuleSet::from_json(r#"[{"id": "x", "blocker_type": "HUMAN"}]"#).is_err());
        assert!(RuleSet::from_json(r#"[{"id": "x", "blocker_type": "HUMAN", "patterns": ["("]}]"#).is_err());
        assert!(BlockerClassifier::new(RuleSet::default(), 1.5).is_err());
    }

    #[test]
    fn test_default_ruleset_roundtrips_through_json() {
        let json = RuleSet::default().to_json().unwrap();
        let reloaded = RuleSet::from_json(&json).unwrap();
        assert_eq!(reloaded.rules(), RuleSet::default_rules());
    }
}
