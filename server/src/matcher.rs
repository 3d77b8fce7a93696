//! Event router: decides which forwarding rules an inbound event fans out to.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use regex::Regex;
use tracing::warn;

use crate::error::StoreError;
use crate::models::{DeviceId, ForwardingRule, TriggerKind};
use crate::store::RuleStore;

/// Compiled patterns kept before the cache is reset.
const PATTERN_CACHE_LIMIT: usize = 512;

pub struct RuleMatcher {
    rules: Arc<dyn RuleStore>,
    /// Pattern source → compiled regex, or `None` if it failed to compile.
    patterns: Mutex<HashMap<String, Option<Regex>>>,
}

impl RuleMatcher {
    pub fn new(rules: Arc<dyn RuleStore>) -> Self {
        Self {
            rules,
            patterns: Mutex::new(HashMap::new()),
        }
    }

    /// Every active rule for `device_id` and `trigger` whose present filters
    /// all match. Rules with a pattern that does not compile are skipped.
    ///
    /// No ordering is implied by the result; each rule is delivered
    /// independently.
    pub async fn match_event(
        &self,
        device_id: DeviceId,
        trigger: TriggerKind,
        sender: &str,
        content: &str,
    ) -> Result<Vec<ForwardingRule>, StoreError> {
        let candidates = self.rules.active_rules(device_id, trigger).await?;
        Ok(candidates
            .into_iter()
            .filter(|rule| rule.applies_to(device_id, trigger))
            .filter(|rule| self.rule_matches(rule, sender, content))
            .collect())
    }

    fn rule_matches(&self, rule: &ForwardingRule, sender: &str, content: &str) -> bool {
        self.filter_matches(rule, "sender", rule.sender_filter.as_deref(), sender)
            && self.filter_matches(rule, "content", rule.content_filter.as_deref(), content)
    }

    fn filter_matches(
        &self,
        rule: &ForwardingRule,
        field: &str,
        pattern: Option<&str>,
        value: &str,
    ) -> bool {
        let Some(pattern) = pattern.filter(|p| !p.is_empty()) else {
            return true;
        };
        match self.compiled(pattern) {
            Some(re) => re.is_match(value),
            None => {
                warn!(
                    rule_id = rule.id,
                    field,
                    pattern,
                    "Skipping rule with invalid filter pattern"
                );
                false
            }
        }
    }

    fn compiled(&self, pattern: &str) -> Option<Regex> {
        let mut cache = match self.patterns.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(entry) = cache.get(pattern) {
            return entry.clone();
        }
        if cache.len() >= PATTERN_CACHE_LIMIT {
            cache.clear();
        }
        let compiled = Regex::new(pattern).ok();
        cache.insert(pattern.to_string(), compiled.clone());
        compiled
    }
}
