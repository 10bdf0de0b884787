use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

fn requirement_matches(requirement: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&requirement.key);
    let values = requirement.values.as_deref().unwrap_or_default();
    match requirement.operator.as_str() {
        "In" => value.is_some_and(|v| values.contains(v)),
        "NotIn" => value.is_none_or(|v| !values.contains(v)),
        "Exists" => value.is_some(),
        "DoesNotExist" => value.is_none(),
        _ => false,
    }
}

/// Label selector semantics: every matchLabels entry and every matchExpressions requirement must hold.
/// An empty selector matches everything.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let labels_match = selector
        .match_labels
        .as_ref()
        .is_none_or(|match_labels| match_labels.iter().all(|(key, value)| labels.get(key) == Some(value)));

    labels_match
        && selector
            .match_expressions
            .as_ref()
            .is_none_or(|expressions| expressions.iter().all(|requirement| requirement_matches(requirement, labels)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| ((*k).to_owned(), (*v).to_owned())).collect()
    }

    #[test]
    fn match_labels_and_expressions() {
        let selector: LabelSelector = serde_yaml::from_str(
            r"
matchLabels:
  team: a
matchExpressions:
- key: env
  operator: In
  values: [prod, staging]
- key: legacy
  operator: DoesNotExist
",
        )
        .unwrap();
        assert!(matches(&selector, &labels(&[("team", "a"), ("env", "prod")])));
        assert!(!matches(&selector, &labels(&[("team", "a"), ("env", "dev")])));
        assert!(!matches(&selector, &labels(&[("team", "a"), ("env", "prod"), ("legacy", "1")])));
        assert!(!matches(&selector, &labels(&[("env", "prod")])));
    }

    #[test]
    fn empty_selector_matches_all() {
        assert!(matches(&LabelSelector::default(), &labels(&[])));
    }
}
