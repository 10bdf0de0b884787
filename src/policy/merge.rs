use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::warn;

/// Fills every field unset in `base` from `other`, recursing into objects. Set fields in `base` are kept.
fn fill_unset(base: &mut Value, other: Value) {
    match (base, other) {
        (Value::Object(base), Value::Object(other)) => {
            for (key, value) in other {
                match base.get_mut(&key) {
                    Some(existing) if !existing.is_null() => fill_unset(existing, value),
                    _ => {
                        base.insert(key, value);
                    },
                }
            }
        },
        (base @ Value::Null, other) => *base = other,
        _ => {},
    }
}

/// Deep merge of configs in precedence order: the earlier config wins on every field it sets.
pub fn merge<T>(configs: impl IntoIterator<Item = T>) -> Option<T>
where
    T: Serialize + DeserializeOwned,
{
    let mut merged: Option<Value> = None;
    for config in configs {
        let value = match serde_json::to_value(config) {
            Ok(value) => value,
            Err(e) => {
                warn!("skipping policy config that does not serialize {e}");
                continue;
            },
        };
        match merged.as_mut() {
            Some(merged) => fill_unset(merged, value),
            None => merged = Some(value),
        }
    }
    match serde_json::from_value(merged?) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("merged policy config does not deserialize {e}");
            None
        },
    }
}

/// The override beats the default on every field it sets, the default fills the rest.
pub fn with_default<T>(config: Option<&T>, default: Option<&T>) -> Option<T>
where
    T: Serialize + DeserializeOwned + Clone,
{
    merge(config.into_iter().chain(default).cloned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apis::policies::{AccessControlConfig, L7RateLimit};

    #[test]
    fn earlier_config_wins_per_field() {
        let earlier = L7RateLimit { requests: Some(10), ..Default::default() };
        let later = L7RateLimit { requests: Some(100), burst: Some(20), backlog: Some(5), ..Default::default() };
        let merged = merge([earlier, later]).unwrap();
        assert_eq!(merged.requests, Some(10));
        assert_eq!(merged.burst, Some(20));
        assert_eq!(merged.backlog, Some(5));
    }

    #[test]
    fn lists_are_not_concatenated() {
        let earlier = AccessControlConfig { blacklist: Some(vec!["10.0.0.1".to_owned()]), ..Default::default() };
        let later = AccessControlConfig { blacklist: Some(vec!["10.0.0.2".to_owned()]), status_code: Some(403), ..Default::default() };
        let merged = with_default(Some(&earlier), Some(&later)).unwrap();
        assert_eq!(merged.blacklist, Some(vec!["10.0.0.1".to_owned()]));
        assert_eq!(merged.status_code, Some(403));
    }

    #[test]
    fn config_that_does_not_serialize_is_skipped() {
        use std::collections::BTreeMap;

        let unserializable = BTreeMap::from([((1, 2), 3)]);
        let merged = merge([unserializable, BTreeMap::new()]).unwrap();
        assert!(merged.is_empty());
    }

    #[test]
    fn nothing_to_merge() {
        assert!(merge(Vec::<L7RateLimit>::new()).is_none());
        assert!(with_default::<L7RateLimit>(None, None).is_none());
    }
}
