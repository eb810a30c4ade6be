use crate::function::{StringMap, LABEL_MIN_REPLICAS};

/// The minimum declared through the `com.openfaas.scale.min` label. A value that isn't a
/// positive integer counts as not declared.
pub fn declared_min(labels: &StringMap) -> Option<i32> {
    let value = labels.get(LABEL_MIN_REPLICAS)?;
    match value.trim().parse::<i32>() {
        Ok(min) if min >= 1 => Some(min),
        _ => {
            log::warn!(
                "Ignoring {} label with value '{}', expected a positive integer",
                LABEL_MIN_REPLICAS,
                value
            );
            None
        }
    }
}

/// Picks the replica count to persist, given a declared minimum and the count currently
/// observed on the cluster (which may have been set by an autoscaler).
///
/// Neither present leaves the count unset, so the api server applies its own default.
pub fn resolve(min: Option<i32>, existing: Option<i32>) -> Option<i32> {
    match (min, existing) {
        (Some(min), Some(existing)) => Some(min.max(existing)),
        (Some(min), None) => Some(min),
        (None, existing) => existing,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn labels(min: &str) -> StringMap {
        let mut labels = StringMap::new();
        labels.insert(LABEL_MIN_REPLICAS.to_owned(), min.to_owned());
        labels
    }

    #[test]
    fn resolve_follows_the_replica_law() {
        assert_eq!(None, resolve(None, None));
        assert_eq!(Some(2), resolve(Some(2), None));
        assert_eq!(Some(2), resolve(Some(2), Some(1)));
        assert_eq!(Some(3), resolve(Some(2), Some(3)));
        assert_eq!(Some(3), resolve(None, Some(3)));
        assert_eq!(Some(2), resolve(Some(2), Some(0)));
        assert_eq!(Some(0), resolve(None, Some(0)));
    }

    #[test]
    fn declared_min_ignores_malformed_values() {
        assert_eq!(Some(2), declared_min(&labels("2")));
        assert_eq!(Some(4), declared_min(&labels(" 4 ")));
        assert_eq!(None, declared_min(&labels("two")));
        assert_eq!(None, declared_min(&labels("0")));
        assert_eq!(None, declared_min(&labels("-1")));
        assert_eq!(None, declared_min(&StringMap::new()));
    }
}
