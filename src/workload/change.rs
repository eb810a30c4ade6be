//! Decides whether a workload has to be re-rendered for a function spec.
//!
//! Every rendered workload carries the json form of the function spec it came from in the
//! `com.openfaas.function.spec` annotation. The stored spec is decoded and compared as a
//! structure, so re-serializing the same spec with a different key order or a reordered
//! secret list is not a change.
use crate::function::FunctionSpec;
use crate::workload::compare::compare_values;
use crate::workload::Workload;

/// The json stored on the workload
pub fn encode_signature(spec: &FunctionSpec) -> Result<String, serde_json::Error> {
    serde_json::to_string(spec)
}

pub fn decode_signature(signature: &str) -> Result<FunctionSpec, serde_json::Error> {
    serde_json::from_str(signature)
}

/// Secrets and constraints only matter as sets
fn normalized(spec: &FunctionSpec) -> FunctionSpec {
    let mut spec = spec.clone();
    spec.secrets.sort();
    spec.secrets.dedup();
    spec.constraints.sort();
    spec.constraints.dedup();
    spec
}

pub fn specs_equivalent(a: &FunctionSpec, b: &FunctionSpec) -> bool {
    normalized(a) == normalized(b)
}

/// True unless the workload was rendered from an equivalent spec. A missing or unreadable
/// signature always needs an update.
pub fn needs_update(spec: &FunctionSpec, workload: &Workload) -> bool {
    let signature = match workload.spec_signature() {
        Some(s) if !s.is_empty() => s,
        _ => {
            log::debug!("Workload '{}' has no spec signature", workload.name());
            return true;
        }
    };

    let previous = match decode_signature(signature) {
        Ok(previous) => previous,
        Err(err) => {
            log::error!(
                "Failed to parse previous function spec of '{}': {}",
                workload.name(),
                err
            );
            return true;
        }
    };

    if specs_equivalent(&previous, spec) {
        log::debug!("No changes detected for '{}'", spec.name);
        return false;
    }

    if log::log_enabled!(log::Level::Info) {
        let (previous, desired) = (normalized(&previous), normalized(spec));
        if let (Ok(prev), Ok(next)) = (serde_json::to_value(&previous), serde_json::to_value(&desired)) {
            log::info!("Change detected for '{}': {}", spec.name, compare_values(&prev, &next));
        }
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::function::ANNOTATION_FUNCTION_SPEC;

    fn spec() -> FunctionSpec {
        let mut spec = FunctionSpec::new("echo", "ghcr.io/openfaas/echo:1");
        spec.secrets = vec!["b".to_owned(), "a".to_owned()];
        spec.environment.insert("write_debug".to_owned(), "true".to_owned());
        spec
    }

    fn workload_with_signature(signature: Option<&str>) -> Workload {
        let mut workload = Workload::default();
        workload.metadata.name = "echo".to_owned();
        if let Some(signature) = signature {
            workload
                .metadata
                .annotations
                .insert(ANNOTATION_FUNCTION_SPEC.to_owned(), signature.to_owned());
        }
        workload
    }

    #[test]
    fn missing_or_corrupt_signature_needs_update() {
        assert!(needs_update(&spec(), &workload_with_signature(None)));
        assert!(needs_update(&spec(), &workload_with_signature(Some(""))));
        assert!(needs_update(&spec(), &workload_with_signature(Some("{not json"))));
    }

    #[test]
    fn same_spec_does_not_need_update() {
        let signature = encode_signature(&spec()).unwrap();
        assert!(!needs_update(&spec(), &workload_with_signature(Some(&signature))));
    }

    #[test]
    fn reordered_serialization_is_not_a_change() {
        let signature = r#"{"secrets":["a","b","a"],"environment":{"write_debug":"true"},"image":"ghcr.io/openfaas/echo:1","name":"echo","readOnlyRootFilesystem":false}"#;
        assert!(!needs_update(&spec(), &workload_with_signature(Some(signature))));

        let mut constrained = spec();
        constrained.constraints = vec!["zone=b".to_owned(), "zone=a".to_owned(), "zone=b".to_owned()];
        let mut reordered = spec();
        reordered.constraints = vec!["zone=a".to_owned(), "zone=b".to_owned()];
        assert!(specs_equivalent(&constrained, &reordered));
    }

    #[test]
    fn real_changes_are_detected() {
        let signature = encode_signature(&spec()).unwrap();
        let workload = workload_with_signature(Some(&signature));

        let mut changed = spec();
        changed.image = "ghcr.io/openfaas/echo:2".to_owned();
        assert!(needs_update(&changed, &workload));

        let mut changed = spec();
        changed.secrets.push("c".to_owned());
        assert!(needs_update(&changed, &workload));

        let mut changed = spec();
        changed.read_only_root_filesystem = true;
        assert!(needs_update(&changed, &workload));
    }
}
