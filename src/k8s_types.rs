use std::fmt::{self, Display};
use std::hash::{self, Hash};

/// Just enough information about a Kubernetes resource type to build api server urls.
/// `&'static str` everywhere so the statics below can be passed around without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct K8sType {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub plural_kind: &'static str,
}

impl Hash for K8sType {
    fn hash<H: hash::Hasher>(&self, hasher: &mut H) {
        self.api_version.hash(hasher);
        self.kind.hash(hasher);
    }
}

impl K8sType {
    pub fn as_group_and_version(&self) -> (&'static str, &'static str) {
        match self.api_version.find('/') {
            Some(slash_idx) => (
                &self.api_version[..slash_idx],
                &self.api_version[(slash_idx + 1)..],
            ),
            None => ("", self.api_version),
        }
    }

    pub fn group(&self) -> &'static str {
        self.as_group_and_version().0
    }

    pub fn version(&self) -> &'static str {
        self.as_group_and_version().1
    }
}

impl Display for K8sType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.api_version, self.plural_kind)
    }
}

macro_rules! k8s_type {
    ($ref_name:ident, $api_version:expr, $kind:expr, $plural_kind:expr) => {
        #[allow(non_upper_case_globals)]
        pub static $ref_name: &crate::k8s_types::K8sType = &crate::k8s_types::K8sType {
            api_version: $api_version,
            kind: $kind,
            plural_kind: $plural_kind,
        };
    };
}

pub mod core {
    pub mod v1 {
        k8s_type!(Service, "v1", "Service", "services");
        k8s_type!(Secret, "v1", "Secret", "secrets");
    }
}

pub mod apps {
    pub mod v1 {
        k8s_type!(StatefulSet, "apps/v1", "StatefulSet", "statefulsets");
    }
}

pub mod openfaas {
    pub mod v1 {
        k8s_type!(Function, "openfaas.com/v1", "Function", "functions");
        k8s_type!(Profile, "openfaas.com/v1", "Profile", "profiles");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn splits_group_and_version() {
        assert_eq!(("apps", "v1"), apps::v1::StatefulSet.as_group_and_version());
        assert_eq!(("", "v1"), core::v1::Secret.as_group_and_version());
        assert_eq!("openfaas.com", openfaas::v1::Profile.group());
    }
}
