use std::fs::File;
use std::io::Read;
use std::path::Path;

pub const DEFAULT_FUNCTION_NAMESPACE: &str = "openfaas-fn";
pub const DEFAULT_PROFILES_NAMESPACE: &str = "openfaas";
pub const DEFAULT_SECRETS_MOUNT_PATH: &str = "/var/openfaas/secrets";
/// Upper bound the scale guard enforces on any function workload
pub const DEFAULT_MAX_REPLICAS: i32 = 5;

const SERVICE_ACCOUNT_TOKEN_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";
const SERVICE_ACCOUNT_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";
const API_SERVER_HOSTNAME: &str = "kubernetes.default.svc";

/// Timings for one kind of probe (liveness or readiness)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeTimings {
    pub initial_delay_seconds: i32,
    pub timeout_seconds: i32,
    pub period_seconds: i32,
}

impl Default for ProbeTimings {
    fn default() -> ProbeTimings {
        ProbeTimings {
            initial_delay_seconds: 2,
            timeout_seconds: 1,
            period_seconds: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// use an http GET against the watchdog instead of an exec of `cat /tmp/.lock`
    pub http_probe: bool,
    pub liveness: ProbeTimings,
    pub readiness: ProbeTimings,
}

impl Default for ProbeConfig {
    fn default() -> ProbeConfig {
        ProbeConfig {
            http_probe: true,
            liveness: ProbeTimings::default(),
            readiness: ProbeTimings::default(),
        }
    }
}

/// Process-wide policy for rendering and guarding function workloads.
///
/// ```no_run
/// use faas_reconciler::config::ReconcilerConfig;
///
/// let config = ReconcilerConfig::new("faas-reconciler")
///     .with_non_root_user(true)
///     .with_max_replicas(10);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    pub operator_name: String,
    pub default_namespace: String,
    pub profiles_namespace: String,
    pub secrets_mount_path: String,
    pub set_non_root_user: bool,
    pub max_replicas: i32,
    pub probes: ProbeConfig,
}

impl Default for ReconcilerConfig {
    fn default() -> ReconcilerConfig {
        ReconcilerConfig {
            operator_name: "faas-reconciler".to_owned(),
            default_namespace: DEFAULT_FUNCTION_NAMESPACE.to_owned(),
            profiles_namespace: DEFAULT_PROFILES_NAMESPACE.to_owned(),
            secrets_mount_path: DEFAULT_SECRETS_MOUNT_PATH.to_owned(),
            set_non_root_user: false,
            max_replicas: DEFAULT_MAX_REPLICAS,
            probes: ProbeConfig::default(),
        }
    }
}

impl ReconcilerConfig {
    pub fn new(operator_name: impl Into<String>) -> ReconcilerConfig {
        ReconcilerConfig {
            operator_name: operator_name.into(),
            ..Default::default()
        }
    }

    /// Loads a yaml file. Fields missing from the file keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<ReconcilerConfig, anyhow::Error> {
        use anyhow::Context;

        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("cannot open reconciler config at '{}'", path.display()))?;
        let config: ReconcilerConfig = serde_yaml::from_reader(file)
            .with_context(|| format!("invalid reconciler config in '{}'", path.display()))?;
        if config.max_replicas < 1 {
            anyhow::bail!("max_replicas must be at least 1, got {}", config.max_replicas);
        }
        log::debug!("Loaded reconciler config from '{}': {:?}", path.display(), config);
        Ok(config)
    }

    pub fn within_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn with_profiles_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.profiles_namespace = namespace.into();
        self
    }

    pub fn with_secrets_mount_path(mut self, path: impl Into<String>) -> Self {
        self.secrets_mount_path = path.into();
        self
    }

    pub fn with_non_root_user(mut self, set_non_root_user: bool) -> Self {
        self.set_non_root_user = set_non_root_user;
        self
    }

    pub fn with_max_replicas(mut self, max_replicas: i32) -> Self {
        self.max_replicas = max_replicas;
        self
    }

    pub fn with_probes(mut self, probes: ProbeConfig) -> Self {
        self.probes = probes;
        self
    }
}

/// Where the api server is and how to authenticate to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub api_server_endpoint: String,
    pub service_account_token: String,
    pub ca_file_path: Option<String>,
    pub verify_ssl_certs: bool,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(api_server_endpoint: impl Into<String>, token: impl Into<String>) -> ClientConfig {
        ClientConfig {
            api_server_endpoint: api_server_endpoint.into(),
            service_account_token: token.into(),
            ca_file_path: None,
            verify_ssl_certs: true,
            user_agent: "faas-reconciler".to_owned(),
        }
    }

    /// Reads the token and CA certificate mounted into every pod that runs with a service account
    pub fn from_service_account(user_agent: impl Into<String>) -> Result<ClientConfig, std::io::Error> {
        let mut token_file = File::open(SERVICE_ACCOUNT_TOKEN_PATH)?;
        let mut service_account_token = String::new();
        token_file.read_to_string(&mut service_account_token)?;

        let ca_file_path = if Path::new(SERVICE_ACCOUNT_CA_PATH).exists() {
            Some(SERVICE_ACCOUNT_CA_PATH.to_owned())
        } else {
            None
        };

        Ok(ClientConfig {
            api_server_endpoint: format!("https://{}", API_SERVER_HOSTNAME),
            service_account_token: service_account_token.trim().to_owned(),
            ca_file_path,
            verify_ssl_certs: true,
            user_agent: user_agent.into(),
        })
    }

    pub fn with_ca_file(mut self, path: impl Into<String>) -> Self {
        self.ca_file_path = Some(path.into());
        self
    }

    pub fn bearer_token(&self) -> String {
        format!("Bearer {}", self.service_account_token)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn yaml_config_keeps_defaults_for_missing_fields() {
        let yaml = "set_non_root_user: true\nmax_replicas: 20\nprobes:\n  http_probe: false\n";
        let config: ReconcilerConfig = serde_yaml::from_str(yaml).expect("valid yaml");
        assert!(config.set_non_root_user);
        assert_eq!(20, config.max_replicas);
        assert!(!config.probes.http_probe);
        assert_eq!(2, config.probes.liveness.initial_delay_seconds);
        assert_eq!(DEFAULT_SECRETS_MOUNT_PATH, config.secrets_mount_path);
        assert_eq!(DEFAULT_PROFILES_NAMESPACE, config.profiles_namespace);
    }

    #[test]
    fn builder_overrides_defaults() {
        let config = ReconcilerConfig::new("test")
            .within_namespace("fns")
            .with_max_replicas(3)
            .with_secrets_mount_path("/run/secrets");
        assert_eq!("fns", config.default_namespace);
        assert_eq!(3, config.max_replicas);
        assert_eq!("/run/secrets", config.secrets_mount_path);
        assert!(!config.set_non_root_user);
    }
}
