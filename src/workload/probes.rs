//! Liveness and readiness probes for the function container.
//!
//! By default both probes hit the watchdog health endpoint. A function can move the path
//! or the initial delay through annotations. With http probes disabled, the probes fall
//! back to checking the lock file the watchdog writes once it's ready.
use crate::config::{ProbeConfig, ProbeTimings};
use crate::error::ValidationError;
use crate::function::FunctionSpec;
use crate::workload::{ExecAction, HttpGetAction, IntOrString, Probe};
use crate::resource::JsonObject;

use lazy_static::lazy_static;
use regex::Regex;

pub const ANNOTATION_PROBE_PATH: &str = "com.openfaas.health.http.path";
pub const ANNOTATION_PROBE_INITIAL_DELAY: &str = "com.openfaas.health.http.initialDelay";
pub const DEFAULT_PROBE_PATH: &str = "/_/health";
pub const WATCHDOG_PORT: i32 = 8080;

lazy_static! {
    static ref DURATION_PART_REGEX: Regex =
        Regex::new(r"([0-9]+(?:\.[0-9]*)?|\.[0-9]+)(ns|us|µs|ms|s|m|h)").unwrap();
}

#[derive(Debug, Clone, PartialEq)]
pub struct Probes {
    pub liveness: Probe,
    pub readiness: Probe,
}

/// Parses a duration such as `30s`, `1m30s` or `2.5s` into whole seconds
pub fn parse_duration_seconds(input: &str) -> Option<i32> {
    let input = input.trim();
    if input == "0" {
        return Some(0);
    }
    if input.is_empty() {
        return None;
    }

    let mut consumed = 0;
    let mut total = 0f64;
    for captures in DURATION_PART_REGEX.captures_iter(input) {
        let whole = captures.get(0)?;
        if whole.start() != consumed {
            return None;
        }
        consumed = whole.end();

        let amount: f64 = captures[1].parse().ok()?;
        let unit_seconds = match &captures[2] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            _ => 3600.0,
        };
        total += amount * unit_seconds;
    }

    if consumed != input.len() || total > i32::MAX as f64 {
        return None;
    }
    Some(total as i32)
}

pub fn make_probes(spec: &FunctionSpec, config: &ProbeConfig) -> Result<Probes, ValidationError> {
    let initial_delay = match spec.annotations.get(ANNOTATION_PROBE_INITIAL_DELAY) {
        Some(value) => Some(parse_duration_seconds(value).ok_or_else(|| {
            ValidationError::new(
                ANNOTATION_PROBE_INITIAL_DELAY,
                format!("'{}' is not a valid duration", value),
            )
        })?),
        None => None,
    };

    let path = spec
        .annotations
        .get(ANNOTATION_PROBE_PATH)
        .map(String::as_str)
        .unwrap_or(DEFAULT_PROBE_PATH);

    let make = |timings: &ProbeTimings| {
        let mut probe = Probe {
            initial_delay_seconds: Some(initial_delay.unwrap_or(timings.initial_delay_seconds)),
            timeout_seconds: Some(timings.timeout_seconds),
            period_seconds: Some(timings.period_seconds),
            ..Default::default()
        };
        if config.http_probe {
            probe.http_get = Some(HttpGetAction {
                path: path.to_owned(),
                port: IntOrString::Int(WATCHDOG_PORT),
                extra: JsonObject::new(),
            });
        } else {
            probe.exec = Some(ExecAction {
                command: vec!["cat".to_owned(), "/tmp/.lock".to_owned()],
            });
        }
        probe
    };

    Ok(Probes {
        liveness: make(&config.liveness),
        readiness: make(&config.readiness),
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_go_style_durations() {
        assert_eq!(Some(30), parse_duration_seconds("30s"));
        assert_eq!(Some(90), parse_duration_seconds("1m30s"));
        assert_eq!(Some(2), parse_duration_seconds("2.5s"));
        assert_eq!(Some(0), parse_duration_seconds("500ms"));
        assert_eq!(Some(7200), parse_duration_seconds("2h"));
        assert_eq!(Some(0), parse_duration_seconds("0"));
        assert_eq!(None, parse_duration_seconds("30"));
        assert_eq!(None, parse_duration_seconds("1x"));
        assert_eq!(None, parse_duration_seconds("s30"));
        assert_eq!(None, parse_duration_seconds(""));
    }

    #[test]
    fn http_probes_use_annotation_overrides() {
        let mut spec = FunctionSpec::new("echo", "echo:1");
        spec.annotations.insert(ANNOTATION_PROBE_PATH.to_owned(), "/healthz".to_owned());
        spec.annotations.insert(ANNOTATION_PROBE_INITIAL_DELAY.to_owned(), "1m".to_owned());

        let probes = make_probes(&spec, &ProbeConfig::default()).expect("probes should build");
        let http = probes.liveness.http_get.as_ref().expect("http probe");
        assert_eq!("/healthz", http.path);
        assert_eq!(IntOrString::Int(8080), http.port);
        assert_eq!(Some(60), probes.liveness.initial_delay_seconds);
        assert_eq!(Some(60), probes.readiness.initial_delay_seconds);
        assert_eq!(Some(1), probes.readiness.timeout_seconds);
    }

    #[test]
    fn exec_probes_check_the_lock_file() {
        let config = ProbeConfig {
            http_probe: false,
            ..Default::default()
        };
        let probes = make_probes(&FunctionSpec::new("echo", "echo:1"), &config).unwrap();
        assert!(probes.readiness.http_get.is_none());
        assert_eq!(
            vec!["cat".to_owned(), "/tmp/.lock".to_owned()],
            probes.readiness.exec.unwrap().command
        );
        assert_eq!(Some(2), probes.liveness.initial_delay_seconds);
    }

    #[test]
    fn invalid_initial_delay_is_an_error() {
        let mut spec = FunctionSpec::new("echo", "echo:1");
        spec.annotations.insert(ANNOTATION_PROBE_INITIAL_DELAY.to_owned(), "soon".to_owned());
        let err = make_probes(&spec, &ProbeConfig::default()).unwrap_err();
        assert_eq!(ANNOTATION_PROBE_INITIAL_DELAY, err.field);
    }
}
