use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::ObjectIdRef;
use crate::runner::client::Error;

use http::{header, Method, Request};
use hyper::Body;
use serde_json::Value;
use url::Url;

pub fn get_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    let req = make_req(url, Method::GET, client_config).body(Body::empty())?;
    Ok(req)
}

pub fn create_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, get_namespace(resource), None)?;
    let as_vec = serde_json::to_vec(resource)?;
    let req = make_req(url, Method::POST, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(as_vec))?;
    Ok(req)
}

pub fn replace_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    id: &ObjectIdRef<'_>,
    resource: &Value,
) -> Result<Request<Body>, Error> {
    let url = make_url(client_config, k8s_type, id.namespace(), Some(id.name()))?;
    let as_vec = serde_json::to_vec(resource)?;
    let req = make_req(url, Method::PUT, client_config)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(as_vec))?;
    Ok(req)
}

pub fn watch_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    resource_version: Option<&str>,
    label_selector: Option<&str>,
    timeout_seconds: Option<u32>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None)?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("watch", "true");
        if let Some(vers) = resource_version {
            query.append_pair("resourceVersion", vers);
        }
        if let Some(selector) = label_selector {
            query.append_pair("labelSelector", selector);
        }
        if let Some(timeout) = timeout_seconds {
            let as_str = format!("{}", timeout);
            query.append_pair("timeoutSeconds", &as_str);
        }
    }
    let req = make_req(url, Method::GET, client_config).body(Body::empty())?;
    Ok(req)
}

pub fn list_request(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    label_selector: Option<&str>,
    namespace: Option<&str>,
) -> Result<Request<Body>, Error> {
    let mut url = make_url(client_config, k8s_type, namespace, None)?;
    if let Some(selector) = label_selector {
        let mut query = url.query_pairs_mut();
        query.append_pair("labelSelector", selector);
    }
    let req = make_req(url, Method::GET, client_config).body(Body::empty())?;
    Ok(req)
}

fn make_req(url: Url, method: Method, client_config: &ClientConfig) -> http::request::Builder {
    Request::builder()
        .method(method)
        .uri(url.as_str())
        .header(header::AUTHORIZATION, client_config.bearer_token())
        .header(header::USER_AGENT, client_config.user_agent.as_str())
}

fn get_namespace(resource: &Value) -> Option<&str> {
    resource
        .pointer("/metadata/namespace")
        .and_then(Value::as_str)
}

fn make_url(
    client_config: &ClientConfig,
    k8s_type: &K8sType,
    namespace: Option<&str>,
    name: Option<&str>,
) -> Result<Url, Error> {
    let mut url = Url::parse(client_config.api_server_endpoint.as_str())?;
    {
        let mut segments = url
            .path_segments_mut()
            .map_err(|_| Error::InvalidEndpoint(client_config.api_server_endpoint.clone()))?;

        let (group, version) = k8s_type.as_group_and_version();
        if group.is_empty() {
            segments.push("api");
        } else {
            segments.push("apis");
            segments.push(group);
        }
        segments.push(version);
        if let Some(ns) = namespace {
            segments.push("namespaces");
            segments.push(ns);
        }
        segments.push(k8s_type.plural_kind);

        if let Some(n) = name {
            segments.push(n);
        }
    }
    Ok(url)
}
