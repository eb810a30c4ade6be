mod request;

use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::resource::{InvalidResourceError, K8sResource, ObjectIdRef};
use crate::runner::metrics::ClientMetrics;
use crate::store::{ApiError, ObjectList, ResourceStore, StoreError, WatchEvent, WatchStream};

use async_trait::async_trait;
use bytes::Buf;
use http::{Request, Response};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use lazy_static::lazy_static;
use openssl::ssl::{SslConnector, SslMethod};
use regex::bytes::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_stream::StreamExt;

use std::io;
use std::sync::Arc;
use std::time::Instant;

lazy_static! {
    static ref NEWLINE_REGEX: Regex = Regex::new("([\\r\\n]+)").unwrap();
}

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    Request(http::Error),
    Url(url::ParseError),
    InvalidEndpoint(String),
    InvalidResource(InvalidResourceError),
    /// non-success status, with the api server's explanation when it sent one
    Http(http::StatusCode, Option<ApiError>),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Serde(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Request(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::Url(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::InvalidResource(e) => Some(e as &(dyn std::error::Error + 'static)),
            Error::InvalidEndpoint(_) | Error::Http(..) => None,
        }
    }
}

impl Error {
    pub fn http(status: http::StatusCode) -> Error {
        Error::Http(status, None)
    }

    pub fn is_http_status(&self, code: u16) -> bool {
        match self {
            Error::Http(ref status, _) => status.as_u16() == code,
            _ => false,
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "Io Error: {}", e),
            Error::Serde(ref e) => write!(f, "(De)Serialization error: {}", e),
            Error::Request(ref e) => write!(f, "Invalid request: {}", e),
            Error::Url(ref e) => write!(f, "Invalid url: {}", e),
            Error::InvalidEndpoint(ref e) => write!(f, "Invalid api server endpoint: '{}'", e),
            Error::InvalidResource(ref e) => write!(f, "{}", e),
            Error::Http(ref status, Some(ref api_error)) => {
                write!(f, "Http Error: {}, {}", status, api_error)
            }
            Error::Http(ref status, None) => write!(f, "Http Error: {}", status),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}
impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}
impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Error {
        Error::Url(e)
    }
}
impl From<InvalidResourceError> for Error {
    fn from(e: InvalidResourceError) -> Error {
        Error::InvalidResource(e)
    }
}

impl From<Error> for StoreError {
    fn from(err: Error) -> StoreError {
        let message = err.to_string();
        match err {
            Error::Http(status, _) => match status.as_u16() {
                404 => StoreError::NotFound(message),
                409 => StoreError::Conflict(message),
                410 => StoreError::Expired,
                _ => StoreError::Upstream(message),
            },
            _ => StoreError::Upstream(message),
        }
    }
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

/// An api server client. Cheap to clone, all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);

        let mut ssl = SslConnector::builder(SslMethod::tls())?;
        // enable http2 using alpn
        ssl.set_alpn_protos(b"\x02h2\x08http/1.1")?;
        if let Some(path) = config.ca_file_path.as_ref() {
            ssl.set_ca_file(path.as_str())?;
        }

        if config.verify_ssl_certs {
            ssl.set_verify(openssl::ssl::SslVerifyMode::PEER);
        } else {
            log::warn!("TLS Certificate verifification has been disabled! All connections to the Kubernetes api server will be insecure!");
            ssl.set_verify(openssl::ssl::SslVerifyMode::NONE);
        }

        let https = HttpsConnector::with_connector(http, ssl)?;
        let client = HyperClient::builder().build(https);

        let inner = ClientInner {
            http_client: client,
            config,
            metrics,
        };
        Ok(Client(Arc::new(inner)))
    }

    pub async fn get_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
    ) -> Result<K8sResource, Error> {
        let req = request::get_request(&self.0.config, k8s_type, id)?;
        let value: Value = self.get_response_body(req).await?;
        Ok(K8sResource::from_value(value)?)
    }

    pub async fn create_resource(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, Error> {
        let req = request::create_request(&self.0.config, k8s_type, resource)?;
        let value: Value = self.get_response_body(req).await?;
        Ok(K8sResource::from_value(value)?)
    }

    pub async fn replace_resource(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, Error> {
        let req = request::replace_request(&self.0.config, k8s_type, id, resource)?;
        let value: Value = self.get_response_body(req).await?;
        Ok(K8sResource::from_value(value)?)
    }

    pub async fn list_all(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, label_selector, namespace)?;
        self.get_response_body(req).await
    }

    pub async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<LineDeserializer<WatchEvent>, Error> {
        let req = request::watch_request(
            &self.0.config,
            k8s_type,
            resource_version,
            label_selector,
            None,
            namespace,
        )?;
        self.get_response_lines_deserialized(req).await
    }

    async fn get_response_lines_deserialized<T: DeserializeOwned>(
        &self,
        req: Request<Body>,
    ) -> Result<LineDeserializer<T>, Error> {
        let lines = self.get_response_lines(req).await?;
        Ok(LineDeserializer::<T>::new(lines))
    }

    async fn get_response_lines(&self, req: Request<Body>) -> Result<Lines, Error> {
        let resp = self.get_response(req).await?;
        if !resp.status().is_success() {
            Err(Client::error_from_response(resp).await)
        } else {
            Ok(Lines::from_body(resp.into_body()))
        }
    }

    async fn get_response(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        self.private_execute_request(start_time, method.as_str(), uri.as_str(), req)
            .await
    }

    async fn get_response_body<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let method = req.method().to_string();
        let uri = req.uri().to_string();
        let start_time = Instant::now();

        let response = self
            .private_execute_request(start_time, method.as_str(), uri.as_str(), req)
            .await?;

        let status_code = response.status().as_u16();
        let result = Client::read_body(response).await;
        let success = result.is_ok();
        let duration = start_time.elapsed().as_millis();
        log::debug!(
            "Finished {} request to: {}, status: {}, total_duration: {}ms, success: {}",
            method,
            uri,
            status_code,
            duration,
            success
        );
        result
    }

    async fn private_execute_request(
        &self,
        start_time: Instant,
        method: &str,
        uri: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, Error> {
        log::debug!("Starting {} request to: {}", method, uri);
        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        let duration = start_time.elapsed().as_millis();
        timer.observe_duration();
        match result {
            Ok(resp) => {
                let status_code = resp.status().as_u16();
                log::debug!(
                    "Response status received for {} to: {}, status: {}, duration: {}ms",
                    method,
                    uri,
                    status_code,
                    duration
                );
                Ok(resp)
            }
            Err(err) => {
                log::error!(
                    "Failed to execute {} request to: {}, err: {}",
                    method,
                    uri,
                    err
                );
                Err(err.into())
            }
        }
    }

    /// Reads the `Status` object the api server sends along with error responses
    async fn error_from_response(response: Response<Body>) -> Error {
        let status = response.status();
        let api_error = match hyper::body::to_bytes(response.into_body()).await {
            Ok(body) => serde_json::from_slice::<ApiError>(body.as_ref()).ok(),
            Err(err) => {
                log::warn!("Failed to read body of error response with status {}: {}", status, err);
                None
            }
        };
        Error::Http(status, api_error)
    }

    async fn read_body<T: DeserializeOwned>(response: Response<Body>) -> Result<T, Error> {
        if !response.status().is_success() {
            return Err(Client::error_from_response(response).await);
        }

        let deserialized = if log::log_enabled!(log::Level::Trace) {
            // if we're logging the response body, then we'll need to read it all into a
            // single buffer, since we can't read a response body twice without copying
            let body = hyper::body::to_bytes(response.into_body()).await?;
            let as_str = String::from_utf8_lossy(body.as_ref());
            log::trace!("Got response body: {}", as_str);
            serde_json::from_slice(body.as_ref())?
        } else {
            let body = hyper::body::aggregate(response.into_body()).await?;
            serde_json::from_reader(body.reader())?
        };
        Ok(deserialized)
    }
}

#[async_trait]
impl ResourceStore for Client {
    async fn get(&self, k8s_type: &K8sType, id: ObjectIdRef<'_>) -> Result<K8sResource, StoreError> {
        Ok(self.get_resource(k8s_type, &id).await?)
    }

    async fn create(&self, k8s_type: &K8sType, resource: &Value) -> Result<K8sResource, StoreError> {
        Ok(self.create_resource(k8s_type, resource).await?)
    }

    async fn replace(
        &self,
        k8s_type: &K8sType,
        id: ObjectIdRef<'_>,
        resource: &Value,
    ) -> Result<K8sResource, StoreError> {
        Ok(self.replace_resource(k8s_type, &id, resource).await?)
    }

    async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, StoreError> {
        Ok(self.list_all(k8s_type, namespace, label_selector).await?)
    }

    async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<WatchStream, StoreError> {
        let lines = Client::watch(self, k8s_type, namespace, resource_version, label_selector).await?;
        let stream = futures::stream::unfold(lines, |mut lines| async move {
            let next = lines.next().await?;
            Some((next.map_err(StoreError::from), lines))
        });
        Ok(Box::pin(stream))
    }
}

pub struct Lines {
    body: Body,
    remaining: Option<bytes::Bytes>,
    current_line: Vec<bytes::Bytes>,
}

impl Lines {
    pub fn from_body(body: Body) -> Lines {
        Lines {
            body,
            remaining: None,
            current_line: Vec::with_capacity(2),
        }
    }

    pub async fn next(&mut self) -> Option<Result<Line<'_>, Error>> {
        self.current_line.clear();

        loop {
            if let Some(mut remaining) = self.remaining.take() {
                let res = Lines::index_of_newline(&remaining[..]);
                if let Some((start, end)) = res {
                    // split off the line and keep whatever follows the newline for the next call
                    let mut line = remaining.split_to(end);
                    if !remaining.is_empty() {
                        self.remaining = Some(remaining);
                    }
                    if start > 0 {
                        line.truncate(start);
                        self.current_line.push(line);
                        return Some(Ok(self.make_line()));
                    }
                } else {
                    self.current_line.push(remaining);
                }
            } else {
                match self.body.next().await {
                    Some(Ok(bytes)) => self.remaining = Some(bytes),
                    Some(Err(e)) => {
                        log::error!("Error reading response lines: {}", e);
                        return Some(Err(e.into()));
                    }
                    None => {
                        if !self.current_line.is_empty() {
                            return Some(Ok(self.make_line()));
                        } else {
                            return None;
                        }
                    }
                }
            }
        }
    }

    fn make_line(&mut self) -> Line {
        Line {
            buffer: self.current_line.as_mut_slice(),
        }
    }

    fn index_of_newline(bytes: &[u8]) -> Option<(usize, usize)> {
        NEWLINE_REGEX.find(bytes).map(|m| (m.start(), m.end()))
    }
}

/// One line of a streaming response, possibly spread over several chunks
pub struct Line<'a> {
    buffer: &'a mut [bytes::Bytes],
}

impl<'a> Line<'a> {
    fn is_empty(&self) -> bool {
        self.buffer.iter().map(bytes::Bytes::len).sum::<usize>() == 0usize
    }
}

impl<'a> std::io::Read for Line<'a> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut bytes_written = 0;
        let mut dest = buf;

        while !self.buffer.is_empty() && !dest.is_empty() {
            let byte_count = dest.len().min(self.buffer[0].len());
            dest[..byte_count].copy_from_slice(&self.buffer[0][..byte_count]);
            bytes_written += byte_count;
            dest = &mut dest[byte_count..];

            let _ = self.buffer[0].split_to(byte_count);
            if self.buffer[0].is_empty() {
                let tmp: &mut [bytes::Bytes] = std::mem::take(&mut self.buffer);
                self.buffer = &mut tmp[1..];
            }
        }
        Ok(bytes_written)
    }
}

/// Decodes each non-empty line of a watch response as one `T`
pub struct LineDeserializer<T: DeserializeOwned> {
    lines: Lines,
    _phantom: std::marker::PhantomData<T>,
}

impl<T: DeserializeOwned> LineDeserializer<T> {
    pub fn new(lines: Lines) -> Self {
        Self {
            lines,
            _phantom: std::marker::PhantomData,
        }
    }

    pub async fn next(&mut self) -> Option<Result<T, Error>> {
        loop {
            let line = self.lines.next().await?;
            match line {
                Ok(reader) if !reader.is_empty() => {
                    return Some(serde_json::from_reader(reader).map_err(Into::into))
                }
                Err(err) => return Some(Err(err)),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;
    use std::io::Read;
    use tokio::runtime;

    fn body_of(chunks: Vec<&'static [u8]>) -> Body {
        let stream = tokio_stream::iter(chunks).map(|b| {
            let res: Result<Bytes, std::io::Error> = Ok(Bytes::from_static(b));
            res
        });
        Body::wrap_stream(stream)
    }

    #[test]
    fn lines_iterates_lines() {
        let input1 = &b"line1\nline2\r\nline3\r\n\r\n\r\n\rlong"[..];
        let input2 = &b"line4\r\r"[..];
        let input3 = &b"\r\nline5"[..];
        let mut lines = Lines::from_body(body_of(vec![input1, input2, input3]));

        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        let expected = ["line1", "line2", "line3", "longline4", "line5"];

        runtime.block_on(async move {
            for expected_line in expected.iter() {
                let mut line = lines
                    .next()
                    .await
                    .expect("line returned none")
                    .expect("line returned error");
                let mut string = String::new();
                line.read_to_string(&mut string)
                    .expect("failed to read to string");
                assert_eq!(*expected_line, string.as_str());
                assert!(line.is_empty());
            }
        });
    }

    #[test]
    fn watch_events_are_decoded_across_chunks() {
        let chunk1 = &b"{\"type\":\"ADDED\",\"object\":{\"metadata\":{\"na"[..];
        let chunk2 = &b"me\":\"echo\"}}}\n\n{\"type\":\"ERROR\",\"object\":{\"status\":\"Failure\",\"code\":410}}\n"[..];
        let lines = Lines::from_body(body_of(vec![chunk1, chunk2]));
        let mut events = LineDeserializer::<WatchEvent>::new(lines);

        let runtime = runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async move {
            match events.next().await.unwrap().unwrap() {
                WatchEvent::Added(obj) => assert_eq!(Some("echo"), obj.pointer("/metadata/name").and_then(Value::as_str)),
                other => panic!("expected ADDED, got: {:?}", other),
            }
            match events.next().await.unwrap().unwrap() {
                WatchEvent::Error(err) => assert_eq!(410, err.code),
                other => panic!("expected ERROR, got: {:?}", other),
            }
            assert!(events.next().await.is_none());
        });
    }

    #[test]
    fn http_errors_map_onto_store_errors() {
        assert_eq!(StoreError::Expired, StoreError::from(Error::http(http::StatusCode::GONE)));
        assert!(StoreError::from(Error::http(http::StatusCode::CONFLICT)).is_conflict());
        assert!(StoreError::from(Error::http(http::StatusCode::NOT_FOUND)).is_not_found());
    }
}
