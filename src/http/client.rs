use std::fs;
use std::path::Path;

use crate::http::config::{HttpConfig, ProxyConfig};
use crate::http_client::{HttpClient as OauthHttpClient, HttpClientError as OauthHttpClientError};
use http::Response as HttpResponse;
use http::{Request, Response};
use reqwest::blocking::{Client, ClientBuilder, Response as BlockingResponse};
use reqwest::redirect::Policy;
use reqwest::tls::TlsInfo;
use reqwest::{Certificate, Proxy};
use tracing::debug;

/// Blocking reqwest client implementing [`crate::http_client::HttpClient`].
///
/// Redirects are never followed: callers see the `3xx` response and its `Location` header.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Builds a reqwest blocking client according to the provided configuration.
    pub fn new(config: HttpConfig) -> Result<Self, HttpBuildError> {
        let builder = Client::builder()
            .use_rustls_tls()
            .tls_built_in_native_certs(true)
            .redirect(Policy::none())
            .timeout(config.timeout)
            .connect_timeout(config.conn_timeout);

        let builder = with_proxy(builder, &config.proxy)?;

        let client = builder
            .build()
            .map_err(|err| HttpBuildError::ClientBuilder(err.to_string()))?;

        Ok(Self { client })
    }

    fn send(&self, request: Request<Vec<u8>>) -> Result<HttpResponse<Vec<u8>>, HttpResponseError> {
        let req = self
            .client
            .request(request.method().into(), request.uri().to_string().as_str())
            .headers(request.headers().clone())
            .body(request.body().to_vec());

        let res = req
            .send()
            .map_err(|err| HttpResponseError::TransportError(err.to_string()))?;

        try_build_response(res)
    }
}

fn with_proxy(builder: ClientBuilder, proxy: &ProxyConfig) -> Result<ClientBuilder, HttpBuildError> {
    let url = proxy.url_as_string();
    if url.is_empty() {
        return Ok(builder);
    }
    debug!(proxy = %url, "configuring http proxy");

    let mut builder = builder.proxy(
        Proxy::all(url.as_str()).map_err(|err| HttpBuildError::InvalidProxy(err.to_string()))?,
    );
    for cert in ca_certificates(proxy)? {
        builder = builder.add_root_certificate(cert);
    }
    Ok(builder)
}

/// Reads the proxy CA certificates: the bundle file plus every `.pem` file in the bundle dir.
fn ca_certificates(proxy: &ProxyConfig) -> Result<Vec<Certificate>, HttpBuildError> {
    let mut paths = Vec::new();
    if !proxy.ca_bundle_file().as_os_str().is_empty() {
        paths.push(proxy.ca_bundle_file().to_path_buf());
    }
    if !proxy.ca_bundle_dir().as_os_str().is_empty() {
        let entries = fs::read_dir(proxy.ca_bundle_dir())
            .map_err(|err| HttpBuildError::CertificateBundle(err.to_string()))?;
        for entry in entries {
            let path = entry
                .map_err(|err| HttpBuildError::CertificateBundle(err.to_string()))?
                .path();
            if path.extension().is_some_and(|ext| ext == "pem") {
                paths.push(path);
            }
        }
    }

    paths.iter().map(|path| read_certificate(path)).collect()
}

fn read_certificate(path: &Path) -> Result<Certificate, HttpBuildError> {
    let pem = fs::read(path).map_err(|err| {
        HttpBuildError::CertificateBundle(format!("{}: {err}", path.display()))
    })?;
    Certificate::from_pem(&pem)
        .map_err(|err| HttpBuildError::CertificateBundle(format!("{}: {err}", path.display())))
}

fn try_build_response(res: BlockingResponse) -> Result<HttpResponse<Vec<u8>>, HttpResponseError> {
    let status = res.status();
    let version = res.version();
    let headers = res.headers().clone();

    let tls_info = res.extensions().get::<TlsInfo>().cloned();

    let body: Vec<u8> = res
        .bytes()
        .map_err(|err| HttpResponseError::ReadingResponse(err.to_string()))?
        .into();

    let mut response_builder = http::Response::builder().status(status).version(version);
    if let Some(response_headers) = response_builder.headers_mut() {
        *response_headers = headers;
    }

    let response_builder = if let Some(tls_info) = tls_info {
        response_builder.extension(tls_info)
    } else {
        response_builder
    };

    let response = response_builder
        .body(body)
        .map_err(|err| HttpResponseError::BuildingResponse(err.to_string()))?;

    Ok(response)
}

impl OauthHttpClient for HttpClient {
    fn send(&self, req: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, OauthHttpClientError> {
        let response = self.send(req)?;

        Ok(response)
    }
}

impl From<HttpResponseError> for OauthHttpClientError {
    fn from(err: HttpResponseError) -> Self {
        match err {
            HttpResponseError::TransportError(msg) => OauthHttpClientError::TransportError(msg),
            HttpResponseError::BuildingResponse(msg) | HttpResponseError::ReadingResponse(msg) => {
                OauthHttpClientError::InvalidResponse(msg)
            }
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HttpBuildError {
    #[error("could not build the http client: {0}")]
    ClientBuilder(String),
    #[error("invalid proxy configuration: {0}")]
    InvalidProxy(String),
    #[error("could not load proxy CA certificates: {0}")]
    CertificateBundle(String),
}

#[derive(thiserror::Error, Debug)]
enum HttpResponseError {
    #[error("could read response body: {0}")]
    ReadingResponse(String),
    #[error("could build response: {0}")]
    BuildingResponse(String),
    #[error("http transport error: `{0}`")]
    TransportError(String),
}
