use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use eltflow_utils::error::Error;
use eltflow_utils::{EltResult, RecordSet};
use reqwest::{Client as ReqwestClient, Method, Request};
use serde_json::Value;
use url::Url;

use super::traits::Source;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct HttpSourceBuilder {
    name: String,
    method: Method,
    base_url: String,
    endpoint: String,
    token: Option<String>,
    params: Option<HashMap<String, String>>,
}

impl Default for HttpSourceBuilder {
    fn default() -> Self {
        Self {
            name: "http".to_string(),
            method: Method::GET,
            base_url: "http://localhost".to_string(),
            endpoint: String::new(),
            token: None,
            params: None,
        }
    }
}

impl HttpSourceBuilder {
    pub fn new<T: Into<String>>(base_url: T) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn name<T: Into<String>>(mut self, name: T) -> Self {
        self.name = name.into();
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn endpoint<T: Into<String>>(mut self, endpoint: T) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn token<T: Into<String>>(mut self, token: Option<T>) -> Self {
        self.token = token.map(|t| t.into());
        self
    }

    pub fn params(mut self, params: HashMap<String, String>) -> Self {
        self.params = Some(params);
        self
    }

    /// Joins base URL and endpoint the way a browser would resolve them,
    /// treating the base as a directory.
    fn url(&self) -> EltResult<Url> {
        let base = if self.base_url.ends_with('/') {
            self.base_url.clone()
        } else {
            format!("{}/", self.base_url)
        };
        let base = Url::parse(&base).map_err(|e| Error::Config(format!("invalid base url `{}`: {e}", self.base_url)))?;
        base.join(self.endpoint.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("invalid endpoint `{}`: {e}", self.endpoint)))
    }

    pub fn build(self) -> EltResult<HttpSource> {
        let client = ReqwestClient::new();
        let mut request = client
            .request(self.method.clone(), self.url()?)
            .timeout(REQUEST_TIMEOUT);

        // Add parameters first (if any)
        if let Some(params) = &self.params {
            request = request.query(params);
        }

        // Add authentication token (if any)
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let request = request
            .build()
            .map_err(|e| Error::Config(format!("invalid request for `{}`: {e}", self.name)))?;

        Ok(HttpSource {
            name: self.name,
            client,
            request,
        })
    }
}

/// Pulls a JSON array of objects from an HTTP endpoint.
pub struct HttpSource {
    name: String,
    client: ReqwestClient,
    request: Request,
}

impl HttpSource {
    pub fn url(&self) -> &Url {
        self.request.url()
    }

    fn get_request(&self) -> EltResult<Request> {
        self.request
            .try_clone()
            .ok_or_else(|| Error::connector(&self.name, "request body cannot be replayed"))
    }

    async fn fetch(&self) -> EltResult<Vec<u8>> {
        let resp = self
            .client
            .execute(self.get_request()?)
            .await
            .map_err(|e| Error::connector(&self.name, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::connector(&self.name, format!("{} returned {status}", self.url())));
        }
        let body = resp.bytes().await.map_err(|e| Error::connector(&self.name, e))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl Source for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn extract(&self) -> EltResult<RecordSet> {
        let body = self.fetch().await?;
        let rows = match serde_json::from_slice::<Value>(&body) {
            Ok(Value::Array(rows)) => rows,
            Ok(_) => return Err(Error::connector(&self.name, "malformed payload: expected a JSON array")),
            Err(e) => return Err(Error::connector(&self.name, format!("malformed payload: {e}"))),
        };
        let records = RecordSet::from_json_rows(&rows).map_err(|e| match e {
            Error::Connector { message, .. } => Error::connector(&self.name, message),
            other => Error::connector(&self.name, other),
        })?;
        tracing::info!(source = %self.name, url = %self.url(), rows = records.num_rows(), "http extract complete");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Response, Server, StatusCode};
    use std::convert::Infallible;
    use std::net::TcpListener;

    /// Serve fixed responses by path on an ephemeral port.
    fn serve(routes: Vec<(&'static str, StatusCode, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let make = make_service_fn(move |_| {
            let routes = routes.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req: hyper::Request<Body>| {
                    let found = routes.iter().find(|(p, _, _)| *p == req.uri().path()).cloned();
                    let authorized = req
                        .headers()
                        .get("authorization")
                        .map(|v| v == "Bearer s3cret")
                        .unwrap_or(false);
                    async move {
                        let (status, body) = match found {
                            Some((_, status, body)) if authorized => (status, body),
                            Some(_) => (StatusCode::UNAUTHORIZED, ""),
                            None => (StatusCode::NOT_FOUND, ""),
                        };
                        Ok::<_, Infallible>(Response::builder().status(status).body(Body::from(body)).unwrap())
                    }
                }))
            }
        });
        let server = Server::from_tcp(listener).unwrap().serve(make);
        tokio::spawn(server);
        format!("http://{addr}")
    }

    fn source(base: &str, endpoint: &str) -> HttpSource {
        HttpSourceBuilder::new(base)
            .name("mockapi")
            .endpoint(endpoint)
            .token(Some("s3cret"))
            .build()
            .unwrap()
    }

    #[test]
    fn endpoint_is_joined_under_base_path() {
        let src = HttpSourceBuilder::new("http://api.local/v1")
            .endpoint("/ecom_orders_api/orders")
            .build()
            .unwrap();
        assert_eq!(src.url().as_str(), "http://api.local/v1/ecom_orders_api/orders");
    }

    #[test]
    fn requests_carry_a_timeout() {
        let src = HttpSourceBuilder::new("http://api.local").endpoint("orders").build().unwrap();
        assert_eq!(src.get_request().unwrap().timeout(), Some(&REQUEST_TIMEOUT));
    }

    #[tokio::test]
    async fn extracts_json_array() {
        let base = serve(vec![(
            "/orders",
            StatusCode::OK,
            r#"[{"order_id": 1, "total": 10.5}, {"order_id": 2, "total": 3}]"#,
        )]);
        let records = source(&base, "orders").extract().await.unwrap();
        assert_eq!(records.num_rows(), 2);
        assert_eq!(records.field_names(), vec!["order_id", "total"]);
    }

    #[tokio::test]
    async fn non_success_status_is_connector_error() {
        let base = serve(vec![("/orders", StatusCode::INTERNAL_SERVER_ERROR, "oops")]);
        let err = source(&base, "orders").extract().await.unwrap_err();
        assert!(matches!(err, Error::Connector { ref connector, .. } if connector == "mockapi"));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn object_payload_is_malformed() {
        let base = serve(vec![("/orders", StatusCode::OK, r#"{"orders": []}"#)]);
        let err = source(&base, "orders").extract().await.unwrap_err();
        assert!(err.to_string().contains("malformed payload"));
    }
}
