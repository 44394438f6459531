//! HTTP transport seam for the API client.
//!
//! The client never talks to `reqwest` directly. Every call goes through
//! an `HttpTransport`, which keeps the authentication protocol testable
//! with scripted transports and lets the same request be replayed after a
//! token refresh.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::{header, multipart, Client, Method};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::{ApiError, TransportError};

/// Sends a fully described request and returns the raw response.
pub trait HttpTransport: Send + Sync {
    fn send<'a>(&'a self, request: &'a HttpRequest)
        -> BoxFuture<'a, Result<HttpResponse, TransportError>>;
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub bearer: Option<String>,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    Multipart(MultipartForm),
}

/// Owned description of a multipart body.
///
/// `reqwest::multipart::Form` is consumed on send, so the form is rebuilt
/// from this description for every attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultipartForm {
    parts: Vec<FormPart>,
}

#[derive(Debug, Clone, PartialEq)]
enum FormPart {
    Text {
        name: String,
        value: String,
    },
    File {
        name: String,
        file_name: String,
        mime: Option<String>,
        data: Vec<u8>,
    },
}

impl MultipartForm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parts.push(FormPart::Text {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        mime: Option<&str>,
        data: Vec<u8>,
    ) -> Self {
        self.parts.push(FormPart::File {
            name: name.into(),
            file_name: file_name.into(),
            mime: mime.map(str::to_owned),
            data,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    fn to_reqwest(&self) -> Result<multipart::Form, reqwest::Error> {
        let mut form = multipart::Form::new();
        for part in &self.parts {
            form = match part {
                FormPart::Text { name, value } => form.text(name.clone(), value.clone()),
                FormPart::File {
                    name,
                    file_name,
                    mime,
                    data,
                } => {
                    let mut file =
                        multipart::Part::bytes(data.clone()).file_name(file_name.clone());
                    if let Some(mime) = mime {
                        file = file.mime_str(mime)?;
                    }
                    form.part(name.clone(), file)
                }
            };
        }
        Ok(form)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

/// Parsed response payload, chosen by the response `Content-Type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    /// Deserialize a JSON payload into a caller type.
    pub fn into_json<T: DeserializeOwned>(self) -> Result<T, ApiError> {
        match self {
            ResponseBody::Json(value) => Ok(serde_json::from_value(value)?),
            ResponseBody::Text(text) => Err(ApiError::InvalidResponse(format!(
                "expected JSON, got text: {}",
                super::error::truncate_body(&text)
            ))),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }
}

impl HttpResponse {
    pub fn json(status: u16, value: Value) -> Self {
        Self {
            status,
            content_type: Some("application/json; charset=utf-8".to_string()),
            body: serde_json::to_vec(&value).unwrap_or_default(),
        }
    }

    pub fn text(status: u16, text: &str) -> Self {
        Self {
            status,
            content_type: Some("text/plain; charset=utf-8".to_string()),
            body: text.as_bytes().to_vec(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == 401
    }

    fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.to_ascii_lowercase().contains("json"))
            .unwrap_or(false)
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse the body as JSON or text according to `Content-Type`.
    pub fn parse_body(&self) -> Result<ResponseBody, ApiError> {
        if !self.is_json() {
            return Ok(ResponseBody::Text(self.text_lossy()));
        }
        if self.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ResponseBody::Json(Value::Null));
        }
        serde_json::from_slice(&self.body)
            .map(ResponseBody::Json)
            .map_err(|e| ApiError::InvalidResponse(format!("malformed JSON body: {}", e)))
    }
}

/// `reqwest`-backed transport.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send<'a>(
        &'a self,
        request: &'a HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
        Box::pin(async move {
            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .header(header::ACCEPT, "application/json");

            if let Some(ref token) = request.bearer {
                builder = builder.bearer_auth(token);
            }

            // Multipart bodies carry their own boundary header.
            builder = match &request.body {
                RequestBody::Empty => builder.header(header::CONTENT_TYPE, "application/json"),
                RequestBody::Json(value) => builder.json(value),
                RequestBody::Multipart(form) => builder.multipart(form.to_reqwest()?),
            };

            let response = builder.send().await?;
            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = response.bytes().await?.to_vec();

            Ok(HttpResponse {
                status,
                content_type,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[test]
    fn test_parse_body_json() {
        let response = HttpResponse::json(200, json!({"id": 7}));
        assert_eq!(response.parse_body().unwrap(), ResponseBody::Json(json!({"id": 7})));
    }

    #[test]
    fn test_parse_body_text_when_not_json() {
        let response = HttpResponse::text(200, "ok");
        assert_eq!(response.parse_body().unwrap(), ResponseBody::Text("ok".into()));
    }

    #[test]
    fn test_parse_body_missing_content_type_is_text() {
        let response = HttpResponse {
            status: 200,
            content_type: None,
            body: b"{\"a\":1}".to_vec(),
        };
        assert_eq!(response.parse_body().unwrap(), ResponseBody::Text("{\"a\":1}".into()));
    }

    #[test]
    fn test_parse_body_empty_json_is_null() {
        let response = HttpResponse {
            status: 204,
            content_type: Some("application/json".into()),
            body: Vec::new(),
        };
        assert_eq!(response.parse_body().unwrap(), ResponseBody::Json(Value::Null));
    }

    #[test]
    fn test_parse_body_malformed_json_is_invalid_response() {
        let response = HttpResponse {
            status: 200,
            content_type: Some("application/problem+json".into()),
            body: b"{not json".to_vec(),
        };
        assert!(matches!(response.parse_body(), Err(ApiError::InvalidResponse(_))));
    }

    #[test]
    fn test_into_json_deserializes_caller_type() {
        #[derive(Deserialize)]
        struct Task {
            id: u32,
            title: String,
        }

        let body = ResponseBody::Json(json!({"id": 3, "title": "Replace terminal"}));
        let task: Task = body.into_json().unwrap();
        assert_eq!(task.id, 3);
        assert_eq!(task.title, "Replace terminal");
    }

    #[test]
    fn test_into_json_rejects_text() {
        let body = ResponseBody::Text("<html>".into());
        assert!(matches!(
            body.into_json::<Value>(),
            Err(ApiError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_multipart_form_builds_parts() {
        let form = MultipartForm::new()
            .text("taskId", "42")
            .file("photo", "site.jpg", Some("image/jpeg"), vec![0xff, 0xd8]);
        assert_eq!(form.len(), 2);
        assert!(form.to_reqwest().is_ok());
    }

    #[test]
    fn test_multipart_form_rejects_bad_mime() {
        let form = MultipartForm::new().file("photo", "site.jpg", Some("not a mime"), vec![1]);
        assert!(form.to_reqwest().is_err());
    }
}
