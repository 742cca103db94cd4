//! Request/response surface the scheme needs from the hosting HTTP stack.

use http::header::{HeaderName, HeaderValue};
use http::StatusCode;

use crate::{Error, Result};

pub const AUTHORIZATION: &str = "Authorization";
pub const WWW_AUTHENTICATE: &str = "WWW-Authenticate";
pub const X_REQUESTED_WITH: &str = "X-Requested-With";

/// Inbound request
pub trait HttpRequest {
    fn method(&self) -> &str;
    /// First value of header `name`; names are case-insensitive
    fn header(&self, name: &str) -> Option<&str>;
    /// Base path the application is mounted at, if the host knows it
    fn context_path(&self) -> Option<&str>;

    fn authorization(&self) -> Option<&str> {
        self.header(AUTHORIZATION)
    }

    /// Scripted (XHR) requests get 403 instead of 401, so browsers do not pop a login dialog.
    fn is_xml_http_request(&self) -> bool {
        self.header(X_REQUESTED_WITH)
            .map_or(false, |v| v.eq_ignore_ascii_case("XMLHttpRequest"))
    }
}

/// Outbound response
pub trait HttpResponse {
    fn set_header(&mut self, name: &str, value: &str) -> Result<()>;
    fn send_error(&mut self, status: u16) -> Result<()>;
}

/// Request extension carrying the context path for `http::Request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextPath(pub String);

impl<B> HttpRequest for http::Request<B> {
    fn method(&self) -> &str {
        self.method().as_str()
    }

    fn header(&self, name: &str) -> Option<&str> {
        self.headers().get(name).and_then(|v| v.to_str().ok())
    }

    fn context_path(&self) -> Option<&str> {
        self.extensions()
            .get::<ContextPath>()
            .map(|path| path.0.as_str())
    }
}

impl<B> HttpResponse for http::Response<B> {
    fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Challenge(format!("bad header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Challenge(format!("bad header value: {}", e)))?;

        self.headers_mut().insert(name, value);
        Ok(())
    }

    fn send_error(&mut self, status: u16) -> Result<()> {
        *self.status_mut() = StatusCode::from_u16(status)
            .map_err(|e| Error::Challenge(format!("bad status {}: {}", status, e)))?;
        Ok(())
    }
}
