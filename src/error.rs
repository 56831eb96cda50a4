// Error types module

use std::fmt;

/// Centralized error type for the gateway.
///
/// Categorizes failures the request pipeline can surface to a client,
/// with an HTTP status mapping. Encoder-level failures never reach this
/// type: the processor degrades to serving the original instead.
#[derive(Debug, Clone)]
pub enum GatewayError {
    /// The resolved source does not exist (local stat failure or
    /// upstream 404). Metadata for the source is deleted by the caller.
    SourceMissing { path: String },

    /// The upstream origin could not be reached or returned a
    /// non-success status during HEAD/GET.
    Upstream { message: String, url: Option<String> },

    /// The request names an extension outside `allowed_types`.
    ExtensionNotAllowed { extension: String },

    /// No image-map prefix matches the request path.
    RouteMiss,

    /// A configured target could not be interpreted (unparsable URL).
    Config { message: String },

    /// Unexpected local failure (disk full, permissions, rename races).
    Io { message: String, operation: Option<String> },
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::SourceMissing { path } => {
                write!(f, "Source not found: {}", path)
            }
            GatewayError::Upstream { message, url } => {
                write!(f, "Upstream error: {}", message)?;
                if let Some(u) = url {
                    write!(f, " [url: {}]", u)?;
                }
                Ok(())
            }
            GatewayError::ExtensionNotAllowed { extension } => {
                write!(f, "File extension not allowed! {}", extension)
            }
            GatewayError::RouteMiss => write!(f, "No matching image-map prefix"),
            GatewayError::Config { message } => {
                write!(f, "Configuration error: {}", message)
            }
            GatewayError::Io { message, operation } => {
                write!(f, "I/O error: {}", message)?;
                if let Some(op) = operation {
                    write!(f, " [operation: {}]", op)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for GatewayError {}

impl GatewayError {
    /// Map the error to the HTTP status served to the client.
    ///
    /// - SourceMissing, RouteMiss → 404
    /// - ExtensionNotAllowed → 400
    /// - Upstream, Config, Io → 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            GatewayError::SourceMissing { .. } | GatewayError::RouteMiss => 404,
            GatewayError::ExtensionNotAllowed { .. } => 400,
            GatewayError::Upstream { .. }
            | GatewayError::Config { .. }
            | GatewayError::Io { .. } => 500,
        }
    }

    pub fn source_missing(path: impl Into<String>) -> Self {
        GatewayError::SourceMissing { path: path.into() }
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        GatewayError::Upstream {
            message: message.into(),
            url: None,
        }
    }

    pub fn upstream_with_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        GatewayError::Upstream {
            message: message.into(),
            url: Some(url.into()),
        }
    }

    pub fn extension_not_allowed(extension: impl Into<String>) -> Self {
        GatewayError::ExtensionNotAllowed {
            extension: extension.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        GatewayError::Config {
            message: message.into(),
        }
    }

    pub fn io(message: impl Into<String>) -> Self {
        GatewayError::Io {
            message: message.into(),
            operation: None,
        }
    }

    pub fn io_with_operation(message: impl Into<String>, operation: impl Into<String>) -> Self {
        GatewayError::Io {
            message: message.into(),
            operation: Some(operation.into()),
        }
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            GatewayError::SourceMissing {
                path: err.to_string(),
            }
        } else {
            GatewayError::io(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_missing_maps_to_404() {
        let err = GatewayError::source_missing("/pics/a.jpg");
        assert_eq!(err.to_http_status(), 404);
        assert_eq!(err.to_string(), "Source not found: /pics/a.jpg");
    }

    #[test]
    fn test_upstream_maps_to_500() {
        let err = GatewayError::upstream_with_url("connect refused", "https://cdn.example.com/x");
        assert_eq!(err.to_http_status(), 500);
        assert!(err.to_string().contains("cdn.example.com"));
    }

    #[test]
    fn test_extension_not_allowed_maps_to_400() {
        let err = GatewayError::extension_not_allowed("a.tiff");
        assert_eq!(err.to_http_status(), 400);
        assert_eq!(err.to_string(), "File extension not allowed! a.tiff");
    }

    #[test]
    fn test_io_not_found_becomes_source_missing() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: GatewayError = io.into();
        assert_eq!(err.to_http_status(), 404);
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<GatewayError>();
    }
}
