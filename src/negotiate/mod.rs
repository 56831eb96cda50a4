//! Client capability negotiation
//!
//! Derives the set of acceptable output formats from the request's
//! `Accept` header, with a User-Agent fallback for clients that support
//! WebP without advertising it. The raw (original) format is always
//! acceptable; a modern format is offered only when the client advertises
//! it and the server has the encoder enabled.

/// Capability map for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientSupport {
    pub raw: bool,
    pub webp: bool,
    pub avif: bool,
    pub jxl: bool,
}

impl ClientSupport {
    /// Raw only; what a client with no `Accept` header gets.
    pub fn raw_only() -> Self {
        Self {
            raw: true,
            webp: false,
            avif: false,
            jxl: false,
        }
    }

    /// Everything; used by the prefetcher to build all enabled formats.
    pub fn all() -> Self {
        Self {
            raw: true,
            webp: true,
            avif: true,
            jxl: true,
        }
    }

    /// True when no modern format survived negotiation.
    pub fn modern_is_empty(&self) -> bool {
        !self.webp && !self.avif && !self.jxl
    }
}

/// Server-side encoder switches, taken from the configuration.
#[derive(Debug, Clone, Copy)]
pub struct EnabledFormats {
    pub webp: bool,
    pub avif: bool,
    pub jxl: bool,
}

/// Compute the capability map from request headers.
pub fn negotiate(
    accept: Option<&str>,
    user_agent: Option<&str>,
    enabled: EnabledFormats,
) -> ClientSupport {
    let mut support = ClientSupport::raw_only();

    if let Some(accept) = accept {
        for token in accept.split(',') {
            let media_type = token.split(';').next().unwrap_or("").trim();
            match media_type.to_ascii_lowercase().as_str() {
                "image/webp" => support.webp = true,
                "image/avif" => support.avif = true,
                "image/jxl" => support.jxl = true,
                _ => {}
            }
        }
    }

    // Safari 14+ and iOS 14+ decode WebP but old versions of the header
    // did not advertise it; recognize them by UA.
    if !support.webp {
        if let Some(ua) = user_agent {
            if ua_implies_webp(ua) {
                support.webp = true;
            }
        }
    }

    support.webp &= enabled.webp;
    support.avif &= enabled.avif;
    support.jxl &= enabled.jxl;
    support
}

fn ua_implies_webp(ua: &str) -> bool {
    if !ua.contains("Safari") || ua.contains("Chrome") || ua.contains("Chromium") {
        return false;
    }
    // "Version/14.1.2 ... Safari/605.1.15" — major version 14 and up.
    ua.split("Version/")
        .nth(1)
        .and_then(|rest| rest.split('.').next())
        .and_then(|major| major.parse::<u32>().ok())
        .map(|major| major >= 14)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ENABLED: EnabledFormats = EnabledFormats {
        webp: true,
        avif: true,
        jxl: true,
    };

    #[test]
    fn test_missing_accept_defaults_to_raw_only() {
        let support = negotiate(None, None, ALL_ENABLED);
        assert_eq!(support, ClientSupport::raw_only());
        assert!(support.modern_is_empty());
    }

    #[test]
    fn test_accept_tokens_map_to_capabilities() {
        let support = negotiate(
            Some("image/avif,image/webp,image/apng,*/*;q=0.8"),
            None,
            ALL_ENABLED,
        );
        assert!(support.raw);
        assert!(support.webp);
        assert!(support.avif);
        assert!(!support.jxl);
    }

    #[test]
    fn test_accept_with_quality_params() {
        let support = negotiate(Some("image/jxl;q=0.9, image/webp;q=0.8"), None, ALL_ENABLED);
        assert!(support.jxl);
        assert!(support.webp);
    }

    #[test]
    fn test_server_disabled_format_is_filtered() {
        let enabled = EnabledFormats {
            webp: true,
            avif: false,
            jxl: false,
        };
        let support = negotiate(Some("image/avif,image/webp,image/jxl"), None, enabled);
        assert!(support.webp);
        assert!(!support.avif);
        assert!(!support.jxl);
    }

    #[test]
    fn test_safari_14_ua_implies_webp() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 \
                  (KHTML, like Gecko) Version/14.1.2 Safari/605.1.15";
        let support = negotiate(Some("image/png,image/svg+xml,*/*;q=0.8"), Some(ua), ALL_ENABLED);
        assert!(support.webp);
    }

    #[test]
    fn test_safari_13_ua_does_not_imply_webp() {
        let ua = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_14_6) AppleWebKit/605.1.15 \
                  (KHTML, like Gecko) Version/13.1 Safari/605.1.15";
        let support = negotiate(Some("image/png"), Some(ua), ALL_ENABLED);
        assert!(!support.webp);
    }

    #[test]
    fn test_chrome_ua_is_not_treated_as_safari() {
        let ua = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) \
                  Chrome/120.0 Safari/537.36";
        let support = negotiate(Some("image/png"), Some(ua), ALL_ENABLED);
        assert!(!support.webp);
    }

    #[test]
    fn test_raw_is_always_acceptable() {
        let support = negotiate(Some("text/html"), None, ALL_ENABLED);
        assert!(support.raw);
        assert!(support.modern_is_empty());
    }
}
