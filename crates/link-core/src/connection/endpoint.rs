//! Server address normalization

use url::Url;

use crate::error::{LinkError, LinkResult};

/// Path every link endpoint ends with
pub const LINK_PATH_SUFFIX: &str = "/ws";

/// Turn the configured server address into the WebSocket endpoint
///
/// Accepts a bare host (`phone.example.com:8080`), an `http(s)` URL or a
/// `ws(s)` URL. `http` becomes `ws`, `https` becomes `wss`, and `/ws` is
/// appended to the path unless it is already there.
pub fn resolve_endpoint(server_url: Option<&str>) -> LinkResult<Url> {
    let raw = server_url.map(str::trim).filter(|s| !s.is_empty()).ok_or_else(|| {
        LinkError::MissingConfiguration {
            field: "server_url".to_string(),
        }
    })?;

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("ws://{}", raw)
    };

    let mut url = Url::parse(&with_scheme).map_err(|e| LinkError::invalid_config("server_url", e.to_string()))?;

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(LinkError::invalid_config(
                "server_url",
                format!("unsupported scheme `{}`", other),
            ))
        }
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(LinkError::invalid_config("server_url", "cannot rewrite scheme"));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(LinkError::invalid_config("server_url", "missing host"));
    }

    let path = url.path().trim_end_matches('/').to_string();
    if !path.ends_with(LINK_PATH_SUFFIX) {
        url.set_path(&format!("{}{}", path, LINK_PATH_SUFFIX));
    }

    Ok(url)
}

/// Base URL for HTTP resources served next to the link endpoint
///
/// The inverse of [`resolve_endpoint`]: `ws` becomes `http`, `wss` becomes
/// `https` and the `/ws` suffix is removed. No trailing slash.
pub fn http_base(endpoint: &Url) -> String {
    let scheme = if endpoint.scheme() == "wss" { "https" } else { "http" };
    let mut base = format!("{}://{}", scheme, endpoint.host_str().unwrap_or_default());
    if let Some(port) = endpoint.port() {
        base.push_str(&format!(":{}", port));
    }
    let path = endpoint.path().trim_end_matches('/');
    base.push_str(path.strip_suffix(LINK_PATH_SUFFIX).unwrap_or(path));
    base
}

/// Download URL of an audio file hosted by the server
pub fn audio_download_url(endpoint: &Url, file_id: &str) -> String {
    format!("{}/api/audio-files/{}/download", http_base(endpoint), file_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(raw: &str) -> String {
        resolve_endpoint(Some(raw)).unwrap().to_string()
    }

    #[test]
    fn test_scheme_rewriting_and_suffix() {
        assert_eq!(resolve("phone.example.com"), "ws://phone.example.com/ws");
        assert_eq!(resolve("phone.example.com:8080"), "ws://phone.example.com:8080/ws");
        assert_eq!(resolve("http://phone.example.com"), "ws://phone.example.com/ws");
        assert_eq!(resolve("https://phone.example.com/"), "wss://phone.example.com/ws");
        assert_eq!(resolve("wss://phone.example.com/ws"), "wss://phone.example.com/ws");
        assert_eq!(resolve("https://example.com/tenant/"), "wss://example.com/tenant/ws");
    }

    #[test]
    fn test_missing_or_malformed_address_is_a_configuration_error() {
        for raw in [None, Some(""), Some("   ")] {
            assert_eq!(
                resolve_endpoint(raw),
                Err(LinkError::MissingConfiguration { field: "server_url".into() })
            );
        }
        for raw in ["ftp://example.com", "http://", "ws://exa mple.com"] {
            let err = resolve_endpoint(Some(raw)).unwrap_err();
            assert!(err.is_configuration_error(), "{raw} gave {err:?}");
        }
    }

    #[test]
    fn test_audio_url_derivation() {
        let endpoint = resolve_endpoint(Some("https://phone.example.com:8443")).unwrap();
        assert_eq!(
            audio_download_url(&endpoint, "17"),
            "https://phone.example.com:8443/api/audio-files/17/download"
        );

        let endpoint = resolve_endpoint(Some("phone.local")).unwrap();
        assert_eq!(http_base(&endpoint), "http://phone.local");
    }
}
