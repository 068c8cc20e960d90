// Device identity probe
//
// Every RPC-generation device answers `GET /shelly` without auth. The
// reply says who the device is and whether RPC calls must be signed,
// which decides whether a session passes through `Authenticating`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::error::Error;

const USER_AGENT: &str = concat!("shelly-rpc/", env!("CARGO_PKG_VERSION"));

/// Length of the `YYYYMMDD` build-date prefix on firmware ids.
const FIRMWARE_DATE_LEN: usize = 8;

/// Contents of the `/shelly` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Device id, e.g. `"shellypro1-abc123"`. Also the default auth realm.
    pub id: String,
    pub mac: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "gen")]
    pub generation: Option<u8>,
    /// Firmware id, e.g. `"20230913-112003/v1.14.0-gcb84623"`.
    #[serde(default)]
    pub fw_id: Option<String>,
    #[serde(default)]
    pub ver: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
    /// Absent on generation-1 devices, which do not speak RPC.
    #[serde(default)]
    pub auth_en: Option<bool>,
    #[serde(default)]
    pub auth_domain: Option<String>,
}

impl DeviceInfo {
    /// Whether RPC calls must carry digest auth.
    ///
    /// Fails for devices that do not report `auth_en` at all.
    pub fn requires_auth(&self) -> Result<bool, Error> {
        self.auth_en.ok_or_else(|| Error::UnsupportedDevice {
            reason: format!(
                "{} does not report auth_en (generation {})",
                self.id,
                self.generation.map_or_else(|| "1".into(), |g| g.to_string())
            ),
        })
    }

    /// The digest realm: `auth_domain`, falling back to the device id.
    pub fn realm(&self) -> &str {
        self.auth_domain.as_deref().unwrap_or(&self.id)
    }

    /// Firmware build date as `YYYYMMDD`, parsed from the `fw_id` prefix.
    pub fn firmware_date(&self) -> Option<u32> {
        let fw = self.fw_id.as_deref()?;
        let prefix = fw.get(..FIRMWARE_DATE_LEN)?;
        if !prefix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        prefix.parse().ok()
    }

    /// Compare against a configured MAC, ignoring case and separators.
    pub fn mac_matches(&self, expected: &str) -> bool {
        normalize_mac(&self.mac) == normalize_mac(expected)
    }
}

fn normalize_mac(mac: &str) -> String {
    mac.chars()
        .filter(char::is_ascii_hexdigit)
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

// ── HTTP client ──────────────────────────────────────────────────────

/// Build the `reqwest::Client` used for probing.
pub fn build_http_client(timeout: Duration) -> Result<reqwest::Client, Error> {
    reqwest::Client::builder()
        .timeout(timeout)
        .user_agent(USER_AGENT)
        .build()
        .map_err(Error::Http)
}

/// Base URL for a device's HTTP endpoints.
pub fn device_base_url(host: &str, port: u16) -> Result<Url, Error> {
    Url::parse(&format!("http://{host}:{port}/")).map_err(Error::InvalidUrl)
}

/// `GET /shelly` and verify the MAC if one was configured.
pub async fn fetch_device_info(
    http: &reqwest::Client,
    base_url: &Url,
    expected_mac: Option<&str>,
) -> Result<DeviceInfo, Error> {
    let url = base_url.join("shelly").map_err(Error::InvalidUrl)?;
    debug!(url = %url, "probing device info");

    let resp = http
        .get(url)
        .send()
        .await
        .map_err(Error::Http)?
        .error_for_status()
        .map_err(Error::Http)?;

    let body = resp.text().await.map_err(Error::Http)?;
    let info: DeviceInfo = serde_json::from_str(&body).map_err(|e| Error::Deserialization {
        message: e.to_string(),
        body: body.clone(),
    })?;

    if let Some(expected) = expected_mac {
        if !info.mac_matches(expected) {
            return Err(Error::MacAddressMismatch {
                expected: expected.to_owned(),
                actual: info.mac,
            });
        }
    }

    debug!(id = %info.id, auth_en = ?info.auth_en, "device info received");
    Ok(info)
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn pro1_info() -> serde_json::Value {
        json!({
            "name": null,
            "id": "shellypro1-c8f09e87b0f0",
            "mac": "C8F09E87B0F0",
            "model": "SPSW-201XE16EU",
            "gen": 2,
            "fw_id": "20230913-112003/v1.14.0-gcb84623",
            "ver": "1.14.0",
            "app": "Pro1",
            "auth_en": true,
            "auth_domain": "shellypro1-c8f09e87b0f0"
        })
    }

    async fn setup() -> (MockServer, reqwest::Client, Url) {
        let server = MockServer::start().await;
        let base = Url::parse(&format!("{}/", server.uri())).unwrap();
        let http = build_http_client(Duration::from_secs(5)).unwrap();
        (server, http, base)
    }

    #[tokio::test]
    async fn fetch_parses_info() {
        let (server, http, base) = setup().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pro1_info()))
            .mount(&server)
            .await;

        let info = fetch_device_info(&http, &base, None).await.unwrap();
        assert_eq!(info.id, "shellypro1-c8f09e87b0f0");
        assert_eq!(info.generation, Some(2));
        assert!(info.requires_auth().unwrap());
        assert_eq!(info.realm(), "shellypro1-c8f09e87b0f0");
        assert_eq!(info.firmware_date(), Some(20_230_913));
    }

    #[tokio::test]
    async fn fetch_accepts_mac_in_any_notation() {
        let (server, http, base) = setup().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pro1_info()))
            .mount(&server)
            .await;

        let info = fetch_device_info(&http, &base, Some("c8:f0:9e:87:b0:f0"))
            .await
            .unwrap();
        assert_eq!(info.mac, "C8F09E87B0F0");
    }

    #[tokio::test]
    async fn fetch_rejects_mac_mismatch() {
        let (server, http, base) = setup().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(200).set_body_json(pro1_info()))
            .mount(&server)
            .await;

        let err = fetch_device_info(&http, &base, Some("AABBCCDDEEFF"))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::MacAddressMismatch { ref actual, .. } if actual == "C8F09E87B0F0"),
            "got {err:?}"
        );
    }

    #[tokio::test]
    async fn fetch_surfaces_http_errors() {
        let (server, http, base) = setup().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let err = fetch_device_info(&http, &base, None).await.unwrap_err();
        assert!(matches!(err, Error::Http(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn fetch_keeps_body_on_bad_json() {
        let (server, http, base) = setup().await;
        Mock::given(method("GET"))
            .and(path("/shelly"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let err = fetch_device_info(&http, &base, None).await.unwrap_err();
        assert!(matches!(err, Error::Deserialization { ref body, .. } if body == "<html>"));
    }

    #[test]
    fn gen1_device_has_no_auth_flag() {
        let info: DeviceInfo = serde_json::from_value(json!({
            "id": "shelly1-abc",
            "mac": "AABBCCDDEEFF"
        }))
        .unwrap();
        assert!(matches!(info.requires_auth(), Err(Error::UnsupportedDevice { .. })));
        assert_eq!(info.firmware_date(), None);
    }

    #[test]
    fn realm_falls_back_to_id() {
        let info: DeviceInfo = serde_json::from_value(json!({
            "id": "shellyplus1-abc",
            "mac": "AABBCCDDEEFF",
            "auth_en": false
        }))
        .unwrap();
        assert_eq!(info.realm(), "shellyplus1-abc");
        assert!(!info.requires_auth().unwrap());
    }
}
