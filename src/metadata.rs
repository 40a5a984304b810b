//! Identity and diagnostic metadata derived from an incoming connection
//! request.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::{header, HeaderMap};

pub const CLIENT_ID_PARAM: &str = "clientID";
pub const TIMESTAMP_PARAM: &str = "timestamp";
pub const TOKEN_PARAM: &str = "token";

/// Everything the relay knows about a connection attempt before upgrade.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    pub client_id: Option<String>,
    pub session_timestamp: Option<u64>,
    pub token: Option<String>,
    pub metadata: ConnectionMetadata,
}

impl ConnectRequest {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            client_id: Some(client_id.into()),
            ..Self::default()
        }
    }

    pub fn with_timestamp(mut self, session_timestamp: u64) -> Self {
        self.session_timestamp = Some(session_timestamp);
        self
    }

    pub fn from_parts(
        query: &HashMap<String, String>,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Self {
        let client_id = query
            .get(CLIENT_ID_PARAM)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        let session_timestamp = query
            .get(TIMESTAMP_PARAM)
            .and_then(|ts| ts.trim().parse::<u64>().ok());
        let token = bearer_token(headers).or_else(|| query.get(TOKEN_PARAM).cloned());

        Self {
            client_id,
            session_timestamp,
            token,
            metadata: ConnectionMetadata::from_headers(headers, peer),
        }
    }

    /// Session timestamp, defaulting to the current time in seconds.
    pub fn session_timestamp_or_now(&self) -> u64 {
        self.session_timestamp.unwrap_or_else(now_secs)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceClass {
    Desktop,
    Mobile,
    Tablet,
    Bot,
    #[default]
    Unknown,
}

impl fmt::Display for DeviceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceClass::Desktop => "desktop",
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Bot => "bot",
            DeviceClass::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Informational data carried on a connection. Routing never reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    pub os: &'static str,
    pub browser: &'static str,
    pub device: DeviceClass,
}

impl ConnectionMetadata {
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);
        let remote_addr = forwarded
            .or(real_ip)
            .or_else(|| peer.map(|addr| addr.ip().to_string()));

        let user_agent = headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let (os, browser, device) = match user_agent.as_deref() {
            Some(ua) => classify_user_agent(ua),
            None => ("unknown", "unknown", DeviceClass::Unknown),
        };

        Self {
            remote_addr,
            user_agent,
            os,
            browser,
            device,
        }
    }
}

impl fmt::Display for ConnectionMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}/{}/{}",
            self.remote_addr.as_deref().unwrap_or("-"),
            self.os,
            self.browser,
            self.device
        )
    }
}

/// Coarse `(os, browser, device)` guess from a User-Agent string.
pub fn classify_user_agent(ua: &str) -> (&'static str, &'static str, DeviceClass) {
    let lower = ua.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);

    let os = if has("windows") {
        "windows"
    } else if has("android") {
        "android"
    } else if has("iphone") || has("ipad") || has("ios") {
        "ios"
    } else if has("mac os") || has("macintosh") {
        "macos"
    } else if has("linux") {
        "linux"
    } else {
        "unknown"
    };

    // Order matters: Edge and Opera also advertise Chrome, Chrome advertises Safari.
    let browser = if has("edg/") {
        "edge"
    } else if has("opr/") || has("opera") {
        "opera"
    } else if has("firefox") {
        "firefox"
    } else if has("chrome") || has("crios") {
        "chrome"
    } else if has("safari") {
        "safari"
    } else if has("python") || has("go-http-client") || has("java") || has("okhttp") {
        "library"
    } else {
        "unknown"
    };

    let device = if has("bot") || has("spider") || has("crawler") {
        DeviceClass::Bot
    } else if has("ipad") || has("tablet") {
        DeviceClass::Tablet
    } else if has("mobile") || has("iphone") || has("android") {
        DeviceClass::Mobile
    } else if os != "unknown" {
        DeviceClass::Desktop
    } else {
        DeviceClass::Unknown
    };

    (os, browser, device)
}
