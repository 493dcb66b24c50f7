// JSON payloads exchanged during the handshake: server INFO and client CONNECT.
use serde::{Deserialize, Serialize};

use crate::Result;

/// Fields the client consumes from the server's INFO line.
///
/// Unknown fields are ignored so newer servers stay compatible.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub tls_required: bool,
    #[serde(default)]
    pub max_payload: i64,
    #[serde(default)]
    pub proto: i32,
    #[serde(default)]
    pub nonce: String,
    #[serde(default)]
    pub connect_urls: Vec<String>,
    // Lame duck: the server will close connections gracefully soon.
    #[serde(default, rename = "ldm")]
    pub lame_duck_mode: bool,
    #[serde(default)]
    pub client_id: u64,
    #[serde(default)]
    pub client_ip: String,
    #[serde(default)]
    pub cluster: String,
    #[serde(default)]
    pub jetstream: bool,
}

impl ServerInfo {
    pub fn parse(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The CONNECT payload sent once after receiving INFO.
///
/// Credential fields are omitted from the JSON when unset.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ConnectInfo {
    pub verbose: bool,
    pub pedantic: bool,
    pub tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub lang: String,
    pub version: String,
    pub protocol: i32,
    pub headers: bool,
    pub echo: bool,
}

impl Default for ConnectInfo {
    fn default() -> Self {
        Self {
            verbose: false,
            pedantic: false,
            tls_required: false,
            auth_token: None,
            user: None,
            pass: None,
            name: None,
            lang: "rust".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: 1,
            headers: true,
            echo: true,
        }
    }
}

impl ConnectInfo {
    pub fn to_json(&self) -> String {
        // Serialization of a plain struct with string/bool fields cannot fail.
        serde_json::to_string(self).expect("serialize connect info")
    }
}
