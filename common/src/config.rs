use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub port: u16,
    pub max_open_sockets: usize,
    pub lru_purge_enable: bool,
    pub stack_size: usize,
    pub request_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 80,
            max_open_sockets: 7,
            lru_purge_enable: true,
            stack_size: 10 * 1024,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssetConfig {
    pub mount_root: String,
    pub default_document: String,
    pub max_path_len: usize,
    pub chunk_size: usize,
    /// Exact asset paths (e.g. cache-busted bundle names) routed ahead of the
    /// wildcard fallback.
    #[serde(default)]
    pub legacy_assets: Vec<String>,
}

impl Default for AssetConfig {
    fn default() -> Self {
        Self {
            mount_root: "/spiffs".to_string(),
            default_document: "index.html".to_string(),
            max_path_len: 64,
            chunk_size: 1024,
            legacy_assets: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedConfig {
    pub num_leds: usize,
    pub frame_period_ms: u64,
    pub data_pin: i32,
    pub rmt_channel: u8,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            num_leds: 60,
            frame_period_ms: 16,
            data_pin: 8,
            rmt_channel: 0,
        }
    }
}

/// One hour; longer reconnect gaps are clamped.
pub const MAX_RECONNECT_DELAY_MS: u64 = 60 * 60 * 1_000;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
    pub jitter_percent: u8,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 250,
            max_delay_ms: 30_000,
            multiplier: 2,
            jitter_percent: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub assets: AssetConfig,
    #[serde(default)]
    pub leds: LedConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.server.sanitize();
        self.assets.sanitize();
        self.leds.sanitize();
        self.reconnect.sanitize();
    }
}

impl ServerConfig {
    pub fn sanitize(&mut self) {
        self.max_open_sockets = self.max_open_sockets.clamp(1, 16);
        self.stack_size = self.stack_size.max(4 * 1024);
        if self.request_timeout_ms == 0 {
            self.request_timeout_ms = ServerConfig::default().request_timeout_ms;
        }
    }
}

impl AssetConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.mount_root.trim_end_matches('/');
        self.mount_root = if trimmed.is_empty() {
            ".".to_string()
        } else {
            trimmed.to_string()
        };

        let document = self.default_document.trim_start_matches('/');
        self.default_document = if document.is_empty() {
            AssetConfig::default().default_document
        } else {
            document.to_string()
        };

        self.chunk_size = self.chunk_size.clamp(64, 16 * 1024);
        self.max_path_len = self.max_path_len.max(self.mount_root.len() + 2);

        self.legacy_assets.retain(|path| path.starts_with('/') && path.len() > 1);
        self.legacy_assets.dedup();
    }
}

impl LedConfig {
    pub fn sanitize(&mut self) {
        self.num_leds = self.num_leds.clamp(1, 1024);
        self.frame_period_ms = self.frame_period_ms.clamp(5, 1_000);

        if self.data_pin < 0 {
            self.data_pin = 8;
        }

        if self.rmt_channel > 7 {
            self.rmt_channel = 0;
        }
    }
}

impl ReconnectConfig {
    pub fn sanitize(&mut self) {
        self.initial_delay_ms = self.initial_delay_ms.max(10);
        self.initial_delay_ms = self.initial_delay_ms.min(MAX_RECONNECT_DELAY_MS);
        self.max_delay_ms = self
            .max_delay_ms
            .clamp(self.initial_delay_ms, MAX_RECONNECT_DELAY_MS);
        self.multiplier = self.multiplier.clamp(1, 10);
        self.jitter_percent = self.jitter_percent.min(100);
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let raw = r#"{"server":{"port":8080,"max_open_sockets":3,"lru_purge_enable":false,"stack_size":8192,"request_timeout_ms":500}}"#;
        let config: RuntimeConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.server.port, 8080);
        assert!(!config.server.lru_purge_enable);
        assert_eq!(config.assets, AssetConfig::default());
        assert_eq!(config.leds, LedConfig::default());
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = RuntimeConfig::default();
        config.server.max_open_sockets = 0;
        config.assets.mount_root = "/spiffs/".to_string();
        config.assets.default_document = "/".to_string();
        config.assets.chunk_size = 1;
        config.assets.legacy_assets = vec!["relative.js".to_string(), "/app-1a2b.js".to_string()];
        config.leds.num_leds = 0;
        config.leds.rmt_channel = 12;
        config.reconnect.max_delay_ms = 1;
        config.reconnect.jitter_percent = 250;

        config.sanitize();

        assert_eq!(config.server.max_open_sockets, 1);
        assert_eq!(config.assets.mount_root, "/spiffs");
        assert_eq!(config.assets.default_document, "index.html");
        assert_eq!(config.assets.chunk_size, 64);
        assert_eq!(config.assets.legacy_assets, vec!["/app-1a2b.js".to_string()]);
        assert_eq!(config.leds.num_leds, 1);
        assert_eq!(config.leds.rmt_channel, 0);
        assert_eq!(config.reconnect.max_delay_ms, config.reconnect.initial_delay_ms);
        assert_eq!(config.reconnect.jitter_percent, 100);
    }
}
