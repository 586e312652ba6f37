use base64::Engine;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub metering: MeteringConfig,
    pub report: ReportConfig,
    pub network_server: NetworkServerConfig,
    pub mqtt: MqttConfig,
    pub downlink: DownlinkConfig,
    pub schedule: ScheduleConfig,
    pub http: HttpConfig,
    pub logging: LoggingConfig,
}

/// Metering backend (report source)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MeteringConfig {
    /// Base URL including the API prefix, e.g. `http://10.0.0.5/api/v1`
    pub base_url: String,
    pub login: String,
    pub password: String,
    /// Meter identifiers included in every report request
    pub meters: Vec<String>,
}

/// Report request constants and XLSX layout
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    pub report_type: String,
    pub time_type: String,
    pub record_id: String,
    /// Hour (UTC) stamped on the report window
    pub cutoff_hour: u32,
    /// Zero-based sheet row holding the column titles
    pub header_row: u32,
    pub id_column: String,
    pub reading_column: String,
    /// Where to keep a copy of the last fetched report, if anywhere
    pub dump_path: Option<String>,
}

/// LoRaWAN network server (device directory)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkServerConfig {
    /// Base URL including the API prefix, e.g. `http://10.0.0.6:8080/api`
    pub base_url: String,
    pub email: String,
    pub password: String,
    pub search_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DownlinkConfig {
    pub f_port: u8,
    /// Base64-encoded command bytes
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub cycle_interval_secs: u64,
    pub error_backoff_secs: u64,
    pub dispatch_interval_secs: u64,
    pub dispatch_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file: {}", e))?;
        Ok(config)
    }

    /// Override file values with process environment variables
    pub fn apply_env(&mut self) {
        self.apply_vars(|key| std::env::var(key).ok());
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(value) = var(key) {
                *target = value;
            }
        };

        set(&mut self.metering.base_url, "METERING_URL");
        set(&mut self.metering.login, "METERING_USER");
        set(&mut self.metering.password, "METERING_PASS");
        set(&mut self.network_server.base_url, "NETWORK_SERVER_URL");
        set(&mut self.network_server.email, "NETWORK_SERVER_USER");
        set(&mut self.network_server.password, "NETWORK_SERVER_PASS");
        set(&mut self.mqtt.host, "MQTT_HOST");
        set(&mut self.logging.level, "LOG_LEVEL");

        if let Some(meters) = var("METERING_METERS") {
            self.metering.meters = meters
                .split(',')
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(port) = var("MQTT_PORT").and_then(|p| p.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(user) = var("MQTT_USER").filter(|u| !u.is_empty()) {
            self.mqtt.username = Some(user);
        }
        if let Some(pass) = var("MQTT_PASS") {
            self.mqtt.password = Some(pass);
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let required = [
            ("metering.base_url", &self.metering.base_url),
            ("metering.login", &self.metering.login),
            ("metering.password", &self.metering.password),
            ("network_server.base_url", &self.network_server.base_url),
            ("network_server.email", &self.network_server.email),
            ("network_server.password", &self.network_server.password),
            ("mqtt.host", &self.mqtt.host),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                anyhow::bail!("{} is not configured", name);
            }
        }

        if self.metering.meters.is_empty() {
            anyhow::bail!("metering.meters must list at least one meter");
        }
        if self.report.cutoff_hour > 23 {
            anyhow::bail!(
                "report.cutoff_hour must be 0-23, got {}",
                self.report.cutoff_hour
            );
        }
        if self.schedule.dispatch_timeout_secs == 0 {
            anyhow::bail!("schedule.dispatch_timeout_secs must be positive");
        }
        self.downlink.payload_bytes()?;
        Ok(())
    }
}

impl DownlinkConfig {
    pub fn payload_bytes(&self) -> anyhow::Result<Vec<u8>> {
        base64::engine::general_purpose::STANDARD
            .decode(&self.data)
            .map_err(|e| anyhow::anyhow!("downlink.data is not valid base64: {}", e))
    }
}

impl ScheduleConfig {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            report_type: "electric".to_string(),
            time_type: "DAILY".to_string(),
            record_id: "DAILY_DATA_ARCHIVE".to_string(),
            cutoff_hour: 19,
            header_row: 3,
            id_column: "Номер прибора".to_string(),
            reading_column: "Показания".to_string(),
            dump_path: None,
        }
    }
}

impl Default for NetworkServerConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            email: String::new(),
            password: String::new(),
            search_limit: 10,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 1883,
            username: None,
            password: None,
            keep_alive_secs: 60,
        }
    }
}

impl Default for DownlinkConfig {
    fn default() -> Self {
        Self {
            f_port: 8,
            data: "AAEAAQABABLDAYEAKAACGQkA/wIBBgAAAAE=".to_string(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            cycle_interval_secs: 3600,
            error_backoff_secs: 300,
            dispatch_interval_secs: 5,
            dispatch_timeout_secs: 10,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { timeout_secs: 30 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
