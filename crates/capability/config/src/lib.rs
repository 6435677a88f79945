//! 应用运行配置加载。

use std::env;

/// 配置加载错误。
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required env: {0}")]
    Missing(String),
    #[error("invalid value for {0}: {1}")]
    Invalid(String, String),
}

/// 应用运行配置。
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub modbus_host: String,
    pub modbus_port: u16,
    pub modbus_unit_id: u8,
    pub modbus_connect_timeout_ms: u64,
    pub modbus_read_timeout_ms: u64,
    pub modbus_delay_on_connect_ms: u64,
    pub modbus_poll_delay_ms: u64,
    pub modbus_probe_address: u16,
    /// 固定调用约定（跳过探测），如 `slave_keyword`
    pub modbus_parameter_style: Option<String>,
    pub modbus_backoff_base_ms: u64,
    pub modbus_backoff_max_ms: u64,
    pub modbus_failed_polls_for_disconnect: u32,
    pub modbus_max_registers_per_read: u16,
    pub profile_path: String,
    pub inverter_model: String,
    pub poll_interval_seconds: u64,
    pub send_to_pvoutput: bool,
    pub pvoutput_api_key: String,
    pub pvoutput_system_id: String,
    pub pvoutput_base_url: String,
    pub pvoutput_extended: bool,
    pub upload_interval_minutes: u64,
    pub upload_max_attempts: u32,
    pub upload_backoff_ms: u64,
    pub upload_timeout_seconds: u64,
    pub rated_system_size_kw: Option<f64>,
}

impl AppConfig {
    /// 从环境变量读取配置。
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 从任意键值来源读取配置（环境变量或测试用映射）。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };
        let modbus_host = vars.required("EMS_MODBUS_HOST")?;
        let profile_path = vars.required("EMS_PROFILE_PATH")?;
        let inverter_model = vars.required("EMS_INVERTER_MODEL")?;
        let modbus_port = vars.parse_with_default("EMS_MODBUS_PORT", 502u16)?;
        let modbus_unit_id = vars.parse_with_default("EMS_MODBUS_UNIT_ID", 247u8)?;
        let modbus_connect_timeout_ms =
            vars.parse_with_default("EMS_MODBUS_CONNECT_TIMEOUT_MS", 5000u64)?;
        let modbus_read_timeout_ms = vars.parse_with_default("EMS_MODBUS_READ_TIMEOUT_MS", 3000u64)?;
        let modbus_delay_on_connect_ms =
            vars.parse_with_default("EMS_MODBUS_DELAY_ON_CONNECT_MS", 1000u64)?;
        let modbus_poll_delay_ms = vars.parse_with_default("EMS_MODBUS_POLL_DELAY_MS", 30u64)?;
        let modbus_probe_address = vars.parse_with_default("EMS_MODBUS_PROBE_ADDRESS", 31006u16)?;
        let modbus_parameter_style = vars.optional("EMS_MODBUS_PARAMETER_STYLE");
        let modbus_backoff_base_ms = vars.parse_with_default("EMS_MODBUS_BACKOFF_BASE_MS", 1000u64)?;
        let modbus_backoff_max_ms = vars.parse_with_default("EMS_MODBUS_BACKOFF_MAX_MS", 30_000u64)?;
        let modbus_failed_polls_for_disconnect =
            vars.parse_with_default("EMS_MODBUS_FAILED_POLLS_FOR_DISCONNECT", 5u32)?;
        let modbus_max_registers_per_read =
            vars.parse_with_default("EMS_MODBUS_MAX_REGISTERS_PER_READ", 125u16)?;
        let poll_interval_seconds = vars.parse_with_default("EMS_POLL_INTERVAL_SECONDS", 10u64)?;
        let send_to_pvoutput = vars.bool_with_default("EMS_SEND_TO_PVOUTPUT", true);
        let pvoutput_api_key = vars
            .optional("EMS_PVOUTPUT_API_KEY")
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let pvoutput_system_id = vars
            .optional("EMS_PVOUTPUT_SYSTEM_ID")
            .map(|value| value.trim().to_string())
            .unwrap_or_default();
        let pvoutput_base_url = vars
            .optional("EMS_PVOUTPUT_BASE_URL")
            .unwrap_or_else(|| "https://pvoutput.org".to_string());
        let pvoutput_extended = vars.bool_with_default("EMS_PVOUTPUT_EXTENDED", false);
        let upload_interval_minutes = vars.parse_with_default("EMS_UPLOAD_INTERVAL_MINUTES", 5u64)?;
        let upload_max_attempts = vars.parse_with_default("EMS_UPLOAD_MAX_ATTEMPTS", 3u32)?;
        let upload_backoff_ms = vars.parse_with_default("EMS_UPLOAD_BACKOFF_MS", 2000u64)?;
        let upload_timeout_seconds = vars.parse_with_default("EMS_UPLOAD_TIMEOUT_SECONDS", 10u64)?;
        let rated_system_size_kw = vars.parse_optional::<f64>("EMS_RATED_SYSTEM_SIZE_KW")?;

        let config = Self {
            modbus_host,
            modbus_port,
            modbus_unit_id,
            modbus_connect_timeout_ms,
            modbus_read_timeout_ms,
            modbus_delay_on_connect_ms,
            modbus_poll_delay_ms,
            modbus_probe_address,
            modbus_parameter_style,
            modbus_backoff_base_ms,
            modbus_backoff_max_ms,
            modbus_failed_polls_for_disconnect,
            modbus_max_registers_per_read,
            profile_path,
            inverter_model,
            poll_interval_seconds,
            send_to_pvoutput,
            pvoutput_api_key,
            pvoutput_system_id,
            pvoutput_base_url,
            pvoutput_extended,
            upload_interval_minutes,
            upload_max_attempts,
            upload_backoff_ms,
            upload_timeout_seconds,
            rated_system_size_kw,
        };
        config.validate()?;
        Ok(config)
    }

    /// 校验取值范围与字段间约束。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=60).contains(&self.upload_interval_minutes) {
            return Err(invalid(
                "EMS_UPLOAD_INTERVAL_MINUTES",
                self.upload_interval_minutes,
            ));
        }
        if self.poll_interval_seconds == 0 {
            return Err(invalid("EMS_POLL_INTERVAL_SECONDS", self.poll_interval_seconds));
        }
        if self.upload_max_attempts == 0 {
            return Err(invalid("EMS_UPLOAD_MAX_ATTEMPTS", self.upload_max_attempts));
        }
        if !(1..=125).contains(&self.modbus_max_registers_per_read) {
            return Err(invalid(
                "EMS_MODBUS_MAX_REGISTERS_PER_READ",
                self.modbus_max_registers_per_read,
            ));
        }
        if self.modbus_backoff_max_ms < self.modbus_backoff_base_ms {
            return Err(invalid("EMS_MODBUS_BACKOFF_MAX_MS", self.modbus_backoff_max_ms));
        }
        if let Some(size) = self.rated_system_size_kw {
            if !size.is_finite() || size <= 0.0 {
                return Err(invalid("EMS_RATED_SYSTEM_SIZE_KW", size));
            }
        }
        if self.send_to_pvoutput {
            if self.pvoutput_api_key.is_empty() {
                return Err(ConfigError::Missing("EMS_PVOUTPUT_API_KEY".to_string()));
            }
            if self.pvoutput_system_id.is_empty() {
                return Err(ConfigError::Missing("EMS_PVOUTPUT_SYSTEM_ID".to_string()));
            }
        }
        Ok(())
    }

    /// Modbus 端点（host:port）。
    pub fn modbus_endpoint(&self) -> String {
        format!("{}:{}", self.modbus_host, self.modbus_port)
    }
}

fn invalid(key: &str, value: impl ToString) -> ConfigError {
    ConfigError::Invalid(key.to_string(), value.to_string())
}

struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.optional(key)
            .ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    fn optional(&self, key: &str) -> Option<String> {
        match (self.lookup)(key) {
            Some(value) if !value.is_empty() => Some(value),
            _ => None,
        }
    }

    fn parse_with_default<T: std::str::FromStr>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        Ok(self.parse_optional(key)?.unwrap_or(default))
    }

    fn parse_optional<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.optional(key) {
            Some(value) => value
                .trim()
                .parse::<T>()
                .map(Some)
                .map_err(|_| ConfigError::Invalid(key.to_string(), value)),
            None => Ok(None),
        }
    }

    fn bool_with_default(&self, key: &str, default: bool) -> bool {
        match self.optional(key) {
            Some(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "on"),
            None => default,
        }
    }
}
