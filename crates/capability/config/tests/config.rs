use ems_config::{AppConfig, ConfigError};
use std::collections::HashMap;

fn base_vars() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        ("EMS_MODBUS_HOST", "192.168.1.50"),
        ("EMS_PROFILE_PATH", "/etc/ems/inverter_profiles.json"),
        ("EMS_INVERTER_MODEL", "H1_G2"),
        ("EMS_PVOUTPUT_API_KEY", " key-1 "),
        ("EMS_PVOUTPUT_SYSTEM_ID", "12345"),
    ])
}

fn load(vars: &HashMap<&'static str, &'static str>) -> Result<AppConfig, ConfigError> {
    AppConfig::from_lookup(|key| vars.get(key).map(|value| value.to_string()))
}

#[test]
fn load_config_defaults() {
    let config = load(&base_vars()).expect("config");
    assert_eq!(config.modbus_endpoint(), "192.168.1.50:502");
    assert_eq!(config.modbus_unit_id, 247);
    assert_eq!(config.modbus_probe_address, 31006);
    assert_eq!(config.upload_interval_minutes, 5);
    assert_eq!(config.upload_max_attempts, 3);
    assert_eq!(config.pvoutput_api_key, "key-1");
    assert_eq!(config.pvoutput_base_url, "https://pvoutput.org");
    assert!(config.send_to_pvoutput);
    assert!(!config.pvoutput_extended);
    assert!(config.rated_system_size_kw.is_none());
}

#[test]
fn upload_interval_out_of_range_is_rejected() {
    let mut vars = base_vars();
    vars.insert("EMS_UPLOAD_INTERVAL_MINUTES", "90");
    let err = load(&vars).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(key, _) if key == "EMS_UPLOAD_INTERVAL_MINUTES"));
}

#[test]
fn credentials_required_only_when_sending() {
    let mut vars = base_vars();
    vars.remove("EMS_PVOUTPUT_API_KEY");
    assert!(matches!(load(&vars), Err(ConfigError::Missing(key)) if key == "EMS_PVOUTPUT_API_KEY"));

    vars.insert("EMS_SEND_TO_PVOUTPUT", "false");
    assert!(load(&vars).is_ok());
}

#[test]
fn invalid_number_is_reported() {
    let mut vars = base_vars();
    vars.insert("EMS_MODBUS_PORT", "not-a-port");
    assert!(matches!(load(&vars), Err(ConfigError::Invalid(key, value))
        if key == "EMS_MODBUS_PORT" && value == "not-a-port"));
}

#[test]
fn load_config_from_env() {
    // Rust 2024 中 set_var 需要显式标注 unsafe（测试进程内可控）。
    unsafe {
        std::env::set_var("EMS_MODBUS_HOST", "10.0.0.8");
        std::env::set_var("EMS_PROFILE_PATH", "profiles.json");
        std::env::set_var("EMS_INVERTER_MODEL", "H3_PRO");
        std::env::set_var("EMS_SEND_TO_PVOUTPUT", "off");
        std::env::set_var("EMS_RATED_SYSTEM_SIZE_KW", "6.6");
    }

    let config = AppConfig::from_env().expect("config");
    assert_eq!(config.modbus_host, "10.0.0.8");
    assert_eq!(config.inverter_model, "H3_PRO");
    assert!(!config.send_to_pvoutput);
    assert_eq!(config.rated_system_size_kw, Some(6.6));
}
