use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tablegate_auth::OidcConfig;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub storage_backend: StorageBackend,
    pub db_url: Option<String>,
    pub storage_timeout_ms: u64,
    pub memory_throughput_limit: u32,
    pub memory_throughput_window_ms: u64,
    pub auth_mode: AuthMode,
    pub local_auth_shared_secret: Option<String>,
    pub oidc: Option<OidcConfig>,
    pub metrics_require_auth: bool,
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    Local,
    Oidc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for StartupError {}

impl GatewayConfig {
    pub fn load() -> Result<Self, StartupError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("TABLEGATE_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                let file_kv = parse_env_file(config_path)?;
                merged.extend(file_kv);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = parse_socket_addr(
            kv.get("TABLEGATE_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "TABLEGATE_BIND_ADDR",
        )?;

        let auth_mode = parse_auth_mode(kv.get("TABLEGATE_AUTH_MODE"))?;

        let dev_allow_nonlocal_bind =
            parse_bool(kv.get("TABLEGATE_DEV_ALLOW_NONLOCAL_BIND")).unwrap_or(false);

        if !bind_addr.ip().is_loopback() && auth_mode != AuthMode::Oidc {
            if dev_allow_nonlocal_bind && is_unspecified_ip(bind_addr.ip()) {
                // Dev-only escape hatch for local containers.
            } else {
                return Err(StartupError {
                    code: "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                    message: "non-local bind requires oidc auth mode; refuse startup".to_string(),
                });
            }
        }

        let storage_backend = parse_storage_backend(kv.get("TABLEGATE_STORAGE_BACKEND"))?;
        let db_url = match storage_backend {
            StorageBackend::Postgres => Some(require_nonempty(kv, "TABLEGATE_DB_URL")?),
            StorageBackend::Memory => optional_string(kv, "TABLEGATE_DB_URL"),
        };

        let storage_timeout_ms = parse_u64(
            kv.get("TABLEGATE_STORAGE_TIMEOUT_MS"),
            2000,
            "TABLEGATE_STORAGE_TIMEOUT_MS",
        )?;
        if storage_timeout_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TABLEGATE_STORAGE_TIMEOUT_MS must be >= 1".to_string(),
            });
        }

        let memory_throughput_limit = parse_u32(
            kv.get("TABLEGATE_MEMORY_THROUGHPUT_LIMIT"),
            0,
            "TABLEGATE_MEMORY_THROUGHPUT_LIMIT",
        )?;
        let memory_throughput_window_ms = parse_u64(
            kv.get("TABLEGATE_MEMORY_THROUGHPUT_WINDOW_MS"),
            1000,
            "TABLEGATE_MEMORY_THROUGHPUT_WINDOW_MS",
        )?;
        if memory_throughput_window_ms == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TABLEGATE_MEMORY_THROUGHPUT_WINDOW_MS must be >= 1".to_string(),
            });
        }

        let local_auth_shared_secret = optional_string(kv, "TABLEGATE_LOCAL_AUTH_SHARED_SECRET");

        let oidc = if auth_mode == AuthMode::Oidc {
            Some(parse_oidc_config(kv)?)
        } else {
            None
        };

        let metrics_require_auth =
            parse_bool(kv.get("TABLEGATE_METRICS_REQUIRE_AUTH")).unwrap_or(false);

        let max_body_bytes = parse_usize(
            kv.get("TABLEGATE_MAX_BODY_BYTES"),
            64 * 1024,
            "TABLEGATE_MAX_BODY_BYTES",
        )?;
        if max_body_bytes == 0 {
            return Err(StartupError {
                code: "ERR_INVALID_CONFIG",
                message: "TABLEGATE_MAX_BODY_BYTES must be >= 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            storage_backend,
            db_url,
            storage_timeout_ms,
            memory_throughput_limit,
            memory_throughput_window_ms,
            auth_mode,
            local_auth_shared_secret,
            oidc,
            metrics_require_auth,
            max_body_bytes,
        })
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| StartupError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| StartupError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_string(kv, key).ok_or_else(|| StartupError {
        code: "ERR_MISSING_CONFIG",
        message: format!("missing required config key {}", key),
    })
}

fn optional_string(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<SocketAddr>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be a valid host:port socket address", key),
        }),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<usize>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u64(value: Option<&String>, default: u64, key: &'static str) -> Result<u64, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u64>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_u32(value: Option<&String>, default: u32, key: &'static str) -> Result<u32, StartupError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v.trim().parse::<u32>().map_err(|_| StartupError {
            code: "ERR_INVALID_CONFIG",
            message: format!("{} must be an integer", key),
        }),
    }
}

fn parse_storage_backend(value: Option<&String>) -> Result<StorageBackend, StartupError> {
    let backend = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("memory");

    match backend {
        "memory" => Ok(StorageBackend::Memory),
        "postgres" => Ok(StorageBackend::Postgres),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "TABLEGATE_STORAGE_BACKEND must be memory or postgres".to_string(),
        }),
    }
}

fn parse_auth_mode(value: Option<&String>) -> Result<AuthMode, StartupError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("local");

    match mode {
        "local" => Ok(AuthMode::Local),
        "oidc" => Ok(AuthMode::Oidc),
        _ => Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "TABLEGATE_AUTH_MODE must be local or oidc".to_string(),
        }),
    }
}

fn parse_oidc_config(kv: &HashMap<String, String>) -> Result<OidcConfig, StartupError> {
    let issuer = require_nonempty(kv, "TABLEGATE_OIDC_ISSUER")?;

    let jwks_json = optional_string(kv, "TABLEGATE_OIDC_JWKS_JSON");
    let jwks_url = optional_string(kv, "TABLEGATE_OIDC_JWKS_URL");

    if jwks_json.is_none() && jwks_url.is_none() {
        return Err(StartupError {
            code: "ERR_INVALID_CONFIG",
            message: "oidc requires TABLEGATE_OIDC_JWKS_URL or TABLEGATE_OIDC_JWKS_JSON"
                .to_string(),
        });
    }

    let audience = optional_string(kv, "TABLEGATE_OIDC_AUDIENCE");

    let principal_id_claim = optional_string(kv, "TABLEGATE_OIDC_PRINCIPAL_ID_CLAIM")
        .unwrap_or_else(|| "sub".to_string());

    let jwks_timeout_ms = parse_u64(
        kv.get("TABLEGATE_OIDC_JWKS_TIMEOUT_MS"),
        2000,
        "TABLEGATE_OIDC_JWKS_TIMEOUT_MS",
    )?;
    let jwks_refresh_ttl_secs = parse_u64(
        kv.get("TABLEGATE_OIDC_JWKS_REFRESH_TTL_SECS"),
        300,
        "TABLEGATE_OIDC_JWKS_REFRESH_TTL_SECS",
    )?;
    let clock_skew_secs = parse_u64(
        kv.get("TABLEGATE_OIDC_CLOCK_SKEW_SECS"),
        60,
        "TABLEGATE_OIDC_CLOCK_SKEW_SECS",
    )?;

    Ok(OidcConfig {
        issuer,
        audience,
        jwks_url,
        jwks_json,
        jwks_timeout: Duration::from_millis(jwks_timeout_ms),
        jwks_refresh_ttl: Duration::from_secs(jwks_refresh_ttl_secs),
        clock_skew: Duration::from_secs(clock_skew_secs),
        principal_id_claim,
    })
}

fn parse_bool(value: Option<&String>) -> Option<bool> {
    let value = value.map(|v| v.trim()).filter(|v| !v.is_empty())?;

    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}

fn is_unspecified_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_unspecified(),
        IpAddr::V6(v6) => v6.is_unspecified(),
    }
}
