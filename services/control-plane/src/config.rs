//! Control plane configuration (env-driven).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use vitrine_namespace::TenantId;

use crate::db::DbConfig;

#[derive(Debug, Clone)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Tenant record database.
    pub database: DbConfig,

    /// Superuser connection used to create tenant roles and databases.
    /// Falls back to `database.database_url`.
    pub db_admin_url: Option<String>,

    /// Docker Engine API socket.
    pub docker_socket: PathBuf,

    pub tenancy: TenancyConfig,
    pub instances: InstanceConfig,
    pub probe: ProbeConfig,
    pub proxy: ProxyConfig,
    pub workers: WorkerConfig,

    /// Timeout applied to every orchestrator call and proxy exec.
    pub call_timeout: Duration,

    /// Registry entry time-to-live.
    pub registry_ttl: Duration,

    /// Global platform applications (not stored in the database).
    pub global_apps: Vec<GlobalApp>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            database: DbConfig::default(),
            db_admin_url: None,
            docker_socket: PathBuf::from("/var/run/docker.sock"),
            tenancy: TenancyConfig::default(),
            instances: InstanceConfig::default(),
            probe: ProbeConfig::default(),
            proxy: ProxyConfig::default(),
            workers: WorkerConfig::default(),
            call_timeout: Duration::from_secs(30),
            registry_ttl: crate::registry::DEFAULT_REGISTRY_TTL,
            global_apps: Vec::new(),
        }
    }
}

/// Per-tenant OS and storage settings.
#[derive(Debug, Clone)]
pub struct TenancyConfig {
    pub volume_root: PathBuf,
    pub volume_target: String,
    pub password_salt: String,
    /// Service-runtime user added to every tenant group (best-effort).
    pub runtime_user: Option<String>,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            volume_root: PathBuf::from("/srv/vitrine/tenants"),
            volume_target: "/data".to_string(),
            password_salt: "vitrine".to_string(),
            runtime_user: None,
        }
    }
}

/// Container service settings.
#[derive(Debug, Clone)]
pub struct InstanceConfig {
    /// Host the published ports are reachable on.
    pub host: String,
    /// Port the tenant process listens on inside its container.
    pub internal_port: u16,
    /// First port probed for new instances.
    pub port_range_start: u16,
    /// How long a reserved port stays leased before the instance is confirmed.
    pub port_lease_ttl: Duration,
    pub store_image: String,
    pub theme_image: String,
    /// Default environment given to every container.
    pub default_env: BTreeMap<String, String>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            internal_port: 3000,
            port_range_start: 20000,
            port_lease_ttl: Duration::from_secs(120),
            store_image: "vitrine/store:latest".to_string(),
            theme_image: "vitrine/theme:latest".to_string(),
            default_env: BTreeMap::new(),
        }
    }
}

/// Readiness probe settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub path: String,
    pub interval: Duration,
    pub max_attempts: u32,
    pub request_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: "/__env".to_string(),
            interval: Duration::from_secs(2),
            max_attempts: 15,
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// Reverse proxy settings.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Name of the proxy container to exec into.
    pub container: String,
    pub available_dir: PathBuf,
    pub enabled_dir: PathBuf,
    pub platform_domain: String,
    /// Cool-down window for coalescing reloads.
    pub reload_cooldown: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            container: "vitrine-proxy".to_string(),
            available_dir: PathBuf::from("/etc/nginx/sites-available"),
            enabled_dir: PathBuf::from("/etc/nginx/sites-enabled"),
            platform_domain: "vitrine.local".to_string(),
            reload_cooldown: Duration::from_secs(5),
        }
    }
}

/// Background worker settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Maximum tenants reconciled concurrently.
    pub max_concurrency: usize,
    /// Delay before the boot-time synchronization.
    pub boot_sync_delay: Duration,
    pub sync_interval: Duration,
    pub gc_interval: Duration,
    /// Entry names garbage collection never removes.
    pub gc_allow: Vec<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            boot_sync_delay: Duration::from_secs(10),
            sync_interval: vitrine_reconcile::DEFAULT_RECONCILE_INTERVAL,
            gc_interval: Duration::from_secs(3600),
            gc_allow: vec!["default".to_string(), "lost+found".to_string()],
        }
    }
}

/// A global platform application declared in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GlobalApp {
    pub id: TenantId,
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub domain_names: Vec<String>,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

fn default_replicas() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let log_level = env_or("VITRINE_LOG_LEVEL", "info");
        let database = DbConfig::from_env();
        let db_admin_url = std::env::var("VITRINE_DB_ADMIN_URL").ok();
        let docker_socket = PathBuf::from(env_or("VITRINE_DOCKER_SOCKET", "/var/run/docker.sock"));

        let tenancy_defaults = TenancyConfig::default();
        let tenancy = TenancyConfig {
            volume_root: std::env::var("VITRINE_VOLUME_ROOT")
                .map(PathBuf::from)
                .unwrap_or(tenancy_defaults.volume_root),
            volume_target: std::env::var("VITRINE_VOLUME_TARGET")
                .unwrap_or(tenancy_defaults.volume_target),
            password_salt: std::env::var("VITRINE_PASSWORD_SALT")
                .unwrap_or(tenancy_defaults.password_salt),
            runtime_user: std::env::var("VITRINE_RUNTIME_USER")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        };

        let platform_domain = env_or("VITRINE_PLATFORM_DOMAIN", "vitrine.local");

        let instance_defaults = InstanceConfig::default();
        let instances = InstanceConfig {
            host: std::env::var("VITRINE_INSTANCE_HOST").unwrap_or(instance_defaults.host),
            internal_port: env_parse("VITRINE_INTERNAL_PORT", instance_defaults.internal_port)?,
            port_range_start: env_parse(
                "VITRINE_PORT_RANGE_START",
                instance_defaults.port_range_start,
            )?,
            port_lease_ttl: Duration::from_secs(env_parse("VITRINE_PORT_LEASE_TTL_SECS", 120u64)?),
            store_image: std::env::var("VITRINE_STORE_IMAGE")
                .unwrap_or(instance_defaults.store_image),
            theme_image: std::env::var("VITRINE_THEME_IMAGE")
                .unwrap_or(instance_defaults.theme_image),
            default_env: container_defaults(&platform_domain)?,
        };

        let probe_defaults = ProbeConfig::default();
        let probe = ProbeConfig {
            path: std::env::var("VITRINE_PROBE_PATH").unwrap_or(probe_defaults.path),
            interval: Duration::from_millis(env_parse("VITRINE_PROBE_INTERVAL_MS", 2000u64)?),
            max_attempts: env_parse("VITRINE_PROBE_MAX_ATTEMPTS", probe_defaults.max_attempts)?
                .max(1),
            request_timeout: probe_defaults.request_timeout,
        };

        let proxy_defaults = ProxyConfig::default();
        let proxy = ProxyConfig {
            container: std::env::var("VITRINE_PROXY_CONTAINER").unwrap_or(proxy_defaults.container),
            available_dir: std::env::var("VITRINE_PROXY_AVAILABLE_DIR")
                .map(PathBuf::from)
                .unwrap_or(proxy_defaults.available_dir),
            enabled_dir: std::env::var("VITRINE_PROXY_ENABLED_DIR")
                .map(PathBuf::from)
                .unwrap_or(proxy_defaults.enabled_dir),
            platform_domain,
            reload_cooldown: Duration::from_millis(env_parse("VITRINE_RELOAD_COOLDOWN_MS", 5000u64)?),
        };

        let worker_defaults = WorkerConfig::default();
        let mut gc_allow = worker_defaults.gc_allow;
        if let Ok(raw) = std::env::var("VITRINE_GC_ALLOW") {
            gc_allow.extend(split_list(&raw));
        }
        let workers = WorkerConfig {
            max_concurrency: env_parse("VITRINE_MAX_CONCURRENCY", worker_defaults.max_concurrency)?
                .max(1),
            boot_sync_delay: Duration::from_secs(env_parse("VITRINE_BOOT_SYNC_DELAY_SECS", 10u64)?),
            sync_interval: Duration::from_secs(env_parse(
                "VITRINE_SYNC_INTERVAL_SECS",
                worker_defaults.sync_interval.as_secs(),
            )?),
            gc_interval: Duration::from_secs(env_parse("VITRINE_GC_INTERVAL_SECS", 3600u64)?),
            gc_allow,
        };

        let call_timeout = Duration::from_secs(env_parse("VITRINE_CALL_TIMEOUT_SECS", 30u64)?.max(1));
        let registry_ttl = Duration::from_secs(env_parse("VITRINE_REGISTRY_TTL_SECS", 3600u64)?);

        let global_apps = match std::env::var("VITRINE_GLOBAL_APPS") {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)
                .context("VITRINE_GLOBAL_APPS must be a JSON array of {id, name, image, ...}")?,
            _ => Vec::new(),
        };

        Ok(Self {
            log_level,
            database,
            db_admin_url,
            docker_socket,
            tenancy,
            instances,
            probe,
            proxy,
            workers,
            call_timeout,
            registry_ttl,
            global_apps,
        })
    }
}

/// Default container environment. Every value can be overridden per
/// deployment; `VITRINE_CONTAINER_ENV` adds arbitrary `KEY=VALUE` pairs.
fn container_defaults(platform_domain: &str) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    env.insert("TZ".to_string(), env_or("VITRINE_TIMEZONE", "UTC"));
    env.insert("LOG_LEVEL".to_string(), env_or("VITRINE_CONTAINER_LOG_LEVEL", "info"));
    env.insert("DB_HOST".to_string(), env_or("VITRINE_DB_HOST", "postgres"));
    env.insert("DB_PORT".to_string(), env_or("VITRINE_DB_PORT", "5432"));
    env.insert("PLATFORM_DOMAIN".to_string(), platform_domain.to_string());
    env.insert("TRUST_PROXY".to_string(), "1".to_string());
    env.insert("PROXY_FORWARDED_HEADER".to_string(), "X-Forwarded-For".to_string());

    if let Ok(raw) = std::env::var("VITRINE_CONTAINER_ENV") {
        for pair in split_list(&raw) {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("VITRINE_CONTAINER_ENV entry '{pair}' is not KEY=VALUE"))?;
            env.insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    Ok(env)
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    std::env::var(name)
        .ok()
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} has an invalid value"))
        .map(|v| v.unwrap_or(default))
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
