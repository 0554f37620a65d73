use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Require HTTP Basic auth for pushes
    #[serde(default = "default_enable_auth")]
    pub enable_auth: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// LMDB map size; the store can never grow past it
    #[serde(default = "default_map_size_gb")]
    pub map_size_gb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Objects at least this large are streamed instead of loaded into memory
    #[serde(default = "default_big_file_threshold")]
    pub big_file_threshold: u64,
    /// Name of the repository holding the registry index
    #[serde(default = "default_index_repository")]
    pub index_repository: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Public URL of the registry; config.json is only written when set
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub allowed_registries: Vec<String>,
    /// Identity used for index commits
    #[serde(default = "default_system_name")]
    pub system_name: String,
    #[serde(default = "default_system_email")]
    pub system_email: String,
}

fn default_bind_address() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_enable_auth() -> bool {
    true
}

fn default_data_dir() -> String {
    get_cargit_dir()
        .join("data")
        .to_string_lossy()
        .to_string()
}

fn default_map_size_gb() -> u64 {
    10
}

fn default_big_file_threshold() -> u64 {
    cargit_git::odb::DEFAULT_BIG_FILE_THRESHOLD
}

fn default_index_repository() -> String {
    "index".to_string()
}

fn default_system_name() -> String {
    "Cargit System".to_string()
}

fn default_system_email() -> String {
    "cargit@localhost".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            enable_auth: default_enable_auth(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            map_size_gb: default_map_size_gb(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            big_file_threshold: default_big_file_threshold(),
            index_repository: default_index_repository(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: None,
            allowed_registries: Vec::new(),
            system_name: default_system_name(),
            system_email: default_system_email(),
        }
    }
}

impl StorageConfig {
    pub fn map_size_bytes(&self) -> usize {
        (self.map_size_gb as usize).saturating_mul(1024 * 1024 * 1024)
    }
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            let content = fs::read_to_string(&config_path)
                .context("Failed to read config file")?;
            toml::from_str(&content).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Save config to file
    pub fn save(&self) -> Result<()> {
        let config_path = get_config_path();

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&config_path, content)?;

        Ok(())
    }
}

/// Get the cargit directory (~/.cargit)
pub fn get_cargit_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cargit")
}

/// Get the config file path (~/.cargit/config.toml)
pub fn get_config_path() -> PathBuf {
    get_cargit_dir().join("config.toml")
}

/// Get the auth cookie path (~/.cargit/auth.cookie)
pub fn get_auth_cookie_path() -> PathBuf {
    get_cargit_dir().join("auth.cookie")
}

/// Generate and save auth cookie if it doesn't exist
pub fn ensure_auth_cookie() -> Result<(String, String)> {
    let cookie_path = get_auth_cookie_path();

    if cookie_path.exists() {
        read_auth_cookie()
    } else {
        generate_auth_cookie()
    }
}

/// Read existing auth cookie
pub fn read_auth_cookie() -> Result<(String, String)> {
    let cookie_path = get_auth_cookie_path();
    let content = fs::read_to_string(&cookie_path)
        .context("Failed to read auth cookie")?;

    let Some((username, password)) = content.trim().split_once(':') else {
        anyhow::bail!("Invalid auth cookie format");
    };

    Ok((username.to_string(), password.to_string()))
}

/// Generate new random auth cookie
pub fn generate_auth_cookie() -> Result<(String, String)> {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    let cookie_path = get_auth_cookie_path();

    if let Some(parent) = cookie_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut rng = rand::thread_rng();
    let username = format!("cargit_{}", rng.gen::<u32>());
    let password: String = (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();

    let content = format!("{}:{}", username, password);
    fs::write(&cookie_path, content)?;

    // Owner read/write only
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        fs::set_permissions(&cookie_path, perms)?;
    }

    Ok((username, password))
}
