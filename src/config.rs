//! Environment configuration.
//!
//! All knobs come from the environment so the hub can run unmodified under
//! the deployment's process supervisor. `SSH_*` names are kept even though
//! the listener itself speaks plain TCP: the SSH terminator in front of the
//! hub shares the same deployment config.

use std::env;
use std::path::PathBuf;

/// How the hub finds its modem line(s).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceConfig {
    /// One fixed character device (`DEVICE_PATH`).
    Single(PathBuf),
    /// A numbered family `{prefix}{0..count}` (`MODEM_DEVICE_PREFIX` + `MODEM_COUNT`).
    Pool { prefix: String, count: usize },
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub ssh_address: String,
    pub ssh_port: u16,
    pub device: DeviceConfig,
    pub sites_path: PathBuf,
    pub user_data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub host_key_dir: PathBuf,
    pub dial_prefix: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let device = match (env::var("MODEM_DEVICE_PREFIX"), env::var("MODEM_COUNT")) {
            (Ok(prefix), Ok(count)) if !prefix.is_empty() => {
                let count = count.parse().unwrap_or(1);
                DeviceConfig::Pool { prefix, count }
            }
            _ => DeviceConfig::Single(PathBuf::from(env_str("DEVICE_PATH", "/dev/ttySL0"))),
        };

        Self {
            ssh_address: env_str("SSH_ADDRESS", ""),
            ssh_port: env_parse("SSH_PORT", 2222),
            device,
            sites_path: PathBuf::from(env_str("SITES_PATH", "/etc/oob-sites.conf")),
            user_data_dir: PathBuf::from(env_str("USER_DATA_DIR", "/data/users")),
            log_dir: PathBuf::from(env_str("LOG_DIR", "/var/log/oob-sessions")),
            host_key_dir: PathBuf::from(env_str("HOST_KEY_DIR", "/data/users/ssh_host_keys")),
            dial_prefix: env_str("MODEM_DIAL_PREFIX", "ATDT"),
        }
    }

    /// Address:port the listener binds. An empty `SSH_ADDRESS` means all
    /// interfaces.
    pub fn bind_addr(&self) -> String {
        let address = if self.ssh_address.is_empty() {
            "0.0.0.0"
        } else {
            &self.ssh_address
        };
        format!("{address}:{}", self.ssh_port)
    }
}

fn env_str(key: &str, fallback: &str) -> String {
    match env::var(key) {
        Ok(v) if !v.is_empty() => v,
        _ => fallback.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env mutation is process-global; serialize these tests.
    static ENV_GUARD: Mutex<()> = Mutex::new(());

    fn clear_env() {
        for key in [
            "SSH_ADDRESS",
            "SSH_PORT",
            "DEVICE_PATH",
            "MODEM_DEVICE_PREFIX",
            "MODEM_COUNT",
            "SITES_PATH",
            "USER_DATA_DIR",
            "LOG_DIR",
            "HOST_KEY_DIR",
            "MODEM_DIAL_PREFIX",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn defaults_apply_when_unset() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear_env();

        let cfg = AppConfig::from_env();
        assert_eq!(cfg.ssh_port, 2222);
        assert_eq!(cfg.ssh_address, "");
        assert_eq!(cfg.bind_addr(), "0.0.0.0:2222");
        assert_eq!(cfg.device, DeviceConfig::Single(PathBuf::from("/dev/ttySL0")));
        assert_eq!(cfg.dial_prefix, "ATDT");
    }

    #[test]
    fn pool_mode_selected_by_prefix_and_count() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear_env();
        env::set_var("MODEM_DEVICE_PREFIX", "/dev/ttyIAX");
        env::set_var("MODEM_COUNT", "4");

        let cfg = AppConfig::from_env();
        assert_eq!(
            cfg.device,
            DeviceConfig::Pool {
                prefix: "/dev/ttyIAX".into(),
                count: 4
            }
        );
        clear_env();
    }

    #[test]
    fn overrides_are_read() {
        let _guard = ENV_GUARD.lock().unwrap();
        clear_env();
        env::set_var("SSH_PORT", "2022");
        env::set_var("SSH_ADDRESS", "127.0.0.1");
        env::set_var("MODEM_DIAL_PREFIX", "ATD");

        let cfg = AppConfig::from_env();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:2022");
        assert_eq!(cfg.dial_prefix, "ATD");
        clear_env();
    }
}
