//! Default locations for the daemon's socket, database and config file
//!
//! Each location has a `TOLLGATE_*` override. Without one, the XDG base
//! directory variables are used, then `$HOME`, then a fixed fallback.

use std::ffi::OsString;
use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const TOLLGATE_SOCKET_ENV: &str = "TOLLGATE_SOCKET";

/// Environment variable for overriding the data directory
pub const TOLLGATE_DATA_DIR_ENV: &str = "TOLLGATE_DATA_DIR";

/// Environment variable for overriding the config file
pub const TOLLGATE_CONFIG_ENV: &str = "TOLLGATE_CONFIG";

const DAEMON_DIR: &str = "tollgated";
const CONFIG_DIR: &str = "tollgate";
const SOCKET_FILENAME: &str = "tollgated.sock";
const CONFIG_FILENAME: &str = "config.toml";

/// Socket path: `$TOLLGATE_SOCKET`, `$XDG_RUNTIME_DIR/tollgated/tollgated.sock`,
/// or `/tmp/tollgated-$USER/tollgated.sock`
pub fn default_socket_path() -> PathBuf {
    socket_path_from(|name| std::env::var_os(name))
}

/// Data directory holding the SQLite database: `$TOLLGATE_DATA_DIR`,
/// `$XDG_DATA_HOME/tollgated`, `~/.local/share/tollgated`, or `/tmp/tollgated/data`
pub fn default_data_dir() -> PathBuf {
    data_dir_from(|name| std::env::var_os(name))
}

/// Config file: `$TOLLGATE_CONFIG`, `$XDG_CONFIG_HOME/tollgate/config.toml`,
/// `~/.config/tollgate/config.toml`, or `/etc/tollgate/config.toml`
pub fn default_config_path() -> PathBuf {
    config_path_from(|name| std::env::var_os(name))
}

type EnvLookup = fn(&str) -> Option<OsString>;

fn var(env: EnvLookup, name: &str) -> Option<PathBuf> {
    env(name).filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// An XDG base directory, or its conventional spot under `$HOME`
fn base_dir(env: EnvLookup, xdg_var: &str, under_home: &[&str]) -> Option<PathBuf> {
    var(env, xdg_var).or_else(|| {
        let mut dir = var(env, "HOME")?;
        dir.extend(under_home);
        Some(dir)
    })
}

fn socket_path_from(env: EnvLookup) -> PathBuf {
    if let Some(path) = var(env, TOLLGATE_SOCKET_ENV) {
        return path;
    }

    match var(env, "XDG_RUNTIME_DIR") {
        Some(runtime) => runtime.join(DAEMON_DIR).join(SOCKET_FILENAME),
        None => {
            let user = env("USER")
                .map(|u| u.to_string_lossy().into_owned())
                .unwrap_or_else(|| "unknown".to_string());
            PathBuf::from(format!("/tmp/{}-{}", DAEMON_DIR, user)).join(SOCKET_FILENAME)
        }
    }
}

fn data_dir_from(env: EnvLookup) -> PathBuf {
    var(env, TOLLGATE_DATA_DIR_ENV)
        .or_else(|| base_dir(env, "XDG_DATA_HOME", &[".local", "share"]).map(|d| d.join(DAEMON_DIR)))
        .unwrap_or_else(|| PathBuf::from("/tmp").join(DAEMON_DIR).join("data"))
}

fn config_path_from(env: EnvLookup) -> PathBuf {
    var(env, TOLLGATE_CONFIG_ENV).unwrap_or_else(|| {
        base_dir(env, "XDG_CONFIG_HOME", &[".config"])
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join(CONFIG_DIR)
            .join(CONFIG_FILENAME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty(_: &str) -> Option<OsString> {
        None
    }

    fn home_only(name: &str) -> Option<OsString> {
        (name == "HOME").then(|| "/home/ops".into())
    }

    fn xdg(name: &str) -> Option<OsString> {
        match name {
            "HOME" => Some("/home/ops".into()),
            "USER" => Some("ops".into()),
            "XDG_RUNTIME_DIR" => Some("/run/user/1000".into()),
            "XDG_DATA_HOME" => Some("/srv/data".into()),
            "XDG_CONFIG_HOME" => Some("/srv/config".into()),
            _ => None,
        }
    }

    fn overridden(name: &str) -> Option<OsString> {
        match name {
            TOLLGATE_SOCKET_ENV => Some("/run/tollgated.sock".into()),
            TOLLGATE_DATA_DIR_ENV => Some("/var/lib/tollgated".into()),
            TOLLGATE_CONFIG_ENV => Some("/etc/tollgated.toml".into()),
            "XDG_RUNTIME_DIR" => Some("/run/user/1000".into()),
            _ => None,
        }
    }

    #[test]
    fn overrides_win() {
        assert_eq!(socket_path_from(overridden), PathBuf::from("/run/tollgated.sock"));
        assert_eq!(data_dir_from(overridden), PathBuf::from("/var/lib/tollgated"));
        assert_eq!(config_path_from(overridden), PathBuf::from("/etc/tollgated.toml"));
    }

    #[test]
    fn xdg_directories() {
        assert_eq!(
            socket_path_from(xdg),
            PathBuf::from("/run/user/1000/tollgated/tollgated.sock")
        );
        assert_eq!(data_dir_from(xdg), PathBuf::from("/srv/data/tollgated"));
        assert_eq!(
            config_path_from(xdg),
            PathBuf::from("/srv/config/tollgate/config.toml")
        );
    }

    #[test]
    fn home_fallbacks() {
        assert_eq!(
            data_dir_from(home_only),
            PathBuf::from("/home/ops/.local/share/tollgated")
        );
        assert_eq!(
            config_path_from(home_only),
            PathBuf::from("/home/ops/.config/tollgate/config.toml")
        );
    }

    #[test]
    fn bare_environment() {
        assert_eq!(
            socket_path_from(empty),
            PathBuf::from("/tmp/tollgated-unknown/tollgated.sock")
        );
        assert_eq!(data_dir_from(empty), PathBuf::from("/tmp/tollgated/data"));
        assert_eq!(
            config_path_from(empty),
            PathBuf::from("/etc/tollgate/config.toml")
        );
    }
}
