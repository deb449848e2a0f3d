//! Configuration loading.
//!
//! Every value is looked up in this order:
//!
//! | Source | Example |
//! |--------|---------|
//! | process environment (after `.env` is loaded) | `MOTO_POS_LOCAL_URL` |
//! | `local_settings` row in category `backend` | `local_url` |
//! | built-in default | `+07:00` for the UTC offset |
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `local_url` / `local_key` | the shop's own Supabase project |
//! | `local_connection` | same, as one base64/JSON connection string |
//! | `external_url` / `external_key` / `external_connection` | the external store (optional) |
//! | `default_branch` | branch used when none is selected |
//! | `utc_offset` | offset for "today" boundaries, `+07:00` or `7` |
//! | `data_dir` / `log_dir` | where `pos.db` and the log files live |

use chrono::FixedOffset;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::db::{self, DbState};
use crate::error::{PosError, PosResult};
use crate::reconcile::default_offset;
use crate::supabase::{decode_connection_string, normalize_base_url, Credentials};

pub const ENV_PREFIX: &str = "MOTO_POS_";
pub const SETTINGS_CATEGORY: &str = "backend";

const DEFAULT_DATA_DIR: &str = "data";

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub local: Credentials,
    pub external: Option<Credentials>,
    pub default_branch: Option<String>,
    pub utc_offset: FixedOffset,
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
}

/// Which backend a credential key belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendSide {
    Local,
    External,
}

impl BackendSide {
    fn prefix(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::External => "external",
        }
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{}", key.to_uppercase()))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Data directory from the environment alone, needed before the database
/// (and therefore `local_settings`) can be opened.
pub fn data_dir() -> PathBuf {
    dotenv::dotenv().ok();
    env_lookup("data_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
}

/// Load the configuration from `.env`, the environment and, when a database
/// is given, the `local_settings` table.
pub fn load(db: Option<&DbState>) -> PosResult<AppConfig> {
    match dotenv::dotenv() {
        Ok(path) => debug!("Loaded environment from {}", path.display()),
        Err(_) => debug!("No .env file found"),
    }

    let settings = |key: &str| -> Option<String> {
        let state = db?;
        let conn = state.conn.lock().ok()?;
        db::get_setting(&conn, SETTINGS_CATEGORY, key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };

    let config = resolve(|key| env_lookup(key).or_else(|| settings(key)))?;
    info!(
        local = %config.local.url,
        external = config.external.as_ref().map(|c| c.url.as_str()).unwrap_or("none"),
        branch = config.default_branch.as_deref().unwrap_or("unset"),
        utc_offset = %config.utc_offset,
        "Configuration loaded"
    );
    Ok(config)
}

/// Build the configuration from a single key lookup.
pub fn resolve(lookup: impl Fn(&str) -> Option<String>) -> PosResult<AppConfig> {
    let local = backend_credentials(&lookup, BackendSide::Local)?.ok_or_else(|| {
        PosError::config(format!(
            "Local backend is not configured (set {ENV_PREFIX}LOCAL_URL and {ENV_PREFIX}LOCAL_KEY)"
        ))
    })?;
    let external = backend_credentials(&lookup, BackendSide::External)?;

    let utc_offset = match lookup("utc_offset") {
        Some(raw) => parse_utc_offset(&raw)
            .ok_or_else(|| PosError::config(format!("Invalid UTC offset: {raw}")))?,
        None => default_offset(),
    };

    let data_dir = lookup("data_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let log_dir = lookup("log_dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"));

    Ok(AppConfig {
        local,
        external,
        default_branch: lookup("default_branch"),
        utc_offset,
        data_dir,
        log_dir,
    })
}

fn backend_credentials(
    lookup: &impl Fn(&str) -> Option<String>,
    side: BackendSide,
) -> PosResult<Option<Credentials>> {
    let prefix = side.prefix();
    if let Some(raw) = lookup(&format!("{prefix}_connection")) {
        return decode_connection_string(&raw).map(Some).ok_or_else(|| {
            PosError::config(format!("Invalid {prefix} connection string"))
        });
    }

    let url = lookup(&format!("{prefix}_url"));
    let key = lookup(&format!("{prefix}_key"));
    match (url, key) {
        (None, None) => Ok(None),
        // A full connection string pasted into the key field carries the URL too.
        (url, Some(key)) if decode_connection_string(&key).is_some() => {
            let mut creds = decode_connection_string(&key).ok_or_else(|| {
                PosError::config(format!("Invalid {prefix} connection string"))
            })?;
            if let Some(url) = url {
                creds.url = normalize_base_url(&url);
            }
            Ok(Some(creds))
        }
        (Some(url), Some(key)) => Ok(Some(Credentials {
            url: normalize_base_url(&url),
            key,
        })),
        (Some(_), None) => Err(PosError::config(format!(
            "{prefix}_url is set but {prefix}_key is missing"
        ))),
        (None, Some(_)) => Err(PosError::config(format!(
            "{prefix}_key is set but {prefix}_url is missing"
        ))),
    }
}

/// Persist credentials for one backend into `local_settings`.
pub fn save_backend(db: &DbState, side: BackendSide, credentials: &Credentials) -> PosResult<()> {
    let conn = db
        .conn
        .lock()
        .map_err(|e| PosError::Database(format!("connection lock poisoned: {e}")))?;
    let prefix = side.prefix();
    db::set_setting(&conn, SETTINGS_CATEGORY, &format!("{prefix}_url"), &credentials.url)?;
    db::set_setting(&conn, SETTINGS_CATEGORY, &format!("{prefix}_key"), &credentials.key)?;
    info!(backend = prefix, url = %credentials.url, "Backend credentials saved");
    Ok(())
}

/// Accepts `+07:00`, `-05:30`, `+7` or `7`.
pub fn parse_utc_offset(raw: &str) -> Option<FixedOffset> {
    let raw = raw.trim();
    let (sign, rest) = match raw.as_bytes().first()? {
        b'+' => (1, &raw[1..]),
        b'-' => (-1, &raw[1..]),
        _ => (1, raw),
    };
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
}
