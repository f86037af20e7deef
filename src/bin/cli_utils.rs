use anyhow::{Context, Result};
use ipatlas::{DataValue, Database, LoaderOptions, Registry};
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::LoadArgs;

/// Id the one-shot commands register their database under
pub const CLI_DATABASE_ID: &str = "cli";

/// Turn a relative path that exists into an absolute one; pass anything else through
pub fn origin_arg(database: &str) -> String {
    let path = Path::new(database);
    if path.is_relative() && path.exists() {
        if let Ok(absolute) = path.canonicalize() {
            return absolute.to_string_lossy().into_owned();
        }
    }
    database.to_string()
}

/// Loader options from the shared command line flags
pub fn loader_options(load: &LoadArgs) -> LoaderOptions {
    let mut options = LoaderOptions::new().with_watch_filesystem(false);
    if let Some(key) = &load.license_key {
        options = options.with_license_key(key.clone());
    }
    if let Some(dir) = &load.cache_dir {
        options = options.with_cache_dir(dir.clone());
    }
    if load.no_cache {
        options = options.without_cache();
    }
    options
}

/// Start a private registry for `database` and wait for its first snapshot
pub fn load_database(database: &str, load: &LoadArgs) -> Result<(Registry, Arc<Database>)> {
    let registry = Registry::new();
    registry
        .start(CLI_DATABASE_ID, &origin_arg(database), loader_options(load))
        .with_context(|| format!("Invalid database: {}", database))?;
    registry
        .wait_for_loaders([CLI_DATABASE_ID], Duration::from_secs(load.timeout))
        .with_context(|| format!("Failed to load database: {}", database))?;
    let snapshot = registry
        .database(CLI_DATABASE_ID)
        .with_context(|| format!("Failed to load database: {}", database))?;
    Ok((registry, snapshot))
}

/// Network address of `ip` under `prefix_len`, as CIDR text
pub fn format_cidr(ip: IpAddr, prefix_len: u8) -> String {
    match ip {
        IpAddr::V4(ipv4) => {
            let mask = u32::MAX.checked_shl(32 - u32::from(prefix_len.min(32))).unwrap_or(0);
            let network = std::net::Ipv4Addr::from(u32::from(ipv4) & mask);
            format!("{}/{}", network, prefix_len)
        }
        IpAddr::V6(ipv6) => {
            let mask = u128::MAX
                .checked_shl(128 - u32::from(prefix_len.min(128)))
                .unwrap_or(0);
            let network = std::net::Ipv6Addr::from(u128::from(ipv6) & mask);
            format!("{}/{}", network, prefix_len)
        }
    }
}

pub fn format_bytes(bytes: usize) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Seconds since the epoch, clamped at zero
pub fn unix_seconds(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub fn format_unix_timestamp(timestamp: u64) -> String {
    let days = timestamp / 86400;
    let remaining = timestamp % 86400;
    let hours = remaining / 3600;
    let minutes = (remaining % 3600) / 60;
    let seconds = remaining % 60;

    let (year, month, day) = days_to_ymd(days);
    format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02} UTC",
        year, month, day, hours, minutes, seconds
    )
}

// Convert days since Unix epoch to year/month/day
fn days_to_ymd(days: u64) -> (u64, u64, u64) {
    let mut year = 1970;
    let mut remaining_days = days;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let days_in_months = if is_leap_year(year) {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1;
    for days_in_month in days_in_months {
        if remaining_days < days_in_month {
            break;
        }
        remaining_days -= days_in_month;
        month += 1;
    }

    (year, month, remaining_days + 1)
}

fn is_leap_year(year: u64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

/// Typed value for a `key=value` field of the build input
///
/// `true`/`false` become booleans, non-negative integers `uint32` (or
/// `uint64` when larger), negative integers `int32`, decimals doubles;
/// everything else is a string.
pub fn parse_field_value(text: &str) -> DataValue {
    match text {
        "true" => return DataValue::Bool(true),
        "false" => return DataValue::Bool(false),
        _ => {}
    }
    if let Ok(n) = text.parse::<u32>() {
        return DataValue::Uint32(n);
    }
    if let Ok(n) = text.parse::<u64>() {
        return DataValue::Uint64(n);
    }
    if let Ok(n) = text.parse::<i32>() {
        return DataValue::Int32(n);
    }
    if text.contains('.') {
        if let Ok(f) = text.parse::<f64>() {
            return DataValue::Double(f);
        }
    }
    DataValue::string(text)
}
