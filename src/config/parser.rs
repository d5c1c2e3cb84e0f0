//! `cookied.conf` configuration file parser
//!
//! Parses an INI-style `[daemon]` section, in the same spirit as this
//! codebase's WireGuard-style `.conf` handling: flat `key = value` pairs,
//! case-insensitive keys, `#` comments, unknown keys ignored for forward
//! compatibility.

use std::net::Ipv6Addr;
use std::path::Path;

use crate::error::ConfigError;
use crate::shim::TimerConstants;

/// Complete daemon configuration (spec §6 tunables + SPEC_FULL ambient
/// knobs for shared-region placement and local policy).
#[derive(Debug, Clone)]
pub struct CookieGuardConfig {
    /// Local address to bind the ICMPv6 control-channel socket to, and
    /// the source address used in outbound control-message checksums
    /// (spec §6's "surrounding ICMP family's rules").
    pub local_address: Ipv6Addr,
    /// Path to the `memmap2`-backed shared state file.
    pub shared_region_path: String,
    /// Bounded cookie cache capacity (spec §4.5).
    pub cache_capacity: usize,
    /// Secret-rotation period in seconds (spec §3's `rotate_at` policy).
    pub rotation_period_secs: u64,
    /// Timer constants from spec §6/§9 (`T_RECOVER`, `FALLBACK_LT2`, `TRY_LT2`).
    pub timers: TimerConstants,
    /// `H`: the host's advertised refresh exponent sent back in a
    /// corrective SET-COOKIE (spec §4.3).
    pub refresh_exponent: u8,
    /// Whether a newly-seen peer starts out seeking a cookie, or with
    /// cookies disabled (spec §4.4 cold-create sub-cases).
    pub cookies_active_default: bool,
    /// Whether a datagram delivered without a cookie is accepted
    /// (spec §9 Open Question — host policy).
    pub accept_uncookied: bool,
}

impl Default for CookieGuardConfig {
    fn default() -> Self {
        Self {
            local_address: Ipv6Addr::UNSPECIFIED,
            shared_region_path: "/var/run/cookieguard.region".to_string(),
            cache_capacity: 4096,
            rotation_period_secs: 120,
            timers: TimerConstants::default(),
            refresh_exponent: 4,
            cookies_active_default: true,
            accept_uncookied: true,
        }
    }
}

impl CookieGuardConfig {
    /// Parse a configuration from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound {
                    path: path.display().to_string(),
                }
            } else {
                ConfigError::Io(e)
            }
        })?;
        Self::parse(&content)
    }

    /// Parse a configuration from a string, starting from [`Default`] and
    /// overriding whatever the `[daemon]` section specifies.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let mut in_daemon_section = false;
        let mut saw_section = false;

        for (line_num, line) in content.lines().enumerate() {
            let line_num = line_num + 1; // 1-indexed
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line.eq_ignore_ascii_case("[daemon]") {
                in_daemon_section = true;
                saw_section = true;
                continue;
            }
            if line.starts_with('[') {
                in_daemon_section = false;
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::ParseError {
                    line: line_num,
                    message: format!("Expected 'key = value', got: {}", line),
                });
            };
            if !in_daemon_section {
                continue;
            }

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "local_address" => config.local_address = parse_field(line_num, &key, value)?,
                "shared_region_path" => config.shared_region_path = value.to_string(),
                "cache_capacity" => {
                    config.cache_capacity = parse_field(line_num, &key, value)?;
                }
                "rotation_period_secs" => {
                    config.rotation_period_secs = parse_field(line_num, &key, value)?;
                }
                "t_recover" => config.timers.t_recover = parse_field(line_num, &key, value)?,
                "fallback_lt2" => config.timers.fallback_lt2 = parse_field(line_num, &key, value)?,
                "try_lt2" => config.timers.try_lt2 = parse_field(line_num, &key, value)?,
                "refresh_exponent" => config.refresh_exponent = parse_field(line_num, &key, value)?,
                "cookies_active_default" => config.cookies_active_default = parse_bool(line_num, &key, value)?,
                "accept_uncookied" => config.accept_uncookied = parse_bool(line_num, &key, value)?,
                _ => {
                    // Unknown key, ignore (forward compatibility).
                    tracing::debug!("Unknown daemon config key: {}", key);
                }
            }
        }

        if !saw_section {
            return Err(ConfigError::MissingField {
                field: "[daemon] section".to_string(),
            });
        }

        Ok(config)
    }
}

fn parse_field<T: std::str::FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::ParseError {
        line,
        message: format!("Invalid value for {}: {}", key, value),
    })
}

fn parse_bool(line: usize, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            field: format!("{} (line {})", key, line),
            value: value.to_string(),
        }),
    }
}
