//! Configuration module for environment variable parsing.
//!
//! Reads the SMTP relay settings and the daemon's idle/shutdown policy from
//! environment variables, falling back to defaults for anything unset.

use std::env;
use std::time::Duration;

use tracing::warn;

/// Default idle window. Managed relays such as SES drop connections that sit
/// idle for 5 seconds, so the daemon closes first.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 4000;

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsMode {
    /// Implicit TLS from the first byte (SMTPS, usually port 465)
    Wrapper,
    /// Plaintext connect, STARTTLS required before auth
    StartTls,
    /// STARTTLS when the server offers it, plaintext otherwise
    Opportunistic,
    /// Plaintext only
    None,
}

impl TlsMode {
    /// Parse a mode name, case-insensitively.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "wrapper" | "tls" | "ssl" | "smtps" => Some(TlsMode::Wrapper),
            "starttls" | "required" => Some(TlsMode::StartTls),
            "opportunistic" => Some(TlsMode::Opportunistic),
            "none" | "plain" | "off" => Some(TlsMode::None),
            _ => None,
        }
    }

    /// Mode implied by the port when none is configured: implicit TLS on
    /// 465, STARTTLS-if-offered anywhere else.
    pub fn for_port(port: u16) -> Self {
        if port == 465 {
            TlsMode::Wrapper
        } else {
            TlsMode::Opportunistic
        }
    }
}

/// SMTP relay settings used to dial the transport session.
#[derive(Clone)]
pub struct SmtpConfig {
    /// Relay hostname
    pub host: String,

    /// Relay port
    pub port: u16,

    /// Username for AUTH; no authentication when unset
    pub user: Option<String>,

    /// Password for AUTH
    pub pass: Option<String>,

    /// Connection security
    pub tls: TlsMode,

    /// Name announced in EHLO
    pub helo_name: String,

    /// Network timeout for each SMTP command
    pub timeout: Duration,
}

impl SmtpConfig {
    /// Relay settings with the defaults for everything but host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            pass: None,
            tls: TlsMode::for_port(port),
            helo_name: "localhost".to_string(),
            timeout: Duration::from_secs(10),
        }
    }

    /// Set AUTH credentials.
    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.pass = Some(pass.into());
        self
    }

    /// Whether AUTH will be attempted.
    pub fn has_credentials(&self) -> bool {
        self.user.as_deref().is_some_and(|u| !u.is_empty())
    }
}

// Hand-written so the password never reaches a log line.
impl std::fmt::Debug for SmtpConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SmtpConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| "***"))
            .field("tls", &self.tls)
            .field("helo_name", &self.helo_name)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Daemon loop policy.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Inactivity after which an open session is closed
    pub idle_timeout: Duration,

    /// Close a still-open session when the queue is closed
    pub close_on_exit: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            close_on_exit: true,
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub smtp: SmtpConfig,
    pub daemon: DaemonConfig,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let port = parse_port("SMTP_PORT", 587);

        let tls = match env::var("SMTP_TLS") {
            Ok(raw) => TlsMode::parse(&raw).unwrap_or_else(|| {
                warn!(env_var = "SMTP_TLS", value = %raw, "Invalid TLS mode, using port default");
                TlsMode::for_port(port)
            }),
            Err(_) => TlsMode::for_port(port),
        };

        let smtp = SmtpConfig {
            host: env::var("SMTP_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port,
            user: non_empty("SMTP_USER"),
            pass: non_empty("SMTP_PASS"),
            tls,
            helo_name: env::var("SMTP_HELO_NAME").unwrap_or_else(|_| "localhost".to_string()),
            timeout: Duration::from_millis(parse_millis("SMTP_TIMEOUT_MS", 10_000)),
        };

        let daemon = DaemonConfig {
            idle_timeout: Duration::from_millis(parse_millis(
                "MAIL_IDLE_TIMEOUT_MS",
                DEFAULT_IDLE_TIMEOUT_MS,
            )),
            close_on_exit: parse_bool("MAIL_CLOSE_ON_EXIT", true),
        };

        Config { smtp, daemon }
    }
}

/// Read a variable, treating an empty value as unset.
fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a positive millisecond count.
fn parse_millis(name: &str, default: u64) -> u64 {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => ms,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid duration, using default");
            default
        }
    }
}

/// Parse a non-zero TCP port.
fn parse_port(name: &str, default: u16) -> u16 {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid port, using default");
            default
        }
    }
}

/// Parse a boolean flag like "true", "0" or "off".
fn parse_bool(name: &str, default: bool) -> bool {
    let raw = match env::var(name) {
        Ok(v) => v,
        Err(_) => return default,
    };

    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" => false,
        _ => {
            warn!(env_var = name, value = %raw, "Invalid boolean, using default");
            default
        }
    }
}
