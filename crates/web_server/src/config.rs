use std::time::Duration;

use anyhow::{Context, Result};
use availability_publisher::PublisherConfig;
use booking_coordinator::BookingConfig;
use chrono::Weekday;
use verification_pipeline::VerificationConfig;

/// Server settings read from the environment
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address (default: 0.0.0.0:8080)
    pub bind_addr: String,

    /// PostgreSQL URL. The in-memory store is used when unset.
    pub database_url: Option<String>,

    /// Lifetime of an unconfirmed hold (default: 15 minutes)
    pub hold_ttl: Duration,

    /// Period of the hold reaper (default: 30 seconds)
    pub reaper_interval: Duration,

    /// Weekdays that can be booked (default: every day)
    pub working_days: Vec<Weekday>,

    /// Availability update coalescing window (default: 150 ms)
    pub coalesce_window: Duration,

    /// Base URL of the OCR service
    pub ocr_service_url: Option<String>,

    /// Base URL of the face match service
    pub face_service_url: Option<String>,

    /// Bearer token sent to both verification services
    pub verification_api_key: Option<String>,

    /// Bound on a single verification service call (default: 10 seconds)
    pub provider_timeout: Duration,

    /// Bearer token the payment provider presents when confirming a payment.
    /// Confirmations are refused when unset.
    pub payment_webhook_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let booking = BookingConfig::default();
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            database_url: None,
            hold_ttl: booking.hold_ttl,
            reaper_interval: booking.reaper_interval,
            working_days: booking.working_days,
            coalesce_window: PublisherConfig::default().coalesce_window,
            ocr_service_url: None,
            face_service_url: None,
            verification_api_key: None,
            provider_timeout: VerificationConfig::default().provider_timeout,
            payment_webhook_secret: None,
        }
    }
}

impl ServerConfig {
    /// Reads the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup`; unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(bind_addr) = read("BIND_ADDR") {
            config.bind_addr = bind_addr;
        }
        config.database_url = read("DATABASE_URL");
        config.ocr_service_url = read("OCR_SERVICE_URL");
        config.face_service_url = read("FACE_MATCH_SERVICE_URL");
        config.verification_api_key = read("VERIFICATION_API_KEY");
        config.payment_webhook_secret = read("PAYMENT_WEBHOOK_SECRET");

        if let Some(secs) = read("HOLD_TTL_SECS") {
            config.hold_ttl = Duration::from_secs(parse_number("HOLD_TTL_SECS", &secs)?);
        }
        if let Some(secs) = read("REAPER_INTERVAL_SECS") {
            let secs = parse_number("REAPER_INTERVAL_SECS", &secs)?;
            anyhow::ensure!(secs > 0, "REAPER_INTERVAL_SECS must be positive");
            config.reaper_interval = Duration::from_secs(secs);
        }
        if let Some(days) = read("WORKING_DAYS") {
            config.working_days = parse_weekdays(&days)?;
        }
        if let Some(ms) = read("COALESCE_WINDOW_MS") {
            config.coalesce_window = Duration::from_millis(parse_number("COALESCE_WINDOW_MS", &ms)?);
        }
        if let Some(secs) = read("PROVIDER_TIMEOUT_SECS") {
            config.provider_timeout =
                Duration::from_secs(parse_number("PROVIDER_TIMEOUT_SECS", &secs)?);
        }

        Ok(config)
    }

    /// Booking settings with this config's hold timing
    pub fn booking_config(&self) -> BookingConfig {
        BookingConfig {
            hold_ttl: self.hold_ttl,
            reaper_interval: self.reaper_interval,
            working_days: self.working_days.clone(),
            ..BookingConfig::default()
        }
    }

    /// Publisher settings with this config's coalescing window
    pub fn publisher_config(&self) -> PublisherConfig {
        PublisherConfig {
            coalesce_window: self.coalesce_window,
            ..PublisherConfig::default()
        }
    }

    /// Verification settings with this config's provider timeout
    pub fn verification_config(&self) -> VerificationConfig {
        VerificationConfig {
            provider_timeout: self.provider_timeout,
            ..VerificationConfig::default()
        }
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .with_context(|| format!("{} must be a whole number, got '{}'", key, value))
}

/// Comma-separated weekdays, e.g. `mon,tue,wed`
fn parse_weekdays(value: &str) -> Result<Vec<Weekday>> {
    let days = value
        .split(',')
        .map(str::trim)
        .filter(|day| !day.is_empty())
        .map(|day| {
            day.parse::<Weekday>()
                .map_err(|_| anyhow::anyhow!("WORKING_DAYS has an unknown weekday '{}'", day))
        })
        .collect::<Result<Vec<_>>>()?;
    anyhow::ensure!(!days.is_empty(), "WORKING_DAYS must name at least one weekday");
    Ok(days)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert!(config.database_url.is_none());
        assert_eq!(config.hold_ttl, Duration::from_secs(900));
        assert_eq!(config.reaper_interval, Duration::from_secs(30));
        assert_eq!(config.coalesce_window, Duration::from_millis(150));
        assert_eq!(config.working_days.len(), 7);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("BIND_ADDR", "127.0.0.1:9000"),
            ("DATABASE_URL", "postgres://localhost/bookings"),
            ("HOLD_TTL_SECS", "120"),
            ("REAPER_INTERVAL_SECS", "5"),
            ("COALESCE_WINDOW_MS", "0"),
            ("OCR_SERVICE_URL", "http://ocr.internal"),
            ("PAYMENT_WEBHOOK_SECRET", "whsec_1"),
            ("WORKING_DAYS", "mon, tue,Saturday"),
        ]))
        .unwrap();

        assert_eq!(config.bind_addr, "127.0.0.1:9000");
        assert_eq!(
            config.database_url.as_deref(),
            Some("postgres://localhost/bookings")
        );
        assert_eq!(config.ocr_service_url.as_deref(), Some("http://ocr.internal"));
        assert!(config.face_service_url.is_none());
        assert_eq!(config.payment_webhook_secret.as_deref(), Some("whsec_1"));

        let booking = config.booking_config();
        assert_eq!(booking.hold_ttl, Duration::from_secs(120));
        assert_eq!(booking.reaper_interval, Duration::from_secs(5));
        assert_eq!(booking.minimum_notice_hours, 24);
        assert_eq!(
            booking.working_days,
            vec![Weekday::Mon, Weekday::Tue, Weekday::Sat]
        );
        assert_eq!(config.publisher_config().coalesce_window, Duration::ZERO);
    }

    #[test]
    fn test_blank_values_are_ignored() {
        let config =
            ServerConfig::from_lookup(lookup(&[("DATABASE_URL", "  "), ("BIND_ADDR", "")])).unwrap();

        assert!(config.database_url.is_none());
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn test_rejects_bad_numbers() {
        let err = ServerConfig::from_lookup(lookup(&[("HOLD_TTL_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("HOLD_TTL_SECS"));

        assert!(ServerConfig::from_lookup(lookup(&[("REAPER_INTERVAL_SECS", "0")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("WORKING_DAYS", "mon,someday")])).is_err());
        assert!(ServerConfig::from_lookup(lookup(&[("WORKING_DAYS", ",")])).is_err());
    }
}
