// =============================================================================
// Engine Configuration — typed record assembled from environment variables
// =============================================================================
//
// Every knob the runtime reads lives here, grouped by component. The whole
// record is built once at startup; a malformed value is a fatal configuration
// error (the process exits with code 2). Values absent from the environment
// fall back to the defaults below.
// =============================================================================

use anyhow::{Context, Result};

// =============================================================================
// Env parse helpers
// =============================================================================

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .with_context(|| format!("{name} must be a number, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<f64>()
            .map(|v| v as u64)
            .with_context(|| format!("{name} must be an integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(raw) => !matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "0" | "false" | "no" | ""
        ),
        Err(_) => default,
    }
}

fn env_csv(name: &str, default: &str) -> Vec<String> {
    env_str(name, default)
        .split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

// =============================================================================
// Per-component sections
// =============================================================================

/// Control-plane settings (token source, approvers, bind address).
#[derive(Debug, Clone)]
pub struct OpsConfig {
    /// Shared secret; `OPS_API_TOKEN_FILE` takes precedence when set.
    pub token: Option<String>,
    pub token_file: Option<String>,
    /// Comma-separated approver secrets for two-man endpoints.
    pub approver_tokens: Vec<String>,
    pub bind_addr: String,
    /// Seconds an idempotency record is retained for replay.
    pub idempotency_retention_sec: f64,
}

/// Event-bus settings.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-subscriber queue bound; 0 means unbounded. When bounded and full,
    /// events to that subscriber are dropped (never block the publisher).
    pub queue_cap: usize,
}

/// Supervisor and watchdog settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Restart backoff sequence in milliseconds; holds at the last entry.
    pub backoff_ms: Vec<u64>,
    /// Per-task join grace on shutdown.
    pub task_grace_sec: u64,
    /// Global shutdown deadline.
    pub shutdown_grace_sec: u64,
    /// Watchdog self-kill threshold.
    pub watchdog_timeout_sec: u64,
}

/// WS stream supervisor settings.
#[derive(Debug, Clone)]
pub struct WsConfig {
    pub reconnect_backoff_ms: Vec<u64>,
    pub health_enabled: bool,
    pub disconnect_alert_sec: u64,
}

/// Bracket governor policy.
#[derive(Debug, Clone)]
pub struct BracketConfig {
    pub enabled: bool,
    pub tp_bps: f64,
    pub sl_bps: f64,
    pub allow_stop_amend: bool,
}

/// Depeg guard policy.
#[derive(Debug, Clone)]
pub struct DepegConfig {
    pub enabled: bool,
    pub threshold_pct: f64,
    pub confirm_windows: u32,
    pub cooldown_min: u64,
    pub exit_risk: bool,
    pub switch_quote: bool,
    pub watch_symbols: Vec<String>,
}

/// Fee-asset topup policy.
#[derive(Debug, Clone)]
pub struct FeeConfig {
    pub enabled: bool,
    pub topup_threshold_usd: f64,
    pub topup_amount_usd: f64,
    pub check_interval_sec: u64,
    pub min_topup_interval_sec: u64,
    pub fee_asset: String,
    pub fee_symbol: String,
}

/// Health notifier settings.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub tg_enabled: bool,
    pub debounce_sec: f64,
}

/// Digest job settings.
#[derive(Debug, Clone)]
pub struct DigestConfig {
    pub enabled: bool,
    pub interval_min: u64,
    pub include_symbols: bool,
    pub six_hour_enabled: bool,
    pub bucket_minutes: u64,
    pub max_buckets: usize,
}

/// Thresholds for the static gates of the guard chain.
#[derive(Debug, Clone)]
pub struct GuardConfig {
    pub max_spread_bps: f64,
    /// Default cooldown TTL applied on entry.
    pub cooldown_ttl_sec: f64,
    pub max_tick_to_order_ms: f64,
    pub min_notional_usd: f64,
    pub max_symbol_exposure_usd: f64,
    pub max_total_exposure_usd: f64,
}

/// Quarantine registry policy.
#[derive(Debug, Clone)]
pub struct QuarantineConfig {
    pub max_stops_in_window: usize,
    pub window_sec: f64,
    pub quarantine_sec: f64,
    pub path: String,
}

/// Notification sink settings.
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub token: Option<String>,
    pub chat_id: Option<String>,
}

/// Model promotion watcher settings.
#[derive(Debug, Clone)]
pub struct ModelWatchConfig {
    pub paths: Vec<String>,
    pub poll_interval_sec: f64,
}

/// Router settings shared by venue adapters.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub default_venue: String,
    pub request_timeout_sec: u64,
    pub api_key: String,
    pub api_secret: String,
}

// =============================================================================
// EngineConfig
// =============================================================================

/// Complete engine configuration, one section per subsystem.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub ops: OpsConfig,
    pub bus: BusConfig,
    pub supervisor: SupervisorConfig,
    pub ws: WsConfig,
    pub bracket: BracketConfig,
    pub depeg: DepegConfig,
    pub fees: FeeConfig,
    pub health: HealthConfig,
    pub digest: DigestConfig,
    pub guards: GuardConfig,
    pub quarantine: QuarantineConfig,
    pub telegram: TelegramConfig,
    pub model_watch: ModelWatchConfig,
    pub router: RouterConfig,
    pub training_cursor_path: String,
}

impl Default for EngineConfig {
    /// The same values `from_env` yields with an empty environment.
    fn default() -> Self {
        Self {
            ops: OpsConfig {
                token: None,
                token_file: None,
                approver_tokens: Vec::new(),
                bind_addr: "0.0.0.0:8002".into(),
                idempotency_retention_sec: 3600.0,
            },
            bus: BusConfig { queue_cap: 0 },
            supervisor: SupervisorConfig {
                backoff_ms: vec![500, 1000, 2000],
                task_grace_sec: 5,
                shutdown_grace_sec: 15,
                watchdog_timeout_sec: 30,
            },
            ws: WsConfig {
                reconnect_backoff_ms: vec![500, 1000, 2000],
                health_enabled: false,
                disconnect_alert_sec: 15,
            },
            bracket: BracketConfig {
                enabled: true,
                tp_bps: 20.0,
                sl_bps: 30.0,
                allow_stop_amend: false,
            },
            depeg: DepegConfig {
                enabled: false,
                threshold_pct: 0.5,
                confirm_windows: 3,
                cooldown_min: 120,
                exit_risk: false,
                switch_quote: false,
                watch_symbols: vec!["USDTUSDC".into(), "BTCUSDT".into(), "BTCUSDC".into()],
            },
            fees: FeeConfig {
                enabled: true,
                topup_threshold_usd: 10.0,
                topup_amount_usd: 50.0,
                check_interval_sec: 1800,
                min_topup_interval_sec: 3600,
                fee_asset: "BNB".into(),
                fee_symbol: "BNBUSDT".into(),
            },
            health: HealthConfig {
                tg_enabled: false,
                debounce_sec: 10.0,
            },
            digest: DigestConfig {
                enabled: false,
                interval_min: 1440,
                include_symbols: true,
                six_hour_enabled: false,
                bucket_minutes: 360,
                max_buckets: 4,
            },
            guards: GuardConfig {
                max_spread_bps: 25.0,
                cooldown_ttl_sec: 300.0,
                max_tick_to_order_ms: 1500.0,
                min_notional_usd: 10.0,
                max_symbol_exposure_usd: 50_000.0,
                max_total_exposure_usd: 250_000.0,
            },
            quarantine: QuarantineConfig {
                max_stops_in_window: 2,
                window_sec: 3600.0,
                quarantine_sec: 14_400.0,
                path: "state/quarantine.json".into(),
            },
            telegram: TelegramConfig {
                enabled: false,
                token: None,
                chat_id: None,
            },
            model_watch: ModelWatchConfig {
                paths: Vec::new(),
                poll_interval_sec: 5.0,
            },
            router: RouterConfig {
                default_venue: "BINANCE".into(),
                request_timeout_sec: 5,
                api_key: String::new(),
                api_secret: String::new(),
            },
            training_cursor_path: "ops/training_cursor.json".into(),
        }
    }
}

fn parse_backoff(name: &str, default: &str) -> Result<Vec<u64>> {
    let raw = env_str(name, default);
    let steps: Result<Vec<u64>> = raw
        .split(',')
        .filter(|s| !s.trim().is_empty())
        .map(|s| {
            s.trim()
                .parse::<u64>()
                .with_context(|| format!("{name} entry '{s}' is not an integer"))
        })
        .collect();
    let steps = steps?;
    anyhow::ensure!(!steps.is_empty(), "{name} must contain at least one step");
    Ok(steps)
}

impl EngineConfig {
    /// Assemble the configuration from the process environment.
    ///
    /// Any malformed value is an error; the caller treats it as fatal and
    /// exits with code 2.
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            ops: OpsConfig {
                token: env_opt("OPS_API_TOKEN"),
                token_file: env_opt("OPS_API_TOKEN_FILE"),
                approver_tokens: env_opt("OPS_APPROVER_TOKENS")
                    .map(|raw| {
                        raw.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                bind_addr: env_str("OPS_BIND_ADDR", "0.0.0.0:8002"),
                idempotency_retention_sec: env_f64("OPS_IDEMPOTENCY_RETENTION_SEC", 3600.0)?,
            },
            bus: BusConfig {
                queue_cap: env_u64("BUS_QUEUE_CAP", 0)? as usize,
            },
            supervisor: SupervisorConfig {
                backoff_ms: parse_backoff("TASK_RESTART_BACKOFF_MS", "500,1000,2000")?,
                task_grace_sec: env_u64("TASK_CANCEL_GRACE_SEC", 5)?,
                shutdown_grace_sec: env_u64("SHUTDOWN_GRACE_SEC", 15)?,
                watchdog_timeout_sec: env_u64("WATCHDOG_TIMEOUT_SEC", 30)?,
            },
            ws: WsConfig {
                reconnect_backoff_ms: parse_backoff("WS_RECONNECT_BACKOFF_MS", "500,1000,2000")?,
                health_enabled: env_bool("WS_HEALTH_ENABLED", false),
                disconnect_alert_sec: env_u64("WS_DISCONNECT_ALERT_SEC", 15)?,
            },
            bracket: BracketConfig {
                enabled: env_bool("BRACKET_GOVERNOR_ENABLED", true),
                tp_bps: env_f64("TP_BPS", 20.0)?,
                sl_bps: env_f64("SL_BPS", 30.0)?,
                allow_stop_amend: env_bool("ALLOW_STOP_AMEND", false),
            },
            depeg: DepegConfig {
                enabled: env_bool("DEPEG_GUARD_ENABLED", false),
                threshold_pct: env_f64("DEPEG_THRESHOLD_PCT", 0.5)?,
                confirm_windows: env_u64("DEPEG_CONFIRM_WINDOWS", 3)? as u32,
                cooldown_min: env_u64("DEPEG_ACTION_COOLDOWN_MIN", 120)?,
                exit_risk: env_bool("DEPEG_EXIT_RISK", false),
                switch_quote: env_bool("DEPEG_SWITCH_QUOTE", false),
                watch_symbols: env_csv("DEPEG_WATCH_SYMBOLS", "USDTUSDC,BTCUSDT,BTCUSDC"),
            },
            fees: FeeConfig {
                enabled: env_bool("BNB_FEE_DISCOUNT_ENABLED", true),
                topup_threshold_usd: env_f64("BNB_TOPUP_THRESHOLD_USD", 10.0)?,
                topup_amount_usd: env_f64("BNB_TOPUP_AMOUNT_USD", 50.0)?,
                check_interval_sec: env_u64("BNB_TOPUP_INTERVAL_SEC", 1800)?,
                min_topup_interval_sec: env_u64("BNB_MIN_TOPUP_INTERVAL_SEC", 3600)?,
                fee_asset: env_str("FEE_ASSET", "BNB"),
                fee_symbol: env_str("FEE_SYMBOL", "BNBUSDT"),
            },
            health: HealthConfig {
                tg_enabled: env_bool("HEALTH_TG_ENABLED", false),
                debounce_sec: env_f64("HEALTH_DEBOUNCE_SEC", 10.0)?,
            },
            digest: DigestConfig {
                enabled: env_bool("DIGEST_ENABLED", false),
                interval_min: env_u64("DIGEST_INTERVAL_MIN", 1440)?,
                include_symbols: env_bool("DIGEST_INCLUDE_SYMBOLS", true),
                six_hour_enabled: env_bool("DIGEST_6H_ENABLED", false),
                bucket_minutes: env_u64("DIGEST_BUCKET_MINUTES", 360)?,
                max_buckets: env_u64("DIGEST_MAX_BUCKETS", 4)? as usize,
            },
            guards: GuardConfig {
                max_spread_bps: env_f64("GUARD_MAX_SPREAD_BPS", 25.0)?,
                cooldown_ttl_sec: env_f64("GUARD_COOLDOWN_TTL_SEC", 300.0)?,
                max_tick_to_order_ms: env_f64("GUARD_MAX_TICK_TO_ORDER_MS", 1500.0)?,
                min_notional_usd: env_f64("GUARD_MIN_NOTIONAL_USD", 10.0)?,
                max_symbol_exposure_usd: env_f64("GUARD_MAX_SYMBOL_EXPOSURE_USD", 50_000.0)?,
                max_total_exposure_usd: env_f64("GUARD_MAX_TOTAL_EXPOSURE_USD", 250_000.0)?,
            },
            quarantine: QuarantineConfig {
                max_stops_in_window: env_u64("QUARANTINE_MAX_STOPS", 2)? as usize,
                window_sec: env_f64("QUARANTINE_WINDOW_SEC", 3600.0)?,
                quarantine_sec: env_f64("QUARANTINE_BLOCK_SEC", 14_400.0)?,
                path: env_str("QUARANTINE_STATE_PATH", "state/quarantine.json"),
            },
            telegram: TelegramConfig {
                enabled: env_bool("TELEGRAM_ENABLED", false),
                token: env_opt("TELEGRAM_BOT_TOKEN"),
                chat_id: env_opt("TELEGRAM_CHAT_ID"),
            },
            model_watch: ModelWatchConfig {
                paths: env_opt("MODEL_WATCH_PATHS")
                    .map(|raw| {
                        raw.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
                poll_interval_sec: env_f64("MODEL_WATCH_POLL_SEC", 5.0)?.max(1.0),
            },
            router: RouterConfig {
                default_venue: env_str("ROUTER_DEFAULT_VENUE", "BINANCE"),
                request_timeout_sec: env_u64("ROUTER_TIMEOUT_SEC", 5)?,
                api_key: env_str("BINANCE_API_KEY", ""),
                api_secret: env_str("BINANCE_API_SECRET", ""),
            },
            training_cursor_path: env_str("TRAINING_CURSOR_PATH", "ops/training_cursor.json"),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Cross-field validation beyond simple parsing.
    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.depeg.threshold_pct > 0.0,
            "DEPEG_THRESHOLD_PCT must be positive"
        );
        anyhow::ensure!(
            self.depeg.confirm_windows >= 1,
            "DEPEG_CONFIRM_WINDOWS must be >= 1"
        );
        anyhow::ensure!(
            self.bracket.tp_bps > 0.0 && self.bracket.sl_bps > 0.0,
            "TP_BPS and SL_BPS must be positive"
        );
        anyhow::ensure!(
            self.quarantine.max_stops_in_window >= 1,
            "QUARANTINE_MAX_STOPS must be >= 1"
        );
        anyhow::ensure!(
            self.digest.max_buckets >= 1,
            "DIGEST_MAX_BUCKETS must be >= 1"
        );
        if self.telegram.enabled {
            anyhow::ensure!(
                self.telegram.token.is_some() && self.telegram.chat_id.is_some(),
                "TELEGRAM_ENABLED requires TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID"
            );
        }
        Ok(())
    }
}
