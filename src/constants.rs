//! Tunable constants shared across the engine.

use std::time::Duration;

// Key prefixes.
pub const BOT_KEY_PREFIX: &str = "lowcard:bot";
pub const GAME_KEY_PREFIX: &str = "lowcard:game";
pub const DECK_KEY_PREFIX: &str = "lowcard:deck";
pub const TIMER_KEY_PREFIX: &str = "room";
pub const TIMER_KEY_SUFFIX: &str = "lowcard:timer";
pub const START_LOCK_PREFIX: &str = "lowcard:lock";
pub const JOIN_LOCK_PREFIX: &str = "lowcard:joinlock";
pub const DRAW_LOCK_PREFIX: &str = "lowcard:drawlock";
pub const CREDITS_KEY_PREFIX: &str = "credits";
pub const ACTIVE_GAME_KEY_PREFIX: &str = "game:active";

// Pub/sub channel carrying inbound chat commands.
pub const GAME_COMMAND_CHANNEL: &str = "game:command";

// Game constants.
pub const MIN_PLAYERS: usize = 2;
pub const DECK_SIZE: usize = 52;
pub const HOUSE_FEE_PERCENT: u64 = 10;
pub const MERCHANT_COMMISSION_PERCENT: u64 = 10;

// Entry amount bounds.
pub const DEFAULT_MIN_ENTRY: i64 = 1;
pub const DEFAULT_MAX_ENTRY: i64 = 999_999_999;
pub const BIG_GAME_MIN_ENTRY: i64 = 50;
pub const BIG_GAME_NAME_MARKER: &str = "big game";

// Durations.
pub const JOIN_PHASE_DURATION: Duration = Duration::from_secs(30);
pub const COUNTDOWN_DURATION: Duration = Duration::from_secs(3);
pub const ROUND_DURATION: Duration = Duration::from_secs(20);
pub const STALE_GAME_GRACE: Duration = Duration::from_secs(120);
pub const STUCK_WAITING_AGE: Duration = Duration::from_secs(40);

// TTLs for keyed-store entries.
pub const GAME_SNAPSHOT_TTL: Duration = Duration::from_secs(60 * 60);
pub const DECK_TTL: Duration = Duration::from_secs(60 * 60);
pub const TIMER_TTL: Duration = Duration::from_secs(120);
pub const BOT_RECORD_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 7);
pub const CREDITS_CACHE_TTL: Duration = Duration::from_secs(300);

// Lock TTLs.
pub const START_LOCK_TTL: Duration = Duration::from_secs(30);
pub const JOIN_LOCK_TTL: Duration = Duration::from_secs(15);
pub const DRAW_LOCK_TTL: Duration = Duration::from_secs(15);

// Lock retry budget for `acquireWithRetry`.
pub const JOIN_LOCK_RETRY_ATTEMPTS: u32 = 5;
pub const JOIN_LOCK_RETRY_DELAY: Duration = Duration::from_millis(100);

// Timer Poller tick interval.
pub const POLLER_TICK_INTERVAL: Duration = Duration::from_millis(500);
