//! The configuration enumeration from the external interfaces section.
//! These are compiled-in defaults; `services/realtime` overrides a subset
//! from environment variables at startup (see its `config` module).

use std::time::Duration;

pub const MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;
pub const MAX_TEXT_CONTENT_BYTES: usize = 10 * 1024;

pub const MESSAGE_RATE_PER_SENDER_PER_CONV: u32 = 100;
pub const MESSAGE_RATE_WINDOW: Duration = Duration::from_secs(60);

pub const MAX_CALL_PARTICIPANTS: usize = 10;

pub const CALL_INITIATE_RATE_PER_USER: u32 = 10;
pub const CALL_INITIATE_RATE_WINDOW: Duration = Duration::from_secs(60);

pub const MAX_CALL_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
pub const CALL_RINGING_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const CALL_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub const Q_CHAT: usize = 1000;
pub const Q_HUB: usize = 1000;
pub const Q_SIGNALING: usize = 256;

pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);
pub const PING_INTERVAL: Duration = Duration::from_secs(25);

pub const BUS_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(10);
pub const BUS_HEALTH_CHECK_DEADLINE: Duration = Duration::from_secs(2);

pub const STORE_WRITE_DEADLINE: Duration = Duration::from_secs(5);
pub const STORE_READ_DEADLINE: Duration = Duration::from_secs(2);
