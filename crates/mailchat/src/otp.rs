use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// How often the background reaper sweeps expired entries.
const REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Validation failures. The `Display` strings are shown to the user verbatim
/// (prefixed `Authentication failed: ` by the connection handler).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OtpError {
    #[error("no OTP found for this email")]
    NotFound,
    #[error("OTP has expired")]
    Expired,
    #[error("maximum verification attempts exceeded")]
    TooManyAttempts,
    #[error("invalid OTP code")]
    Mismatch,
}

#[derive(Debug)]
struct OtpData {
    code: String,
    expires_at: Instant,
    attempts: u32,
}

/// One-time codes keyed by email: one live entry per address, bounded
/// lifetime, bounded attempts, single use. The reaper task shares the same
/// lock as `generate`/`validate`, so the three can race freely.
pub struct OtpService {
    otps: Mutex<HashMap<String, OtpData>>,
    expiration: Duration,
    max_retries: u32,
}

impl OtpService {
    pub fn new(expiration: Duration, max_retries: u32) -> Arc<Self> {
        Arc::new(Self {
            otps: Mutex::new(HashMap::new()),
            expiration,
            max_retries,
        })
    }

    /// Generate a fresh 6-digit code for `email`, replacing any prior entry.
    /// Fails only if the system CSPRNG fails.
    pub async fn generate(&self, email: &str) -> anyhow::Result<String> {
        let code = generate_code()?;
        let mut otps = self.otps.lock().await;
        otps.insert(
            email.to_string(),
            OtpData {
                code: code.clone(),
                expires_at: Instant::now() + self.expiration,
                attempts: 0,
            },
        );
        Ok(code)
    }

    /// Check `code` against the live entry for `email`.
    ///
    /// Expired or attempt-exhausted entries are removed on the spot; a wrong
    /// code burns an attempt but keeps the entry; a correct code removes the
    /// entry (single use).
    pub async fn validate(&self, email: &str, code: &str) -> Result<(), OtpError> {
        let mut otps = self.otps.lock().await;

        let entry = match otps.get_mut(email) {
            Some(entry) => entry,
            None => return Err(OtpError::NotFound),
        };

        if Instant::now() > entry.expires_at {
            otps.remove(email);
            return Err(OtpError::Expired);
        }

        if entry.attempts >= self.max_retries {
            otps.remove(email);
            return Err(OtpError::TooManyAttempts);
        }

        entry.attempts += 1;

        if entry.code != code {
            return Err(OtpError::Mismatch);
        }

        otps.remove(email);
        Ok(())
    }

    /// Drop any entry for `email`. Used to roll back a `generate` whose
    /// email delivery failed.
    pub async fn clear(&self, email: &str) {
        self.otps.lock().await.remove(email);
    }

    /// A live, non-expired entry exists for `email`.
    pub async fn has_pending(&self, email: &str) -> bool {
        self.otps
            .lock()
            .await
            .get(email)
            .is_some_and(|e| Instant::now() <= e.expires_at)
    }

    /// Background sweep of expired entries, once a minute, for the life of
    /// the process.
    pub fn spawn_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let svc = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(REAP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let now = Instant::now();
                let mut otps = svc.otps.lock().await;
                let before = otps.len();
                otps.retain(|_, e| now <= e.expires_at);
                let reaped = before - otps.len();
                if reaped > 0 {
                    debug!(reaped, "expired OTP entries removed");
                }
            }
        })
    }
}

/// Uniform random code in `[0, 1_000_000)`, zero-padded to 6 digits.
fn generate_code() -> anyhow::Result<String> {
    const BOUND: u32 = 1_000_000;
    // Rejection sampling keeps the distribution uniform over the bound.
    const ZONE: u32 = (u32::MAX / BOUND) * BOUND;

    loop {
        let mut b = [0u8; 4];
        getrandom::getrandom(&mut b).map_err(|e| anyhow::anyhow!("CSPRNG failure: {e}"))?;
        let n = u32::from_be_bytes(b);
        if n < ZONE {
            return Ok(format!("{:06}", n % BOUND));
        }
    }
}
