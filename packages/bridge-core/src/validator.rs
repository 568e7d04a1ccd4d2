use crate::types::{unix_now_secs, CrossChainMessage};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid id format: {0}")]
    InvalidId(String),

    #[error("Invalid hashlock format: {0}")]
    InvalidHashlock(String),

    #[error("Timelock {timelock} is not after current time {now}")]
    ExpiredTimelock { timelock: u64, now: u64 },
}

/// Structural checks on a [`CrossChainMessage`]. A message rejected here can
/// never become valid later, so callers discard it instead of retrying.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageValidator;

impl MessageValidator {
    pub fn validate(&self, message: &CrossChainMessage) -> bool {
        self.check(message, unix_now_secs()).is_ok()
    }

    /// Runs every check against `now` (seconds since epoch), stopping at the
    /// first violation.
    pub fn check(&self, message: &CrossChainMessage, now: u64) -> Result<(), ValidationError> {
        let required = [
            ("id", message.id.as_str()),
            ("sourceChain", message.source_chain.as_str()),
            ("targetChain", message.target_chain.as_str()),
            ("receiver", message.receiver.as_str()),
            ("hashlock", message.hashlock.as_str()),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(ValidationError::MissingField(name));
            }
        }
        if message.timelock == 0 {
            return Err(ValidationError::MissingField("timelock"));
        }

        if !is_hex32(&message.id) {
            return Err(ValidationError::InvalidId(message.id.clone()));
        }
        if !is_hex32(&message.hashlock) {
            return Err(ValidationError::InvalidHashlock(message.hashlock.clone()));
        }

        if message.timelock <= now {
            return Err(ValidationError::ExpiredTimelock {
                timelock: message.timelock,
                now,
            });
        }

        Ok(())
    }
}

/// `^0x[0-9a-f]{64}$`
pub fn is_hex32(value: &str) -> bool {
    match value.strip_prefix("0x") {
        Some(digits) => {
            digits.len() == 64 && digits.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
        }
        None => false,
    }
}
