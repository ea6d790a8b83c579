//! RFC 6238 time-based one-time passwords, used to authenticate the
//! session-id bootstrap probe.

use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TunnelError};

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_STEP_SECS: u64 = 30;
const DEFAULT_DIGITS: u32 = 6;

/// `otp_code() -> decimal_string`.
pub trait TotpCode: Send + Sync {
    fn otp_code(&self) -> Result<String>;
}

/// Standard RFC 6238 TOTP over HMAC-SHA1 with a 30-second step and 6
/// decimal digits.
pub struct Rfc6238Totp {
    secret: Vec<u8>,
    step_secs: u64,
    digits: u32,
}

impl Rfc6238Totp {
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            step_secs: DEFAULT_STEP_SECS,
            digits: DEFAULT_DIGITS,
        }
    }

    fn code_at(&self, unix_time: u64) -> Result<String> {
        let counter = unix_time / self.step_secs;
        let mut mac = HmacSha1::new_from_slice(&self.secret).map_err(|_| TunnelError::Config(
            "TOTP secret key is invalid length for HMAC-SHA1".to_string(),
        ))?;
        mac.update(&counter.to_be_bytes());
        let result = mac.finalize().into_bytes();

        let offset = (result[result.len() - 1] & 0x0f) as usize;
        let truncated = ((result[offset] as u32 & 0x7f) << 24)
            | ((result[offset + 1] as u32) << 16)
            | ((result[offset + 2] as u32) << 8)
            | (result[offset + 3] as u32);

        let modulus = 10u32.pow(self.digits);
        Ok(format!("{:0width$}", truncated % modulus, width = self.digits as usize))
    }
}

impl TotpCode for Rfc6238Totp {
    fn otp_code(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|_| TunnelError::Config("system clock before unix epoch".to_string()))?
            .as_secs();
        self.code_at(now)
    }
}
