use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use sha2::Sha256;

const NONCE_ACTION: &str = "safeflag_flag_comment_nonce";
const TICK_SECS: i64 = 12 * 60 * 60;

fn tick(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(TICK_SECS)
}

fn sign(secret: &str, tick: i64) -> Option<Vec<u8>> {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return None;
    };
    mac.update(NONCE_ACTION.as_bytes());
    mac.update(b"|");
    mac.update(tick.to_string().as_bytes());
    Some(mac.finalize().into_bytes().to_vec())
}

pub fn issue(secret: &str, now: DateTime<Utc>) -> String {
    sign(secret, tick(now)).map(hex::encode).unwrap_or_default()
}

pub fn verify(secret: &str, nonce: &str, now: DateTime<Utc>) -> bool {
    let Ok(given) = hex::decode(nonce.trim()) else {
        return false;
    };
    let current = tick(now);
    [current, current - 1].into_iter().any(|t| {
        sign(secret, t)
            .is_some_and(|expected| expected.len() == given.len() && constant_time_eq(&expected, &given))
    })
}
