use rand::Rng;

use crate::types::{SensorKind, SensorReading};

/// Characters a correlation token is drawn from (67 symbols).
pub const TOKEN_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789#?!-_";

pub const TOKEN_LEN: usize = 32;

/// Uniform sample in `[0, max)` for the given kind.
pub fn sample<R: Rng + ?Sized>(kind: SensorKind, rng: &mut R) -> f32 {
    let value = rng.gen_range(0.0..kind.max_value());
    // f32 rounding can land exactly on the bound.
    if value >= kind.max_value() {
        0.0
    } else {
        value
    }
}

/// Fresh reading for the same sensor.
pub fn resample<R: Rng + ?Sized>(reading: &SensorReading, rng: &mut R) -> SensorReading {
    reading.with_value(sample(reading.kind, rng))
}

pub fn correlation_token<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}
