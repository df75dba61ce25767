//! Scalar functions and the `encrypt`/`decrypt` cipher.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{Datelike, Timelike};
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::digest::{SHA256, digest};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::HashMap;
use std::fmt::Write as _;

use crate::domain::ast::{Function, Query};
use crate::domain::error::QueryError;
use crate::domain::rewrite::visit_query_calls;
use crate::domain::temporal::format_duration;
use crate::domain::value::Value;

/// Apply a non-aggregate function to already evaluated arguments. A null
/// first argument yields null, except for `coalesce`.
pub fn apply_scalar(func: Function, args: &[Value], option: Option<&str>) -> Value {
    if func == Function::Coalesce {
        return args
            .iter()
            .find(|v| !v.is_null())
            .cloned()
            .unwrap_or(Value::Null);
    }
    let Some(arg) = args.first() else {
        return Value::Null;
    };
    if arg.is_null() {
        return Value::Null;
    }
    match (func, arg) {
        (Function::Abs, Value::Int(i)) => Value::Int(i.wrapping_abs()),
        (Function::Abs, Value::Float(f)) => Value::Float(f.abs()),
        (Function::Abs, Value::Duration(d)) => Value::Duration(d.abs()),
        (Function::Year, Value::Date(d)) => Value::Int(i64::from(d.year())),
        (Function::Month, Value::Date(d)) => Value::Int(i64::from(d.month())),
        (Function::Week, Value::Date(d)) => Value::Int(i64::from(d.ordinal() / 7)),
        (Function::DayOfWeek, Value::Date(d)) => {
            Value::Int(i64::from(d.weekday().num_days_from_sunday()))
        }
        (Function::DayOfYear, Value::Date(d)) => Value::Int(i64::from(d.ordinal())),
        (Function::DayOfMonth, Value::Date(d)) => Value::Int(i64::from(d.day())),
        (Function::Hour, Value::Date(d)) => Value::Int(i64::from(d.hour())),
        (Function::MonthName, Value::Date(d)) => Value::Text(d.format("%B").to_string()),
        (Function::DayName, Value::Date(d)) => Value::Text(d.format("%A").to_string()),
        (Function::Format, v) => format_value(v, option),
        _ => Value::Null,
    }
}

/// `format(expr, pattern)`: strftime patterns for dates, a decimal
/// precision for numbers. Without a pattern the display form is used.
fn format_value(value: &Value, pattern: Option<&str>) -> Value {
    let Some(pattern) = pattern else {
        return Value::Text(value.to_string());
    };
    match value {
        Value::Date(d) => {
            let mut out = String::new();
            // invalid strftime items surface as a formatting error
            match write!(out, "{}", d.format(pattern)) {
                Ok(()) => Value::Text(out),
                Err(_) => Value::Null,
            }
        }
        Value::Int(_) | Value::Float(_) => {
            let digits = pattern.trim().trim_start_matches('%').trim_start_matches('.');
            let digits = digits.trim_end_matches('f');
            match (digits.parse::<usize>(), value.as_f64()) {
                (Ok(precision), Some(x)) => Value::Text(format!("{x:.precision$}")),
                _ => Value::Text(value.to_string()),
            }
        }
        Value::Duration(d) => Value::Text(format_duration(d)),
        other => Value::Text(other.to_string()),
    }
}

/// AES-256-GCM keyed by the SHA-256 digest of a password. Ciphertext is the
/// random nonce followed by the sealed bytes, base64 encoded.
pub struct Cipher {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cipher").finish_non_exhaustive()
    }
}

impl Cipher {
    pub fn new(password: &str) -> Result<Cipher, QueryError> {
        let hashed = digest(&SHA256, password.as_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, hashed.as_ref())
            .map_err(|_| QueryError::execution("could not derive an encryption key"))?;
        Ok(Cipher {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, QueryError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| QueryError::execution("could not generate a nonce"))?;
        let mut sealed = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce_bytes),
                Aad::empty(),
                &mut sealed,
            )
            .map_err(|_| QueryError::execution("encryption failed"))?;
        let mut out = nonce_bytes.to_vec();
        out.extend_from_slice(&sealed);
        Ok(STANDARD.encode(out))
    }

    /// Returns `None` for malformed input or a wrong password.
    pub fn decrypt(&self, encoded: &str) -> Option<String> {
        let bytes = STANDARD.decode(encoded.trim()).ok()?;
        if bytes.len() <= NONCE_LEN {
            return None;
        }
        let (nonce, sealed) = bytes.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce).ok()?;
        let mut sealed = sealed.to_vec();
        let plain = self.key.open_in_place(nonce, Aad::empty(), &mut sealed).ok()?;
        String::from_utf8(plain.to_vec()).ok()
    }
}

/// Ciphers for every `encrypt`/`decrypt` call of a query, keyed by the
/// call's own password when it has one.
#[derive(Debug, Default)]
pub struct Ciphers {
    default: Option<Cipher>,
    named: HashMap<String, Cipher>,
}

impl Ciphers {
    /// Build ciphers for `query`. A call without its own password uses
    /// `default_password`; missing both is a type error.
    pub fn prepare(query: &Query, default_password: Option<&str>) -> Result<Ciphers, QueryError> {
        let mut ciphers = Ciphers::default();
        let mut result = Ok(());
        visit_query_calls(query, &mut |call| {
            if result.is_err() || !matches!(call.func, Function::Encrypt | Function::Decrypt) {
                return;
            }
            result = match (&call.option, default_password) {
                (Some(password), _) => {
                    if ciphers.named.contains_key(password) {
                        Ok(())
                    } else {
                        Cipher::new(password).map(|c| {
                            ciphers.named.insert(password.clone(), c);
                        })
                    }
                }
                (None, Some(password)) => {
                    if ciphers.default.is_some() {
                        Ok(())
                    } else {
                        Cipher::new(password).map(|c| ciphers.default = Some(c))
                    }
                }
                (None, None) => Err(QueryError::type_error(format!(
                    "{} needs a password: pass one as the second argument or configure [crypto] password",
                    call.func.name()
                ))),
            };
        });
        result.map(|()| ciphers)
    }

    pub fn get(&self, password: Option<&str>) -> Option<&Cipher> {
        match password {
            Some(p) => self.named.get(p),
            None => self.default.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::temporal::parse_date;

    fn date(text: &str) -> Value {
        Value::Date(parse_date(text).unwrap())
    }

    #[test]
    fn date_parts() {
        // 2024-03-10 was a Sunday, day 70 of the year
        let d = date("2024-03-10 14:30:00");
        assert_eq!(apply_scalar(Function::Year, &[d.clone()], None), Value::Int(2024));
        assert_eq!(apply_scalar(Function::Month, &[d.clone()], None), Value::Int(3));
        assert_eq!(apply_scalar(Function::DayOfMonth, &[d.clone()], None), Value::Int(10));
        assert_eq!(apply_scalar(Function::DayOfYear, &[d.clone()], None), Value::Int(70));
        assert_eq!(apply_scalar(Function::Week, &[d.clone()], None), Value::Int(10));
        assert_eq!(apply_scalar(Function::DayOfWeek, &[d.clone()], None), Value::Int(0));
        assert_eq!(apply_scalar(Function::Hour, &[d.clone()], None), Value::Int(14));
        assert_eq!(
            apply_scalar(Function::MonthName, &[d.clone()], None),
            Value::Text("March".to_string())
        );
        assert_eq!(
            apply_scalar(Function::DayName, &[d], None),
            Value::Text("Sunday".to_string())
        );
    }

    #[test]
    fn null_argument_gives_null() {
        assert!(apply_scalar(Function::Year, &[Value::Null], None).is_null());
        assert!(apply_scalar(Function::Abs, &[Value::Null], None).is_null());
    }

    #[test]
    fn abs_and_coalesce() {
        assert_eq!(apply_scalar(Function::Abs, &[Value::Int(-4)], None), Value::Int(4));
        assert_eq!(apply_scalar(Function::Abs, &[Value::Float(-1.5)], None), Value::Float(1.5));
        let args = [Value::Null, Value::Int(3), Value::Int(5)];
        assert_eq!(apply_scalar(Function::Coalesce, &args, None), Value::Int(3));
        assert!(apply_scalar(Function::Coalesce, &[Value::Null], None).is_null());
    }

    #[test]
    fn format_dates_and_numbers() {
        let d = date("2024-03-10");
        assert_eq!(
            apply_scalar(Function::Format, &[d], Some("%d/%m/%Y")),
            Value::Text("10/03/2024".to_string())
        );
        assert_eq!(
            apply_scalar(Function::Format, &[Value::Float(3.14159)], Some("2")),
            Value::Text("3.14".to_string())
        );
        assert_eq!(
            apply_scalar(Function::Format, &[Value::Int(7)], Some(".1")),
            Value::Text("7.0".to_string())
        );
        assert_eq!(
            apply_scalar(Function::Format, &[Value::Int(7)], None),
            Value::Text("7".to_string())
        );
    }

    #[test]
    fn encrypt_then_decrypt() {
        let cipher = Cipher::new("secret").unwrap();
        let sealed = cipher.encrypt("hello").unwrap();
        assert_ne!(sealed, "hello");
        assert_eq!(cipher.decrypt(&sealed).as_deref(), Some("hello"));
        // fresh nonce each time
        assert_ne!(cipher.encrypt("hello").unwrap(), sealed);
    }

    #[test]
    fn wrong_password_or_garbage_fails_to_decrypt() {
        let sealed = Cipher::new("secret").unwrap().encrypt("hello").unwrap();
        assert!(Cipher::new("other").unwrap().decrypt(&sealed).is_none());
        assert!(Cipher::new("secret").unwrap().decrypt("not base64!").is_none());
        assert!(Cipher::new("secret").unwrap().decrypt("AAAA").is_none());
    }
}
