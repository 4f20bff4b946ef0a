//! Atomic in-place operations
//!
//! An operation names a key and turns the current record into its new form.
//! [`SortedStore::execute`](crate::SortedStore::execute) runs it while holding
//! the owning block exclusively, so concurrent executions on one key never
//! lose updates.
//!
//! Absent keys start from zero (numbers) or empty (append). A value that is
//! not in the format the operation expects fails with
//! [`BurrowError::OperationFailed`].

use crate::error::{BurrowError, Result};

/// The record an operation sees
#[derive(Debug, Clone, Copy)]
pub struct Current<'a> {
    pub value: &'a [u8],
    pub expire_at: Option<u64>,
}

/// What to do with the record after an operation ran
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    /// Leave the record as it is
    Keep,
    /// Store a new value
    Put {
        value: Vec<u8>,
        expire_at: Option<u64>,
    },
    /// Remove the record
    Delete,
}

/// A read-modify-write step on a single key
pub trait AtomicOperation {
    fn key(&self) -> &[u8];

    /// Compute the update from the current record (`None` if absent)
    fn apply(&mut self, current: Option<Current<'_>>) -> Result<Update>;

    /// The update from the last `apply` was not stored (memory ceiling)
    fn rejected(&mut self) {}
}

// =============================================================================
// Increment
// =============================================================================

/// Encoding of an integer counter value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumberFormat {
    /// ASCII decimal, optional leading `-`
    #[default]
    Text,
    /// 8 bytes, big-endian two's complement
    Binary,
}

/// Add a delta to an `i64` counter
#[derive(Debug, Clone)]
pub struct Increment {
    key: Vec<u8>,
    delta: i64,
    format: NumberFormat,
    result: Option<i64>,
}

impl Increment {
    pub fn new(key: impl Into<Vec<u8>>, delta: i64) -> Self {
        Self {
            key: key.into(),
            delta,
            format: NumberFormat::Text,
            result: None,
        }
    }

    /// Counter stored as an 8-byte big-endian integer
    pub fn binary(key: impl Into<Vec<u8>>, delta: i64) -> Self {
        Self {
            format: NumberFormat::Binary,
            ..Self::new(key, delta)
        }
    }

    /// Value after the last stored update
    pub fn result(&self) -> Option<i64> {
        self.result
    }
}

impl AtomicOperation for Increment {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn apply(&mut self, current: Option<Current<'_>>) -> Result<Update> {
        let (base, expire_at) = match current {
            Some(c) => (decode_i64(c.value, self.format)?, c.expire_at),
            None => (0, None),
        };
        let next = base.checked_add(self.delta).ok_or_else(|| {
            BurrowError::OperationFailed(format!(
                "increment of {} by {} overflows",
                base, self.delta
            ))
        })?;

        self.result = Some(next);
        Ok(Update::Put {
            value: encode_i64(next, self.format),
            expire_at,
        })
    }

    fn rejected(&mut self) {
        self.result = None;
    }
}

fn decode_i64(value: &[u8], format: NumberFormat) -> Result<i64> {
    match format {
        NumberFormat::Text => std::str::from_utf8(value)
            .ok()
            .filter(|s| !s.is_empty() && !s.starts_with('+'))
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| BurrowError::OperationFailed("value is not an integer".to_string())),
        NumberFormat::Binary => {
            let bytes: [u8; 8] = value.try_into().map_err(|_| {
                BurrowError::OperationFailed(format!(
                    "binary counter must be 8 bytes, got {}",
                    value.len()
                ))
            })?;
            Ok(i64::from_be_bytes(bytes))
        }
    }
}

fn encode_i64(value: i64, format: NumberFormat) -> Vec<u8> {
    match format {
        NumberFormat::Text => value.to_string().into_bytes(),
        NumberFormat::Binary => value.to_be_bytes().to_vec(),
    }
}

// =============================================================================
// Floating-point increment
// =============================================================================

/// Add a delta to a decimal floating-point value stored as text
#[derive(Debug, Clone)]
pub struct IncrementFloat {
    key: Vec<u8>,
    delta: f64,
    result: Option<f64>,
}

impl IncrementFloat {
    pub fn new(key: impl Into<Vec<u8>>, delta: f64) -> Self {
        Self {
            key: key.into(),
            delta,
            result: None,
        }
    }

    pub fn result(&self) -> Option<f64> {
        self.result
    }
}

impl AtomicOperation for IncrementFloat {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn apply(&mut self, current: Option<Current<'_>>) -> Result<Update> {
        let (base, expire_at) = match current {
            Some(c) => {
                let parsed = std::str::from_utf8(c.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<f64>().ok())
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| {
                        BurrowError::OperationFailed("value is not a valid float".to_string())
                    })?;
                (parsed, c.expire_at)
            }
            None => (0.0, None),
        };

        let next = base + self.delta;
        if !next.is_finite() {
            return Err(BurrowError::OperationFailed(
                "increment would produce NaN or Infinity".to_string(),
            ));
        }

        self.result = Some(next);
        Ok(Update::Put {
            value: next.to_string().into_bytes(),
            expire_at,
        })
    }

    fn rejected(&mut self) {
        self.result = None;
    }
}

// =============================================================================
// Append
// =============================================================================

/// Concatenate bytes to the current value
#[derive(Debug, Clone)]
pub struct Append {
    key: Vec<u8>,
    suffix: Vec<u8>,
    new_len: Option<usize>,
}

impl Append {
    pub fn new(key: impl Into<Vec<u8>>, suffix: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            suffix: suffix.into(),
            new_len: None,
        }
    }

    /// Length of the value after the last stored update
    pub fn new_len(&self) -> Option<usize> {
        self.new_len
    }
}

impl AtomicOperation for Append {
    fn key(&self) -> &[u8] {
        &self.key
    }

    fn apply(&mut self, current: Option<Current<'_>>) -> Result<Update> {
        let (mut value, expire_at) = match current {
            Some(c) => {
                let mut value = Vec::with_capacity(c.value.len() + self.suffix.len());
                value.extend_from_slice(c.value);
                (value, c.expire_at)
            }
            None => (Vec::with_capacity(self.suffix.len()), None),
        };
        value.extend_from_slice(&self.suffix);

        self.new_len = Some(value.len());
        Ok(Update::Put { value, expire_at })
    }

    fn rejected(&mut self) {
        self.new_len = None;
    }
}
