//! Conversion between [`Value`]s and SQLite column values.
//!
//! SQLite turns a bound NaN into NULL, so non-finite numbers are written as
//! the text sentinels `nan`, `inf` and `-inf` into the REAL column. SQLite
//! also stores integral reals as integers, which loses the sign of `-0.0`,
//! so that one value is written as its 8 raw bytes. Arrays
//! are little-endian blobs: `u32` rank, `u64` per dimension, then `f64`
//! elements. Array elements keep their bits, NaN included.

use rusqlite::types::{Value as SqlValue, ValueRef};

use crate::config::NonFinitePolicy;
use crate::error::{MeasdbError, Result};
use crate::models::{ArrayValue, ParamType, Value};

const NAN: &str = "nan";
const POS_INF: &str = "inf";
const NEG_INF: &str = "-inf";

pub(crate) fn to_sql(value: &Value, policy: NonFinitePolicy) -> SqlValue {
    match value {
        Value::Numeric(v) if *v == 0.0 && v.is_sign_negative() => {
            SqlValue::Blob(v.to_le_bytes().to_vec())
        }
        Value::Numeric(v) if v.is_finite() => SqlValue::Real(*v),
        Value::Numeric(_) if policy == NonFinitePolicy::Null => SqlValue::Null,
        Value::Numeric(v) if v.is_nan() => SqlValue::Text(NAN.to_string()),
        Value::Numeric(v) if *v > 0.0 => SqlValue::Text(POS_INF.to_string()),
        Value::Numeric(_) => SqlValue::Text(NEG_INF.to_string()),
        Value::Text(s) => SqlValue::Text(s.clone()),
        Value::Array(a) => SqlValue::Blob(encode_array(a)),
    }
}

pub(crate) fn from_sql(raw: ValueRef<'_>, param_type: ParamType) -> Result<Option<Value>> {
    if let ValueRef::Null = raw {
        return Ok(None);
    }
    let value = match (param_type, raw) {
        (ParamType::Numeric, ValueRef::Real(v)) => Value::Numeric(v),
        (ParamType::Numeric, ValueRef::Integer(v)) => Value::Numeric(v as f64),
        (ParamType::Numeric, ValueRef::Text(t)) => Value::Numeric(parse_sentinel(t)?),
        (ParamType::Numeric, ValueRef::Blob(b)) => {
            let bytes: [u8; 8] = b
                .try_into()
                .map_err(|_| MeasdbError::Corrupt(format!("{}-byte blob in a numeric column", b.len())))?;
            Value::Numeric(f64::from_le_bytes(bytes))
        }
        (ParamType::Text, ValueRef::Text(t)) => Value::Text(
            std::str::from_utf8(t)
                .map_err(|e| MeasdbError::Corrupt(format!("text value is not UTF-8: {e}")))?
                .to_string(),
        ),
        (ParamType::Array, ValueRef::Blob(b)) => Value::Array(decode_array(b)?),
        (ptype, other) => {
            return Err(MeasdbError::Corrupt(format!(
                "stored {:?} value in a {ptype} column",
                other.data_type()
            )))
        }
    };
    Ok(Some(value))
}

fn parse_sentinel(raw: &[u8]) -> Result<f64> {
    match raw {
        b"nan" => Ok(f64::NAN),
        b"inf" => Ok(f64::INFINITY),
        b"-inf" => Ok(f64::NEG_INFINITY),
        other => Err(MeasdbError::Corrupt(format!(
            "unexpected text '{}' in a numeric column",
            String::from_utf8_lossy(other)
        ))),
    }
}

pub(crate) fn encode_array(array: &ArrayValue) -> Vec<u8> {
    let shape = array.shape();
    let mut out = Vec::with_capacity(4 + shape.len() * 8 + array.len() * 8);
    out.extend_from_slice(&(shape.len() as u32).to_le_bytes());
    for dim in shape {
        out.extend_from_slice(&(*dim as u64).to_le_bytes());
    }
    for v in array.data() {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub(crate) fn decode_array(bytes: &[u8]) -> Result<ArrayValue> {
    let corrupt = || MeasdbError::Corrupt("truncated array blob".into());

    let (rank, mut rest) = bytes.split_first_chunk::<4>().ok_or_else(corrupt)?;
    let rank = u32::from_le_bytes(*rank) as usize;

    let mut shape = Vec::with_capacity(rank.min(rest.len() / 8));
    for _ in 0..rank {
        let (dim, tail) = rest.split_first_chunk::<8>().ok_or_else(corrupt)?;
        shape.push(
            usize::try_from(u64::from_le_bytes(*dim))
                .map_err(|_| MeasdbError::Corrupt("array dimension overflows usize".into()))?,
        );
        rest = tail;
    }

    if rest.len() % 8 != 0 {
        return Err(corrupt());
    }
    let data: Vec<f64> = rest
        .chunks_exact(8)
        .map(|c| {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(c);
            f64::from_le_bytes(buf)
        })
        .collect();

    ArrayValue::new(shape, data).map_err(|e| MeasdbError::Corrupt(e.to_string()))
}
