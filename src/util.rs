use serde::Serializer;

const FLOAT_TO_INT_MAX: f64 = 9007199254740991_f64;

/// Converting float to int has undefined behaviour for huge floats: https://stackoverflow.com/a/41139453.
/// To avoid this, refuse to convert floats with magnitude greater than 2**53 - 1, after which 64-bit floats no longer
/// retain integer precision.
pub(crate) fn f64_to_i64_safe(f: f64) -> Option<i64> {
    if f.abs() <= FLOAT_TO_INT_MAX {
        Some(f as i64)
    } else {
        None
    }
}

pub(crate) fn is_false(b: &bool) -> bool {
    !(*b)
}

/// Writes a number as a JSON integer whenever it is integral, so `1` is not read back as `1.0`.
#[allow(clippy::float_cmp)]
pub(crate) fn serialize_number<S>(number: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match f64_to_i64_safe(*number) {
        Some(i) if i as f64 == *number => serializer.serialize_i64(i),
        _ => serializer.serialize_f64(*number),
    }
}

/// Writes a rollout weight (out of 100000) as a JSON integer whenever it is integral.
#[allow(clippy::float_cmp)]
pub(crate) fn serialize_weight<S>(weight: &f32, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let as_f64 = *weight as f64;
    match f64_to_i64_safe(as_f64) {
        Some(i) if i as f64 == as_f64 => serializer.serialize_i64(i),
        _ => serializer.serialize_f32(*weight),
    }
}

pub(crate) fn serialize_optional_weight<S>(
    weight: &Option<f32>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match weight {
        Some(w) => serialize_weight(w, serializer),
        None => serializer.serialize_none(),
    }
}
