//! Unit conversion and number formatting for point queries.
//!
//! Conversions stay inside one dimension. Every unit maps linearly onto the
//! dimension's base unit (`base = value * scale + offset`), which also covers the
//! temperature scales.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    #[error("unknown unit '{0}'")]
    Unknown(String),
    #[error("cannot convert '{from}' to '{to}'")]
    Incompatible { from: String, to: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dimension {
    Speed,
    Temperature,
    Pressure,
    Distance,
    Volume,
    Time,
}

#[derive(Debug, Clone, Copy)]
struct UnitDef {
    code: &'static str,
    dimension: Dimension,
    scale: f64,
    offset: f64,
}

const fn unit(code: &'static str, dimension: Dimension, scale: f64, offset: f64) -> UnitDef {
    UnitDef {
        code,
        dimension,
        scale,
        offset,
    }
}

// Base units: m/s, C, kPa, m, l, s.
const UNITS: &[UnitDef] = &[
    unit("m/s", Dimension::Speed, 1.0, 0.0),
    unit("km/h", Dimension::Speed, 1.0 / 3.6, 0.0),
    unit("mph", Dimension::Speed, 0.447_04, 0.0),
    unit("C", Dimension::Temperature, 1.0, 0.0),
    unit("F", Dimension::Temperature, 5.0 / 9.0, -160.0 / 9.0),
    unit("K", Dimension::Temperature, 1.0, -273.15),
    unit("kPa", Dimension::Pressure, 1.0, 0.0),
    unit("bar", Dimension::Pressure, 100.0, 0.0),
    unit("psi", Dimension::Pressure, 6.894_757, 0.0),
    unit("m", Dimension::Distance, 1.0, 0.0),
    unit("km", Dimension::Distance, 1000.0, 0.0),
    unit("mi", Dimension::Distance, 1609.344, 0.0),
    unit("l", Dimension::Volume, 1.0, 0.0),
    unit("gal", Dimension::Volume, 3.785_411_784, 0.0),
    unit("s", Dimension::Time, 1.0, 0.0),
    unit("ms", Dimension::Time, 0.001, 0.0),
    unit("min", Dimension::Time, 60.0, 0.0),
];

/// Languages that write a decimal comma.
const COMMA_LANGUAGES: &[&str] = &["de", "fr", "it", "es", "nl", "pt", "ru"];

fn lookup(code: &str) -> Option<&'static UnitDef> {
    let normalized = match code.trim().to_ascii_lowercase().as_str() {
        "mps" => "m/s",
        "kph" | "kmh" => "km/h",
        "degc" | "°c" | "c" => "C",
        "degf" | "°f" | "f" => "F",
        "k" => "K",
        "kpa" => "kPa",
        "sec" => "s",
        "mins" => "min",
        "liter" | "litre" => "l",
        _ => code.trim(),
    };
    UNITS.iter().find(|u| u.code == normalized)
}

/// The canonical spelling of `code`, if it is a known unit.
pub fn canonical(code: &str) -> Option<&'static str> {
    lookup(code).map(|u| u.code)
}

/// Converts `value` from unit `from` to unit `to`. An empty `to` keeps the value.
pub fn convert(value: f64, from: &str, to: &str) -> Result<f64, UnitError> {
    if to.is_empty() || from == to {
        return Ok(value);
    }
    let incompatible = || UnitError::Incompatible {
        from: from.to_string(),
        to: to.to_string(),
    };
    if from.is_empty() {
        return Err(incompatible());
    }
    let source = lookup(from).ok_or_else(|| UnitError::Unknown(from.to_string()))?;
    let target = lookup(to).ok_or_else(|| UnitError::Unknown(to.to_string()))?;
    if source.dimension != target.dimension {
        return Err(incompatible());
    }
    let base = value * source.scale + source.offset;
    Ok((base - target.offset) / target.scale)
}

/// Formats `value` for display.
///
/// `format` is `"0"`, `"0.0"`, `"0.00"`, ...; the number of digits after the point
/// picks the decimal places. Anything else falls back to the shortest form.
/// Locales whose language writes a decimal comma get one.
pub fn format_number(value: f64, format: &str, locale: &str) -> String {
    let text = match decimal_places(format) {
        Some(places) => format!("{value:.places$}"),
        None => format!("{value}"),
    };
    if uses_decimal_comma(locale) {
        text.replace('.', ",")
    } else {
        text
    }
}

fn decimal_places(format: &str) -> Option<usize> {
    let (int_part, frac_part) = match format.split_once('.') {
        Some((i, f)) => (i, f),
        None => (format, ""),
    };
    let valid = !int_part.is_empty()
        && int_part.chars().all(|c| c == '0' || c == '#')
        && frac_part.chars().all(|c| c == '0');
    valid.then_some(frac_part.len())
}

fn uses_decimal_comma(locale: &str) -> bool {
    let language = locale
        .split(['-', '_'])
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    COMMA_LANGUAGES.contains(&language.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn converts_within_a_dimension() {
        assert!(close(convert(36.0, "km/h", "m/s").unwrap(), 10.0));
        assert!(close(convert(100.0, "C", "F").unwrap(), 212.0));
        assert!(close(convert(32.0, "F", "K").unwrap(), 273.15));
        assert!(close(convert(2.0, "bar", "kPa").unwrap(), 200.0));
        assert!(close(convert(1.5, "min", "ms").unwrap(), 90_000.0));
        assert!(close(convert(1.0, "mi", "km").unwrap(), 1.609_344));
    }

    #[test]
    fn empty_target_keeps_value() {
        assert_eq!(convert(12.5, "m/s", ""), Ok(12.5));
        assert_eq!(convert(12.5, "", ""), Ok(12.5));
    }

    #[test]
    fn rejects_cross_dimension_and_unknown_units() {
        assert!(matches!(
            convert(1.0, "m/s", "bar"),
            Err(UnitError::Incompatible { .. })
        ));
        assert!(matches!(
            convert(1.0, "", "km/h"),
            Err(UnitError::Incompatible { .. })
        ));
        assert_eq!(
            convert(1.0, "m/s", "furlong/fortnight"),
            Err(UnitError::Unknown("furlong/fortnight".into()))
        );
    }

    #[test]
    fn aliases_resolve_to_canonical_codes() {
        assert_eq!(canonical("kph"), Some("km/h"));
        assert_eq!(canonical("degC"), Some("C"));
        assert_eq!(canonical("KPA"), Some("kPa"));
        assert_eq!(canonical("lightyear"), None);
    }

    #[test]
    fn formats_with_places_and_locale() {
        assert_eq!(format_number(120.0, "", ""), "120");
        assert_eq!(format_number(120.456, "0.0", ""), "120.5");
        assert_eq!(format_number(120.457, "0.00", "de-DE"), "120,46");
        assert_eq!(format_number(120.456, "0", "fr"), "120");
        assert_eq!(format_number(0.25, "", "en-US"), "0.25");
        assert_eq!(format_number(0.25, "weird", "pt_BR"), "0,25");
    }
}
