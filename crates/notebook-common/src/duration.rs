//! Parsing for the duration strings used in job specs (`"30m"`, `"1h30m"`, `"90s"`)

use std::time::Duration;

use crate::Error;

/// Parse a compound duration such as `"15m"`, `"1h30m"` or `"45s"`.
///
/// Each segment is a non-negative integer followed by one of `h`, `m`, `s`
/// or `ms`. A bare number is interpreted as seconds.
pub fn parse_duration(s: &str) -> Result<Duration, Error> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::validation("empty duration string"));
    }

    if s.chars().all(|c| c.is_ascii_digit()) {
        let secs: u64 = s
            .parse()
            .map_err(|_| Error::validation(format!("invalid duration: {s}")))?;
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .char_indices()
            .find(|(_, c)| !c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        if digits == 0 {
            return Err(Error::validation(format!("invalid duration: {s}")));
        }
        let num: u64 = rest[..digits]
            .parse()
            .map_err(|_| Error::validation(format!("invalid number in duration: {s}")))?;
        rest = &rest[digits..];

        let unit_len = rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit())
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let segment = match &rest[..unit_len] {
            "ms" => Duration::from_millis(num),
            "s" => Duration::from_secs(num),
            "m" => Duration::from_secs(num.saturating_mul(60)),
            "h" => Duration::from_secs(num.saturating_mul(3600)),
            other => {
                return Err(Error::validation(format!(
                    "unknown duration unit '{other}' in {s}"
                )))
            }
        };
        total = total.saturating_add(segment);
        rest = &rest[unit_len..];
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
    }

    #[test]
    fn parses_compound_durations() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn bare_number_is_seconds() {
        assert_eq!(parse_duration("120").unwrap(), Duration::from_secs(120));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("m30").is_err());
        assert!(parse_duration("10x").is_err());
        assert!(parse_duration("ten minutes").is_err());
    }
}
