//! `Time ::= CHOICE { utcTime UTCTime, generalTime GeneralizedTime }`

use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};

use super::der::{encode_tlv, tag};
use super::errors::{CrlError, CrlResult};

const UTC_TIME_FORMAT: &str = "%y%m%d%H%M%S";
const GENERALIZED_TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Decode a UTCTime or GeneralizedTime given its tag and content octets
pub fn decode_time(tag: u8, content: &[u8]) -> CrlResult<DateTime<Utc>> {
    let text = std::str::from_utf8(content)
        .map_err(|_| CrlError::format("Time value is not ASCII"))?;
    let text = text
        .strip_suffix('Z')
        .ok_or_else(|| CrlError::format(format!("Time {text:?} is not in UTC")))?;

    let naive = match tag {
        tag::UTC_TIME => {
            let parsed = NaiveDateTime::parse_from_str(text, UTC_TIME_FORMAT)
                .map_err(|e| CrlError::format(format!("Invalid UTCTime {text:?}: {e}")))?;
            // RFC 5280 §4.1.2.5.1: YY >= 50 means 19YY
            if parsed.year() >= 2050 {
                parsed
                    .with_year(parsed.year() - 100)
                    .ok_or_else(|| CrlError::format(format!("Invalid UTCTime {text:?}")))?
            } else {
                parsed
            }
        }
        tag::GENERALIZED_TIME => {
            // Fractional seconds are tolerated on input and dropped
            let whole = text.split('.').next().unwrap_or(text);
            NaiveDateTime::parse_from_str(whole, GENERALIZED_TIME_FORMAT).map_err(|e| {
                CrlError::format(format!("Invalid GeneralizedTime {text:?}: {e}"))
            })?
        }
        other => {
            return Err(CrlError::format(format!(
                "Expected a time, found tag 0x{other:02X}"
            )));
        }
    };
    Ok(Utc.from_utc_datetime(&naive))
}

/// Encode per RFC 5280: UTCTime through 2049, GeneralizedTime afterwards.
/// Sub-second precision is dropped.
pub fn encode_time(time: &DateTime<Utc>) -> Vec<u8> {
    if (1950..2050).contains(&time.year()) {
        encode_tlv(
            tag::UTC_TIME,
            format!("{}Z", time.format(UTC_TIME_FORMAT)).as_bytes(),
        )
    } else {
        encode_tlv(
            tag::GENERALIZED_TIME,
            format!("{}Z", time.format(GENERALIZED_TIME_FORMAT)).as_bytes(),
        )
    }
}

pub fn is_time_tag(tag: u8) -> bool {
    tag == tag::UTC_TIME || tag == tag::GENERALIZED_TIME
}
