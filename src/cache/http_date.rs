//! IMF-fixdate handling for `Last-Modified` / `If-Modified-Since`.

use time::{
    OffsetDateTime, PrimitiveDateTime, UtcOffset, format_description::BorrowedFormatItem,
    macros::format_description,
};

const HTTP_DATE: &[BorrowedFormatItem<'static>] = format_description!(
    "[weekday repr:short], [day] [month repr:short] [year] [hour]:[minute]:[second] GMT"
);

/// Format a timestamp as an HTTP date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn format(value: OffsetDateTime) -> Option<String> {
    value.to_offset(UtcOffset::UTC).format(HTTP_DATE).ok()
}

/// Parse an HTTP date. Obsolete RFC 850 and asctime forms are not accepted.
pub fn parse(value: &str) -> Option<OffsetDateTime> {
    PrimitiveDateTime::parse(value.trim(), HTTP_DATE)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_imf_fixdate() {
        let value = datetime!(1994-11-06 08:49:37 UTC);
        assert_eq!(format(value).as_deref(), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
    }

    #[test]
    fn formats_in_utc_regardless_of_offset() {
        let value = datetime!(1994-11-06 10:49:37 +02:00);
        assert_eq!(format(value).as_deref(), Some("Sun, 06 Nov 1994 08:49:37 GMT"));
    }

    #[test]
    fn parses_what_it_formats() {
        let value = datetime!(2024-02-29 23:59:01 UTC);
        let text = format(value).expect("formattable");
        assert_eq!(parse(&text), Some(value));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse("yesterday"), None);
        assert_eq!(parse(""), None);
    }
}
