use chrono::{DateTime, NaiveDateTime, Utc};
use nom::{
    bytes::complete::tag,
    error::{Error, ErrorKind, ParseError},
    IResult,
};

use crate::frame::FieldEncoding;
use crate::stream::header::MAX_HEADER_LINE_LENGTH;
use crate::FieldPredictor;

/// One parsed `H <key>:<value>` line. Unrecognized keys and values that
/// fail to parse degrade to `Other` so a single odd line cannot end the
/// header early.
#[derive(Debug, PartialEq)]
pub(crate) enum HeaderFrame<'f> {
    Product(&'f str),
    DataVersion(u8),
    FirmwareType(&'f str),
    FirmwareRevision(&'f str),
    FirmwareDate(DateTime<Utc>),
    LogStartDatetime(DateTime<Utc>),
    CraftName(&'f str),
    IInterval(i32),
    PInterval(u16, u16),
    FieldIName(Vec<&'f str>),
    FieldISigned(Vec<bool>),
    FieldIPredictor(Vec<FieldPredictor>),
    FieldIEncoding(Vec<FieldEncoding>),
    FieldPPredictor(Vec<FieldPredictor>),
    FieldPEncoding(Vec<FieldEncoding>),
    FieldGName(Vec<&'f str>),
    FieldGPredictor(Vec<FieldPredictor>),
    FieldGEncoding(Vec<FieldEncoding>),
    FieldHName(Vec<&'f str>),
    FieldHPredictor(Vec<FieldPredictor>),
    FieldHEncoding(Vec<FieldEncoding>),
    MinThrottle(i32),
    MaxThrottle(i32),
    RcRate(i32),
    VBatScale(i32),
    VBatRef(i32),
    Acc1G(i32),
    VBatCellVoltage { min: i32, warning: i32, max: i32 },
    CurrentMeter { offset: i32, scale: i32 },
    GyroScale(f32),
    Other(&'f str, &'f str),
}

/// Parses one header line: `H ` followed by up to 1024 bytes bounded by a
/// newline or NUL. The `H` tag byte doubles as the GPS-home frame marker,
/// so the space is what commits this parser to a header line.
pub(crate) fn parse_header_line(input: &[u8]) -> IResult<&[u8], HeaderFrame<'_>> {
    let (input, _) = tag("H ")(input)?;
    let (input, line) = take_line(input)?;
    let line = std::str::from_utf8(line)
        .map_err(|_| nom::Err::Error(Error::from_error_kind(input, ErrorKind::Char)))?;

    let (name, value) = match line.find(':') {
        Some(ix) => (&line[..ix], &line[ix + 1..]),
        None => (line, ""),
    };

    Ok((input, header_frame(name, value)))
}

fn take_line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let limit = input.len().min(MAX_HEADER_LINE_LENGTH);
    match input[..limit]
        .iter()
        .position(|&b| b == b'\n' || b == b'\0')
    {
        Some(ix) => Ok((&input[ix + 1..], &input[..ix])),
        None => Err(nom::Err::Error(Error::from_error_kind(
            input,
            ErrorKind::TakeUntil,
        ))),
    }
}

fn header_frame<'f>(name: &'f str, value: &'f str) -> HeaderFrame<'f> {
    let other = || HeaderFrame::Other(name, value);

    match name {
        "Product" => HeaderFrame::Product(value),
        "Data version" => int(value)
            .map(|v| HeaderFrame::DataVersion(v as u8))
            .unwrap_or_else(other),
        "Firmware type" => HeaderFrame::FirmwareType(value),
        "Firmware revision" => HeaderFrame::FirmwareRevision(value),
        "Firmware date" => date(value).map(HeaderFrame::FirmwareDate).unwrap_or_else(other),
        "Log start datetime" => date(value)
            .map(HeaderFrame::LogStartDatetime)
            .unwrap_or_else(other),
        "Craft name" => HeaderFrame::CraftName(value),
        "I interval" => int(value).map(HeaderFrame::IInterval).unwrap_or_else(other),
        "P interval" => ratio(value)
            .map(|(num, denom)| HeaderFrame::PInterval(num, denom))
            .unwrap_or_else(other),
        "Field I name" => HeaderFrame::FieldIName(name_list(value)),
        "Field I signed" => bool_list(value).map(HeaderFrame::FieldISigned).unwrap_or_else(other),
        "Field I predictor" => predictor_list(value)
            .map(HeaderFrame::FieldIPredictor)
            .unwrap_or_else(other),
        "Field I encoding" => encoding_list(value)
            .map(HeaderFrame::FieldIEncoding)
            .unwrap_or_else(other),
        "Field P predictor" => predictor_list(value)
            .map(HeaderFrame::FieldPPredictor)
            .unwrap_or_else(other),
        "Field P encoding" => encoding_list(value)
            .map(HeaderFrame::FieldPEncoding)
            .unwrap_or_else(other),
        "Field G name" => HeaderFrame::FieldGName(name_list(value)),
        "Field G predictor" => predictor_list(value)
            .map(HeaderFrame::FieldGPredictor)
            .unwrap_or_else(other),
        "Field G encoding" => encoding_list(value)
            .map(HeaderFrame::FieldGEncoding)
            .unwrap_or_else(other),
        "Field H name" => HeaderFrame::FieldHName(name_list(value)),
        "Field H predictor" => predictor_list(value)
            .map(HeaderFrame::FieldHPredictor)
            .unwrap_or_else(other),
        "Field H encoding" => encoding_list(value)
            .map(HeaderFrame::FieldHEncoding)
            .unwrap_or_else(other),
        "minthrottle" => int(value).map(HeaderFrame::MinThrottle).unwrap_or_else(other),
        "maxthrottle" => int(value).map(HeaderFrame::MaxThrottle).unwrap_or_else(other),
        "rcRate" => int(value).map(HeaderFrame::RcRate).unwrap_or_else(other),
        "vbatscale" => int(value).map(HeaderFrame::VBatScale).unwrap_or_else(other),
        "vbatref" => int(value).map(HeaderFrame::VBatRef).unwrap_or_else(other),
        "acc_1G" => int(value).map(HeaderFrame::Acc1G).unwrap_or_else(other),
        "vbatcellvoltage" => match int_list(value).as_deref() {
            Some([min, warning, max]) => HeaderFrame::VBatCellVoltage {
                min: *min,
                warning: *warning,
                max: *max,
            },
            _ => other(),
        },
        "currentMeter" => match int_list(value).as_deref() {
            Some([offset, scale]) => HeaderFrame::CurrentMeter {
                offset: *offset,
                scale: *scale,
            },
            _ => other(),
        },
        "gyro.scale" => hex_float(value).map(HeaderFrame::GyroScale).unwrap_or_else(other),
        _ => other(),
    }
}

fn int(value: &str) -> Option<i32> {
    value.trim().parse().ok()
}

fn int_list(value: &str) -> Option<Vec<i32>> {
    value.split(',').map(|part| part.trim().parse().ok()).collect()
}

fn name_list(value: &str) -> Vec<&str> {
    value.split(',').collect()
}

fn bool_list(value: &str) -> Option<Vec<bool>> {
    Some(int_list(value)?.into_iter().map(|v| v != 0).collect())
}

fn predictor_list(value: &str) -> Option<Vec<FieldPredictor>> {
    value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u16>()
                .ok()
                .map(FieldPredictor::from_wire_id)
        })
        .collect()
}

fn encoding_list(value: &str) -> Option<Vec<FieldEncoding>> {
    value
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<u16>()
                .ok()
                .map(FieldEncoding::from_wire_id)
        })
        .collect()
}

fn ratio(value: &str) -> Option<(u16, u16)> {
    let (num, denom) = value.trim().split_once('/')?;
    Some((num.parse().ok()?, denom.parse().ok()?))
}

fn hex_float(value: &str) -> Option<f32> {
    let digits = value.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    u32::from_str_radix(digits, 16).ok().map(f32::from_bits)
}

fn date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDateTime::parse_from_str(value, "%b %e %Y %H:%M:%S")
                .ok()
                .map(|naive| naive.and_utc())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &[u8]) -> HeaderFrame<'_> {
        let (rest, frame) = parse_header_line(line).unwrap();
        assert!(rest.is_empty());
        frame
    }

    #[test]
    fn field_definition_lines() {
        assert_eq!(
            parse(b"H Field I name:loopIteration,time\n"),
            HeaderFrame::FieldIName(vec!["loopIteration", "time"])
        );
        assert_eq!(
            parse(b"H Field I predictor:0,6\n"),
            HeaderFrame::FieldIPredictor(vec![
                FieldPredictor::None,
                FieldPredictor::Increment
            ])
        );
        assert_eq!(
            parse(b"H Field P encoding:9,0\n"),
            HeaderFrame::FieldPEncoding(vec![FieldEncoding::Null, FieldEncoding::SignedVB])
        );
        assert_eq!(
            parse(b"H Field I signed:0,1\n"),
            HeaderFrame::FieldISigned(vec![false, true])
        );
    }

    #[test]
    fn interval_and_scalar_lines() {
        assert_eq!(parse(b"H I interval:32\n"), HeaderFrame::IInterval(32));
        assert_eq!(parse(b"H P interval:1/4\n"), HeaderFrame::PInterval(1, 4));
        assert_eq!(parse(b"H minthrottle:1150\n"), HeaderFrame::MinThrottle(1150));
        assert_eq!(
            parse(b"H vbatcellvoltage:33,35,43\n"),
            HeaderFrame::VBatCellVoltage {
                min: 33,
                warning: 35,
                max: 43
            }
        );
        assert_eq!(
            parse(b"H currentMeter:0,400\n"),
            HeaderFrame::CurrentMeter { offset: 0, scale: 400 }
        );
    }

    #[test]
    fn gyro_scale_is_hex_float_bits() {
        match parse(b"H gyro.scale:0x3a83126f\n") {
            HeaderFrame::GyroScale(scale) => assert!((scale - 0.001).abs() < 1e-9),
            frame => panic!("unexpected {:?}", frame),
        }
    }

    #[test]
    fn malformed_values_degrade_to_other() {
        assert_eq!(
            parse(b"H P interval:128\n"),
            HeaderFrame::Other("P interval", "128")
        );
        assert_eq!(
            parse(b"H I interval:banana\n"),
            HeaderFrame::Other("I interval", "banana")
        );
        assert_eq!(
            parse(b"H Unknown key:whatever\n"),
            HeaderFrame::Other("Unknown key", "whatever")
        );
    }

    #[test]
    fn line_requires_space_after_tag() {
        // An `H` immediately followed by binary payload is a GPS-home
        // frame, not a header line.
        assert!(parse_header_line(b"H\x05\x07").is_err());
        assert!(parse_header_line(b"I\x01").is_err());
    }

    #[test]
    fn nul_terminates_a_line() {
        let (rest, frame) = parse_header_line(b"H Craft name:quad\0leftover").unwrap();
        assert_eq!(frame, HeaderFrame::CraftName("quad"));
        assert_eq!(rest, b"leftover");
    }

    #[test]
    fn unterminated_line_fails() {
        assert!(parse_header_line(b"H Craft name:quad").is_err());
    }
}
