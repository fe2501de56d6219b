use log::warn;

use crate::stream::{ByteStream, UnexpectedEof};

/// Terminator literal carried by a log-end event.
pub const END_OF_LOG_MESSAGE: &[u8] = b"End of log\0";

#[derive(Clone, Debug, PartialEq)]
pub enum LogEvent {
    SyncBeep {
        time: u32,
    },
    AutotuneCycleStart {
        phase: u8,
        cycle: u8,
        rising: bool,
        p: u8,
        i: u8,
        d: u8,
    },
    AutotuneCycleResult {
        overshot: bool,
        p: u8,
        i: u8,
        d: u8,
    },
    /// Angles arrive in decidegrees and are stored in degrees.
    AutotuneTargets {
        current_angle: f32,
        target_angle: i8,
        target_angle_at_peak: i8,
        first_peak_angle: f32,
        second_peak_angle: f32,
    },
    LogEnd,
}

/// Reads one event payload. `None` means the event was discarded: an
/// unrecognized type, or a log-end header whose terminator literal did not
/// match (the bytes only looked like an event). A matching log-end clamps
/// the stream end so iteration stops at the marker.
pub(crate) fn parse_event(stream: &mut ByteStream<'_>) -> Result<Option<LogEvent>, UnexpectedEof> {
    let event_id = stream.read_byte()?;

    let event = match event_id {
        0 => Some(LogEvent::SyncBeep {
            time: stream.read_unsigned_vb()?,
        }),
        10 => {
            let phase = stream.read_byte()?;
            let cycle_and_rising = stream.read_byte()?;
            Some(LogEvent::AutotuneCycleStart {
                phase,
                cycle: cycle_and_rising & 0x7F,
                rising: cycle_and_rising & 0x80 != 0,
                p: stream.read_byte()?,
                i: stream.read_byte()?,
                d: stream.read_byte()?,
            })
        }
        11 => Some(LogEvent::AutotuneCycleResult {
            overshot: stream.read_byte()? != 0,
            p: stream.read_byte()?,
            i: stream.read_byte()?,
            d: stream.read_byte()?,
        }),
        12 => Some(LogEvent::AutotuneTargets {
            current_angle: stream.read_s16()? as f32 / 10.0,
            target_angle: stream.read_s8()?,
            target_angle_at_peak: stream.read_s8()?,
            first_peak_angle: stream.read_s16()? as f32 / 10.0,
            second_peak_angle: stream.read_s16()? as f32 / 10.0,
        }),
        255 => {
            let message = stream.read_string(END_OF_LOG_MESSAGE.len())?;
            if message == END_OF_LOG_MESSAGE {
                let pos = stream.pos();
                stream.set_end(pos);
                Some(LogEvent::LogEnd)
            } else {
                None
            }
        }
        id => {
            warn!("discarding unrecognized event type {}", id);
            None
        }
    };

    Ok(event)
}
