use log::{debug, warn};
use thiserror::Error;

use crate::frame::event::{parse_event, LogEvent};
use crate::frame::FrameKind;
use crate::stream::data::decode_frame;
use crate::stream::header::{parse_headers, Header, HeaderError, SysConfig};
use crate::stream::predictor::{GpsHomeHistory, MainHistory, PredictorCtx, Snapshot};
use crate::stream::stats::Stats;
use crate::stream::{ByteStream, UnexpectedEof};
use crate::FieldPredictor;

/// Longest frame the wire format can produce, lookahead byte included;
/// anything larger is treated as corruption.
pub const MAX_FRAME_LENGTH: usize = 256;

/// Largest credible iteration advance between consecutive main frames.
pub const MAX_ITERATION_JUMP: i64 = 5_000;

/// Largest credible time advance between consecutive main frames, in
/// microseconds.
pub const MAX_TIME_JUMP: i64 = 10_000_000;

/// Index of the loop-iteration counter within a main frame.
pub const MAIN_FIELD_ITERATION: usize = 0;

/// Index of the timestamp within a main frame.
pub const MAIN_FIELD_TIME: usize = 1;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("log header must be parsed before log data")]
    HeaderNotParsed,
    #[error("unsupported field encoding {0}")]
    UnsupportedEncoding(u16),
    #[error("unsupported field predictor {0:?}")]
    UnsupportedPredictor(FieldPredictor),
    #[error("prediction references the {0} field, which this log does not define")]
    MissingPredictorField(&'static str),
    #[error("prediction references GPS home frames, which this log does not define")]
    MissingGpsHomeDefinition,
    #[error(transparent)]
    UnexpectedEof(#[from] UnexpectedEof),
}

/// Payload handed to the frame sink. The borrowed data lives in the
/// decoder's history slots and is only valid for the duration of the call.
#[derive(Clone, Copy, Debug)]
pub enum FrameData<'a> {
    Fields(&'a [i32]),
    Event(&'a LogEvent),
}

#[derive(Clone, Copy, Debug)]
pub struct FrameNotification<'a> {
    pub valid: bool,
    pub kind: FrameKind,
    /// `None` for corrupt or desynced frames.
    pub data: Option<FrameData<'a>>,
    /// Byte offset of the frame's tag within the log buffer.
    pub offset: usize,
    /// Frame extent as discovered by the scan, lookahead byte included.
    pub size: usize,
}

/// Blackbox log decoder over a caller-owned byte buffer.
///
/// Drive it with [`LogDecoder::parse_header`] followed by
/// [`LogDecoder::parse_log_data`]; decoded frames are delivered to the
/// sink callback exactly once each, in file order, corrupt frames
/// included.
pub struct LogDecoder<'a> {
    data: &'a [u8],
    header: Option<Header>,
    main_history: MainHistory,
    gps_home: GpsHomeHistory,
    gps_frame: Vec<i32>,
    last_event: Option<LogEvent>,
    last_main_frame_iteration: i64,
    last_main_frame_time: i64,
    main_stream_is_valid: bool,
    gps_home_is_valid: bool,
    last_skipped_frames: u32,
    stats: Stats,
    data_start: usize,
}

impl<'a> LogDecoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            header: None,
            main_history: MainHistory::with_size(0),
            gps_home: GpsHomeHistory::with_size(0),
            gps_frame: Vec::new(),
            last_event: None,
            last_main_frame_iteration: -1,
            last_main_frame_time: -1,
            main_stream_is_valid: false,
            gps_home_is_valid: false,
            last_skipped_frames: 0,
            stats: Stats::default(),
            data_start: 0,
        }
    }

    pub fn header(&self) -> Option<&Header> {
        self.header.as_ref()
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Parses the `H ` header lines in `[start, end)` (defaulting to the
    /// whole buffer), builds the frame schema and allocates the history
    /// rings. All previous decoder state is discarded.
    pub fn parse_header(
        &mut self,
        start: Option<usize>,
        end: Option<usize>,
    ) -> Result<(), HeaderError> {
        let end = end.unwrap_or(self.data.len()).min(self.data.len());
        let start = start.unwrap_or(0).min(end);

        let (consumed, header) = parse_headers(&self.data[start..end])?;

        self.data_start = start + consumed;
        self.main_history = MainHistory::with_size(header.main_field_count());
        self.gps_home = GpsHomeHistory::with_size(header.gps_home_field_count());
        self.gps_frame = vec![0; header.gps_field_count()];
        self.stats = Stats::default();
        self.stats.resize_fields(header.main_field_count());
        self.header = Some(header);
        self.reset_tracking();
        Ok(())
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
    }

    /// Clears tracking state, history validity and statistics so the same
    /// log section (or another one) can be reparsed; the parsed schema is
    /// kept.
    pub fn reset_state(&mut self) {
        self.reset_tracking();
        self.stats.reset();
    }

    fn reset_tracking(&mut self) {
        self.last_main_frame_iteration = -1;
        self.last_main_frame_time = -1;
        self.main_stream_is_valid = false;
        self.gps_home_is_valid = false;
        self.last_skipped_frames = 0;
        self.last_event = None;
        self.main_history.invalidate();
    }

    /// Decodes the binary frame section in `[start, end)` (defaulting to
    /// everything after the header), delivering one notification per
    /// frame. With `raw` set, decoded values are the wire deltas before
    /// predictor application.
    ///
    /// Tracking state and history carry over between calls, so a log may
    /// be decoded in consecutive sub-ranges under one parsed header. To
    /// start over instead, reset explicitly with
    /// [`LogDecoder::reset_state`] or [`LogDecoder::parse_header`].
    ///
    /// `Ok(())` is normal termination, including a log-end marker cutting
    /// the range short. Corruption never fails the parse; only schema
    /// errors do.
    pub fn parse_log_data<F>(
        &mut self,
        raw: bool,
        start: Option<usize>,
        end: Option<usize>,
        mut on_frame: F,
    ) -> Result<(), DecodeError>
    where
        F: FnMut(FrameNotification<'_>),
    {
        if self.header.is_none() {
            return Err(DecodeError::HeaderNotParsed);
        }

        let mut stream = ByteStream::new(self.data);
        stream.set_range(
            start.unwrap_or(self.data_start),
            end.unwrap_or(self.data.len()),
        );

        let mut frame_start = stream.start();
        let mut pending: Option<FrameKind> = None;
        let mut premature_eof = false;

        loop {
            let command = stream.read_char();

            if let Some(kind) = pending {
                let size = stream.pos() - frame_start;
                let completed = command.and_then(FrameKind::from_tag).is_some()
                    || (!premature_eof && command.is_none());

                if size <= MAX_FRAME_LENGTH && completed {
                    let accepted = self.complete_frame(kind, frame_start, size, raw, &mut on_frame);
                    let frame_stats = self.stats.frame_mut(kind);
                    if accepted {
                        frame_stats.record_size(size);
                        frame_stats.valid_count += 1;
                    } else {
                        frame_stats.desync_count += 1;
                    }
                } else {
                    warn!(
                        "corrupt {} frame at offset {}, resynchronizing",
                        kind.tag(),
                        frame_start
                    );
                    let frame_stats = self.stats.frame_mut(kind);
                    frame_stats.record_size(size);
                    frame_stats.corrupt_count += 1;
                    self.stats.total_corrupt_frames += 1;
                    self.main_stream_is_valid = false;
                    on_frame(FrameNotification {
                        valid: false,
                        kind,
                        data: None,
                        offset: frame_start,
                        size,
                    });
                    // Resume the scan one byte past the corrupt frame's
                    // start: if the frame was merely truncated, the next
                    // real frame is somewhere inside the range just
                    // consumed.
                    stream.set_pos(frame_start + 1);
                    pending = None;
                    premature_eof = false;
                    continue;
                }
                pending = None;
            }

            let command = match command {
                Some(command) => command,
                None => break,
            };

            frame_start = stream.pos() - 1;
            match FrameKind::from_tag(command) {
                Some(kind) => {
                    match self.parse_frame_body(kind, &mut stream, raw) {
                        Ok(()) => {}
                        Err(DecodeError::UnexpectedEof(_)) => {}
                        Err(fatal) => return Err(fatal),
                    }
                    if stream.eof() {
                        premature_eof = true;
                    }
                    pending = Some(kind);
                }
                None => {
                    debug!("unknown frame tag 0x{:02X} at offset {}", command, frame_start);
                    self.main_stream_is_valid = false;
                }
            }
        }

        self.stats.total_bytes += (stream.end() - stream.start()) as u64;
        Ok(())
    }

    fn parse_frame_body(
        &mut self,
        kind: FrameKind,
        stream: &mut ByteStream<'_>,
        raw: bool,
    ) -> Result<(), DecodeError> {
        let Self {
            header,
            main_history,
            gps_home,
            gps_frame,
            last_event,
            last_main_frame_iteration,
            last_main_frame_time,
            last_skipped_frames,
            ..
        } = self;
        let header = match header.as_ref() {
            Some(header) => header,
            None => return Err(DecodeError::HeaderNotParsed),
        };
        let sys = &header.sys_config;

        match kind {
            FrameKind::Intra => {
                let ctx = PredictorCtx {
                    sys,
                    motor0_ix: header.motor0_ix,
                    home0_ix: header.home0_ix,
                    home1_ix: header.home1_ix,
                    gps_home: header.gps_home_def.as_ref().map(|_| gps_home.last()),
                    last_main_frame_time: *last_main_frame_time,
                };
                let mut snapshot = main_history.snapshot_intra();
                decode_frame(
                    stream,
                    &header.main_def.predictors,
                    &header.main_def.encodings,
                    sys.data_version,
                    &ctx,
                    &mut snapshot,
                    0,
                    raw,
                )
            }
            FrameKind::Inter => {
                *last_skipped_frames = count_skipped_forward(*last_main_frame_iteration, sys);
                let ctx = PredictorCtx {
                    sys,
                    motor0_ix: header.motor0_ix,
                    home0_ix: header.home0_ix,
                    home1_ix: header.home1_ix,
                    gps_home: header.gps_home_def.as_ref().map(|_| gps_home.last()),
                    last_main_frame_time: *last_main_frame_time,
                };
                let mut snapshot = main_history.snapshot_inter();
                decode_frame(
                    stream,
                    &header.inter_def.predictors,
                    &header.inter_def.encodings,
                    sys.data_version,
                    &ctx,
                    &mut snapshot,
                    *last_skipped_frames,
                    raw,
                )
            }
            FrameKind::Gps => match header.gps_def.as_ref() {
                Some(def) => {
                    let ctx = PredictorCtx {
                        sys,
                        motor0_ix: header.motor0_ix,
                        home0_ix: header.home0_ix,
                        home1_ix: header.home1_ix,
                        gps_home: header.gps_home_def.as_ref().map(|_| gps_home.last()),
                        last_main_frame_time: *last_main_frame_time,
                    };
                    let mut snapshot = Snapshot {
                        current: gps_frame.as_mut_slice(),
                        previous: None,
                        previous_2: None,
                    };
                    decode_frame(
                        stream,
                        &def.predictors,
                        &def.encodings,
                        sys.data_version,
                        &ctx,
                        &mut snapshot,
                        0,
                        raw,
                    )
                }
                None => Ok(()),
            },
            FrameKind::GpsHome => match header.gps_home_def.as_ref() {
                Some(def) => {
                    let (write, last) = gps_home.split();
                    let ctx = PredictorCtx {
                        sys,
                        motor0_ix: header.motor0_ix,
                        home0_ix: header.home0_ix,
                        home1_ix: header.home1_ix,
                        gps_home: Some(last),
                        last_main_frame_time: *last_main_frame_time,
                    };
                    let mut snapshot = Snapshot {
                        current: write,
                        previous: None,
                        previous_2: None,
                    };
                    decode_frame(
                        stream,
                        &def.predictors,
                        &def.encodings,
                        sys.data_version,
                        &ctx,
                        &mut snapshot,
                        0,
                        raw,
                    )
                }
                None => Ok(()),
            },
            FrameKind::Event => {
                *last_event = None;
                if let Some(event) = parse_event(stream)? {
                    *last_event = Some(event);
                }
                Ok(())
            }
        }
    }

    /// Runs the completion routine for a frame whose end was just
    /// discovered. `false` means the frame is rejected as a desync (it
    /// consumed bytes but carried nothing usable).
    fn complete_frame<F>(
        &mut self,
        kind: FrameKind,
        offset: usize,
        size: usize,
        raw: bool,
        on_frame: &mut F,
    ) -> bool
    where
        F: FnMut(FrameNotification<'_>),
    {
        match kind {
            FrameKind::Intra => self.complete_intra(offset, size, raw, on_frame),
            FrameKind::Inter => self.complete_inter(offset, size, raw, on_frame),
            FrameKind::Gps => self.complete_gps(offset, size, on_frame),
            FrameKind::GpsHome => self.complete_gps_home(offset, size, on_frame),
            FrameKind::Event => self.complete_event(offset, size, on_frame),
        }
    }

    fn complete_intra<F>(&mut self, offset: usize, size: usize, raw: bool, on_frame: &mut F) -> bool
    where
        F: FnMut(FrameNotification<'_>),
    {
        let Self {
            header,
            main_history,
            stats,
            last_main_frame_iteration,
            last_main_frame_time,
            main_stream_is_valid,
            ..
        } = self;
        let sys = match header.as_ref() {
            Some(header) => &header.sys_config,
            None => return false,
        };

        let iteration = tracking_value(main_history.current(), MAIN_FIELD_ITERATION);
        let time = tracking_value(main_history.current(), MAIN_FIELD_TIME);

        // An intra frame is self-contained, but when history exists it
        // still has to line up with it.
        let mut accept = true;
        if !raw && *last_main_frame_iteration != -1 {
            accept = iteration > *last_main_frame_iteration
                && iteration < *last_main_frame_iteration + MAX_ITERATION_JUMP
                && time >= *last_main_frame_time
                && time < *last_main_frame_time + MAX_TIME_JUMP;
        }

        if accept {
            stats.intentionally_absent_iterations +=
                count_skipped_to(*last_main_frame_iteration, iteration, sys);
            *last_main_frame_iteration = iteration;
            *last_main_frame_time = time;
            *main_stream_is_valid = true;
            stats.observe_fields(main_history.current());
        } else {
            *main_stream_is_valid = false;
            main_history.invalidate();
        }

        on_frame(FrameNotification {
            valid: *main_stream_is_valid,
            kind: FrameKind::Intra,
            data: Some(FrameData::Fields(main_history.current())),
            offset,
            size,
        });

        // Whatever the verdict, this frame is the oldest history any
        // following inter frame may reach.
        main_history.advance_intra();
        true
    }

    fn complete_inter<F>(&mut self, offset: usize, size: usize, raw: bool, on_frame: &mut F) -> bool
    where
        F: FnMut(FrameNotification<'_>),
    {
        let Self {
            main_history,
            stats,
            last_main_frame_iteration,
            last_main_frame_time,
            last_skipped_frames,
            main_stream_is_valid,
            ..
        } = self;

        let iteration = tracking_value(main_history.current(), MAIN_FIELD_ITERATION);
        let time = tracking_value(main_history.current(), MAIN_FIELD_TIME);

        if *main_stream_is_valid
            && !raw
            && (time < *last_main_frame_time
                || time > *last_main_frame_time + MAX_TIME_JUMP
                || iteration < *last_main_frame_iteration
                || iteration > *last_main_frame_iteration + MAX_ITERATION_JUMP)
        {
            *main_stream_is_valid = false;
        }

        if *main_stream_is_valid {
            *last_main_frame_iteration = iteration;
            *last_main_frame_time = time;
            stats.intentionally_absent_iterations += *last_skipped_frames as u64;
            stats.observe_fields(main_history.current());
        }

        // An inter frame cannot resynchronize the stream, so it never sets
        // the valid flag, only clears it.
        on_frame(FrameNotification {
            valid: *main_stream_is_valid,
            kind: FrameKind::Inter,
            data: Some(FrameData::Fields(main_history.current())),
            offset,
            size,
        });

        if *main_stream_is_valid {
            main_history.advance_inter();
        }
        true
    }

    fn complete_gps<F>(&mut self, offset: usize, size: usize, on_frame: &mut F) -> bool
    where
        F: FnMut(FrameNotification<'_>),
    {
        match self.header.as_ref() {
            Some(header) if header.gps_def.is_some() => {}
            _ => return false,
        }

        // GPS positions are deltas against home, so they are only
        // meaningful once a home frame has arrived.
        on_frame(FrameNotification {
            valid: self.gps_home_is_valid,
            kind: FrameKind::Gps,
            data: Some(FrameData::Fields(&self.gps_frame)),
            offset,
            size,
        });
        true
    }

    fn complete_gps_home<F>(&mut self, offset: usize, size: usize, on_frame: &mut F) -> bool
    where
        F: FnMut(FrameNotification<'_>),
    {
        match self.header.as_ref() {
            Some(header) if header.gps_home_def.is_some() => {}
            _ => return false,
        }

        self.gps_home.commit();
        self.gps_home_is_valid = true;

        on_frame(FrameNotification {
            valid: true,
            kind: FrameKind::GpsHome,
            data: Some(FrameData::Fields(self.gps_home.last())),
            offset,
            size,
        });
        true
    }

    fn complete_event<F>(&mut self, offset: usize, size: usize, on_frame: &mut F) -> bool
    where
        F: FnMut(FrameNotification<'_>),
    {
        match self.last_event.as_ref() {
            Some(event) => {
                on_frame(FrameNotification {
                    valid: true,
                    kind: FrameKind::Event,
                    data: Some(FrameData::Event(event)),
                    offset,
                    size,
                });
                true
            }
            None => {
                on_frame(FrameNotification {
                    valid: false,
                    kind: FrameKind::Event,
                    data: None,
                    offset,
                    size,
                });
                false
            }
        }
    }
}

fn tracking_value(values: &[i32], ix: usize) -> i64 {
    // Iteration and time are unsigned on the wire; widen them so the full
    // range orders correctly against the -1 "no frame yet" sentinel.
    values.get(ix).map(|&value| value as u32 as i64).unwrap_or(0)
}

/// Whether the logger's sampling configuration records a frame for this
/// iteration at all.
pub(crate) fn should_have_frame(iteration: i64, sys: &SysConfig) -> bool {
    let interval_i = sys.frame_interval_i as i64;
    let num = *sys.frame_interval_p.numer() as i64;
    let denom = *sys.frame_interval_p.denom() as i64;
    (iteration % interval_i + num - 1) % denom < num
}

/// Length of the run of intentionally unlogged iterations following
/// `last_iteration`.
fn count_skipped_forward(last_iteration: i64, sys: &SysConfig) -> u32 {
    if last_iteration == -1 {
        return 0;
    }
    let mut count = 0;
    let mut iteration = last_iteration + 1;
    while !should_have_frame(iteration, sys) {
        count += 1;
        iteration += 1;
    }
    count
}

/// Number of intentionally unlogged iterations strictly between
/// `last_iteration` and `target`.
fn count_skipped_to(last_iteration: i64, target: i64, sys: &SysConfig) -> u64 {
    if last_iteration == -1 {
        return 0;
    }
    let mut count = 0;
    for iteration in (last_iteration + 1)..target {
        if !should_have_frame(iteration, sys) {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_rational::Ratio;

    fn sys(interval_i: u16, num: u16, denom: u16) -> SysConfig {
        SysConfig {
            frame_interval_i: interval_i,
            frame_interval_p: Ratio::new_raw(num, denom),
            ..SysConfig::default()
        }
    }

    #[test]
    fn full_rate_logs_skip_nothing() {
        let sys = sys(32, 1, 1);
        for iteration in 0..100 {
            assert!(should_have_frame(iteration, &sys));
        }
        assert_eq!(count_skipped_forward(10, &sys), 0);
        assert_eq!(count_skipped_to(10, 20, &sys), 0);
    }

    #[test]
    fn half_rate_log_skips_odd_iterations() {
        let sys = sys(32, 1, 2);
        assert!(should_have_frame(0, &sys));
        assert!(!should_have_frame(1, &sys));
        assert!(should_have_frame(2, &sys));
        assert_eq!(count_skipped_forward(100, &sys), 1);
        // (100, 104): iterations 101 and 103 are absent.
        assert_eq!(count_skipped_to(100, 104, &sys), 2);
    }

    #[test]
    fn quarter_rate_runs_of_skips() {
        let sys = sys(32, 1, 4);
        assert!(should_have_frame(0, &sys));
        assert!(!should_have_frame(1, &sys));
        assert!(!should_have_frame(2, &sys));
        assert!(!should_have_frame(3, &sys));
        assert!(should_have_frame(4, &sys));
        assert_eq!(count_skipped_forward(100, &sys), 3);
    }

    #[test]
    fn no_counting_before_the_first_frame() {
        let sys = sys(32, 1, 4);
        assert_eq!(count_skipped_forward(-1, &sys), 0);
        assert_eq!(count_skipped_to(-1, 1000, &sys), 0);
    }

    #[test]
    fn two_of_four_sampling_pattern() {
        let sys = sys(32, 2, 4);
        // (i % 32 + 1) % 4 < 2 picks two of every four iterations.
        let pattern: Vec<bool> = (0..8).map(|i| should_have_frame(i, &sys)).collect();
        assert_eq!(
            pattern,
            vec![true, false, false, true, true, false, false, true]
        );
    }
}
