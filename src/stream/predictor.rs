use crate::stream::decoder::DecodeError;
use crate::stream::header::SysConfig;
use crate::FieldPredictor;

/// Rotating main-frame history: two history buffers plus the write slot,
/// rotated by index so no decoded frame is ever moved. History may be
/// absent (after a reset or a rejected frame); predictors that reference
/// absent history become no-ops.
pub(crate) struct MainHistory {
    history: [Vec<i32>; 2],
    current: Vec<i32>,
    previous_ix: usize,
    previous_2_ix: usize,
    valid: bool,
}

pub(crate) struct Snapshot<'a> {
    pub current: &'a mut [i32],
    pub previous: Option<&'a [i32]>,
    pub previous_2: Option<&'a [i32]>,
}

impl MainHistory {
    pub fn with_size(cap: usize) -> Self {
        Self {
            history: [vec![0; cap], vec![0; cap]],
            current: vec![0; cap],
            previous_ix: 0,
            previous_2_ix: 1,
            valid: false,
        }
    }

    pub fn current(&self) -> &[i32] {
        &self.current
    }

    /// Intra frames decode without history: they are the oldest state any
    /// predictor may reach.
    pub fn snapshot_intra(&mut self) -> Snapshot<'_> {
        Snapshot {
            current: &mut self.current,
            previous: None,
            previous_2: None,
        }
    }

    pub fn snapshot_inter(&mut self) -> Snapshot<'_> {
        let (previous, previous_2) = if self.valid {
            (
                Some(&self.history[self.previous_ix][..]),
                Some(&self.history[self.previous_2_ix][..]),
            )
        } else {
            (None, None)
        };
        Snapshot {
            current: &mut self.current,
            previous,
            previous_2,
        }
    }

    /// After an intra frame both history slots become that frame.
    pub fn advance_intra(&mut self) {
        let current = &self.current;
        self.history[0].copy_from_slice(current);
        self.history[1].copy_from_slice(current);
        self.valid = true;
    }

    /// After an accepted inter frame the old previous becomes
    /// previous-previous and the new frame becomes previous.
    pub fn advance_inter(&mut self) {
        std::mem::swap(&mut self.previous_ix, &mut self.previous_2_ix);
        self.history[self.previous_ix].copy_from_slice(&self.current);
    }

    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

/// Two-slot GPS home history: slot 0 receives the decoding in progress,
/// slot 1 holds the last complete home frame that predictors consult.
pub(crate) struct GpsHomeHistory {
    write: Vec<i32>,
    last: Vec<i32>,
}

impl GpsHomeHistory {
    pub fn with_size(cap: usize) -> Self {
        Self {
            write: vec![0; cap],
            last: vec![0; cap],
        }
    }

    pub fn split(&mut self) -> (&mut [i32], &[i32]) {
        (&mut self.write, &self.last)
    }

    pub fn last(&self) -> &[i32] {
        &self.last
    }

    pub fn commit(&mut self) {
        self.last.copy_from_slice(&self.write);
    }
}

/// Everything a predictor may consult besides the frame history.
pub(crate) struct PredictorCtx<'a> {
    pub sys: &'a SysConfig,
    pub motor0_ix: Option<usize>,
    pub home0_ix: Option<usize>,
    pub home1_ix: Option<usize>,
    /// `None` when the log defines no GPS home frames at all.
    pub gps_home: Option<&'a [i32]>,
    pub last_main_frame_time: i64,
}

/// Adds the predictor's correction to a raw wire value. Arithmetic wraps:
/// field values are 32-bit signed telemetry readings.
pub(crate) fn apply_prediction(
    predictor: FieldPredictor,
    value: i32,
    field_ix: usize,
    current: &[i32],
    previous: Option<&[i32]>,
    previous_2: Option<&[i32]>,
    ctx: &PredictorCtx<'_>,
) -> Result<i32, DecodeError> {
    let value = match predictor {
        FieldPredictor::None => value,
        FieldPredictor::Previous => match previous {
            Some(previous) => value.wrapping_add(previous[field_ix]),
            None => value,
        },
        FieldPredictor::StraightLine => match (previous, previous_2) {
            (Some(previous), Some(previous_2)) => value.wrapping_add(
                previous[field_ix]
                    .wrapping_mul(2)
                    .wrapping_sub(previous_2[field_ix]),
            ),
            _ => value,
        },
        FieldPredictor::Average2 => match (previous, previous_2) {
            (Some(previous), Some(previous_2)) => {
                // i64 sum, then native division: truncation toward zero is
                // load-bearing for negative sums.
                let sum = previous[field_ix] as i64 + previous_2[field_ix] as i64;
                value.wrapping_add((sum / 2) as i32)
            }
            _ => value,
        },
        FieldPredictor::MinThrottle => value.wrapping_add(ctx.sys.minthrottle),
        FieldPredictor::Around1500 => value.wrapping_add(1500),
        FieldPredictor::VBatRef => value.wrapping_add(ctx.sys.vbatref),
        FieldPredictor::Motor0 => {
            let ix = ctx
                .motor0_ix
                .ok_or(DecodeError::MissingPredictorField("motor[0]"))?;
            value.wrapping_add(current[ix])
        }
        FieldPredictor::HomeCoordinates => {
            let home = ctx.gps_home.ok_or(DecodeError::MissingGpsHomeDefinition)?;
            let ix = ctx
                .home0_ix
                .ok_or(DecodeError::MissingPredictorField("GPS_home[0]"))?;
            value.wrapping_add(home[ix])
        }
        FieldPredictor::HomeCoordinates1 => {
            let home = ctx.gps_home.ok_or(DecodeError::MissingGpsHomeDefinition)?;
            let ix = ctx
                .home1_ix
                .ok_or(DecodeError::MissingPredictorField("GPS_home[1]"))?;
            value.wrapping_add(home[ix])
        }
        FieldPredictor::LastMainFrameTime => {
            if ctx.last_main_frame_time != -1 {
                value.wrapping_add(ctx.last_main_frame_time as i32)
            } else {
                value
            }
        }
        // Increment is resolved by the frame decoder before any wire read;
        // reaching it here means the schema pairs it with a group encoding.
        FieldPredictor::Increment => return Err(DecodeError::UnsupportedPredictor(predictor)),
        FieldPredictor::Unknown(_) => return Err(DecodeError::UnsupportedPredictor(predictor)),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(sys: &'a SysConfig, home: Option<&'a [i32]>) -> PredictorCtx<'a> {
        PredictorCtx {
            sys,
            motor0_ix: Some(1),
            home0_ix: Some(0),
            home1_ix: Some(1),
            gps_home: home,
            last_main_frame_time: -1,
        }
    }

    #[test]
    fn average_2_truncates_toward_zero() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys, None);
        let previous = [-3i32];
        let previous_2 = [-2i32];
        let value = apply_prediction(
            FieldPredictor::Average2,
            0,
            0,
            &[],
            Some(&previous),
            Some(&previous_2),
            &ctx,
        )
        .unwrap();
        assert_eq!(value, -2);
    }

    #[test]
    fn straight_line_extrapolates() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys, None);
        let previous = [110i32];
        let previous_2 = [100i32];
        let value = apply_prediction(
            FieldPredictor::StraightLine,
            5,
            0,
            &[],
            Some(&previous),
            Some(&previous_2),
            &ctx,
        )
        .unwrap();
        assert_eq!(value, 125);
    }

    #[test]
    fn history_predictors_are_noops_without_history() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys, None);
        for predictor in [
            FieldPredictor::Previous,
            FieldPredictor::StraightLine,
            FieldPredictor::Average2,
        ]
        .iter()
        .copied()
        {
            let value = apply_prediction(predictor, 42, 0, &[], None, None, &ctx).unwrap();
            assert_eq!(value, 42);
        }
    }

    #[test]
    fn config_based_predictors() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys, None);
        let current = [0i32, 1400];
        assert_eq!(
            apply_prediction(FieldPredictor::MinThrottle, 10, 0, &current, None, None, &ctx)
                .unwrap(),
            1160
        );
        assert_eq!(
            apply_prediction(FieldPredictor::Around1500, -30, 0, &current, None, None, &ctx)
                .unwrap(),
            1470
        );
        assert_eq!(
            apply_prediction(FieldPredictor::VBatRef, 1, 0, &current, None, None, &ctx).unwrap(),
            4096
        );
        assert_eq!(
            apply_prediction(FieldPredictor::Motor0, 7, 0, &current, None, None, &ctx).unwrap(),
            1407
        );
    }

    #[test]
    fn missing_references_are_fatal() {
        let sys = SysConfig::default();
        let mut bad = ctx(&sys, None);
        bad.motor0_ix = None;
        assert!(matches!(
            apply_prediction(FieldPredictor::Motor0, 0, 0, &[], None, None, &bad),
            Err(DecodeError::MissingPredictorField("motor[0]"))
        ));
        assert!(matches!(
            apply_prediction(FieldPredictor::HomeCoordinates, 0, 0, &[], None, None, &bad),
            Err(DecodeError::MissingGpsHomeDefinition)
        ));
        assert!(matches!(
            apply_prediction(FieldPredictor::Unknown(12), 0, 0, &[], None, None, &bad),
            Err(DecodeError::UnsupportedPredictor(FieldPredictor::Unknown(12)))
        ));
    }

    #[test]
    fn home_coordinates_add_the_reference_slot() {
        let sys = SysConfig::default();
        let home = [37_000_000i32, -122_000_000];
        let ctx = ctx(&sys, Some(&home));
        assert_eq!(
            apply_prediction(FieldPredictor::HomeCoordinates, 5, 0, &[], None, None, &ctx)
                .unwrap(),
            37_000_005
        );
        assert_eq!(
            apply_prediction(FieldPredictor::HomeCoordinates1, 7, 0, &[], None, None, &ctx)
                .unwrap(),
            -121_999_993
        );
    }

    #[test]
    fn last_main_frame_time_requires_a_previous_frame() {
        let sys = SysConfig::default();
        let mut ctx = ctx(&sys, None);
        assert_eq!(
            apply_prediction(FieldPredictor::LastMainFrameTime, 9, 0, &[], None, None, &ctx)
                .unwrap(),
            9
        );
        ctx.last_main_frame_time = 1_000_000;
        assert_eq!(
            apply_prediction(FieldPredictor::LastMainFrameTime, 9, 0, &[], None, None, &ctx)
                .unwrap(),
            1_000_009
        );
    }

    #[test]
    fn history_rotation() {
        let mut history = MainHistory::with_size(1);
        {
            let snapshot = history.snapshot_inter();
            assert!(snapshot.previous.is_none());
        }
        history.current[0] = 10;
        history.advance_intra();
        {
            let snapshot = history.snapshot_inter();
            assert_eq!(snapshot.previous, Some(&[10i32][..]));
            assert_eq!(snapshot.previous_2, Some(&[10i32][..]));
        }
        history.current[0] = 20;
        history.advance_inter();
        {
            let snapshot = history.snapshot_inter();
            assert_eq!(snapshot.previous, Some(&[20i32][..]));
            assert_eq!(snapshot.previous_2, Some(&[10i32][..]));
        }
        history.invalidate();
        assert!(history.snapshot_inter().previous.is_none());
    }
}
