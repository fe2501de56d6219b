use crate::frame::FieldEncoding;
use crate::stream::decoder::DecodeError;
use crate::stream::predictor::{apply_prediction, PredictorCtx, Snapshot};
use crate::stream::{sign_extend, ByteStream};
use crate::FieldPredictor;

/// Decodes one frame payload into `snapshot.current`, walking the field
/// vectors and interleaving predictor application with the wire reads.
///
/// The increment predictor is resolved before any encoding dispatch and
/// consumes no wire bytes. With `raw` set, every other predictor is forced
/// to `None` so the stored values are the wire deltas themselves.
pub(crate) fn decode_frame(
    stream: &mut ByteStream<'_>,
    predictors: &[FieldPredictor],
    encodings: &[FieldEncoding],
    data_version: u8,
    ctx: &PredictorCtx<'_>,
    snapshot: &mut Snapshot<'_>,
    skipped_frames: u32,
    raw: bool,
) -> Result<(), DecodeError> {
    let count = snapshot.current.len();
    let mut values = [0i32; 8];

    let mut i = 0;
    while i < count {
        if predictors[i] == FieldPredictor::Increment {
            let base = snapshot.previous.map(|previous| previous[i]).unwrap_or(0);
            snapshot.current[i] = base.wrapping_add(skipped_frames as i32).wrapping_add(1);
            i += 1;
            continue;
        }

        let value = match encodings[i] {
            FieldEncoding::SignedVB => stream.read_signed_vb()?,
            FieldEncoding::UnsignedVB => stream.read_unsigned_vb()? as i32,
            FieldEncoding::Negative14BitVB => {
                let wide = stream.read_unsigned_vb()?;
                -sign_extend((wide & 0x3FFF) as i32, 14)
            }
            FieldEncoding::Null => 0,
            FieldEncoding::Tag8_4S16 => {
                if data_version < 2 {
                    stream.read_tag8_4s16_v1(&mut values)?;
                } else {
                    stream.read_tag8_4s16_v2(&mut values)?;
                }
                i = apply_group(&values[..4], i, predictors, ctx, snapshot, raw)?;
                continue;
            }
            FieldEncoding::Tag2_3S32 => {
                stream.read_tag2_3s32(&mut values)?;
                i = apply_group(&values[..3], i, predictors, ctx, snapshot, raw)?;
                continue;
            }
            FieldEncoding::Tag8_8SVB => {
                // The group spans the run of consecutive fields sharing
                // this encoding, capped at eight.
                let mut group = 1;
                while group < 8
                    && i + group < count
                    && encodings[i + group] == FieldEncoding::Tag8_8SVB
                {
                    group += 1;
                }
                stream.read_tag8_8svb(&mut values, group)?;
                i = apply_group(&values[..group], i, predictors, ctx, snapshot, raw)?;
                continue;
            }
            FieldEncoding::Unknown(id) => return Err(DecodeError::UnsupportedEncoding(id)),
        };

        let predictor = if raw { FieldPredictor::None } else { predictors[i] };
        snapshot.current[i] = apply_prediction(
            predictor,
            value,
            i,
            snapshot.current,
            snapshot.previous,
            snapshot.previous_2,
            ctx,
        )?;
        i += 1;
    }

    Ok(())
}

fn apply_group(
    values: &[i32],
    mut i: usize,
    predictors: &[FieldPredictor],
    ctx: &PredictorCtx<'_>,
    snapshot: &mut Snapshot<'_>,
    raw: bool,
) -> Result<usize, DecodeError> {
    let count = snapshot.current.len();
    for value in values.iter().copied() {
        if i >= count {
            break;
        }
        let predictor = if raw { FieldPredictor::None } else { predictors[i] };
        snapshot.current[i] = apply_prediction(
            predictor,
            value,
            i,
            snapshot.current,
            snapshot.previous,
            snapshot.previous_2,
            ctx,
        )?;
        i += 1;
    }
    Ok(i)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::header::SysConfig;

    fn ctx(sys: &SysConfig) -> PredictorCtx<'_> {
        PredictorCtx {
            sys,
            motor0_ix: None,
            home0_ix: None,
            home1_ix: None,
            gps_home: None,
            last_main_frame_time: -1,
        }
    }

    #[test]
    fn increment_shortcut_reads_no_bytes() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys);
        let data = [2u8];
        let mut stream = ByteStream::new(&data);
        let mut current = vec![0i32; 2];
        let previous = vec![100i32, 7];
        let mut snapshot = Snapshot {
            current: &mut current,
            previous: Some(&previous),
            previous_2: Some(&previous),
        };
        decode_frame(
            &mut stream,
            &[FieldPredictor::Increment, FieldPredictor::Previous],
            &[FieldEncoding::Null, FieldEncoding::SignedVB],
            2,
            &ctx,
            &mut snapshot,
            3,
            false,
        )
        .unwrap();
        assert_eq!(current, vec![104, 8]);
        assert_eq!(stream.pos(), 1);
    }

    #[test]
    fn svb_group_run_is_bounded_by_encoding_change() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys);
        // Group of two signed VBs behind a selector, then one bare signed VB.
        let data = [0b0000_0011u8, 2, 4, 6];
        let mut stream = ByteStream::new(&data);
        let mut current = vec![0i32; 3];
        let mut snapshot = Snapshot {
            current: &mut current,
            previous: None,
            previous_2: None,
        };
        decode_frame(
            &mut stream,
            &[FieldPredictor::None; 3],
            &[
                FieldEncoding::Tag8_8SVB,
                FieldEncoding::Tag8_8SVB,
                FieldEncoding::SignedVB,
            ],
            2,
            &ctx,
            &mut snapshot,
            0,
            false,
        )
        .unwrap();
        assert_eq!(current, vec![1, 2, 3]);
    }

    #[test]
    fn unknown_encoding_is_fatal() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys);
        let data = [0u8];
        let mut stream = ByteStream::new(&data);
        let mut current = vec![0i32; 1];
        let mut snapshot = Snapshot {
            current: &mut current,
            previous: None,
            previous_2: None,
        };
        let err = decode_frame(
            &mut stream,
            &[FieldPredictor::None],
            &[FieldEncoding::Unknown(10)],
            2,
            &ctx,
            &mut snapshot,
            0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::UnsupportedEncoding(10)));
    }

    #[test]
    fn raw_mode_suppresses_predictors_but_not_increment() {
        let sys = SysConfig::default();
        let ctx = ctx(&sys);
        let data = [9u8];
        let mut stream = ByteStream::new(&data);
        let mut current = vec![0i32; 2];
        let previous = vec![50i32, 1000];
        let mut snapshot = Snapshot {
            current: &mut current,
            previous: Some(&previous),
            previous_2: Some(&previous),
        };
        decode_frame(
            &mut stream,
            &[FieldPredictor::Increment, FieldPredictor::Previous],
            &[FieldEncoding::Null, FieldEncoding::SignedVB],
            2,
            &ctx,
            &mut snapshot,
            0,
            true,
        )
        .unwrap();
        // Iteration still advances; the delta stays a wire value.
        assert_eq!(current, vec![51, -5]);
    }
}
