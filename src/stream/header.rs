use std::{
    collections::HashMap,
    convert::{TryFrom, TryInto},
    f32::consts::PI,
};

use chrono::{DateTime, Utc};
use itertools::izip;
use log::debug;
use nom::multi::fold_many0;
use num_rational::Ratio;
use thiserror::Error;

use crate::frame::header::{parse_header_line, HeaderFrame};
use crate::frame::FieldEncoding;
use crate::FieldPredictor;

/// Identification line that opens every log session; log-index collaborators
/// scan for it to locate session starts in multi-session files.
pub const LOG_HEADER_MARKER: &str = "H Product:Blackbox flight data recorder by Nicholas Sherlock";

/// Upper bound on a single `H <key>:<value>` header line, terminator included.
pub const MAX_HEADER_LINE_LENGTH: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FirmwareType {
    Unknown,
    Baseflight,
    Cleanflight,
}

impl Default for FirmwareType {
    fn default() -> Self {
        FirmwareType::Unknown
    }
}

/// System configuration snapshot taken from the header. Defaults reflect a
/// Baseflight-era controller and apply whenever a key is absent.
#[derive(Clone, Debug, PartialEq)]
pub struct SysConfig {
    pub frame_interval_i: u16,
    /// Inter-frame sampling fraction, kept unreduced: the sampling
    /// arithmetic depends on the literal numerator and denominator.
    pub frame_interval_p: Ratio<u16>,
    pub data_version: u8,
    pub firmware_type: FirmwareType,
    pub minthrottle: i32,
    pub maxthrottle: i32,
    pub rc_rate: i32,
    pub vbatscale: i32,
    pub vbatref: i32,
    pub vbatmincellvoltage: i32,
    pub vbatwarningcellvoltage: i32,
    pub vbatmaxcellvoltage: i32,
    pub current_meter_offset: i32,
    pub current_meter_scale: i32,
    pub acc_1g: i32,
    pub gyro_scale: f32,
}

impl Default for SysConfig {
    fn default() -> Self {
        Self {
            frame_interval_i: 32,
            frame_interval_p: Ratio::new_raw(1, 1),
            data_version: 1,
            firmware_type: FirmwareType::Unknown,
            minthrottle: 1150,
            maxthrottle: 1850,
            rc_rate: 90,
            vbatscale: 110,
            vbatref: 4095,
            vbatmincellvoltage: 33,
            vbatwarningcellvoltage: 35,
            vbatmaxcellvoltage: 43,
            current_meter_offset: 0,
            current_meter_scale: 400,
            acc_1g: 1,
            gyro_scale: 1.0,
        }
    }
}

/// Field schema for one frame type: parallel vectors of names, predictors
/// and encodings, plus optional per-field signedness.
#[derive(Clone, Debug, Default)]
pub struct FrameDef {
    pub names: Vec<String>,
    pub predictors: Vec<FieldPredictor>,
    pub encodings: Vec<FieldEncoding>,
    pub signed: Vec<bool>,
    name_to_index: HashMap<String, usize>,
}

impl FrameDef {
    fn new(
        names: Vec<String>,
        predictors: Vec<FieldPredictor>,
        encodings: Vec<FieldEncoding>,
        mut signed: Vec<bool>,
    ) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(ix, name)| (name.clone(), ix))
            .collect();
        signed.resize(names.len(), false);
        Self {
            names,
            predictors,
            encodings,
            signed,
            name_to_index,
        }
    }

    pub fn count(&self) -> usize {
        self.names.len()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("log header does not define any main frame fields")]
    MissingFieldNames,
    #[error("log header is missing predictor or encoding definitions for {frame} frames")]
    MissingFrameDefinition { frame: char },
    #[error("log header {frame} frame definitions disagree on field count")]
    MismatchedFieldCounts { frame: char },
}

#[derive(Clone, Debug)]
pub struct Header {
    pub sys_config: SysConfig,
    /// Intra-frame schema; also carries the shared main field names.
    pub main_def: FrameDef,
    /// Inter-frame schema over the same field names.
    pub inter_def: FrameDef,
    pub gps_def: Option<FrameDef>,
    pub gps_home_def: Option<FrameDef>,
    pub product: Option<String>,
    pub firmware_revision: Option<String>,
    pub firmware_date: Option<DateTime<Utc>>,
    pub log_start_datetime: Option<DateTime<Utc>>,
    pub craft_name: Option<String>,
    pub other_headers: HashMap<String, String>,
    pub(crate) motor0_ix: Option<usize>,
    pub(crate) home0_ix: Option<usize>,
    pub(crate) home1_ix: Option<usize>,
}

impl Header {
    pub fn main_field_count(&self) -> usize {
        self.main_def.count()
    }

    pub fn main_field_names(&self) -> &[String] {
        &self.main_def.names
    }

    pub fn main_field_index(&self, name: &str) -> Option<usize> {
        self.main_def.index_of(name)
    }

    pub fn gps_field_count(&self) -> usize {
        self.gps_def.as_ref().map(FrameDef::count).unwrap_or(0)
    }

    pub fn gps_field_names(&self) -> &[String] {
        self.gps_def.as_ref().map(|def| &def.names[..]).unwrap_or(&[])
    }

    pub fn gps_home_field_count(&self) -> usize {
        self.gps_home_def.as_ref().map(FrameDef::count).unwrap_or(0)
    }

    pub fn gps_home_field_names(&self) -> &[String] {
        self.gps_home_def
            .as_ref()
            .map(|def| &def.names[..])
            .unwrap_or(&[])
    }
}

#[derive(Clone, Debug, Default)]
struct HeaderBuilder {
    product: Option<String>,
    data_version: Option<u8>,
    firmware_type: Option<FirmwareType>,
    firmware_revision: Option<String>,
    firmware_date: Option<DateTime<Utc>>,
    log_start_datetime: Option<DateTime<Utc>>,
    craft_name: Option<String>,
    i_interval: Option<i32>,
    p_interval: Option<(u16, u16)>,
    gyro_scale: Option<f32>,
    minthrottle: Option<i32>,
    maxthrottle: Option<i32>,
    rc_rate: Option<i32>,
    vbatscale: Option<i32>,
    vbatref: Option<i32>,
    acc_1g: Option<i32>,
    vbat_cell_voltage: Option<(i32, i32, i32)>,
    current_meter: Option<(i32, i32)>,

    i_field_names: Vec<String>,
    i_field_signed: Vec<bool>,
    i_field_predictors: Vec<FieldPredictor>,
    i_field_encodings: Vec<FieldEncoding>,
    p_field_predictors: Vec<FieldPredictor>,
    p_field_encodings: Vec<FieldEncoding>,
    g_field_names: Vec<String>,
    g_field_predictors: Vec<FieldPredictor>,
    g_field_encodings: Vec<FieldEncoding>,
    h_field_names: Vec<String>,
    h_field_predictors: Vec<FieldPredictor>,
    h_field_encodings: Vec<FieldEncoding>,

    other_headers: HashMap<String, String>,
}

impl HeaderBuilder {
    fn apply(&mut self, frame: HeaderFrame<'_>) {
        match frame {
            HeaderFrame::Product(product) => self.product = Some(product.to_owned()),
            HeaderFrame::DataVersion(version) => self.data_version = Some(version),
            HeaderFrame::FirmwareType(name) => {
                self.firmware_type = Some(match name {
                    "Cleanflight" => FirmwareType::Cleanflight,
                    _ => FirmwareType::Baseflight,
                });
            }
            HeaderFrame::FirmwareRevision(rev) => self.firmware_revision = Some(rev.to_owned()),
            HeaderFrame::FirmwareDate(date) => self.firmware_date = Some(date),
            HeaderFrame::LogStartDatetime(date) => self.log_start_datetime = Some(date),
            HeaderFrame::CraftName(name) => self.craft_name = Some(name.to_owned()),
            HeaderFrame::IInterval(interval) => self.i_interval = Some(interval),
            HeaderFrame::PInterval(num, denom) => self.p_interval = Some((num, denom)),
            HeaderFrame::FieldIName(names) => {
                self.i_field_names = names.into_iter().map(ToOwned::to_owned).collect()
            }
            HeaderFrame::FieldISigned(signed) => self.i_field_signed = signed,
            HeaderFrame::FieldIPredictor(predictors) => self.i_field_predictors = predictors,
            HeaderFrame::FieldIEncoding(encodings) => self.i_field_encodings = encodings,
            HeaderFrame::FieldPPredictor(predictors) => self.p_field_predictors = predictors,
            HeaderFrame::FieldPEncoding(encodings) => self.p_field_encodings = encodings,
            HeaderFrame::FieldGName(names) => {
                self.g_field_names = names.into_iter().map(ToOwned::to_owned).collect()
            }
            HeaderFrame::FieldGPredictor(predictors) => self.g_field_predictors = predictors,
            HeaderFrame::FieldGEncoding(encodings) => self.g_field_encodings = encodings,
            HeaderFrame::FieldHName(names) => {
                self.h_field_names = names.into_iter().map(ToOwned::to_owned).collect()
            }
            HeaderFrame::FieldHPredictor(predictors) => self.h_field_predictors = predictors,
            HeaderFrame::FieldHEncoding(encodings) => self.h_field_encodings = encodings,
            HeaderFrame::MinThrottle(value) => self.minthrottle = Some(value),
            HeaderFrame::MaxThrottle(value) => self.maxthrottle = Some(value),
            HeaderFrame::RcRate(value) => self.rc_rate = Some(value),
            HeaderFrame::VBatScale(value) => self.vbatscale = Some(value),
            HeaderFrame::VBatRef(value) => self.vbatref = Some(value),
            HeaderFrame::Acc1G(value) => self.acc_1g = Some(value),
            HeaderFrame::VBatCellVoltage { min, warning, max } => {
                self.vbat_cell_voltage = Some((min, warning, max))
            }
            HeaderFrame::CurrentMeter { offset, scale } => {
                self.current_meter = Some((offset, scale))
            }
            HeaderFrame::GyroScale(scale) => self.gyro_scale = Some(scale),
            HeaderFrame::Other(name, value) => {
                self.other_headers.insert(name.to_owned(), value.to_owned());
            }
        }
    }
}

impl TryFrom<HeaderBuilder> for Header {
    type Error = HeaderError;

    fn try_from(builder: HeaderBuilder) -> Result<Self, Self::Error> {
        if builder.i_field_names.is_empty() {
            return Err(HeaderError::MissingFieldNames);
        }
        if builder.i_field_predictors.is_empty() || builder.i_field_encodings.is_empty() {
            return Err(HeaderError::MissingFrameDefinition { frame: 'I' });
        }
        if builder.p_field_predictors.is_empty() || builder.p_field_encodings.is_empty() {
            return Err(HeaderError::MissingFrameDefinition { frame: 'P' });
        }

        let count = builder.i_field_names.len();
        if builder.i_field_predictors.len() != count || builder.i_field_encodings.len() != count {
            return Err(HeaderError::MismatchedFieldCounts { frame: 'I' });
        }
        if builder.p_field_predictors.len() != count || builder.p_field_encodings.len() != count {
            return Err(HeaderError::MismatchedFieldCounts { frame: 'P' });
        }

        for (ix, (name, predictor, encoding)) in izip!(
            &builder.i_field_names,
            &builder.i_field_predictors,
            &builder.i_field_encodings
        )
        .enumerate()
        {
            debug!("main field {} {:?}: {:?} {:?}", ix, name, predictor, encoding);
        }

        let main_def = FrameDef::new(
            builder.i_field_names.clone(),
            builder.i_field_predictors,
            builder.i_field_encodings,
            builder.i_field_signed.clone(),
        );
        let inter_def = FrameDef::new(
            builder.i_field_names,
            builder.p_field_predictors,
            builder.p_field_encodings,
            builder.i_field_signed,
        );

        let gps_def = optional_def('G', builder.g_field_names, {
            // The second of two adjacent home-coordinate predictors refers
            // to the second home field (longitude).
            let mut predictors = builder.g_field_predictors;
            for ix in 1..predictors.len() {
                if predictors[ix - 1] == FieldPredictor::HomeCoordinates
                    && predictors[ix] == FieldPredictor::HomeCoordinates
                {
                    predictors[ix] = FieldPredictor::HomeCoordinates1;
                }
            }
            predictors
        }, builder.g_field_encodings)?;
        let gps_home_def = optional_def(
            'H',
            builder.h_field_names,
            builder.h_field_predictors,
            builder.h_field_encodings,
        )?;

        let firmware_type = builder.firmware_type.unwrap_or_default();
        let defaults = SysConfig::default();

        let frame_interval_p = match builder.p_interval {
            Some((num, denom)) if num >= 1 && denom >= 1 => Ratio::new_raw(num, denom),
            _ => defaults.frame_interval_p,
        };

        let mut gyro_scale = builder.gyro_scale.unwrap_or(defaults.gyro_scale);
        if firmware_type == FirmwareType::Cleanflight {
            // Cleanflight logs degrees per second; normalize to the
            // Baseflight convention of radians per microsecond.
            gyro_scale *= (PI / 180.0) * 0.000001;
        }

        let (vbatmincellvoltage, vbatwarningcellvoltage, vbatmaxcellvoltage) =
            builder.vbat_cell_voltage.unwrap_or((
                defaults.vbatmincellvoltage,
                defaults.vbatwarningcellvoltage,
                defaults.vbatmaxcellvoltage,
            ));
        let (current_meter_offset, current_meter_scale) = builder
            .current_meter
            .unwrap_or((defaults.current_meter_offset, defaults.current_meter_scale));

        let sys_config = SysConfig {
            frame_interval_i: builder
                .i_interval
                .map(|interval| interval.max(1) as u16)
                .unwrap_or(defaults.frame_interval_i),
            frame_interval_p,
            data_version: builder.data_version.unwrap_or(defaults.data_version),
            firmware_type,
            minthrottle: builder.minthrottle.unwrap_or(defaults.minthrottle),
            maxthrottle: builder.maxthrottle.unwrap_or(defaults.maxthrottle),
            rc_rate: builder.rc_rate.unwrap_or(defaults.rc_rate),
            vbatscale: builder.vbatscale.unwrap_or(defaults.vbatscale),
            vbatref: builder.vbatref.unwrap_or(defaults.vbatref),
            vbatmincellvoltage,
            vbatwarningcellvoltage,
            vbatmaxcellvoltage,
            current_meter_offset,
            current_meter_scale,
            acc_1g: builder.acc_1g.unwrap_or(defaults.acc_1g),
            gyro_scale,
        };

        let motor0_ix = main_def.index_of("motor[0]");
        let (home0_ix, home1_ix) = match &gps_home_def {
            Some(def) => (def.index_of("GPS_home[0]"), def.index_of("GPS_home[1]")),
            None => (None, None),
        };

        Ok(Header {
            sys_config,
            main_def,
            inter_def,
            gps_def,
            gps_home_def,
            product: builder.product,
            firmware_revision: builder.firmware_revision,
            firmware_date: builder.firmware_date,
            log_start_datetime: builder.log_start_datetime,
            craft_name: builder.craft_name,
            other_headers: builder.other_headers,
            motor0_ix,
            home0_ix,
            home1_ix,
        })
    }
}

fn optional_def(
    frame: char,
    names: Vec<String>,
    predictors: Vec<FieldPredictor>,
    encodings: Vec<FieldEncoding>,
) -> Result<Option<FrameDef>, HeaderError> {
    if names.is_empty() {
        return Ok(None);
    }
    if predictors.is_empty() || encodings.is_empty() {
        return Err(HeaderError::MissingFrameDefinition { frame });
    }
    if predictors.len() != names.len() || encodings.len() != names.len() {
        return Err(HeaderError::MismatchedFieldCounts { frame });
    }
    Ok(Some(FrameDef::new(names, predictors, encodings, Vec::new())))
}

/// Consumes `H ` header lines from the front of `input` until the first
/// byte that does not open one, then builds the schema. Returns the number
/// of bytes consumed alongside the header.
pub(crate) fn parse_headers(input: &[u8]) -> Result<(usize, Header), HeaderError> {
    let (rest, builder) = match fold_many0(
        parse_header_line,
        HeaderBuilder::default(),
        |mut builder, frame| {
            builder.apply(frame);
            builder
        },
    )(input)
    {
        Ok((rest, builder)) => (rest, builder),
        Err(_) => (input, HeaderBuilder::default()),
    };

    let header: Header = builder.try_into()?;
    debug!(
        "parsed log header: {} main fields, {} gps fields, data version {}",
        header.main_field_count(),
        header.gps_field_count(),
        header.sys_config.data_version,
    );
    Ok((input.len() - rest.len(), header))
}
