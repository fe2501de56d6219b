pub mod frame;
pub mod stream;

pub use crate::frame::event::{LogEvent, END_OF_LOG_MESSAGE};
pub use crate::frame::{FieldEncoding, FrameKind};
pub use crate::stream::decoder::{
    DecodeError, FrameData, FrameNotification, LogDecoder, MAIN_FIELD_ITERATION, MAIN_FIELD_TIME,
    MAX_FRAME_LENGTH, MAX_ITERATION_JUMP, MAX_TIME_JUMP,
};
pub use crate::stream::header::{
    FirmwareType, FrameDef, Header, HeaderError, SysConfig, LOG_HEADER_MARKER,
    MAX_HEADER_LINE_LENGTH,
};
pub use crate::stream::stats::{FieldRange, FrameTypeStats, Stats};
pub use crate::stream::{ByteStream, UnexpectedEof};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldPredictor {
    None,
    Previous,
    StraightLine,
    Average2,
    MinThrottle,
    Motor0,
    Increment,
    HomeCoordinates,
    Around1500,
    VBatRef,
    LastMainFrameTime,
    /// Synthetic predictor for the second of two adjacent home-coordinate
    /// fields, produced by header post-processing; it has no wire ID of
    /// its own.
    HomeCoordinates1,
    Unknown(u16),
}

impl FieldPredictor {
    pub fn from_wire_id(id: u16) -> Self {
        match id {
            0 => FieldPredictor::None,
            1 => FieldPredictor::Previous,
            2 => FieldPredictor::StraightLine,
            3 => FieldPredictor::Average2,
            4 => FieldPredictor::MinThrottle,
            5 => FieldPredictor::Motor0,
            6 => FieldPredictor::Increment,
            7 => FieldPredictor::HomeCoordinates,
            8 => FieldPredictor::Around1500,
            9 => FieldPredictor::VBatRef,
            10 => FieldPredictor::LastMainFrameTime,
            n => FieldPredictor::Unknown(n),
        }
    }
}

impl Default for FieldPredictor {
    fn default() -> Self {
        FieldPredictor::None
    }
}
